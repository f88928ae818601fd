//! Core domain types
//!
//! This module contains the core domain structures used across Consort crates.
//! Records serialize in camelCase so they stay interchangeable with the JSON
//! produced by the remote API and the desktop front-end.

pub mod collection;
pub mod consortium;
pub mod pipeline;
pub mod provenance;
pub mod run;

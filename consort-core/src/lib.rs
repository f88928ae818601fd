//! Consort Core
//!
//! Core types and abstractions for the consortium pipeline run controller.
//!
//! This crate contains:
//! - Domain types: Consortia, collections, pipelines, runs and provenance records
//! - DTOs: Events and requests exchanged between the controller and its front-ends
//! - Mapping: Resolution of a consortium's declared step inputs against local collections

pub mod domain;
pub mod dto;
pub mod mapping;

//! Data Transfer Objects exchanged with front-ends
//!
//! Events flow out of the run controller towards whatever front-end drives it;
//! run DTOs flow in and describe what to start and what changed remotely.

pub mod event;
pub mod run;

//! Repository layer
//!
//! Repositories are the local key-value stores the controller keeps between
//! sessions: the consortia a user joined, their file collections and the run
//! history. They carry no business logic.
//!
//! All repositories are trait-based to enable testing and mocking.

mod collections;
mod consortia;
mod file_store;
mod runs;

// Re-export traits
pub use collections::CollectionRepository;
pub use consortia::ConsortiumRepository;
pub use runs::RunRepository;

// Re-export implementations
pub use file_store::FileStore;

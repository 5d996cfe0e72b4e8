// src/concord/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod consensus;
pub mod event_bus;
pub mod orchestrator;
pub mod roles;

// Export the orchestrator at the module root so callers reach it as
// concord::DiscussionOrchestrator instead of the full path.
pub use orchestrator::DiscussionOrchestrator;

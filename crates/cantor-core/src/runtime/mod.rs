pub mod artifact;
pub mod backend;
pub mod orchestrator;
pub mod registry;
pub mod retention;
pub mod types;
mod worker;

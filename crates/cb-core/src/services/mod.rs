pub mod catalog;
pub mod config_loader;
pub mod executor;
pub mod join;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod remote;
pub mod ssh;
pub mod state;

pub mod approval;
pub mod clock;
pub mod config;
pub mod errors;
pub mod handoff;
pub mod logging;
pub mod policy;
pub mod runtime;
pub mod tracker;
pub mod workflow;

pub mod broker;
pub mod config;
pub mod error;
pub mod job;
pub mod node;
pub mod resources;
pub mod runtime;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod worker;

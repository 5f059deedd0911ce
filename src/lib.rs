pub mod config;
pub mod dashboard;
pub mod error;
pub mod jobstore;
pub mod models;
pub mod node;
pub mod orchestrator;
pub mod routing;
pub mod shutdown;
pub mod transport;

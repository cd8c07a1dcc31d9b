pub mod agent;
pub mod config;
pub mod device;
pub mod register;
pub mod store;
pub mod telemetry;

pub use agent::{Agent, AgentParts, ProvisionError};
pub use config::{AgentConfig, Cli};

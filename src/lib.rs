// fleetshell
// Interactive shells on remote fleet agents over one multiplexed connection

pub mod cli;
pub mod client;
pub mod core;
pub mod directory;
pub mod engine;
pub mod passive;

pub use client::{ConsoleClient, WsConnector};
pub use core::{Config, GatewayError, SessionToken};
pub use directory::AgentDirectory;
pub use engine::ShellEngine;
pub use passive::PassiveRegistry;

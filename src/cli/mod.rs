//! Command-line interface

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, ConfigAction, ConfigArgs, LogFormat};

use crate::config::Config;

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        let servers: Vec<String> = self
            .nats_servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !servers.is_empty() {
            config.nats.servers = servers;
        }
        if let Some(id) = &self.node_id {
            config.node.id = id.clone();
        }
    }
}

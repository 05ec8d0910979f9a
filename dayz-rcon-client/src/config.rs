//! Deserializable configuration for a set of servers.

use crate::session::SessionConfig;
use crate::RconError;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub ip: String,
    pub rcon_port: u16,
    /// Asked for interactively when missing.
    #[serde(default)]
    pub rcon_password: Option<String>,
    /// Seconds between keep alive requests.
    #[serde(default = "default_keep_alive_interval")]
    pub rcon_keep_alive_interval: u64,
    #[serde(default)]
    pub log_rcon_keep_alive: bool,
    #[serde(default = "default_true")]
    pub chat_show_connect_disconnect_notices: bool,
    /// Replaces the default allow-list.
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
    #[serde(default)]
    pub scheduled_commands: Vec<ScheduleConfig>,
}

/// A command run over and over, either every `interval` seconds or at fixed times of day.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleConfig {
    /// A server command, or `safe_shutdown`.
    pub command: String,
    /// Seconds between runs.
    pub interval: u64,
    /// Without the clock: seconds to wait before the first countdown. With the clock: seconds
    /// the alignment point is moved away from midnight.
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub with_clock: bool,
    /// Seconds of warning given by `safe_shutdown`.
    #[serde(default)]
    pub delay: u64,
}

fn default_keep_alive_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> crate::Result<()> {
        if self.servers.is_empty() {
            return Err(RconError::Config("no servers configured".to_string()).into());
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if !names.insert(server.name.as_str()) {
                return Err(RconError::Config(format!(
                    "server name {} is used more than once",
                    server.name
                ))
                .into());
            }
            if server.rcon_keep_alive_interval == 0 {
                return Err(RconError::Config(format!(
                    "{}: keep alive interval must be positive",
                    server.name
                ))
                .into());
            }
            for (index, schedule) in server.scheduled_commands.iter().enumerate() {
                if schedule.interval == 0 {
                    return Err(RconError::Config(format!(
                        "{}: scheduled command #{} has a zero interval",
                        server.name, index
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }
}

impl ServerConfig {
    /// `host:port` of the RCON endpoint, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("[{}]:{}", self.ip, self.rcon_port)
        } else {
            format!("{}:{}", self.ip, self.rcon_port)
        }
    }

    pub fn session_config(&self, password: &str) -> SessionConfig {
        let mut config = SessionConfig::new(&self.name, &self.address(), password);
        config.keep_alive_interval = Duration::from_secs(self.rcon_keep_alive_interval);
        config.log_keep_alive = self.log_rcon_keep_alive;
        config.player_notices = self.chat_show_connect_disconnect_notices;
        if let Some(allowed) = &self.allowed_commands {
            config.allowed_commands = allowed.clone();
        }
        config
    }
}

use crate::config::{Config, ServerConfig};
use crate::connection::ConnectionState;
use crate::events::{EventSink, ServerEvent};
use crate::runtime::Supervisor;
use crate::scheduler::{ScheduleMessage, ScheduleStatus, ScheduledCommand};
use crate::session::{CommandResponse, Session, SessionHandle};
use crate::shutdown::ShutdownStatus;
use crate::RconError;
use log::info;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

struct Server {
    session: Supervisor<Session>,
    handle: SessionHandle,
    schedules: Vec<Supervisor<ScheduledCommand<SessionHandle>>>,
}

/// Owns the session and scheduled commands of every configured server.
///
/// Nothing runs until [`Manager::start`] is called. Dropping the manager stops everything
/// except safe shutdowns that are already under way.
pub struct Manager {
    servers: BTreeMap<String, Server>,
}

impl Manager {
    /// Every server must have its password filled in.
    pub fn new(config: &Config, events: UnboundedSender<ServerEvent>) -> crate::Result<Self> {
        config.validate()?;

        let mut servers = BTreeMap::new();
        for server in &config.servers {
            servers.insert(server.name.clone(), Server::new(server, events.clone())?);
        }
        Ok(Manager { servers })
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn start(&self) {
        for server in self.servers.values() {
            server.session.start();
            for schedule in &server.schedules {
                schedule.start();
            }
        }
    }

    pub fn stop(&self) {
        for server in self.servers.values() {
            for schedule in &server.schedules {
                schedule.stop();
            }
            server.session.stop();
        }
    }

    pub fn state(&self, server: &str) -> crate::Result<ConnectionState> {
        Ok(self.server(server)?.session.service().state())
    }

    pub fn shutdown_in_progress(&self, server: &str) -> crate::Result<bool> {
        Ok(self.server(server)?.session.service().shutdown_in_progress())
    }

    pub async fn execute_command(
        &self,
        server: &str,
        text: &str,
    ) -> crate::Result<CommandResponse> {
        self.server(server)?.handle.execute_command(text).await
    }

    pub async fn safe_shutdown(
        &self,
        server: &str,
        delay: Duration,
    ) -> crate::Result<ShutdownStatus> {
        self.server(server)?.handle.request_safe_shutdown(delay).await
    }

    /// Skips the next run of a scheduled command.
    pub fn skip(&self, server: &str, index: usize) -> crate::Result<()> {
        let schedule = self
            .server(server)?
            .schedules
            .get(index)
            .ok_or_else(|| RconError::UnknownSchedule {
                server: server.to_string(),
                index,
            })?;
        schedule.send_message(ScheduleMessage::Skip);
        Ok(())
    }

    pub fn schedule_status(&self) -> BTreeMap<String, Vec<ScheduleStatus>> {
        self.servers
            .iter()
            .map(|(name, server)| {
                let statuses = server
                    .schedules
                    .iter()
                    .map(|schedule| schedule.service().status(schedule.is_running()))
                    .collect();
                (name.clone(), statuses)
            })
            .collect()
    }

    fn server(&self, name: &str) -> crate::Result<&Server> {
        self.servers
            .get(name)
            .ok_or_else(|| RconError::UnknownServer(name.to_string()).into())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Server {
    fn new(config: &ServerConfig, events: UnboundedSender<ServerEvent>) -> crate::Result<Self> {
        let password = config.rcon_password.as_deref().ok_or_else(|| {
            RconError::Config(format!("{}: no RCON password", config.name))
        })?;

        let session = Supervisor::new(Session::new(
            config.session_config(password),
            EventSink::new(&config.name, events),
        ));
        let handle = SessionHandle::new(&session);

        let schedules = config
            .scheduled_commands
            .iter()
            .enumerate()
            .map(|(index, schedule)| {
                Supervisor::new(ScheduledCommand::new(
                    index,
                    schedule.clone(),
                    handle.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!(
            "{}: {} scheduled command(s) at {}",
            config.name,
            schedules.len(),
            config.address()
        );

        Ok(Server {
            session,
            handle,
            schedules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config() -> Config {
        serde_json::from_str(
            r#"{ "servers": [{
                "name": "main", "ip": "127.0.0.1", "rcon_port": 9, "rcon_password": "secret",
                "scheduled_commands": [
                    { "command": "players", "interval": 60 },
                    { "command": "safe_shutdown", "interval": 3600, "with_clock": true }
                ]
            }] }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_names_are_errors() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Manager::new(&config(), tx).unwrap();

        let err = manager.execute_command("other", "players").await.unwrap_err();
        assert!(err.is_unknown_server());
        assert!(manager.skip("other", 0).unwrap_err().is_unknown_server());
        assert!(manager.skip("main", 2).is_err());
        manager.skip("main", 1).unwrap();
    }

    #[test]
    fn missing_password_is_rejected() {
        let mut config = config();
        config.servers[0].rcon_password = None;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Manager::new(&config, tx).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn status_covers_every_schedule() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Manager::new(&config(), tx).unwrap();
        assert_eq!(manager.servers().collect::<Vec<_>>(), vec!["main"]);

        let status = manager.schedule_status();
        assert_eq!(status["main"].len(), 2);
        assert!(status["main"].iter().all(|schedule| !schedule.alive));

        manager.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = manager.schedule_status();
        let fixed = &status["main"][0];
        assert_eq!(fixed.command, "players");
        assert_eq!(fixed.interval, 60);
        assert!(fixed.alive);
        assert!(!fixed.skip_pending);
        assert_eq!(status["main"][1].command, "safe_shutdown");

        manager.stop();
        assert!(manager.schedule_status()["main"].iter().all(|s| !s.alive));
    }
}

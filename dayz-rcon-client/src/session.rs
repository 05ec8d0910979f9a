use crate::connection::{Connection, ConnectionOptions, ConnectionState, LinkState};
use crate::events::EventSink;
use crate::packet::Payload;
use crate::registrar::{Registrar, DEFAULT_TIMEOUT};
use crate::runtime::{Mailbox, Service, Supervisor};
use crate::shutdown::{ShutdownLock, ShutdownStatus};
use crate::RconError;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Commands the server is allowed to receive, matched against the first word of a command.
pub const DEFAULT_COMMANDS: &[&str] = &[
    "players",
    "admins",
    "kick",
    "bans",
    "ban",
    "removeBan",
    "say",
    "addBan",
    "#shutdown",
];

/// Answered locally with the allow-list.
pub const LIST_COMMANDS: &str = "commands";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    /// `host:port` of the server's RCON endpoint.
    pub address: String,
    pub password: String,
    pub allowed_commands: Vec<String>,
    pub request_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub login_timeout: Duration,
    pub login_backoff: Duration,
    /// Emit a notice for every successful keep alive.
    pub log_keep_alive: bool,
    /// Report players joining and leaving as events.
    pub player_notices: bool,
}

impl SessionConfig {
    pub fn new(name: &str, address: &str, password: &str) -> Self {
        SessionConfig {
            name: name.to_string(),
            address: address.to_string(),
            password: password.to_string(),
            allowed_commands: DEFAULT_COMMANDS.iter().map(|c| c.to_string()).collect(),
            request_timeout: DEFAULT_TIMEOUT,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
            login_backoff: Duration::from_secs(2),
            log_keep_alive: false,
            player_notices: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    /// Whatever the server answered, possibly nothing.
    Output(String),
    /// The allow-list, for the `commands` pseudo command.
    Commands(Vec<String>),
    /// The command is not on the allow-list and was never sent.
    Invalid,
}

impl Display for CommandResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandResponse::Output(text) => write!(f, "{}", text),
            CommandResponse::Commands(commands) => write!(f, "{}", commands.join(", ")),
            CommandResponse::Invalid => write!(f, "invalid command"),
        }
    }
}

#[derive(Debug)]
pub enum SessionMessage {
    Command {
        text: String,
        reply: oneshot::Sender<crate::Result<CommandResponse>>,
    },
    SafeShutdown {
        delay: Duration,
        reply: oneshot::Sender<ShutdownStatus>,
    },
}

/// What the shutdown sequence and the scheduler need from a server.
#[async_trait]
pub trait Console: Send + Sync + 'static {
    fn server(&self) -> &str;

    async fn execute(&self, command: &str) -> crate::Result<CommandResponse>;

    async fn safe_shutdown(&self, delay: Duration) -> crate::Result<ShutdownStatus>;

    fn notice(&self, text: &str);
}

/// RCON session with one server: logs in, keeps the login alive, and runs commands.
pub struct Session {
    config: SessionConfig,
    registrar: Registrar,
    link: Arc<LinkState>,
    connection: Mutex<Option<Arc<Connection>>>,
    events: EventSink,
    shutdown: ShutdownLock,
}

impl Session {
    pub fn new(config: SessionConfig, events: EventSink) -> Self {
        Session {
            registrar: Registrar::new(&config.name),
            config,
            link: Arc::new(LinkState::new()),
            connection: Mutex::new(None),
            events,
            shutdown: ShutdownLock::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.link.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.shutdown.in_progress()
    }

    /// Runs a command on the server, or answers it locally where possible.
    pub async fn execute(&self, text: &str) -> crate::Result<CommandResponse> {
        let text = text.trim();
        if text == LIST_COMMANDS {
            return Ok(CommandResponse::Commands(self.config.allowed_commands.clone()));
        }

        let verb = text.split_whitespace().next().unwrap_or_default();
        if !self.config.allowed_commands.iter().any(|allowed| allowed == verb) {
            info!("{}: rejecting invalid command: {}", self.name(), text);
            return Ok(CommandResponse::Invalid);
        }

        let connection = match self.logged_in_connection() {
            Some(connection) => connection,
            None => {
                warn!("{}: not logged in, cancelling command: {}", self.name(), text);
                return Err(RconError::NotLoggedIn.into());
            }
        };

        match self
            .request(&connection, text, self.config.request_timeout)
            .await
        {
            Ok(output) => Ok(CommandResponse::Output(output)),
            Err(err) => {
                warn!("{}: command cancelled: {}: {}", self.name(), text, err);
                Err(err)
            }
        }
    }

    fn logged_in_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .clone()
            .filter(|connection| connection.is_logged_in())
    }

    async fn request(
        &self,
        connection: &Connection,
        text: &str,
        timeout: Duration,
    ) -> crate::Result<String> {
        let seq = self.registrar.next_sequence_number();
        let response = self.registrar.register(seq, timeout);
        connection.send(&Payload::command(seq, text)).await?;
        response.await
    }

    async fn login_and_keep_alive(&self, connection: &Connection) -> crate::Result<()> {
        if let Err(err) = connection.wait_for_login(self.config.login_timeout).await {
            info!("{}: {}", self.name(), err);
            connection.close();
            tokio::time::sleep(self.config.login_backoff).await;
            return Err(err);
        }

        loop {
            tokio::time::sleep(self.config.keep_alive_interval).await;

            debug!("{}: sending keep alive", self.name());
            match self
                .request(connection, "", self.config.keep_alive_timeout)
                .await
            {
                Ok(_) => {
                    if self.config.log_keep_alive {
                        self.events.notice("keep alive");
                    }
                }
                Err(err) => {
                    warn!("{}: keep alive timed out: {}", self.name(), err);
                    self.events.notice("keep alive timed out");
                    connection.close();
                    return Err(RconError::KeepAliveTimedOut.into());
                }
            }
        }
    }
}

#[async_trait]
impl Service for Session {
    type Message = SessionMessage;

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, _mailbox: &Mailbox<SessionMessage>) -> crate::Result<()> {
        self.registrar.reset();

        let connection = Connection::open(
            ConnectionOptions {
                address: &self.config.address,
                password: &self.config.password,
                player_notices: self.config.player_notices,
            },
            self.registrar.clone(),
            self.events.clone(),
            Arc::clone(&self.link),
        )
        .await?;
        let active = ActiveConnection::install(self, Arc::new(connection));
        let connection = &active.connection;

        tokio::select! {
            result = connection.receive_loop() => result,
            result = self.login_and_keep_alive(connection) => result,
        }
    }

    async fn handle_message(&self, message: SessionMessage, mailbox: &Mailbox<SessionMessage>) {
        match message {
            SessionMessage::Command { text, reply } => {
                info!("{}: command received: {}", self.name(), text);
                let result = self.execute(&text).await;
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
            SessionMessage::SafeShutdown { delay, reply } => {
                let console = SessionHandle {
                    mailbox: mailbox.clone(),
                    events: self.events.clone(),
                };
                let status = self.shutdown.schedule(console, delay);
                info!("{}: safe shutdown: {}", self.name(), status);
                let _ = reply.send(status);
            }
        }
    }
}

// Publishes a connection to command callers for as long as the run loop is using it.
struct ActiveConnection<'a> {
    session: &'a Session,
    connection: Arc<Connection>,
}

impl<'a> ActiveConnection<'a> {
    fn install(session: &'a Session, connection: Arc<Connection>) -> Self {
        *session.connection.lock() = Some(Arc::clone(&connection));
        ActiveConnection {
            session,
            connection,
        }
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        let current = {
            let mut slot = self.session.connection.lock();
            let current = slot
                .as_ref()
                .map_or(false, |installed| Arc::ptr_eq(installed, &self.connection));
            if current {
                *slot = None;
            }
            current
        };

        // A replacement may already be running; leave its requests alone
        if current {
            self.connection.close();
            self.session.registrar.reset();
        }
    }
}

/// Cheap handle for talking to a running [`Session`] through its inbox.
#[derive(Clone)]
pub struct SessionHandle {
    mailbox: Mailbox<SessionMessage>,
    events: EventSink,
}

impl SessionHandle {
    pub fn new(supervisor: &Supervisor<Session>) -> Self {
        SessionHandle {
            mailbox: supervisor.mailbox(),
            events: supervisor.service().events.clone(),
        }
    }

    pub async fn execute_command(&self, text: &str) -> crate::Result<CommandResponse> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(SessionMessage::Command {
            text: text.to_string(),
            reply,
        });
        rx.await.map_err(|_| RconError::Cancelled)?
    }

    pub async fn request_safe_shutdown(&self, delay: Duration) -> crate::Result<ShutdownStatus> {
        let (reply, rx) = oneshot::channel();
        self.mailbox
            .send(SessionMessage::SafeShutdown { delay, reply });
        Ok(rx.await.map_err(|_| RconError::Cancelled)?)
    }
}

#[async_trait]
impl Console for SessionHandle {
    fn server(&self) -> &str {
        self.events.server()
    }

    async fn execute(&self, command: &str) -> crate::Result<CommandResponse> {
        self.execute_command(command).await
    }

    async fn safe_shutdown(&self, delay: Duration) -> crate::Result<ShutdownStatus> {
        self.request_safe_shutdown(delay).await
    }

    fn notice(&self, text: &str) {
        self.events.notice(text);
    }
}

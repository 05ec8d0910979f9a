//! This crate implements a BattlEye RCON client for DayZ servers, together with the small
//! control plane built on top of it: supervised per-server sessions that log in and keep
//! themselves alive, recurring scheduled commands, and a staged safe shutdown.
//!
//! Everything is asynchronous and requires a [Tokio](https://tokio.rs/) runtime.
//!
//! The easiest entry point is the [`Manager`], which starts one session per configured server
//! and routes commands to them by name. Server messages come out of the event channel.
//!
//! # Example
//! ```rust,no_run
//! use dayz_rcon_client::{Config, Manager};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = serde_json::from_str(r#"{
//!         "servers": [{
//!             "name": "main",
//!             "ip": "127.0.0.1",
//!             "rcon_port": 2302,
//!             "rcon_password": "password123"
//!         }]
//!     }"#).unwrap();
//!
//!     let (events, mut rx) = mpsc::unbounded_channel();
//!     let manager = Manager::new(&config, events).unwrap();
//!     manager.start();
//!
//!     let players = manager.execute_command("main", "players").await;
//!     println!("{:?}", players);
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{}: {:?}", event.server, event.event);
//!     }
//! }
//! ```

pub mod config;
mod connection;
pub mod events;
mod manager;
pub mod packet;
pub mod players;
mod registrar;
pub mod runtime;
pub mod scheduler;
mod session;
pub mod shutdown;

/// Error type for RCON operations.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(RconError);

#[derive(Debug, thiserror::Error)]
pub(crate) enum RconError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not bind UDP socket on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed frame: {0}")]
    Frame(#[from] packet::FrameError),

    #[error("query timed out")]
    Cancelled,

    #[error("query timed out: not logged in")]
    NotLoggedIn,

    #[error("login timed out")]
    LoginTimedOut,

    #[error("login rejected")]
    LoginRejected,

    #[error("keep alive timed out")]
    KeepAliveTimedOut,

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("{server} has no scheduled command #{index}")]
    UnknownSchedule { server: String, index: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// [`Result`] alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The request was cancelled: it timed out, another request on the same session timed
    /// out, the session was not logged in, or the session was stopped. Worth retrying.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.0, RconError::Cancelled | RconError::NotLoggedIn)
    }

    pub fn is_not_logged_in(&self) -> bool {
        matches!(self.0, RconError::NotLoggedIn)
    }

    /// The session cannot come up at all and will not be restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(self.0, RconError::Bind { .. })
    }

    pub fn is_unknown_server(&self) -> bool {
        matches!(self.0, RconError::UnknownServer(_))
    }
}

impl<T> From<T> for Error
where
    T: Into<RconError>,
{
    fn from(inner: T) -> Self {
        Error(inner.into())
    }
}

pub use self::config::{Config, ScheduleConfig, ServerConfig};
pub use self::connection::ConnectionState;
pub use self::events::{Event, EventSink, ServerEvent};
pub use self::manager::Manager;
pub use self::scheduler::{ScheduleStatus, ScheduledCommand};
pub use self::session::{
    CommandResponse, Console, Session, SessionConfig, SessionHandle, DEFAULT_COMMANDS,
};
pub use self::shutdown::ShutdownStatus;

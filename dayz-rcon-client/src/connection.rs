use crate::events::{classify, Event, EventSink};
use crate::packet::{Packet, Payload};
use crate::registrar::Registrar;
use crate::RconError;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

// Largest payload a UDP datagram can carry
const READ_BUFFER_LEN: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingLogin,
    LoggedIn,
}

/// Connection state shared by every connection a session opens over its lifetime. Each
/// connection only gets to update it while it is the most recent one, so a connection that is
/// torn down late cannot overwrite the state of its replacement.
pub(crate) struct LinkState {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl LinkState {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        LinkState {
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set(&self, generation: u64, new: ConnectionState) {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation || *state == new {
                return false;
            }
            *state = new;
            true
        });
    }
}

/// One UDP association with a server.
///
/// Opening a connection sends the login request straight away; [`Connection::receive_loop`]
/// must be polled for the login answer, command responses and server messages to be processed.
pub struct Connection {
    socket: UdpSocket,
    registrar: Registrar,
    events: EventSink,
    link: Arc<LinkState>,
    generation: u64,
    player_notices: bool,
}

pub(crate) struct ConnectionOptions<'a> {
    pub address: &'a str,
    pub password: &'a str,
    pub player_notices: bool,
}

impl Connection {
    pub(crate) async fn open(
        options: ConnectionOptions<'_>,
        registrar: Registrar,
        events: EventSink,
        link: Arc<LinkState>,
    ) -> crate::Result<Self> {
        let remote = resolve(options.address).await?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| RconError::Bind {
                addr: local.to_string(),
                source,
            })?;
        socket.connect(remote).await?;

        let generation = link.next_generation();
        let connection = Connection {
            socket,
            registrar,
            events,
            link,
            generation,
            player_notices: options.player_notices,
        };

        connection.set_state(ConnectionState::AwaitingLogin);
        info!("{}: sending login to {}", connection.name(), remote);
        connection.send(&Payload::login(options.password)).await?;

        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.link.get()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == ConnectionState::LoggedIn
    }

    /// Waits for the server to answer the login request.
    pub async fn wait_for_login(&self, timeout: Duration) -> crate::Result<()> {
        let mut state = self.link.subscribe();

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::LoggedIn => return Ok(()),
                    ConnectionState::Disconnected => return Err(RconError::LoginRejected),
                    ConnectionState::AwaitingLogin => {}
                }
                if state.changed().await.is_err() {
                    return Err(RconError::LoginRejected);
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => Ok(result?),
            Err(_) => Err(RconError::LoginTimedOut.into()),
        }
    }

    pub async fn send(&self, payload: &Payload) -> crate::Result<()> {
        debug!("{}: sending {:?}", self.name(), Redacted(payload));
        let datagram = Packet::new(payload.clone()).encode();
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Processes datagrams until the socket fails.
    pub async fn receive_loop(&self) -> crate::Result<()> {
        let mut buffer = vec![0; READ_BUFFER_LEN];

        loop {
            let len = match self.socket.recv(&mut buffer).await {
                Ok(len) => len,
                Err(err) => {
                    warn!("{}: connection lost: {}", self.name(), err);
                    self.close();
                    return Err(err.into());
                }
            };

            let packet = match Packet::decode(&buffer[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    // The protocol tolerates loss, the server will resend if it cares
                    warn!("{}: discarding datagram: {}", self.name(), err);
                    continue;
                }
            };

            debug!("{}: received {:?}", self.name(), packet.payload);
            if let Some(reply) = self.dispatch(packet.payload) {
                self.send(&reply).await?;
            }
        }
    }

    pub fn close(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.link.set(self.generation, state);
    }

    fn dispatch(&self, payload: Payload) -> Option<Payload> {
        match payload {
            Payload::Login { success, .. } => {
                // Only the first answer to a login attempt counts
                if self.state() == ConnectionState::AwaitingLogin {
                    info!(
                        "{}: login was {}successful",
                        self.name(),
                        if success { "" } else { "not " }
                    );
                    self.set_state(if success {
                        ConnectionState::LoggedIn
                    } else {
                        ConnectionState::Disconnected
                    });
                }
                None
            }
            payload @ (Payload::Command { .. } | Payload::SplitCommand { .. }) => {
                self.registrar.incoming(payload);
                None
            }
            Payload::Message { seq, text } => {
                if text.is_empty() {
                    return None;
                }

                match classify(&text) {
                    Some(Event::PlayerConnected(name)) | Some(Event::PlayerDisconnected(name))
                        if !self.player_notices =>
                    {
                        debug!("{}: not announcing {}", self.name(), name);
                    }
                    Some(event) => {
                        info!("{}: {:?}", self.name(), event);
                        self.events.emit(event);
                    }
                    None => {}
                }
                self.events.emit(Event::LogLine(text));

                Some(Payload::ack(seq))
            }
        }
    }

    fn name(&self) -> &str {
        self.events.server()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve(address: &str) -> crate::Result<SocketAddr> {
    match tokio::net::lookup_host(address).await?.next() {
        Some(addr) => Ok(addr),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address found for {}", address),
        )
        .into()),
    }
}

// Keeps the password out of debug logs
struct Redacted<'a>(&'a Payload);

impl std::fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Payload::Login { .. } => write!(f, "Login {{ .. }}"),
            other => other.fmt(f),
        }
    }
}

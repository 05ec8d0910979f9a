//! Safe shutdown: warn players ahead of time, kick them, keep the server empty for a minute, then
//! shut it down.

use crate::players::{parse_players, player_total};
use crate::session::{CommandResponse, Console};
use log::{debug, info, warn};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Minutes before shutdown at which players are warned.
pub const NOTICE_MINUTES: [u64; 9] = [60, 30, 20, 10, 5, 4, 3, 2, 1];

const LOCK_DURATION: u64 = 60;
const LOCK_KICK_INTERVAL: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    Scheduled,
    AlreadyScheduled,
}

impl Display for ShutdownStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownStatus::Scheduled => write!(f, "shutdown scheduled"),
            ShutdownStatus::AlreadyScheduled => write!(f, "already scheduled"),
        }
    }
}

/// Allows one shutdown sequence per server at a time.
#[derive(Debug, Clone, Default)]
pub struct ShutdownLock {
    lock: Arc<Mutex<()>>,
}

impl ShutdownLock {
    /// Starts the shutdown sequence in the background, unless one is already running.
    pub fn schedule<C: Console>(&self, console: C, delay: Duration) -> ShutdownStatus {
        let guard = match Arc::clone(&self.lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return ShutdownStatus::AlreadyScheduled,
        };

        tokio::spawn(async move {
            run(&console, delay).await;
            drop(guard);
        });
        ShutdownStatus::Scheduled
    }

    pub fn in_progress(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

pub async fn run<C: Console + ?Sized>(console: &C, delay: Duration) {
    count_down(console, delay.as_secs()).await;

    console.notice("shutdown -> kicking");
    kick_everybody(console, "Server is restarting").await;

    // The native lock command is unreliable, so keep kicking whoever gets back in instead
    console.notice("shutdown -> locking");
    console.notice("shutdown -> wait for a minute");
    let mut time_left = LOCK_DURATION;
    while time_left > 0 {
        kick_everybody(
            console,
            &format!("Server locked, restarting in {} seconds", time_left),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(LOCK_KICK_INTERVAL)).await;
        time_left = time_left.saturating_sub(LOCK_KICK_INTERVAL);
    }

    console.notice("shutdown -> shutting down");
    if let Err(err) = console.execute("#shutdown").await {
        warn!("{}: shutdown command failed: {}", console.server(), err);
    }
}

async fn count_down<C: Console + ?Sized>(console: &C, mut remaining: u64) {
    // Thresholds already passed at the start are never announced
    let mut thresholds = NOTICE_MINUTES
        .iter()
        .copied()
        .filter(move |minutes| remaining >= minutes * 60)
        .peekable();
    info!("{}: shutdown in {}s", console.server(), remaining);

    let mut step = 1;
    while remaining > 0 {
        if let Some(minutes) = thresholds.next_if(|minutes| remaining < minutes * 60) {
            let message = format!(
                "Restarting the server in {} minute{}",
                minutes,
                if minutes == 1 { "" } else { "s" }
            );
            if let Err(err) = console.execute(&format!("say -1 {}", message)).await {
                warn!("{}: could not announce shutdown: {}", console.server(), err);
            }
            console.notice(&message);

            // Past the first announcement everything happens on whole minutes
            step = 60;
        }

        tokio::time::sleep(Duration::from_secs(step)).await;
        remaining = remaining.saturating_sub(step);
    }
}

async fn kick_everybody<C: Console + ?Sized>(console: &C, reason: &str) {
    let players = match console.execute("players").await {
        Ok(CommandResponse::Output(output)) => {
            let players = parse_players(&output);
            debug!(
                "{}: {} player(s) online",
                console.server(),
                player_total(&output).unwrap_or(players.len())
            );
            players
        }
        Ok(other) => {
            warn!("{}: unexpected player list: {}", console.server(), other);
            return;
        }
        Err(err) => {
            warn!("{}: could not list players: {}", console.server(), err);
            return;
        }
    };

    for player in players {
        let command = format!("kick {} {}", player.id, reason);
        match console.execute(&command).await {
            Ok(_) => info!("{}: {}", console.server(), command),
            Err(err) => warn!("{}: {} failed: {}", console.server(), command, err),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use tokio::time::Instant;

    const TWO_PLAYERS: &str = "\
Players on server:
[#] [IP Address]:[Port] [Ping] [GUID] [Name]
--------------------------------------------------
2 127.0.0.1:2304 0 1234(OK) Survivor2
4 127.0.0.2:2304 32 5678(OK) Survivor4
(2 players in total)";

    const NO_PLAYERS: &str = "\
Players on server:
[#] [IP Address]:[Port] [Ping] [GUID] [Name]
--------------------------------------------------
(0 players in total)";

    /// Records everything sent to it. The first `players` query reports two players, later ones
    /// an empty server.
    #[derive(Clone, Default)]
    pub struct RecordingConsole {
        pub log: Arc<SyncMutex<Vec<(Instant, String)>>>,
        pub notices: Arc<SyncMutex<Vec<String>>>,
        pub shutdowns: Arc<SyncMutex<Vec<Duration>>>,
    }

    impl RecordingConsole {
        pub fn commands(&self) -> Vec<String> {
            self.log.lock().iter().map(|(_, c)| c.clone()).collect()
        }

        fn count(&self, prefix: &str) -> usize {
            self.commands()
                .iter()
                .filter(|command| command.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl Console for RecordingConsole {
        fn server(&self) -> &str {
            "test"
        }

        async fn execute(&self, command: &str) -> crate::Result<CommandResponse> {
            let mut log = self.log.lock();
            let first_query = !log.iter().any(|(_, c)| c == "players");
            log.push((Instant::now(), command.to_string()));

            if command == "players" {
                let output = if first_query { TWO_PLAYERS } else { NO_PLAYERS };
                return Ok(CommandResponse::Output(output.to_string()));
            }
            Ok(CommandResponse::Output(String::new()))
        }

        async fn safe_shutdown(&self, delay: Duration) -> crate::Result<ShutdownStatus> {
            self.shutdowns.lock().push(delay);
            Ok(ShutdownStatus::Scheduled)
        }

        fn notice(&self, text: &str) {
            self.notices.lock().push(text.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_shutdown_runs_every_phase() {
        let console = RecordingConsole::default();
        let started = Instant::now();

        run(&console, Duration::ZERO).await;

        let commands = console.commands();
        assert_eq!(commands[0], "players");
        assert_eq!(commands[1], "kick 2 Server is restarting");
        assert_eq!(commands[2], "kick 4 Server is restarting");
        assert_eq!(commands.last().map(String::as_str), Some("#shutdown"));
        assert_eq!(console.count("say"), 0);

        // One query at the start, then one every two seconds while locked
        assert_eq!(console.count("players"), 1 + 30);
        assert!(started.elapsed() >= Duration::from_secs(60));

        assert_eq!(
            *console.notices.lock(),
            vec![
                "shutdown -> kicking",
                "shutdown -> locking",
                "shutdown -> wait for a minute",
                "shutdown -> shutting down",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn count_down_announces_remaining_thresholds() {
        let console = RecordingConsole::default();
        let started = Instant::now();

        count_down(&console, 10 * 60).await;

        let says: Vec<(Duration, String)> = console
            .log
            .lock()
            .iter()
            .filter(|(_, command)| command.starts_with("say"))
            .map(|(at, command)| (at.duration_since(started), command.clone()))
            .collect();

        let expected = [10, 5, 4, 3, 2, 1];
        assert_eq!(says.len(), expected.len());
        for ((_, command), minutes) in says.iter().zip(expected) {
            let announcement = format!("say -1 Restarting the server in {} minute", minutes);
            assert!(command.starts_with(&announcement));
        }

        // The first notice goes out a second in, later ones on the minute
        assert_eq!(says[0].0, Duration::from_secs(1));
        assert_eq!(says[1].0, Duration::from_secs(1 + 5 * 60));
        assert_eq!(says[5].1, "say -1 Restarting the server in 1 minute");
    }

    #[tokio::test(start_paused = true)]
    async fn short_delay_only_announces_last_minute() {
        let console = RecordingConsole::default();
        count_down(&console, 30).await;
        assert_eq!(console.count("say"), 0);

        let console = RecordingConsole::default();
        count_down(&console, 90).await;
        assert_eq!(
            console.commands(),
            vec!["say -1 Restarting the server in 1 minute"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_shutdown_is_rejected_while_first_runs() {
        let lock = ShutdownLock::default();
        let console = RecordingConsole::default();

        assert_eq!(
            lock.schedule(console.clone(), Duration::ZERO),
            ShutdownStatus::Scheduled
        );
        assert_eq!(
            lock.schedule(console.clone(), Duration::ZERO),
            ShutdownStatus::AlreadyScheduled
        );
        assert!(lock.in_progress());

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!lock.in_progress());
        assert_eq!(console.count("#shutdown"), 1);
        assert_eq!(console.count("kick"), 2);

        // Once finished another one may run
        assert_eq!(
            lock.schedule(console.clone(), Duration::ZERO),
            ShutdownStatus::Scheduled
        );
    }
}

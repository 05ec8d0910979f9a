//! Hosting for long running services.
//!
//! A [`Supervisor`] owns three tasks for its service: a message pump that feeds the inbox to
//! [`Service::handle_message`] one message at a time, the service's own [`Service::run`] loop,
//! and a watchdog. If the pump or the run loop ends for any reason (an error, a panic, or simply
//! returning) the watchdog restarts the whole service. The only way a service stays down is
//! being stopped, or its run loop failing with a fatal error.
//!
//! A stopped service accepts no mail. Anything sent to it, or still queued when it stopped, is
//! dropped, so callers waiting on a reply channel see it close instead of waiting forever.

use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const WATCHDOG_TICK: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Message: Send + 'static;

    fn name(&self) -> &str;

    /// Main loop of the service. Normally never returns.
    async fn run(&self, mailbox: &Mailbox<Self::Message>) -> crate::Result<()>;

    async fn handle_message(&self, message: Self::Message, mailbox: &Mailbox<Self::Message>);
}

#[derive(Debug)]
pub enum Envelope<M> {
    Stop,
    Restart,
    Message(M),
}

/// Sending half of a service's inbox.
pub struct Mailbox<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
    open: Arc<AtomicBool>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Mailbox {
            tx: self.tx.clone(),
            open: Arc::clone(&self.open),
        }
    }
}

impl<M> Mailbox<M> {
    pub fn send(&self, message: M) {
        self.post(Envelope::Message(message));
    }

    pub fn stop(&self) {
        self.post(Envelope::Stop);
    }

    pub fn restart(&self) {
        self.post(Envelope::Restart);
    }

    /// Whether the service is accepting mail, i.e. it has been started and not stopped.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn post(&self, envelope: Envelope<M>) {
        if !self.is_open() {
            // Dropping the envelope drops any reply sender inside it
            return;
        }
        // The receiver lives as long as the supervisor, so this only fails during teardown
        let _ = self.tx.send(envelope);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Pump,
    Run,
    Watchdog,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Pump => write!(f, "message pump"),
            Role::Run => write!(f, "service"),
            Role::Watchdog => write!(f, "watchdog"),
        }
    }
}

struct Task {
    role: Role,
    handle: JoinHandle<()>,
}

struct Shared<S: Service> {
    service: Arc<S>,
    mailbox: Mailbox<S::Message>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope<S::Message>>>,
    tasks: Mutex<Vec<Task>>,
}

pub struct Supervisor<S: Service> {
    shared: Arc<Shared<S>>,
}

impl<S: Service> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Supervisor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Service> Supervisor<S> {
    pub fn new(service: S) -> Self {
        info!("initializing service {}", service.name());
        let (tx, rx) = mpsc::unbounded_channel();

        Supervisor {
            shared: Arc::new(Shared {
                service: Arc::new(service),
                mailbox: Mailbox {
                    tx,
                    open: Arc::new(AtomicBool::new(false)),
                },
                inbox: tokio::sync::Mutex::new(rx),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.shared.service
    }

    pub fn mailbox(&self) -> Mailbox<S::Message> {
        self.shared.mailbox.clone()
    }

    pub fn send_message(&self, message: S::Message) {
        self.shared.mailbox.send(message);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.tasks.lock().is_empty()
    }

    /// Starts the service. Does nothing if it is already running.
    pub fn start(&self) {
        let mut tasks = self.shared.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        info!("starting service {}", self.name());
        self.shared.mailbox.open.store(true, Ordering::SeqCst);
        tasks.push(Task {
            role: Role::Pump,
            handle: tokio::spawn(self.clone().pump()),
        });
        tasks.push(Task {
            role: Role::Run,
            handle: tokio::spawn(self.clone().run()),
        });
        tasks.push(Task {
            role: Role::Watchdog,
            handle: tokio::spawn(self.clone().watchdog()),
        });
    }

    /// Stops the service and throws away its undelivered mail.
    pub fn stop(&self) {
        self.shared.mailbox.open.store(false, Ordering::SeqCst);
        self.halt();
        self.discard_inbox();
    }

    /// Restarts the service. Mail queued in the meantime is kept.
    pub fn restart(&self) {
        info!("restarting service {}", self.name());
        self.halt();
        self.start();
    }

    fn halt(&self) {
        let tasks: Vec<Task> = self.shared.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        info!("stopping service {}", self.name());
        for task in tasks {
            task.handle.abort();
        }
    }

    fn discard_inbox(&self) {
        if let Ok(mut inbox) = self.shared.inbox.try_lock() {
            discard(self.name(), &mut inbox);
            return;
        }

        // An aborted pump may still hold the inbox until the runtime drops it
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => return,
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let mut inbox = shared.inbox.lock().await;
            if !shared.mailbox.is_open() {
                discard(shared.service.name(), &mut inbox);
            }
        });
    }

    fn name(&self) -> &str {
        self.shared.service.name()
    }

    async fn pump(self) {
        loop {
            let envelope = match self.shared.inbox.lock().await.recv().await {
                Some(envelope) => envelope,
                None => return,
            };

            // Control messages replace this task, so it must not look at the inbox again
            match envelope {
                Envelope::Stop => {
                    info!("{} received stop", self.name());
                    self.stop();
                    return;
                }
                Envelope::Restart => {
                    info!("{} received restart", self.name());
                    self.restart();
                    return;
                }
                Envelope::Message(message) => {
                    self.shared
                        .service
                        .handle_message(message, &self.shared.mailbox)
                        .await;
                }
            }
        }
    }

    async fn run(self) {
        match self.shared.service.run(&self.shared.mailbox).await {
            Ok(()) => info!("{} finished", self.name()),
            Err(err) if err.is_fatal() => {
                error!("{} failed and will not be restarted: {}", self.name(), err);
                self.stop();
            }
            Err(err) => error!("{} failed: {}", self.name(), err),
        }
    }

    async fn watchdog(self) {
        let mut ticks = interval_at(Instant::now() + WATCHDOG_TICK, WATCHDOG_TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let terminated = self
                .shared
                .tasks
                .lock()
                .iter()
                .find(|task| task.role != Role::Watchdog && task.handle.is_finished())
                .map(|task| task.role);

            if let Some(role) = terminated {
                error!(
                    "{}: {} task terminated unexpectedly, restarting",
                    self.name(),
                    role
                );
                // Without a pump nobody would read the restart request
                if role == Role::Pump {
                    self.restart();
                } else {
                    self.shared.mailbox.restart();
                }
                return;
            }
        }
    }
}

fn discard<M>(name: &str, inbox: &mut mpsc::UnboundedReceiver<Envelope<M>>) {
    let mut dropped = 0;
    while inbox.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("{}: dropped {} undelivered message(s)", name, dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedSender;

    // Handling this one never finishes
    const STUCK: u32 = 99;

    struct Recorder {
        runs: AtomicUsize,
        fail_first_run: bool,
        seen: UnboundedSender<u32>,
    }

    #[async_trait]
    impl Service for Recorder {
        type Message = u32;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn run(&self, _: &Mailbox<u32>) -> crate::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_run && run == 0 {
                return Err(crate::RconError::KeepAliveTimedOut.into());
            }
            std::future::pending().await
        }

        async fn handle_message(&self, message: u32, _: &Mailbox<u32>) {
            if message == 0 {
                panic!("message zero");
            }
            if message == STUCK {
                std::future::pending::<()>().await;
            }
            let _ = self.seen.send(message);
        }
    }

    fn recorder(fail_first_run: bool) -> (Supervisor<Recorder>, mpsc::UnboundedReceiver<u32>) {
        let (seen, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(Recorder {
            runs: AtomicUsize::new(0),
            fail_first_run,
            seen,
        });
        (supervisor, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_handled_in_order() {
        let (supervisor, mut seen) = recorder(false);
        supervisor.start();

        for message in 1..=5 {
            supervisor.send_message(message);
        }
        for expected in 1..=5 {
            assert_eq!(seen.recv().await, Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (supervisor, _seen) = recorder(false);
        supervisor.start();
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supervisor.service().runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_restarted_by_watchdog() {
        let (supervisor, _seen) = recorder(true);
        supervisor.start();

        tokio::time::sleep(WATCHDOG_TICK * 2).await;

        assert_eq!(supervisor.service().runs.load(Ordering::SeqCst), 2);
        assert!(supervisor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_is_restarted_and_keeps_inbox() {
        let (supervisor, mut seen) = recorder(false);
        supervisor.start();

        supervisor.send_message(0);
        supervisor.send_message(7);

        assert_eq!(seen.recv().await, Some(7));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supervisor.service().runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_message_stops_everything() {
        let (supervisor, _seen) = recorder(false);
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        supervisor.mailbox().stop();

        tokio::time::sleep(WATCHDOG_TICK * 3).await;

        assert!(!supervisor.is_running());
        assert_eq!(supervisor.service().runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_message_runs_service_again() {
        let (supervisor, _seen) = recorder(false);
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        supervisor.mailbox().restart();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(supervisor.is_running());
        assert_eq!(supervisor.service().runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_service_drops_its_mail() {
        let (supervisor, mut seen) = recorder(false);
        supervisor.send_message(1);
        supervisor.start();
        supervisor.send_message(STUCK);
        supervisor.send_message(2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        supervisor.stop();
        assert!(!supervisor.mailbox().is_open());
        supervisor.send_message(3);

        // Only mail sent while running again gets through
        supervisor.start();
        supervisor.send_message(4);
        assert_eq!(seen.recv().await, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_keeps_queued_mail() {
        let (supervisor, mut seen) = recorder(false);
        supervisor.start();
        supervisor.send_message(STUCK);
        supervisor.send_message(5);
        tokio::time::sleep(Duration::from_millis(10)).await;

        supervisor.restart();
        assert!(supervisor.mailbox().is_open());
        assert_eq!(seen.recv().await, Some(5));
    }
}

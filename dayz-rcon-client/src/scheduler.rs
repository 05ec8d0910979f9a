//! Recurring commands.
//!
//! Each configured command gets its own [`ScheduledCommand`] service. Without the clock it
//! counts down from its interval and fires when it reaches zero, over and over. With the clock
//! it fires whenever the time of day (minus the offset) is a multiple of the interval, so an
//! interval of 4 hours fires at midnight, 4:00, 8:00 and so on.

use crate::config::ScheduleConfig;
use crate::runtime::{Mailbox, Service};
use crate::session::Console;
use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Command name that runs the safe shutdown sequence instead of a server command.
pub const SAFE_SHUTDOWN: &str = "safe_shutdown";

/// How often the countdown and the clock are looked at.
pub const TICK: Duration = Duration::from_secs(2);

/// A clock schedule fires when it is less than this far away from its aligned time.
pub const ALIGNMENT_WINDOW: Duration = Duration::from_secs(5);

/// Source of the local time of day.
pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Not computed yet.
    Pending,
    /// Seconds left on the countdown.
    In(u64),
    /// Fired during the current cycle.
    Now,
    /// Next aligned time of day.
    At(NaiveTime),
}

impl Display for NextRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NextRun::Pending => write!(f, "-"),
            NextRun::In(secs) => write!(
                f,
                "{}:{:02}:{:02}",
                secs / 3600,
                secs % 3600 / 60,
                secs % 60
            ),
            NextRun::Now => write!(f, "now"),
            NextRun::At(time) => write!(f, "{}", time.format("%H:%M:%S")),
        }
    }
}

#[derive(Debug)]
pub enum ScheduleMessage {
    /// Skip the next run.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleStatus {
    pub index: usize,
    pub command: String,
    pub interval: u64,
    pub next_run: NextRun,
    pub skip_pending: bool,
    /// Whether the scheduler service is running.
    pub alive: bool,
}

impl Display for ScheduleStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} every {}s, next: {}",
            self.index, self.command, self.interval, self.next_run
        )?;
        if self.skip_pending {
            write!(f, " (skipping)")?;
        }
        if !self.alive {
            write!(f, " (stopped)")?;
        }
        Ok(())
    }
}

struct ScheduleState {
    next_run: NextRun,
    skip: bool,
}

pub struct ScheduledCommand<C: Console> {
    name: String,
    index: usize,
    schedule: ScheduleConfig,
    console: C,
    clock: Clock,
    state: Mutex<ScheduleState>,
}

impl<C: Console> ScheduledCommand<C> {
    pub fn new(index: usize, schedule: ScheduleConfig, console: C) -> Self {
        Self::with_clock(index, schedule, console, Arc::new(|| Local::now().time()))
    }

    pub fn with_clock(index: usize, schedule: ScheduleConfig, console: C, clock: Clock) -> Self {
        ScheduledCommand {
            name: format!("{} schedule #{}", console.server(), index),
            index,
            schedule,
            console,
            clock,
            state: Mutex::new(ScheduleState {
                next_run: NextRun::Pending,
                skip: false,
            }),
        }
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// Snapshot for status queries. `alive` is filled in by whoever supervises the service.
    pub fn status(&self, alive: bool) -> ScheduleStatus {
        let state = self.state.lock();
        ScheduleStatus {
            index: self.index,
            command: self.schedule.command.clone(),
            interval: self.schedule.interval,
            next_run: state.next_run,
            skip_pending: state.skip,
            alive,
        }
    }

    fn set_next_run(&self, next_run: NextRun) {
        self.state.lock().next_run = next_run;
    }

    async fn count_down(&self) {
        let mut remaining = self.schedule.interval;
        while remaining > 0 {
            self.set_next_run(NextRun::In(remaining));
            let step = remaining.min(TICK.as_secs());
            tokio::time::sleep(Duration::from_secs(step)).await;
            remaining -= step;
        }
    }

    async fn wait_for_alignment(&self) {
        loop {
            let now = (self.clock)();
            let until = time_until_aligned(now, self.schedule.interval, self.schedule.offset);

            if until < ALIGNMENT_WINDOW {
                let already_fired = self.state.lock().next_run == NextRun::Now;
                if !already_fired {
                    return;
                }
            } else {
                let at = now + chrono::Duration::milliseconds(until.as_millis() as i64);
                self.set_next_run(NextRun::At(at));
            }

            tokio::time::sleep(TICK).await;
        }
    }

    async fn fire(&self) {
        let skip = {
            let mut state = self.state.lock();
            state.next_run = NextRun::Now;
            std::mem::take(&mut state.skip)
        };

        let command = &self.schedule.command;
        if skip {
            info!("{}: skipping {}", self.name, command);
            self.console
                .notice(&format!("Skipping scheduled command: {}", command));
            return;
        }

        if command == SAFE_SHUTDOWN {
            let delay = Duration::from_secs(self.schedule.delay);
            match self.console.safe_shutdown(delay).await {
                Ok(status) => info!("{}: {}", self.name, status),
                Err(err) => warn!("{}: safe shutdown failed: {}", self.name, err),
            }
        } else {
            match self.console.execute(command).await {
                Ok(response) => info!("{}: {} -> {}", self.name, command, response),
                Err(err) => warn!("{}: {} failed: {}", self.name, command, err),
            }
        }
    }
}

#[async_trait]
impl<C: Console> Service for ScheduledCommand<C> {
    type Message = ScheduleMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _mailbox: &Mailbox<ScheduleMessage>) -> crate::Result<()> {
        if self.schedule.with_clock {
            loop {
                self.wait_for_alignment().await;
                self.fire().await;
            }
        }

        if self.schedule.offset > 0 {
            debug!("{}: waiting {}s before starting", self.name, self.schedule.offset);
            tokio::time::sleep(Duration::from_secs(self.schedule.offset as u64)).await;
        }
        loop {
            self.count_down().await;
            self.fire().await;
        }
    }

    async fn handle_message(&self, message: ScheduleMessage, _: &Mailbox<ScheduleMessage>) {
        match message {
            ScheduleMessage::Skip => {
                info!("{}: next run will be skipped", self.name);
                self.state.lock().skip = true;
            }
        }
    }
}

/// Time from `now` until the next time of day that is a whole number of `interval` seconds
/// past midnight plus `offset` seconds. Never zero: exactly on an aligned time this is a full
/// interval. Millisecond precision.
pub fn time_until_aligned(now: NaiveTime, interval: u64, offset: i64) -> Duration {
    let interval = interval.max(1) as i64 * 1000;
    // Leap seconds report more than a billion nanoseconds
    let millis = now.num_seconds_from_midnight() as i64 * 1000
        + (now.nanosecond() / 1_000_000).min(999) as i64;
    let since_alignment = (millis - offset * 1000).rem_euclid(interval);
    Duration::from_millis((interval - since_alignment) as u64)
}

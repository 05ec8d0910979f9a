use crate::packet::{decode_text, Payload};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Matches command responses to the requests that caused them.
///
/// Sequence numbers are a single byte, so at most one request per number can be in flight. When
/// any request times out every other pending request is cancelled as well and numbering starts
/// over from zero; callers see [`Error::is_cancelled`](crate::Error::is_cancelled) and decide
/// whether to retry.
#[derive(Clone)]
pub struct Registrar {
    name: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    seq: u8,
    next_ticket: u64,
    pending: HashMap<u8, Pending>,
    splits: HashMap<u8, Vec<Option<Vec<u8>>>>,
}

struct Pending {
    ticket: u64,
    reply: oneshot::Sender<String>,
    deadline: JoinHandle<()>,
}

/// Resolves to the response text, or to a cancellation error if the request timed out or the
/// registrar was reset.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<String>,
}

impl Registrar {
    pub fn new(name: &str) -> Self {
        Registrar {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn next_sequence_number(&self) -> u8 {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq = inner.seq.wrapping_add(1);
        seq
    }

    /// Registers interest in the response for `seq`. Must be called from within a Tokio runtime,
    /// as it starts a task that watches the deadline.
    pub fn register(&self, seq: u8, timeout: Duration) -> PendingResponse {
        debug!("{}: register {}", self.name, seq);
        let (reply, rx) = oneshot::channel();

        let mut inner = self.inner.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;

        let deadline = self.watch_deadline(seq, ticket, timeout);
        if let Some(previous) = inner.pending.insert(
            seq,
            Pending {
                ticket,
                reply,
                deadline,
            },
        ) {
            // The previous owner of this number is dropped, which cancels it
            warn!("{}: sequence number {} reused while pending", self.name, seq);
            previous.deadline.abort();
        }
        inner.splits.remove(&seq);

        PendingResponse { rx }
    }

    /// Feeds a command response or fragment received from the server. Responses nobody is
    /// waiting for are ignored.
    pub fn incoming(&self, payload: Payload) {
        let mut inner = self.inner.lock();

        match payload {
            Payload::Command { seq, text } => {
                debug!("{}: incoming {}", self.name, seq);
                inner.resolve(seq, text);
            }
            Payload::SplitCommand {
                seq,
                index,
                count,
                data,
            } => {
                debug!(
                    "{}: incoming {} fragment {} of {}",
                    self.name, seq, index, count
                );
                if !inner.pending.contains_key(&seq) {
                    return;
                }
                if index >= count {
                    warn!(
                        "{}: fragment index {} out of range for {} fragments",
                        self.name, index, count
                    );
                    return;
                }

                let fragments = inner
                    .splits
                    .entry(seq)
                    .or_insert_with(|| vec![None; count as usize]);
                // A different count means a stale assembly for a reused number
                if fragments.len() != count as usize {
                    *fragments = vec![None; count as usize];
                }
                fragments[index as usize] = Some(data);

                if fragments.iter().all(Option::is_some) {
                    let data: Vec<u8> = inner
                        .splits
                        .remove(&seq)
                        .into_iter()
                        .flatten()
                        .flatten()
                        .flatten()
                        .collect();
                    inner.resolve(seq, decode_text(&data));
                }
            }
            Payload::Login { .. } | Payload::Message { .. } => {}
        }
    }

    /// Cancels every pending request and starts numbering from zero again.
    pub fn reset(&self) {
        debug!("{}: reset", self.name);
        self.inner.lock().reset();
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn watch_deadline(&self, seq: u8, ticket: u64, timeout: Duration) -> JoinHandle<()> {
        let name = Arc::clone(&self.name);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut inner = inner.lock();
            let still_pending = inner
                .pending
                .get(&seq)
                .map_or(false, |pending| pending.ticket == ticket);
            if still_pending {
                warn!("{}: timed out waiting for {}, resetting", name, seq);
                inner.reset();
            }
        })
    }
}

impl Inner {
    fn resolve(&mut self, seq: u8, text: String) {
        if let Some(pending) = self.pending.remove(&seq) {
            pending.deadline.abort();
            // The caller may have stopped waiting already
            let _ = pending.reply.send(text);
        }
        self.splits.remove(&seq);
    }

    fn reset(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.deadline.abort();
        }
        self.splits.clear();
        self.seq = 0;
    }
}

impl Future for PendingResponse {
    type Output = crate::Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| crate::RconError::Cancelled.into())
    }
}

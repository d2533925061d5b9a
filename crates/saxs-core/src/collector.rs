//! Inbound collector: one background task per open connection.
//!
//! The collector owns the read half of the transport. It polls the framed
//! stream with a short timeout (so a stop request is noticed within one
//! `poll_interval`), and hands every complete message to the [`Inbox`]:
//!
//! - while commands are pending, messages are queued for their waiters;
//! - otherwise they go straight to the unsolicited handler, on this task.
//!
//! Waiters scan the queue themselves. A message a waiter rejects is put back
//! once; a second rejection (or a waiter giving up with messages still
//! queued) sends it back to the collector, which routes it to the
//! unsolicited handler. Nothing a message contains can stop the collector;
//! only a transport error or end-of-stream does, and that is reported through
//! the fault callback instead of touching the connection directly.

use crate::connection::Match;
use crate::error::{CoreError, CoreResult, ProtocolError};
use crate::transport::{DynTransport, Framing};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

/// How many times a rejected message goes back into the queue.
const MAX_PUT_BACKS: u8 = 1;

/// Identifies one outstanding exchange; returned by `send`, consumed by `wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    id: u64,
    label: Arc<str>,
}

impl Ticket {
    /// Command label this ticket was issued for.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// An exchange awaiting its reply.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Ticket id.
    pub id: u64,
    /// Command label.
    pub label: String,
    /// When the command was written.
    pub issued: Instant,
    /// Whether a caller is currently waiting on it.
    pub waiting: bool,
    examined: u64,
}

#[derive(Debug)]
struct Inbound {
    seq: u64,
    bytes: Bytes,
    rejections: u8,
}

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<Inbound>,
    overflow: Vec<Bytes>,
    pending: Vec<PendingCommand>,
    closed: Option<String>,
    next_seq: u64,
    next_id: u64,
}

/// Thread-safe queue between the collector and waiting callers.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    arrived: Notify,
    drain: Notify,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Forget everything from a previous connection.
    pub(crate) fn reset(&self) {
        *self.state.lock() = InboxState::default();
    }

    /// Reject all current and future waits with `reason`.
    pub(crate) fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.pending.clear();
        }
        self.arrived.notify_waiters();
    }

    pub(crate) fn register(&self, label: &str) -> Ticket {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        // Only messages arriving after the command was issued are candidates.
        let examined = state.next_seq;
        state.pending.push(PendingCommand {
            id,
            label: label.to_string(),
            issued: Instant::now(),
            waiting: false,
            examined,
        });
        Ticket {
            id,
            label: Arc::from(label),
        }
    }

    pub(crate) fn cancel(&self, ticket: &Ticket) {
        let request_drain = {
            let mut state = self.state.lock();
            state.pending.retain(|p| p.id != ticket.id);
            state.pending.is_empty() && (!state.queue.is_empty() || !state.overflow.is_empty())
        };
        if request_drain {
            self.drain.notify_one();
        }
    }

    /// Queue `message` for waiters, or hand it back if nobody is pending.
    pub(crate) fn deliver(&self, message: Bytes) -> Option<Bytes> {
        {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return Some(message);
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.queue.push_back(Inbound {
                seq,
                bytes: message,
                rejections: 0,
            });
        }
        self.arrived.notify_waiters();
        None
    }

    /// Number of queued messages.
    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Snapshot of the pending table.
    pub(crate) fn pending(&self) -> Vec<PendingCommand> {
        self.state.lock().pending.clone()
    }

    /// Messages nobody will claim: doubly-rejected ones, plus the whole queue
    /// when no command is pending. Tickets never waited on expire after
    /// `expiry`.
    pub(crate) fn take_unclaimed(&self, expiry: Duration) -> Vec<Bytes> {
        let mut state = self.state.lock();
        state.pending.retain(|p| {
            let keep = p.waiting || p.issued.elapsed() < expiry;
            if !keep {
                tracing::debug!(command = %p.label, "Pending command expired without a waiter");
            }
            keep
        });
        let mut out = std::mem::take(&mut state.overflow);
        if state.pending.is_empty() {
            out.extend(state.queue.drain(..).map(|m| m.bytes));
        }
        out
    }

    /// Wait until `matcher` accepts or fails a queued message, or `timeout`.
    pub(crate) async fn wait<R, M>(
        &self,
        ticket: &Ticket,
        mut matcher: M,
        timeout: Duration,
        put_back: bool,
        instrument: &str,
    ) -> CoreResult<R>
    where
        M: FnMut(&[u8]) -> Match<R>,
    {
        let deadline = Instant::now() + timeout;
        // Dropping the wait (e.g. a caller-side timeout) still retires the ticket
        let _retire = Retire {
            inbox: self,
            ticket,
        };
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(done) = self.scan(ticket, &mut matcher, put_back, instrument, timeout) {
                break done;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Err(CoreError::timeout(instrument, ticket.label(), timeout));
            }
        }
    }

    fn scan<R, M>(
        &self,
        ticket: &Ticket,
        matcher: &mut M,
        put_back: bool,
        instrument: &str,
        timeout: Duration,
    ) -> Option<CoreResult<R>>
    where
        M: FnMut(&[u8]) -> Match<R>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(reason) = &state.closed {
            return Some(Err(CoreError::broken(instrument, reason)));
        }
        let Some(pending) = state.pending.iter_mut().find(|p| p.id == ticket.id) else {
            return Some(Err(CoreError::timeout(instrument, ticket.label(), timeout)));
        };
        pending.waiting = true;

        let mut overflowed = false;
        let mut result = None;
        let mut i = 0;
        while i < state.queue.len() {
            let seq = state.queue[i].seq;
            if seq <= pending.examined {
                i += 1;
                continue;
            }
            pending.examined = seq;
            let bytes = state.queue[i].bytes.clone();
            match matcher(&bytes) {
                Match::Accept(reply) => {
                    state.queue.remove(i);
                    result = Some(Ok(reply));
                    break;
                }
                Match::Fail(e) => {
                    state.queue.remove(i);
                    result = Some(Err(CoreError::protocol(instrument, e)));
                    break;
                }
                Match::Reject if !put_back => {
                    state.queue.remove(i);
                    state.overflow.push(bytes.clone());
                    overflowed = true;
                    result = Some(Err(CoreError::protocol(
                        instrument,
                        ProtocolError::Unmatched {
                            command: ticket.label().to_string(),
                            message: String::from_utf8_lossy(&bytes).into_owned(),
                        },
                    )));
                    break;
                }
                Match::Reject => {
                    state.queue[i].rejections += 1;
                    if state.queue[i].rejections > MAX_PUT_BACKS {
                        state.queue.remove(i);
                        state.overflow.push(bytes);
                        overflowed = true;
                    } else {
                        i += 1;
                    }
                }
            }
        }
        drop(guard);
        if overflowed {
            self.drain.notify_one();
        }
        result
    }
}

struct Retire<'a> {
    inbox: &'a Inbox,
    ticket: &'a Ticket,
}

impl Drop for Retire<'_> {
    fn drop(&mut self) {
        self.inbox.cancel(self.ticket);
    }
}

// =============================================================================
// Collector task
// =============================================================================

/// Receives messages nobody claimed.
pub(crate) type UnsolicitedSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called once, with the reason, when the transport fails.
pub(crate) type FaultReporter = Box<dyn FnOnce(String) + Send>;

pub(crate) struct CollectorContext {
    pub instrument: String,
    pub framing: Framing,
    pub inbox: Arc<Inbox>,
    pub stop: Arc<AtomicBool>,
    pub poll_interval: Duration,
    pub expiry: Duration,
    pub unsolicited: UnsolicitedSink,
    pub on_fault: FaultReporter,
}

/// Start the collector for `reader`.
pub(crate) fn spawn(reader: ReadHalf<DynTransport>, ctx: CollectorContext) -> JoinHandle<()> {
    let CollectorContext {
        instrument,
        framing,
        inbox,
        stop,
        poll_interval,
        expiry,
        unsolicited,
        on_fault,
    } = ctx;

    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, framing.decoder());
        let route = |messages: Vec<Bytes>| {
            for message in messages {
                tracing::debug!(
                    instrument = %instrument,
                    message = %String::from_utf8_lossy(&message),
                    "Unsolicited message"
                );
                unsolicited(&message);
            }
        };
        tracing::debug!(instrument = %instrument, ?poll_interval, "Collector started");

        let fault = loop {
            if stop.load(Ordering::SeqCst) {
                break None;
            }
            tokio::select! {
                biased;
                _ = inbox.drain.notified() => route(inbox.take_unclaimed(expiry)),
                polled = tokio::time::timeout(poll_interval, framed.next()) => match polled {
                    Err(_) => route(inbox.take_unclaimed(expiry)),
                    Ok(Some(Ok(message))) => {
                        tracing::trace!(instrument = %instrument, len = message.len(), "Inbound message");
                        if let Some(message) = inbox.deliver(message) {
                            route(vec![message]);
                        }
                    }
                    Ok(Some(Err(e))) => break Some(e.to_string()),
                    Ok(None) => break Some("connection closed by peer".to_string()),
                },
            }
        };

        if let Some(reason) = fault {
            if stop.load(Ordering::SeqCst) {
                tracing::debug!(instrument = %instrument, %reason, "Transport closed during shutdown");
            } else {
                tracing::error!(instrument = %instrument, %reason, "Transport failed, scheduling disconnect");
                inbox.close(&reason);
                on_fault(reason);
            }
        }
        tracing::debug!(instrument = %instrument, "Collector stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_prefix(prefix: &'static [u8]) -> impl FnMut(&[u8]) -> Match<Vec<u8>> {
        move |m: &[u8]| {
            if m.starts_with(prefix) {
                Match::Accept(m.to_vec())
            } else {
                Match::Reject
            }
        }
    }

    #[tokio::test]
    async fn test_no_pending_means_unsolicited() {
        let inbox = Inbox::new();
        assert!(inbox.deliver(Bytes::from_static(b"7 OK x")).is_some());
        assert_eq!(inbox.queued(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_waiters() {
        let inbox = Inbox::new();
        let b = inbox.register("B");
        let a = inbox.register("A");
        assert!(inbox.deliver(Bytes::from_static(b"B-reply")).is_none());
        assert!(inbox.deliver(Bytes::from_static(b"A-reply")).is_none());

        let got_a = inbox
            .wait(&a, accept_prefix(b"A"), Duration::from_millis(50), true, "t")
            .await
            .unwrap();
        assert_eq!(got_a, b"A-reply");

        let got_b = inbox
            .wait(&b, accept_prefix(b"B"), Duration::from_millis(50), true, "t")
            .await
            .unwrap();
        assert_eq!(got_b, b"B-reply");
        assert_eq!(inbox.queued(), 0);
    }

    #[tokio::test]
    async fn test_second_rejection_overflows() {
        let inbox = Inbox::new();
        let a = inbox.register("A");
        let b = inbox.register("B");
        inbox.deliver(Bytes::from_static(b"C-reply"));

        let err = inbox
            .wait(&a, accept_prefix(b"A"), Duration::from_millis(10), true, "t")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert_eq!(inbox.queued(), 1, "first rejection puts the message back");

        let _ = inbox
            .wait(&b, accept_prefix(b"B"), Duration::from_millis(10), true, "t")
            .await;
        assert_eq!(inbox.queued(), 0);
        assert_eq!(inbox.take_unclaimed(Duration::from_secs(1)), vec![Bytes::from_static(b"C-reply")]);
    }

    #[tokio::test]
    async fn test_put_back_disabled_is_protocol_error() {
        let inbox = Inbox::new();
        let a = inbox.register("A");
        inbox.deliver(Bytes::from_static(b"other"));
        let err = inbox
            .wait(&a, accept_prefix(b"A"), Duration::from_millis(50), false, "t")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Protocol {
                source: ProtocolError::Unmatched { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let inbox = Arc::new(Inbox::new());
        let a = inbox.register("A");
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox
                    .wait(&a, accept_prefix(b"A"), Duration::from_secs(5), true, "t")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        inbox.close("reset by peer");
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.breaks_link());
    }

    #[tokio::test]
    async fn test_unwaited_ticket_expires() {
        let inbox = Inbox::new();
        let _t = inbox.register("fire-and-forget");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox.take_unclaimed(Duration::from_millis(5)).is_empty());
        assert!(inbox.pending().is_empty());
        assert!(inbox.deliver(Bytes::from_static(b"late")).is_some());
    }
}

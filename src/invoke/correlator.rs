//! Invoke correlator
//!
//! Tracks outstanding requests by trace id and hands each response to the
//! caller waiting on it. Responsibilities:
//! - register a pending invocation with a deadline before the request is
//!   written, so a fast response can never be missed
//! - deliver a response to its waiter exactly once; stray or late
//!   responses are dropped
//! - synthesize a `TIMEOUT` envelope once a deadline elapses
//!
//! Concurrency notes:
//! - The sending path and the inbound path never block on each other: the
//!   inbound path only performs a map lookup and a oneshot send.
//! - Each pending entry owns a oneshot channel, so any number of callers can
//!   wait on distinct trace ids without interfering.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Envelope;
use crate::utils::{MqError, Result};

#[derive(Debug)]
struct PendingInvocation {
    deadline: Instant,
    /// Taken by the first matching `add_response`.
    sender: Option<oneshot::Sender<Envelope>>,
    /// Taken by `get_response`.
    receiver: Option<oneshot::Receiver<Envelope>>,
}

/// See [`InvokeCorrelator::guard`].
#[must_use]
#[derive(Debug)]
pub struct PendingGuard<'a> {
    correlator: &'a InvokeCorrelator,
    trace_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.remove(self.trace_id);
    }
}

#[derive(Debug, Default)]
pub struct InvokeCorrelator {
    pending: Mutex<HashMap<String, PendingInvocation>>,
    /// Signalled whenever an entry is removed, for shutdown draining.
    drained: Notify,
}

impl InvokeCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request with `deadline = now + timeout`.
    pub fn add_request(&self, trace_id: &str, timeout: Duration) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.contains_key(trace_id) {
            return Err(MqError::DuplicateTraceId(trace_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            trace_id.to_string(),
            PendingInvocation {
                deadline: Instant::now() + timeout,
                sender: Some(tx),
                receiver: Some(rx),
            },
        );
        debug!("registered invocation {trace_id}, timeout {timeout:?}");
        Ok(())
    }

    /// Hand `envelope` to the caller waiting on `trace_id`.
    ///
    /// Returns `false` when there is no such invocation or it was already
    /// resolved; the response is dropped in that case.
    pub fn add_response(&self, trace_id: &str, envelope: Envelope) -> bool {
        let sender = {
            let mut pending = self.pending.lock();
            pending.get_mut(trace_id).and_then(|p| p.sender.take())
        };
        match sender {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    debug!("waiter for {trace_id} already gone, response dropped");
                    return false;
                }
                true
            }
            None => {
                debug!("no pending invocation for {trace_id}, response dropped");
                false
            }
        }
    }

    /// Wait for the response to `trace_id`, or a synthesized `TIMEOUT`
    /// envelope once the deadline passes. The entry is removed either way.
    pub async fn get_response(&self, trace_id: &str) -> Envelope {
        let waiter = {
            let mut pending = self.pending.lock();
            pending
                .get_mut(trace_id)
                .and_then(|p| p.receiver.take().map(|rx| (p.deadline, rx)))
        };

        let Some((deadline, rx)) = waiter else {
            warn!("get_response for unknown or already awaited invocation {trace_id}");
            return Envelope::timeout(trace_id);
        };

        let envelope = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(_)) | Err(_) => {
                debug!("invocation {trace_id} timed out");
                Envelope::timeout(trace_id)
            }
        };
        self.remove(trace_id);
        envelope
    }

    /// Tie the lifetime of `trace_id` to the returned guard: the entry is
    /// removed when the guard drops, including when the waiting future is
    /// cancelled before its response or deadline.
    pub fn guard<'a>(&'a self, trace_id: &'a str) -> PendingGuard<'a> {
        PendingGuard {
            correlator: self,
            trace_id,
        }
    }

    /// Drop an invocation that will never be awaited, e.g. its write failed.
    pub fn remove(&self, trace_id: &str) {
        let removed = self.pending.lock().remove(trace_id).is_some();
        if removed {
            self.drained.notify_waiters();
        }
    }

    /// Number of invocations still outstanding.
    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until no invocation is outstanding or `window` elapses.
    /// Returns `true` when fully drained.
    pub async fn wait_drained(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            let notified = self.drained.notified();
            if self.remaining() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let left = self.remaining();
                if left > 0 {
                    warn!("{left} invocations still outstanding after {window:?}");
                }
                return left == 0;
            }
        }
    }
}

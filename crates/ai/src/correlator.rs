//! Call correlation: pairs each reply with the pending call that produced it.
//!
//! Requests and replies share one byte stream, and nothing guarantees replies
//! come back in send order once the engine is concurrent. Every outgoing
//! message therefore carries a [`CallId`] and the reply names it.
//!
//! For engines that cannot echo ids, [`CorrelationMode::Fifo`] resolves the
//! oldest pending call with the next reply. That is only sound with a single
//! call in flight, so callers must serialize sends in that mode.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use finadvisor_core::CallId;

use crate::result::BridgeError;

/// What a pending call is completed with.
pub type CallOutcome = Result<JsonValue, BridgeError>;

/// How replies are matched to calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CorrelationMode {
    /// Replies carry the id of the request they answer.
    #[default]
    Tagged,
    /// Replies carry no id; the oldest pending call takes the next reply.
    Fifo,
}

impl CorrelationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationMode::Tagged => "tagged",
            CorrelationMode::Fifo => "fifo",
        }
    }
}

impl FromStr for CorrelationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tagged" | "id" => Ok(CorrelationMode::Tagged),
            "fifo" | "legacy" => Ok(CorrelationMode::Fifo),
            other => Err(format!("unknown correlation mode {other:?} (expected tagged|fifo)")),
        }
    }
}

/// Process-wide source of call ids.
///
/// Shared by every correlator of a transport so ids stay unique across
/// channel restarts.
#[derive(Debug)]
pub struct CallIdSequence {
    next: AtomicU64,
}

impl CallIdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CallId {
        CallId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-flight request awaiting its reply.
#[derive(Debug)]
pub struct PendingCall {
    pub id: CallId,
    pub submitted_at: DateTime<Utc>,
    started: Instant,
    sent: bool,
    slot: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn complete(self, outcome: CallOutcome) {
        // The waiter may already be gone (cancelled); nothing to do then.
        let _ = self.slot.send(outcome);
    }
}

#[derive(Debug, Default)]
struct Table {
    mode: CorrelationMode,
    pending: BTreeMap<CallId, PendingCall>,
    /// Replies still owed by the engine for calls we gave up on. Only
    /// counted in FIFO mode; tagged replies name their call.
    orphaned: usize,
}

/// Id-keyed table of pending calls.
///
/// All operations take one short lock and never await while holding it, so
/// registration and resolution are atomic with respect to each other.
#[derive(Debug)]
pub struct Correlator {
    ids: Arc<CallIdSequence>,
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_sequence(Arc::new(CallIdSequence::new()))
    }

    pub fn with_sequence(ids: Arc<CallIdSequence>) -> Self {
        Self {
            ids,
            table: Mutex::new(Table::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set how replies will be matched. Defaults to [`CorrelationMode::Tagged`].
    pub fn set_mode(&self, mode: CorrelationMode) {
        self.table().mode = mode;
    }

    /// Create a pending call; the receiver completes exactly once.
    pub fn register(&self) -> (CallId, oneshot::Receiver<CallOutcome>) {
        let (slot, rx) = oneshot::channel();
        let mut table = self.table();
        let id = self.ids.next_id();
        table.pending.insert(
            id,
            PendingCall {
                id,
                submitted_at: Utc::now(),
                started: Instant::now(),
                sent: false,
                slot,
            },
        );
        (id, rx)
    }

    /// Record that the request for `id` reached the engine.
    pub fn mark_sent(&self, id: CallId) {
        if let Some(call) = self.table().pending.get_mut(&id) {
            call.sent = true;
        }
    }

    /// Complete the call `id`. Unknown or already-finished ids are a logged no-op.
    pub fn resolve(&self, id: CallId, outcome: CallOutcome) -> bool {
        let call = self.table().pending.remove(&id);
        match call {
            Some(call) => {
                debug!(call_id = %id, elapsed_ms = call.started.elapsed().as_millis() as u64, "engine call resolved");
                call.complete(outcome);
                true
            }
            None => {
                debug!(call_id = %id, "reply for unknown or finished call dropped");
                false
            }
        }
    }

    /// Complete the oldest pending call (FIFO correlation).
    ///
    /// A reply owed to a call that already timed out or was cancelled is
    /// swallowed here instead of being handed to the next caller.
    pub fn resolve_oldest(&self, outcome: CallOutcome) -> Option<CallId> {
        let call = {
            let mut table = self.table();
            if table.orphaned > 0 {
                table.orphaned -= 1;
                debug!(still_owed = table.orphaned, "late reply for abandoned call dropped");
                return None;
            }
            table.pending.pop_first().map(|(_, call)| call)
        };

        match call {
            Some(call) => {
                let id = call.id;
                debug!(call_id = %id, "engine call resolved in arrival order");
                call.complete(outcome);
                Some(id)
            }
            None => {
                warn!("reply arrived with no pending call; dropped");
                None
            }
        }
    }

    /// Fail every pending call with `reason`. Returns how many were failed.
    pub fn fail_all(&self, reason: BridgeError) -> usize {
        let drained = {
            let mut table = self.table();
            table.orphaned = 0;
            std::mem::take(&mut table.pending)
        };

        let count = drained.len();
        for (_, call) in drained {
            call.complete(Err(reason.clone()));
        }
        count
    }

    /// Timer expiry: fail the call with `Timeout` if it is still pending.
    ///
    /// The id is forgotten, so a reply arriving later resolves nothing.
    pub fn expire(&self, id: CallId) -> bool {
        match self.forget(id) {
            Some(call) => {
                call.complete(Err(BridgeError::Timeout));
                true
            }
            None => false,
        }
    }

    /// Drop the call without completing it. Late replies are discarded.
    pub fn cancel(&self, id: CallId) -> bool {
        match self.forget(id) {
            Some(_) => {
                debug!(call_id = %id, "engine call cancelled");
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: CallId) -> Option<PendingCall> {
        let mut table = self.table();
        let call = table.pending.remove(&id)?;
        if call.sent && table.mode == CorrelationMode::Fifo {
            table.orphaned += 1;
        }
        Some(call)
    }

    pub fn is_pending(&self, id: CallId) -> bool {
        self.table().pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.table().pending.len()
    }

    /// Replies still owed for abandoned FIFO calls.
    pub fn owed_replies(&self) -> usize {
        self.table().orphaned
    }
}

/// Cancels its call when dropped, unless the call already finished.
///
/// Held across the await of a reply so that an abandoned future (caller gone)
/// does not leave its entry behind.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: CallId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(correlator: &'a Correlator, id: CallId) -> Self {
        Self { correlator, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.id);
    }
}

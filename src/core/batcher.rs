//! Frame-coalescing for streamed deltas.
//!
//! Providers can emit hundreds of tiny deltas per second. The batcher
//! accumulates them per transcript entry and releases them as one
//! `AppendContent` per entry when the frame timer fires, so observers see at
//! most one state revision per frame. The batcher does not own the timer:
//! `update` says when a frame must be scheduled and the caller flushes.

use crate::core::app::actions::TurnAction;
use crate::core::message::EntryId;

#[derive(Debug, Default)]
pub struct StreamBatcher {
    // Insertion-ordered; a turn streams into one or two entries at most.
    pending: Vec<(EntryId, String)>,
    flush_scheduled: bool,
}

impl StreamBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `delta` for `id`. Returns `true` when the caller must schedule
    /// a flush (no flush is pending yet).
    pub fn update(&mut self, id: EntryId, delta: &str) -> bool {
        if delta.is_empty() {
            return false;
        }
        match self.pending.iter_mut().find(|(pending_id, _)| *pending_id == id) {
            Some((_, buffer)) => buffer.push_str(delta),
            None => self.pending.push((id, delta.to_string())),
        }
        !std::mem::replace(&mut self.flush_scheduled, true)
    }

    /// Drain every buffer into one action. `None` when nothing is buffered.
    pub fn flush(&mut self) -> Option<TurnAction> {
        self.flush_scheduled = false;
        if self.pending.is_empty() {
            return None;
        }
        let appends: Vec<TurnAction> = self
            .pending
            .drain(..)
            .map(|(target, text)| TurnAction::AppendContent { target, text })
            .collect();
        Some(TurnAction::Batch(appends))
    }

    /// Drop buffered text and any scheduled flush without emitting.
    pub fn cancel(&mut self) {
        self.pending.clear();
        self.flush_scheduled = false;
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    pub fn pending_len(&self, id: &EntryId) -> usize {
        self.pending
            .iter()
            .find(|(pending_id, _)| pending_id == id)
            .map_or(0, |(_, buffer)| buffer.len())
    }
}

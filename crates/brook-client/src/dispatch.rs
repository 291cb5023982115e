//! Reply dispatcher: pending (tag → registration) table with deadlines.
//!
//! The dispatcher is pure data; the [`Context`](crate::Context) interprets
//! the slot matched for an incoming reply and feeds expired registrations
//! back through the same path as real replies.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::operation::OperationHandle;

/// What a matched reply should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplySlot {
    /// Handshake continuation (AUTH and SET_NAME replies).
    Setup,
    /// Simple-ack completion for an operation.
    SimpleAck(OperationHandle),
}

#[derive(Debug)]
struct PendingReply {
    deadline: Instant,
    slot: ReplySlot,
}

/// Table of in-flight reply registrations, keyed by correlation tag.
#[derive(Debug, Default)]
pub(crate) struct ReplyDispatcher {
    pending: HashMap<u32, PendingReply>,
}

impl ReplyDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reply slot for `tag`. Returns false if the tag is
    /// already pending, which a wrapped tag counter could in theory produce.
    #[must_use]
    pub fn register(&mut self, tag: u32, timeout: Duration, slot: ReplySlot) -> bool {
        if self.pending.contains_key(&tag) {
            return false;
        }
        self.pending.insert(
            tag,
            PendingReply {
                deadline: Instant::now() + timeout,
                slot,
            },
        );
        true
    }

    /// Consumes and returns the registration for `tag`, if any.
    pub fn take(&mut self, tag: u32) -> Option<ReplySlot> {
        self.pending.remove(&tag).map(|p| p.slot)
    }

    /// Drops the registration pointing at `handle`, if any.
    pub fn unregister_operation(&mut self, handle: OperationHandle) {
        self.pending
            .retain(|_, p| p.slot != ReplySlot::SimpleAck(handle));
    }

    /// True while any reply is outstanding.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Earliest deadline among pending registrations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Tags whose deadline has elapsed. The registrations stay pending so
    /// the synthesized TIMEOUT reply consumes them through [`take`].
    pub fn expired(&self, now: Instant) -> Vec<u32> {
        self.pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&tag, _)| tag)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn register_take_consumes_once() {
        let mut d = ReplyDispatcher::new();
        assert!(d.register(1, TIMEOUT, ReplySlot::Setup));
        assert!(d.has_pending());
        assert_eq!(d.take(1), Some(ReplySlot::Setup));
        assert_eq!(d.take(1), None);
        assert!(!d.has_pending());
    }

    #[test]
    fn duplicate_tag_rejected() {
        let mut d = ReplyDispatcher::new();
        assert!(d.register(7, TIMEOUT, ReplySlot::Setup));
        assert!(!d.register(7, TIMEOUT, ReplySlot::Setup));
        // The original registration survives the collision.
        assert_eq!(d.take(7), Some(ReplySlot::Setup));
    }

    #[test]
    fn expiry_reports_elapsed_tags() {
        let mut d = ReplyDispatcher::new();
        assert!(d.register(1, Duration::ZERO, ReplySlot::Setup));
        assert!(d.register(2, Duration::from_secs(3600), ReplySlot::Setup));

        let expired = d.expired(Instant::now());
        assert_eq!(expired, vec![1]);
        // Still pending until consumed.
        assert_eq!(d.take(1), Some(ReplySlot::Setup));
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut d = ReplyDispatcher::new();
        assert_eq!(d.next_deadline(), None);
        assert!(d.register(1, Duration::from_secs(60), ReplySlot::Setup));
        assert!(d.register(2, Duration::from_secs(5), ReplySlot::Setup));
        let deadline = d.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(5));
    }
}

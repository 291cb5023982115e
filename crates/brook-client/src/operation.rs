//! Operation arena.
//!
//! Every outstanding asynchronous request is an entry in the context's
//! operation arena; callers get back a copyable [`OperationHandle`] id. An
//! operation is pending exactly while its slot is present — finishing or
//! cancelling removes the slot, so a finished operation can never re-enter
//! the pending set.

use std::collections::HashMap;

use crate::context::Context;

/// Completion callback of a simple command: `success` is false when the
/// reply was an error or timed out.
pub(crate) type SimpleAckCallback = Box<dyn FnMut(&mut Context, bool) + 'static>;

/// Completion callback of a drain operation.
pub(crate) type DrainCallback = Box<dyn FnMut(&mut Context) + 'static>;

/// Handle to one outstanding asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle(u64);

/// Completion shape of an operation, dispatched by matching.
pub(crate) enum OperationKind {
    SimpleAck { callback: Option<SimpleAckCallback> },
    Drain { callback: Option<DrainCallback> },
}

/// Arena of pending operations with stable ids.
#[derive(Default)]
pub(crate) struct OperationSet {
    slots: HashMap<u64, OperationKind>,
    next_id: u64,
}

impl OperationSet {
    pub fn insert(&mut self, kind: OperationKind) -> OperationHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, kind);
        OperationHandle(id)
    }

    /// Removes and returns the slot, finishing the operation.
    pub fn take(&mut self, handle: OperationHandle) -> Option<OperationKind> {
        self.slots.remove(&handle.0)
    }

    pub fn contains(&self, handle: OperationHandle) -> bool {
        self.slots.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drops every slot without running callbacks.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_take_is_single_shot() {
        let mut ops = OperationSet::default();
        let a = ops.insert(OperationKind::Drain { callback: None });
        let b = ops.insert(OperationKind::Drain { callback: None });
        assert_ne!(a, b);
        assert_eq!(ops.len(), 2);

        assert!(ops.take(a).is_some());
        assert!(ops.take(a).is_none());
        assert!(!ops.contains(a));
        assert!(ops.contains(b));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut ops = OperationSet::default();
        let a = ops.insert(OperationKind::Drain { callback: None });
        ops.take(a);
        let b = ops.insert(OperationKind::Drain { callback: None });
        assert_ne!(a, b);
    }
}

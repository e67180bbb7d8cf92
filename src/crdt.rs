//! Replicated character sequence the application servers edit.
//!
//! Each inserted character carries a globally unique id and anchors to the
//! id of its predecessor at insertion time. Concurrent inserts under the
//! same anchor are ordered by id, deletes tombstone by id, and every
//! applied insert id is remembered, so delivering the same operation twice
//! leaves the text unchanged. Replicas that apply the same set of
//! operations materialize the same text regardless of arrival order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Unique identity of one inserted element: a Lamport-style counter plus
/// the inserting replica's name as the tiebreak. Ordering compares the
/// counter first, so ids from different replicas are totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub replica: String,
}

/// A commutative edit exchanged between replicas and broadcast to editor
/// sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        id: OpId,
        anchor: Option<OpId>,
        value: String,
    },
    Delete {
        target: OpId,
    },
}

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    value: String,
    deleted: bool,
}

/// One replica of the shared text.
#[derive(Debug)]
pub struct TextReplica {
    replica: String,
    clock: u64,
    elements: Vec<Element>,
    applied: HashSet<OpId>,
}

impl TextReplica {
    pub fn new(replica: &str) -> Self {
        Self {
            replica: replica.to_string(),
            clock: 0,
            elements: Vec::new(),
            applied: HashSet::new(),
        }
    }

    /// Inserts `value` at the given visible index and returns the operation
    /// peer replicas need to converge. Out-of-range indices clamp to the
    /// end of the text.
    pub fn local_insert(&mut self, index: usize, value: &str) -> Operation {
        let index = index.min(self.visible_len());
        let anchor = if index == 0 {
            None
        } else {
            self.visible_nth(index - 1).map(|element| element.id.clone())
        };
        self.clock += 1;
        let operation = Operation::Insert {
            id: OpId {
                counter: self.clock,
                replica: self.replica.clone(),
            },
            anchor,
            value: value.to_string(),
        };
        self.apply(&operation);
        operation
    }

    /// Deletes the element at the given visible index. Returns `None` when
    /// the index is out of range, leaving the text untouched.
    pub fn local_delete(&mut self, index: usize) -> Option<Operation> {
        let target = self.visible_nth(index)?.id.clone();
        let operation = Operation::Delete { target };
        self.apply(&operation);
        Some(operation)
    }

    /// Applies a local or remote operation. Idempotent: re-applying an
    /// operation that has already been integrated is a no-op.
    pub fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::Insert { id, anchor, value } => {
                self.integrate_insert(id, anchor.as_ref(), value);
            }
            Operation::Delete { target } => self.integrate_delete(target),
        }
    }

    fn integrate_insert(&mut self, id: &OpId, anchor: Option<&OpId>, value: &str) {
        if self.applied.contains(id) {
            return;
        }

        let mut position = match anchor {
            Some(anchor_id) => match self.elements.iter().position(|e| &e.id == anchor_id) {
                Some(found) => found + 1,
                // Anchor not seen yet; place at the end rather than drop.
                None => self.elements.len(),
            },
            None => 0,
        };

        // Concurrent siblings under the same anchor sort by descending id,
        // so skip over the ones that win against this insert.
        while position < self.elements.len() && self.elements[position].id > *id {
            position += 1;
        }

        self.elements.insert(
            position,
            Element {
                id: id.clone(),
                value: value.to_string(),
                deleted: false,
            },
        );
        self.applied.insert(id.clone());
        self.clock = self.clock.max(id.counter);
    }

    fn integrate_delete(&mut self, target: &OpId) {
        if let Some(element) = self.elements.iter_mut().find(|e| &e.id == target) {
            element.deleted = true;
        }
    }

    /// The visible text, in order.
    pub fn materialize(&self) -> String {
        self.elements
            .iter()
            .filter(|element| !element.deleted)
            .map(|element| element.value.as_str())
            .collect()
    }

    pub fn visible_len(&self) -> usize {
        self.elements.iter().filter(|element| !element.deleted).count()
    }

    fn visible_nth(&self, n: usize) -> Option<&Element> {
        self.elements
            .iter()
            .filter(|element| !element.deleted)
            .nth(n)
    }
}

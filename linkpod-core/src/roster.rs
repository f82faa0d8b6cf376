//! Membership tracker: ordered roster of session participants.
//!
//! The roster head (index 0) is the session originator. Each peer owns its
//! own replica; convergence happens through protocol messages, never shared
//! memory.

use crate::identity::PeerId;

/// Ordered, duplicate-free list of active participants.
#[derive(Debug, Default)]
pub struct Roster {
    members: Vec<PeerId>,
    self_index: Option<usize>,
    originator_departed: bool,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append each id not already present. Duplicate join delivery is a
    /// no-op, not an error.
    pub fn on_join(&mut self, ids: &[PeerId]) {
        for id in ids {
            if !self.members.contains(id) {
                self.members.push(id.clone());
            }
        }
    }

    /// Remove each present id; absent ids are ignored. Returns true if any
    /// removed id was the roster head, i.e. the originator departed.
    pub fn on_leave(&mut self, ids: &[PeerId]) -> bool {
        let mut head_departed = false;
        for id in ids {
            let Some(pos) = self.members.iter().position(|m| m == id) else {
                continue;
            };
            if pos == 0 {
                head_departed = true;
                self.originator_departed = true;
            }
            self.members.remove(pos);
            if let Some(own) = self.self_index {
                if pos < own {
                    self.self_index = Some(own - 1);
                }
            }
        }
        head_departed
    }

    /// Replace the roster wholesale with the list received from the session
    /// owner during the join handshake. Records the local peer's own index
    /// by locating `self_id` in the received list.
    pub fn adopt(&mut self, members: Vec<PeerId>, self_id: &PeerId) -> Option<usize> {
        self.members = members;
        self.self_index = self.members.iter().position(|m| m == self_id);
        self.self_index
    }

    pub fn head(&self) -> Option<&PeerId> {
        self.members.first()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.members.contains(id)
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Index of the local peer within the roster, known once a roster has
    /// been adopted (or the peer located itself at adoption time).
    pub fn self_index(&self) -> Option<usize> {
        self.self_index
    }

    /// Whether the session originator has left at any point. Sticky.
    pub fn originator_departed(&self) -> bool {
        self.originator_departed
    }
}

//! Replicated link store: ordered records, tombstone removal.
//!
//! Mutations here are local-apply only; broadcasting them to peers is the
//! session engine's job.

use crate::identity::{LinkId, PeerId};

/// One shared link. `deleted` marks logical removal; records are never
/// physically dropped so positional indices already handed to the UI stay
/// stable.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub id: LinkId,
    pub url: String,
    pub title: String,
    pub color: String,
    pub owner: PeerId,
    pub thumbnail: Vec<u8>,
    pub deleted: bool,
}

/// Insertion-ordered collection of link records, one instance per session.
#[derive(Debug, Default)]
pub struct LinkStore {
    records: Vec<LinkRecord>,
}

impl LinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new live record and return its position. The id is derived
    /// from the URL here. No dedup by id: two peers adding the same URL
    /// independently produce two entries.
    pub fn add(
        &mut self,
        url: impl Into<String>,
        title: impl Into<String>,
        color: impl Into<String>,
        owner: PeerId,
        thumbnail: Vec<u8>,
    ) -> usize {
        let url = url.into();
        self.records.push(LinkRecord {
            id: LinkId::from_url(&url),
            url,
            title: title.into(),
            color: color.into(),
            owner,
            thumbnail,
            deleted: false,
        });
        self.records.len() - 1
    }

    /// Tombstone the first live record with this id. Returns true if a
    /// record actually flipped; tombstoning an absent or already-removed id
    /// is a no-op.
    pub fn mark_removed(&mut self, id: &LinkId) -> bool {
        match self
            .records
            .iter_mut()
            .find(|r| !r.deleted && &r.id == id)
        {
            Some(record) => {
                record.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Non-tombstoned records in insertion order.
    pub fn active(&self) -> impl Iterator<Item = &LinkRecord> {
        self.records.iter().filter(|r| !r.deleted)
    }

    /// Whether a live record with this (id, owner) pair exists. Used to
    /// drop retransmitted bulk transfers.
    pub fn has_active(&self, id: &LinkId, owner: &PeerId) -> bool {
        self.records
            .iter()
            .any(|r| !r.deleted && &r.id == id && &r.owner == owner)
    }

    pub fn get(&self, index: usize) -> Option<&LinkRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

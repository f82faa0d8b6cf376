//! Presentation bridge: immutable link notifications for the host UI.
//!
//! The engine never hands the UI a reference into its own store; it emits
//! self-contained event values instead.

use crate::identity::{LinkId, PeerId};
use crate::links::LinkRecord;

/// A change to the replicated link list, ready for display.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A link appeared at `index` (remote add or bulk transfer).
    Added {
        url: String,
        thumbnail: Vec<u8>,
        color: String,
        title: String,
        owner: PeerId,
        index: usize,
    },
    /// The link with this id was removed.
    Removed { id: LinkId },
}

impl LinkEvent {
    pub(crate) fn added(record: &LinkRecord, index: usize) -> Self {
        LinkEvent::Added {
            url: record.url.clone(),
            thumbnail: record.thumbnail.clone(),
            color: record.color.clone(),
            title: record.title.clone(),
            owner: record.owner.clone(),
            index,
        }
    }
}

//! LinkPod wire protocol: message types and version.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::identity::{LinkId, PeerId};

/// Current protocol version. Carried in Hello so mismatched peers can be
/// diagnosed from logs.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types, one variant per protocol operation. Encoding is
/// bincode; framing is length-prefix (see wire module). Hello, AddLink and
/// RemoveLink travel as broadcasts; InitMembers and TransferLink as direct
/// calls from the session owner to a joiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Announce presence to current members after joining the bus.
    Hello { protocol_version: u8 },
    /// A member added a link.
    AddLink(LinkPayload),
    /// A member removed a link, identified by its derived id.
    RemoveLink { link_id: LinkId },
    /// Owner hands a joiner the full roster, once.
    InitMembers { roster: Vec<PeerId> },
    /// Owner hands a joiner one existing link, once per live link.
    TransferLink(LinkPayload),
}

/// Link fields as they travel on the wire. The thumbnail rides as base64
/// text; everything else is plain text. The link id is never carried here,
/// receivers rederive it from the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPayload {
    pub url: String,
    pub title: String,
    pub color: String,
    pub owner: PeerId,
    pub thumbnail: String,
}

impl LinkPayload {
    /// Build a payload from raw link fields, encoding the thumbnail bytes.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        color: impl Into<String>,
        owner: PeerId,
        thumbnail: &[u8],
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            color: color.into(),
            owner,
            thumbnail: base64::engine::general_purpose::STANDARD.encode(thumbnail),
        }
    }

    /// Decode the thumbnail back to raw bytes.
    pub fn thumbnail_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.thumbnail)
            .map_err(PayloadError::Thumbnail)
    }
}

/// Malformed payload field inside an otherwise decodable message.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid thumbnail encoding: {0}")]
    Thumbnail(#[from] base64::DecodeError),
}

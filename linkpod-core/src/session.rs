//! Host-driven session engine: the host passes bus events in, SessionCore
//! returns actions to execute.
//!
//! One instance per peer. The engine exclusively owns its roster and link
//! store; peers coordinate only through the messages in [`crate::protocol`].

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::bridge::LinkEvent;
use crate::identity::{LinkId, PeerId};
use crate::links::LinkStore;
use crate::protocol::{LinkPayload, Message, PROTOCOL_VERSION};
use crate::roster::Roster;
use crate::wire;

/// Default timeout for direct calls in ticks. An expired call marks the
/// target as implicitly departed.
pub const DEFAULT_CALL_TIMEOUT_TICKS: u64 = 30;

/// Identifier for one in-flight direct call (16 random bytes).
pub type CallId = [u8; 16];

/// Where the engine is in the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No membership event seen yet.
    Idle,
    /// Hello sent; waiting for the owner's roster.
    AwaitingRoster,
    /// Replica is live.
    Synced,
}

/// Action for the host to perform.
#[derive(Debug)]
pub enum OutboundAction {
    /// Fire-and-forget signal to every subscriber on the bus, the local
    /// peer included (the bus echoes broadcasts back to the sender).
    Broadcast(Vec<u8>),
    /// Point-to-point call. The host reports the outcome later through
    /// `on_call_reply` / `on_call_error`.
    Call {
        call_id: CallId,
        target: PeerId,
        frame: Vec<u8>,
    },
    /// Surface a link change to the UI.
    Notify(LinkEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message")]
    DecodeFailed,
}

struct PendingCall {
    target: PeerId,
    operation: &'static str,
    issued_tick: u64,
}

/// Sync protocol engine. Host passes events; engine returns actions.
pub struct SessionCore {
    self_id: PeerId,
    is_owner: bool,
    state: SyncState,
    roster: Roster,
    links: LinkStore,
    pending_calls: HashMap<CallId, PendingCall>,
    tick_count: u64,
    call_timeout_ticks: u64,
}

impl SessionCore {
    /// `self_id` is the bus-assigned unique name of the local peer, passed
    /// in explicitly so every self-filter comparison is against a known
    /// value. `is_initiator` is true for the peer that created the session.
    pub fn new(self_id: PeerId, is_initiator: bool) -> Self {
        Self {
            self_id,
            is_owner: is_initiator,
            state: SyncState::Idle,
            roster: Roster::new(),
            links: LinkStore::new(),
            pending_calls: HashMap::new(),
            tick_count: 0,
            call_timeout_ticks: DEFAULT_CALL_TIMEOUT_TICKS,
        }
    }

    /// Set custom direct-call timeout in ticks.
    pub fn set_call_timeout(&mut self, ticks: u64) {
        self.call_timeout_ticks = ticks;
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Whether this peer currently serves joiners with the bulk catch-up
    /// transfer. True for the session creator, and for a promoted successor
    /// after the originator departs.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn links(&self) -> &LinkStore {
        &self.links
    }

    /// Bus membership delta. Leaves are applied before joins so originator
    /// departure is judged against the roster as it was.
    pub fn on_participant_change(
        &mut self,
        added: &[PeerId],
        removed: &[PeerId],
    ) -> Vec<OutboundAction> {
        let mut actions = Vec::new();

        for id in removed {
            debug!(peer = %id, "member left");
            self.abandon_calls_to(id);
        }
        if self.roster.on_leave(removed) {
            self.promote_successor();
        }

        if self.state == SyncState::Idle {
            if self.is_owner {
                debug!(id = %self.self_id, "initialising a new shared session");
                self.roster
                    .adopt(vec![self.self_id.clone()], &self.self_id);
                self.state = SyncState::Synced;
            } else {
                debug!(id = %self.self_id, "announcing presence to current members");
                let hello = Message::Hello {
                    protocol_version: PROTOCOL_VERSION,
                };
                if let Ok(frame) = wire::encode_frame(&hello) {
                    actions.push(OutboundAction::Broadcast(frame));
                }
                self.state = SyncState::AwaitingRoster;
            }
        }

        self.roster.on_join(added);
        actions
    }

    /// Process a received frame, broadcast or direct call alike. The bus
    /// delivers the local peer's own broadcasts too; mutation signals from
    /// self are skipped here.
    pub fn on_message_received(
        &mut self,
        sender: &PeerId,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, MessageError> {
        let (msg, _consumed) =
            wire::decode_frame(bytes).map_err(|_| MessageError::DecodeFailed)?;

        let mut actions = Vec::new();

        match msg {
            Message::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        peer = %sender,
                        version = protocol_version,
                        "hello from peer with different protocol version"
                    );
                }
                self.roster.on_join(std::slice::from_ref(sender));
                if self.is_owner && sender != &self.self_id {
                    actions.extend(self.handshake_with(sender));
                }
            }
            Message::AddLink(payload) => {
                if sender != &self.self_id {
                    self.apply_remote_add(sender, payload, "add-link", &mut actions);
                }
            }
            Message::RemoveLink { link_id } => {
                if sender != &self.self_id && self.links.mark_removed(&link_id) {
                    debug!(peer = %sender, id = %link_id, "removed link");
                    actions.push(OutboundAction::Notify(LinkEvent::Removed { id: link_id }));
                }
            }
            Message::InitMembers { roster } => {
                let index = self.roster.adopt(roster, &self.self_id);
                debug!(peer = %sender, index = ?index, "adopted roster from session owner");
                self.state = SyncState::Synced;
            }
            Message::TransferLink(payload) => {
                let id = LinkId::from_url(&payload.url);
                if self.links.has_active(&id, &payload.owner) {
                    debug!(peer = %sender, %id, "ignoring retransmitted link");
                } else {
                    self.apply_remote_add(sender, payload, "transfer-link", &mut actions);
                }
            }
        }

        Ok(actions)
    }

    /// Local user added a link. Applies to the store, then broadcasts with
    /// the same payload shape the bulk transfer uses. Returns the new
    /// record's position. No UI notification: the UI initiated this.
    pub fn add_link(
        &mut self,
        url: &str,
        title: &str,
        color: &str,
        owner: PeerId,
        thumbnail: Vec<u8>,
    ) -> (usize, Vec<OutboundAction>) {
        let payload = LinkPayload::new(url, title, color, owner.clone(), &thumbnail);
        let index = self.links.add(url, title, color, owner, thumbnail);
        debug!(url, index, "added local link");
        let mut actions = Vec::new();
        if let Ok(frame) = wire::encode_frame(&Message::AddLink(payload)) {
            actions.push(OutboundAction::Broadcast(frame));
        }
        (index, actions)
    }

    /// Local user removed a link. Tombstones locally, then broadcasts the
    /// identifier.
    pub fn remove_link(&mut self, id: &LinkId) -> Vec<OutboundAction> {
        if self.links.mark_removed(id) {
            debug!(%id, "removed local link");
        }
        let mut actions = Vec::new();
        let msg = Message::RemoveLink {
            link_id: id.clone(),
        };
        if let Ok(frame) = wire::encode_frame(&msg) {
            actions.push(OutboundAction::Broadcast(frame));
        }
        actions
    }

    /// Host reports a direct call completed.
    pub fn on_call_reply(&mut self, call_id: CallId) {
        self.pending_calls.remove(&call_id);
    }

    /// Host reports a direct call failed. Logged, never retried; remaining
    /// handshake transfers proceed on their own.
    pub fn on_call_error(&mut self, call_id: CallId, error: &str) {
        match self.pending_calls.remove(&call_id) {
            Some(call) => error!(
                operation = call.operation,
                target = %call.target,
                error,
                "direct call failed"
            ),
            None => error!(error, "direct call failed for unknown call"),
        }
    }

    /// Periodic tick: expire overdue direct calls. A timed-out call marks
    /// its target as implicitly departed, the same path as a bus leave.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.tick_count = self.tick_count.saturating_add(1);

        let overdue: Vec<CallId> = self
            .pending_calls
            .iter()
            .filter(|(_, c)| {
                self.tick_count.saturating_sub(c.issued_tick) > self.call_timeout_ticks
            })
            .map(|(&id, _)| id)
            .collect();

        let mut actions = Vec::new();
        for call_id in overdue {
            let Some(call) = self.pending_calls.remove(&call_id) else {
                continue;
            };
            error!(
                operation = call.operation,
                target = %call.target,
                "direct call timed out; treating peer as departed"
            );
            actions.extend(self.on_participant_change(&[], std::slice::from_ref(&call.target)));
        }
        actions
    }

    /// Number of direct calls still awaiting completion.
    pub fn pending_calls(&self) -> usize {
        self.pending_calls.len()
    }

    /// Join handshake with a new member: the full roster first, then every
    /// live link in store order. Each call is tracked for timeout; a failed
    /// transfer is logged and skipped without blocking the rest.
    fn handshake_with(&mut self, joiner: &PeerId) -> Vec<OutboundAction> {
        debug!(joiner = %joiner, links = self.links.active().count(), "starting join handshake");
        let mut actions = Vec::new();

        let init = Message::InitMembers {
            roster: self.roster.members().to_vec(),
        };
        if let Ok(frame) = wire::encode_frame(&init) {
            actions.push(self.track_call(joiner.clone(), "init-members", frame));
        }

        let payloads: Vec<LinkPayload> = self
            .links
            .active()
            .map(|r| {
                LinkPayload::new(
                    r.url.clone(),
                    r.title.clone(),
                    r.color.clone(),
                    r.owner.clone(),
                    &r.thumbnail,
                )
            })
            .collect();
        for payload in payloads {
            if let Ok(frame) = wire::encode_frame(&Message::TransferLink(payload)) {
                actions.push(self.track_call(joiner.clone(), "transfer-link", frame));
            }
        }
        actions
    }

    fn track_call(
        &mut self,
        target: PeerId,
        operation: &'static str,
        frame: Vec<u8>,
    ) -> OutboundAction {
        let call_id: CallId = uuid::Uuid::new_v4().into_bytes();
        self.pending_calls.insert(
            call_id,
            PendingCall {
                target: target.clone(),
                operation,
                issued_tick: self.tick_count,
            },
        );
        OutboundAction::Call {
            call_id,
            target,
            frame,
        }
    }

    fn apply_remote_add(
        &mut self,
        sender: &PeerId,
        payload: LinkPayload,
        operation: &'static str,
        actions: &mut Vec<OutboundAction>,
    ) {
        let thumbnail = match payload.thumbnail_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(operation, url = %payload.url, error = %e, "dropping link with malformed thumbnail");
                return;
            }
        };
        let LinkPayload {
            url,
            title,
            color,
            owner,
            ..
        } = payload;
        let index = self.links.add(url, title, color, owner, thumbnail);
        if let Some(record) = self.links.get(index) {
            debug!(peer = %sender, url = %record.url, index, "added link");
            actions.push(OutboundAction::Notify(LinkEvent::added(record, index)));
        }
    }

    fn abandon_calls_to(&mut self, peer: &PeerId) {
        let stale: Vec<CallId> = self
            .pending_calls
            .iter()
            .filter(|(_, c)| &c.target == peer)
            .map(|(&id, _)| id)
            .collect();
        for call_id in stale {
            if let Some(call) = self.pending_calls.remove(&call_id) {
                debug!(
                    operation = call.operation,
                    target = %call.target,
                    "abandoning call to departed peer"
                );
            }
        }
    }

    fn promote_successor(&mut self) {
        match self.roster.head() {
            Some(head) if *head == self.self_id => {
                debug!(id = %self.self_id, "session originator departed; assuming ownership");
                self.is_owner = true;
            }
            Some(head) => {
                debug!(successor = %head, "session originator departed");
            }
            None => debug!("session originator departed; session is empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: &str) -> PeerId {
        PeerId::from(n)
    }

    fn initiator(id: &str) -> SessionCore {
        let mut core = SessionCore::new(peer(id), true);
        let actions = core.on_participant_change(std::slice::from_ref(&peer(id)), &[]);
        assert!(actions.is_empty());
        core
    }

    fn frame(msg: &Message) -> Vec<u8> {
        wire::encode_frame(msg).unwrap()
    }

    fn payload(url: &str, owner: &PeerId, thumb: &[u8]) -> LinkPayload {
        LinkPayload::new(url, "title", "#101010,#fefefe", owner.clone(), thumb)
    }

    #[test]
    fn initiator_first_event_goes_synced() {
        let core = initiator(":1.0");
        assert_eq!(core.state(), SyncState::Synced);
        assert!(core.is_owner());
        assert_eq!(core.roster().members(), &[peer(":1.0")]);
        assert_eq!(core.roster().self_index(), Some(0));
    }

    #[test]
    fn joiner_first_event_sends_hello() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        let actions =
            core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        assert_eq!(core.state(), SyncState::AwaitingRoster);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            OutboundAction::Broadcast(bytes) => {
                let (msg, _) = wire::decode_frame(bytes).unwrap();
                assert!(matches!(msg, Message::Hello { .. }));
            }
            other => panic!("expected Broadcast, got {other:?}"),
        }
        // Only the first membership event announces.
        let again = core.on_participant_change(&[peer(":1.6")], &[]);
        assert!(again.is_empty());
    }

    #[test]
    fn init_members_adopts_roster_and_syncs() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        let msg = Message::InitMembers {
            roster: vec![peer(":1.0"), peer(":1.5")],
        };
        let actions = core.on_message_received(&peer(":1.0"), &frame(&msg)).unwrap();
        assert!(actions.is_empty());
        assert_eq!(core.state(), SyncState::Synced);
        assert_eq!(core.roster().members(), &[peer(":1.0"), peer(":1.5")]);
        assert_eq!(core.roster().self_index(), Some(1));
    }

    #[test]
    fn hello_triggers_handshake_on_owner() {
        let mut core = initiator(":1.0");
        core.add_link("http://a", "a", "", peer(":1.0"), vec![1]);
        core.add_link("http://b", "b", "", peer(":1.0"), vec![2]);
        core.add_link("http://dead", "dead", "", peer(":1.0"), vec![]);
        core.remove_link(&LinkId::from_url("http://dead"));

        let joiner = peer(":1.7");
        let msg = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        let actions = core.on_message_received(&joiner, &frame(&msg)).unwrap();

        assert!(core.roster().contains(&joiner));
        // Roster first, then the two live links in store order; the
        // tombstoned one stays home.
        assert_eq!(actions.len(), 3);
        let mut urls = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            let OutboundAction::Call { target, frame, .. } = action else {
                panic!("expected Call, got {action:?}");
            };
            assert_eq!(target, &joiner);
            let (msg, _) = wire::decode_frame(frame).unwrap();
            match (i, msg) {
                (0, Message::InitMembers { roster }) => {
                    assert_eq!(roster, vec![peer(":1.0"), joiner.clone()]);
                }
                (_, Message::TransferLink(p)) => urls.push(p.url),
                (_, other) => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(urls, vec!["http://a".to_owned(), "http://b".to_owned()]);
        assert_eq!(core.pending_calls(), 3);
    }

    #[test]
    fn hello_ignored_by_non_owner() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        let msg = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        let actions = core.on_message_received(&peer(":1.9"), &frame(&msg)).unwrap();
        assert!(actions.is_empty());
        assert!(core.roster().contains(&peer(":1.9")));
    }

    #[test]
    fn own_add_broadcast_is_filtered() {
        let mut core = initiator(":1.0");
        let (index, actions) =
            core.add_link("http://x", "x", "", peer(":1.0"), vec![9]);
        assert_eq!(index, 0);
        let OutboundAction::Broadcast(echo) = &actions[0] else {
            panic!("expected Broadcast");
        };
        // The bus echoes the broadcast back to the sender.
        let me = peer(":1.0");
        let produced = core.on_message_received(&me, echo).unwrap();
        assert!(produced.is_empty());
        assert_eq!(core.links().len(), 1);
    }

    #[test]
    fn remote_add_applies_and_notifies() {
        let mut core = initiator(":1.0");
        let sender = peer(":1.4");
        let msg = Message::AddLink(payload("http://y", &sender, b"pix"));
        let actions = core.on_message_received(&sender, &frame(&msg)).unwrap();
        assert_eq!(core.links().active().count(), 1);
        let record = core.links().get(0).unwrap();
        assert_eq!(record.id, LinkId::from_url("http://y"));
        assert_eq!(record.thumbnail, b"pix");
        match &actions[0] {
            OutboundAction::Notify(LinkEvent::Added { url, index, .. }) => {
                assert_eq!(url, "http://y");
                assert_eq!(*index, 0);
            }
            other => panic!("expected Notify(Added), got {other:?}"),
        }
    }

    #[test]
    fn duplicate_remove_emits_single_event() {
        let mut core = initiator(":1.0");
        let sender = peer(":1.4");
        let add = Message::AddLink(payload("http://y", &sender, b""));
        core.on_message_received(&sender, &frame(&add)).unwrap();

        let rm = Message::RemoveLink {
            link_id: LinkId::from_url("http://y"),
        };
        let first = core.on_message_received(&sender, &frame(&rm)).unwrap();
        let second = core.on_message_received(&sender, &frame(&rm)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(core.links().active().count(), 0);
    }

    #[test]
    fn own_remove_broadcast_is_filtered() {
        let mut core = initiator(":1.0");
        core.add_link("http://x", "x", "", peer(":1.0"), vec![]);
        let actions = core.remove_link(&LinkId::from_url("http://x"));
        let OutboundAction::Broadcast(echo) = &actions[0] else {
            panic!("expected Broadcast");
        };
        let me = peer(":1.0");
        let produced = core.on_message_received(&me, echo).unwrap();
        assert!(produced.is_empty());
    }

    #[test]
    fn transfer_link_rederives_id_locally() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        let owner = peer(":1.0");
        let msg = Message::TransferLink(payload("http://z", &owner, b"img"));
        core.on_message_received(&owner, &frame(&msg)).unwrap();
        let record = core.links().get(0).unwrap();
        assert_eq!(record.id, LinkId::from_url("http://z"));
    }

    #[test]
    fn retransmitted_transfer_is_dropped() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        let owner = peer(":1.0");
        let msg = Message::TransferLink(payload("http://z", &owner, b"img"));
        let first = core.on_message_received(&owner, &frame(&msg)).unwrap();
        let second = core.on_message_received(&owner, &frame(&msg)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(core.links().len(), 1);
    }

    #[test]
    fn malformed_thumbnail_drops_mutation() {
        let mut core = initiator(":1.0");
        let sender = peer(":1.4");
        let mut p = payload("http://bad", &sender, b"");
        p.thumbnail = "@@@not-base64@@@".to_owned();
        let actions = core
            .on_message_received(&sender, &frame(&Message::AddLink(p)))
            .unwrap();
        assert!(actions.is_empty());
        assert!(core.links().is_empty());
    }

    #[test]
    fn undecodable_frame_is_an_error() {
        let mut core = initiator(":1.0");
        let err = core.on_message_received(&peer(":1.4"), &[0xff, 0x01]);
        assert!(matches!(err, Err(MessageError::DecodeFailed)));
    }

    #[test]
    fn call_error_clears_pending_without_retry() {
        let mut core = initiator(":1.0");
        core.add_link("http://a", "a", "", peer(":1.0"), vec![]);
        let joiner = peer(":1.7");
        let msg = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        let actions = core.on_message_received(&joiner, &frame(&msg)).unwrap();
        let OutboundAction::Call { call_id, .. } = &actions[1] else {
            panic!("expected Call");
        };
        core.on_call_error(*call_id, "connection reset");
        assert_eq!(core.pending_calls(), 1);
        // No new actions were produced; the failed transfer is not retried.
    }

    #[test]
    fn call_timeout_marks_peer_departed() {
        let mut core = initiator(":1.0");
        core.set_call_timeout(2);
        core.add_link("http://a", "a", "", peer(":1.0"), vec![]);
        let joiner = peer(":1.7");
        let msg = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        core.on_message_received(&joiner, &frame(&msg)).unwrap();
        assert_eq!(core.pending_calls(), 2);
        assert!(core.roster().contains(&joiner));

        for _ in 0..4 {
            core.tick();
        }

        assert_eq!(core.pending_calls(), 0);
        assert!(!core.roster().contains(&joiner));
    }

    #[test]
    fn reply_before_timeout_keeps_peer() {
        let mut core = initiator(":1.0");
        core.set_call_timeout(2);
        let joiner = peer(":1.7");
        let msg = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        let actions = core.on_message_received(&joiner, &frame(&msg)).unwrap();
        let OutboundAction::Call { call_id, .. } = &actions[0] else {
            panic!("expected Call");
        };
        core.on_call_reply(*call_id);

        for _ in 0..4 {
            core.tick();
        }

        assert!(core.roster().contains(&joiner));
    }

    #[test]
    fn departure_of_head_promotes_self_when_next() {
        let mut core = SessionCore::new(peer(":1.5"), false);
        core.on_participant_change(&[peer(":1.0"), peer(":1.5")], &[]);
        let init = Message::InitMembers {
            roster: vec![peer(":1.0"), peer(":1.5")],
        };
        core.on_message_received(&peer(":1.0"), &frame(&init)).unwrap();
        assert!(!core.is_owner());

        core.on_participant_change(&[], &[peer(":1.0")]);

        assert!(core.roster().originator_departed());
        assert!(core.is_owner());
        assert_eq!(core.roster().members(), &[peer(":1.5")]);
    }

    #[test]
    fn duplicate_leave_notifications_are_noops() {
        let mut core = initiator(":1.0");
        core.on_participant_change(&[peer(":1.1")], &[]);
        core.on_participant_change(&[], &[peer(":1.1")]);
        core.on_participant_change(&[], &[peer(":1.1")]);
        assert_eq!(core.roster().members(), &[peer(":1.0")]);
        assert!(!core.roster().originator_departed());
    }
}

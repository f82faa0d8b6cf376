//! In-memory session bus - simulates the pub/sub transport for tests.
//!
//! Routes broadcasts (echoed to the sender, as the real bus does) and
//! direct calls between engines, reports call completions, and collects
//! each peer's UI notifications.

use std::collections::VecDeque;

use crate::bridge::LinkEvent;
use crate::identity::{LinkId, PeerId};
use crate::session::{OutboundAction, SessionCore};

struct BusPeer {
    id: PeerId,
    core: SessionCore,
    ui_events: Vec<LinkEvent>,
}

/// A simulated session: every added peer shares one bus. The first peer
/// added is the session initiator.
#[derive(Default)]
pub struct SessionBus {
    peers: Vec<BusPeer>,
    next_name: u32,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the session. Mints a bus name, constructs its engine
    /// (initiator if the bus was empty), delivers membership notifications
    /// all around, and runs the resulting traffic to quiescence. Returns
    /// the new peer's bus name.
    pub fn add_peer(&mut self) -> PeerId {
        let id = PeerId::new(format!(":1.{}", self.next_name));
        self.next_name += 1;
        let core = SessionCore::new(id.clone(), self.peers.is_empty());
        self.peers.push(BusPeer {
            id: id.clone(),
            core,
            ui_events: Vec::new(),
        });

        let current: Vec<PeerId> = self.peers.iter().map(|p| p.id.clone()).collect();
        // Existing members learn of the newcomer first, then the newcomer
        // gets its first membership callback with the full current set.
        for existing in current.iter().filter(|p| *p != &id).cloned().collect::<Vec<_>>() {
            let actions = self
                .peer_mut(&existing)
                .core
                .on_participant_change(std::slice::from_ref(&id), &[]);
            self.dispatch(existing, actions);
        }
        let actions = self.peer_mut(&id).core.on_participant_change(&current, &[]);
        self.dispatch(id.clone(), actions);
        id
    }

    /// Remove a peer from the session; remaining members observe the leave.
    pub fn remove_peer(&mut self, id: &PeerId) {
        self.peers.retain(|p| &p.id != id);
        let remaining: Vec<PeerId> = self.peers.iter().map(|p| p.id.clone()).collect();
        for peer in remaining {
            let actions = self
                .peer_mut(&peer)
                .core
                .on_participant_change(&[], std::slice::from_ref(id));
            self.dispatch(peer, actions);
        }
    }

    /// Add a link on behalf of `peer` (the peer is recorded as owner) and
    /// run the broadcast to quiescence. Returns the local index.
    pub fn add_link(&mut self, peer: &PeerId, url: &str, title: &str, color: &str, thumbnail: &[u8]) -> usize {
        let owner = peer.clone();
        let (index, actions) =
            self.peer_mut(peer)
                .core
                .add_link(url, title, color, owner, thumbnail.to_vec());
        self.dispatch(peer.clone(), actions);
        index
    }

    /// Remove a link on behalf of `peer` and run the broadcast to
    /// quiescence.
    pub fn remove_link(&mut self, peer: &PeerId, id: &LinkId) {
        let actions = self.peer_mut(peer).core.remove_link(id);
        self.dispatch(peer.clone(), actions);
    }

    pub fn core(&self, id: &PeerId) -> &SessionCore {
        &self.peer(id).core
    }

    pub fn ui_events(&self, id: &PeerId) -> &[LinkEvent] {
        &self.peer(id).ui_events
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn peer(&self, id: &PeerId) -> &BusPeer {
        self.peers
            .iter()
            .find(|p| &p.id == id)
            .expect("peer on bus")
    }

    fn peer_mut(&mut self, id: &PeerId) -> &mut BusPeer {
        self.peers
            .iter_mut()
            .find(|p| &p.id == id)
            .expect("peer on bus")
    }

    /// Drain an action queue: one action per loop turn, exactly one engine
    /// touched at a time, matching the single-threaded delivery model.
    fn dispatch(&mut self, origin: PeerId, actions: Vec<OutboundAction>) {
        let mut queue: VecDeque<(PeerId, OutboundAction)> = actions
            .into_iter()
            .map(|a| (origin.clone(), a))
            .collect();

        while let Some((from, action)) = queue.pop_front() {
            match action {
                OutboundAction::Broadcast(frame) => {
                    // Every subscriber gets the signal, the sender included.
                    let members: Vec<PeerId> =
                        self.peers.iter().map(|p| p.id.clone()).collect();
                    for member in members {
                        let produced = self
                            .peer_mut(&member)
                            .core
                            .on_message_received(&from, &frame)
                            .expect("decodable broadcast");
                        queue.extend(produced.into_iter().map(|a| (member.clone(), a)));
                    }
                }
                OutboundAction::Call {
                    call_id,
                    target,
                    frame,
                } => {
                    if self.peers.iter().any(|p| p.id == target) {
                        let produced = self
                            .peer_mut(&target)
                            .core
                            .on_message_received(&from, &frame)
                            .expect("decodable call");
                        queue.extend(produced.into_iter().map(|a| (target.clone(), a)));
                        self.peer_mut(&from).core.on_call_reply(call_id);
                    } else {
                        self.peer_mut(&from)
                            .core
                            .on_call_error(call_id, "peer departed");
                    }
                }
                OutboundAction::Notify(event) => {
                    self.peer_mut(&from).ui_events.push(event);
                }
            }
        }
    }
}

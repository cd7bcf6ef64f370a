//! Joining a client to a running session
//!
//! The admin drives every join:
//!
//! 1. `client_connected` sends `SetupGame` with protocol version and cookie
//! 2. the client checks both, suspends its active players, moves them into its
//!    new id space and answers with `SetupGameContinue`
//! 3. the admin decides which players take part, sends `ActivatePlayer` for
//!    the client's survivors, resynchronizes the random sequence and sends
//!    the full game state (`GameLoad`) followed by `SetupDone`
//! 4. the client announces itself with `Connected`
//!
//! Leaving is handled here as well, for both sides of the connection.

use crate::config::Role;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::player::{read_records, write_records, Player, PlayerRecord};
use crate::registry::choose_deactivations;
use crate::session::GameSession;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use shared::{
    wire, ClientRef, ErrorReport, MessageKind, PeerId, PlayerId, PlayerRef, Policy, Reader,
    SetupGame, SyncRandom, Writer, BROADCAST, PROTOCOL_VERSION,
};
use std::fmt;

/// Where a peer stands in the join handshake
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    /// `SetupGame` sent (admin view) or being checked (client view)
    Verifying,
    /// Player lists are being reconciled
    Reconciling,
    /// Game state sent, waiting for `Connected`
    Joining,
    Joined,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::Verifying => "verifying",
            NegotiationPhase::Reconciling => "reconciling",
            NegotiationPhase::Joining => "joining",
            NegotiationPhase::Joined => "joined",
        };
        f.write_str(name)
    }
}

impl<T: Transport> GameSession<T> {
    /// This peer's own handshake phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Handshake phase of a client, as seen by the admin
    pub fn client_phase(&self, client: PeerId) -> Option<NegotiationPhase> {
        self.negotiations.get(&client).copied()
    }

    pub fn admin(&self) -> Option<PeerId> {
        self.admin
    }

    /// Turns this session into a client of `admin`, with the peer id the
    /// message server assigned. The admin starts the handshake.
    pub fn connect_to_admin(&mut self, assigned: PeerId, admin: PeerId) {
        info!("Connected to admin {} as {}", admin, assigned);
        self.role = Role::Client;
        self.peer_id = assigned;
        self.admin = Some(admin);
        self.phase = NegotiationPhase::Idle;
        self.negotiations.clear();
    }

    /// Admin side: a new peer reached the message server
    pub fn client_connected(&mut self, client: PeerId) {
        if !self.is_admin() {
            warn!("Ignoring connection of {}: only the admin negotiates", client);
            return;
        }
        info!("Negotiating with {}", client);
        self.negotiations.insert(client, NegotiationPhase::Verifying);
        let setup = SetupGame {
            version: PROTOCOL_VERSION,
            cookie: self.config.cookie,
        };
        self.send_system(MessageKind::SetupGame, client.raw(), &setup);
    }

    /// Broadcasts `Disconnect`. The echo drops the connection to the admin
    /// and turns this peer back into a standalone game.
    pub fn leave(&mut self) -> bool {
        if self.is_admin() {
            warn!("The admin cannot leave its own game");
            return false;
        }
        info!("Leaving the game");
        self.send_raw(MessageKind::Disconnect, BROADCAST, Vec::new());
        true
    }

    /// Admin side: `client` is gone. Its players are removed unless the game
    /// takes them over; players the admin suspended earlier come back while
    /// there is room.
    pub fn client_disconnected(&mut self, client: PeerId) {
        if !self.is_admin() {
            debug!("Ignoring disconnect of {}: not the admin", client);
            return;
        }
        info!("{} disconnected", client);
        let previous_status = self.game_status();
        self.negotiations.remove(&client);
        self.begin_batch();

        let owned: Vec<PlayerId> = self
            .registry
            .active_ids()
            .iter()
            .copied()
            .filter(|id| id.owner() == client)
            .collect();
        let mut removed = 0;
        for id in owned {
            let Some(player) = self.registry.get(id) else {
                continue;
            };
            if self.hooks.replace_player_io(player) {
                info!("Game took over {}", id);
                continue;
            }
            if self.remove_player(id, None) {
                removed += 1;
            }
        }

        let max = self.max_players();
        let remaining = self.player_count().saturating_sub(removed);
        let budget = if max < 0 {
            usize::MAX
        } else {
            (max as usize).saturating_sub(remaining)
        };
        let revive: Vec<PlayerId> = self
            .registry
            .deactivated_ids()
            .iter()
            .copied()
            .filter(|id| id.owner() != client)
            .take(budget)
            .collect();
        for id in revive {
            self.registry.forget_deactivated(id);
            self.activate_player(id);
        }

        self.emit(SessionEvent::ClientLeft {
            client: Some(client),
            previous_status,
        });
        self.end_batch();
    }

    /// Client side: the admin is gone. Foreign players are dropped unless the
    /// game takes them over, and this peer continues as a standalone admin.
    pub fn admin_disconnected(&mut self) {
        if self.is_admin() {
            debug!("Already running standalone");
            return;
        }
        info!("Lost connection to the admin, continuing standalone");
        let previous_status = self.game_status();
        let own = self.peer_id;
        self.begin_batch();

        let foreign: Vec<PlayerId> = self
            .registry
            .active_ids()
            .iter()
            .copied()
            .filter(|id| id.owner() != own)
            .collect();
        for id in foreign {
            let Some(player) = self.registry.get(id) else {
                continue;
            };
            if self.hooks.replace_player_io(player) {
                info!("Game took over {}", id);
                if let Some(player) = self.registry.get_mut(id) {
                    player.set_virtual(false);
                }
            } else {
                self.system_remove_player(id);
            }
        }

        self.role = Role::Admin;
        self.peer_id = PeerId::ADMIN;
        self.admin = None;
        self.phase = NegotiationPhase::Idle;
        self.negotiations.clear();

        let max = self.max_players();
        for id in self.registry.inactive_ids().to_vec() {
            if max >= 0 && self.player_count() >= max as usize {
                break;
            }
            if self.registry.reactivate(id) {
                info!("Reactivated {}", id);
                self.emit(SessionEvent::PlayerJoined(id));
            }
        }

        for old in self.registry.active_ids().to_vec() {
            let Some(new) = self.next_player_id() else {
                warn!("No free id to move {} to", old);
                break;
            };
            if self.registry.rekey(old, new) {
                debug!("{} is now {}", old, new);
                self.emit(SessionEvent::PlayerIdChanged { old, new });
            } else {
                warn!("Cannot move {} to {}: id in use", old, new);
            }
        }

        self.emit(SessionEvent::ClientLeft {
            client: None,
            previous_status,
        });
        self.end_batch();
    }

    pub(crate) fn handle_setup_game(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let setup: SetupGame = wire::decode(payload)?;
        debug!(
            "{} offers protocol {} with cookie {}",
            sender, setup.version, setup.cookie
        );

        if setup.cookie != self.config.cookie {
            let reason = format!(
                "cookie mismatch: ours is {}, {} uses {}",
                self.config.cookie, sender, setup.cookie
            );
            self.refuse_setup(sender, ErrorReport::COOKIE_MISMATCH, reason);
            return Ok(());
        }
        if setup.version != PROTOCOL_VERSION {
            let reason = format!(
                "protocol version mismatch: ours is {}, {} uses {}",
                PROTOCOL_VERSION, sender, setup.version
            );
            self.refuse_setup(sender, ErrorReport::VERSION_MISMATCH, reason);
            return Ok(());
        }

        if self.is_admin() {
            debug!("Setup offer from {} accepted, waiting for its players", sender);
            self.negotiations.insert(sender, NegotiationPhase::Reconciling);
            return Ok(());
        }

        self.phase = NegotiationPhase::Verifying;
        // players suspended before the handshake stay out of the offer
        let offered = self.registry.active_ids().to_vec();
        for id in offered.iter().copied() {
            self.system_inactivate_player(id);
        }

        let mut records: Vec<PlayerRecord> = Vec::with_capacity(offered.len());
        for old in offered {
            let id = self.rescope_player(old);
            if let Some(player) = self.registry.get(id) {
                records.push(player.record()?);
            }
        }

        let mut writer = Writer::new();
        write_records(&mut writer, &records)?;
        info!("Offering {} players to {}", records.len(), sender);
        self.send_raw(MessageKind::SetupGameContinue, sender.raw(), writer.into_bytes());
        self.phase = NegotiationPhase::Reconciling;
        Ok(())
    }

    pub(crate) fn handle_setup_game_continue(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_admin() {
            warn!("Ignoring player offer from {}: not the admin", sender);
            return Ok(());
        }
        match self.negotiations.get(&sender) {
            Some(NegotiationPhase::Verifying | NegotiationPhase::Reconciling) => {}
            phase => {
                warn!("Unexpected player offer from {} (phase {:?})", sender, phase);
                return Ok(());
            }
        }
        self.negotiations.insert(sender, NegotiationPhase::Reconciling);

        let records = read_records(&mut Reader::new(payload))?;
        let mut newcomers: Vec<Player> = Vec::with_capacity(records.len());
        for record in &records {
            let Some(id) = record.player_id() else {
                warn!("{} offered a player with invalid id {}", sender, record.id);
                continue;
            };
            if id.owner() != sender {
                error!("{} offered {} which it does not own", sender, id);
                continue;
            }
            if self.registry.contains(id) || newcomers.iter().any(|p| p.id() == Some(id)) {
                warn!("{} offered {} twice", sender, id);
                continue;
            }
            if let Some(player) = self.instantiate_player(record, true) {
                newcomers.push(player);
            }
        }

        let mut chosen = self.preselect_deactivations(&newcomers);
        let max = self.max_players();
        let total = (self.player_count() + newcomers.len()).saturating_sub(chosen.len());
        if max >= 0 && total > max as usize {
            let candidates: Vec<(PlayerId, i32)> = self
                .registry
                .active_players()
                .chain(newcomers.iter())
                .filter_map(|player| player.id().map(|id| (id, player.network_priority())))
                .filter(|(id, _)| !chosen.contains(id))
                .collect();
            chosen.extend(choose_deactivations(&candidates, total - max as usize));
        }
        info!(
            "{} offered {} players, {} of all players stay inactive",
            sender,
            newcomers.len(),
            chosen.len()
        );

        for id in chosen.iter().copied() {
            if id.owner() == sender {
                self.registry.note_deactivated(id);
                continue;
            }
            if !self.registry.contains(id) {
                warn!("Cannot deactivate {}: not registered", id);
                continue;
            }
            self.system_inactivate_player(id);
            if self.policy != Policy::Local {
                self.send_system(MessageKind::InactivatePlayer, BROADCAST, &PlayerRef::new(id));
            }
        }

        for id in newcomers.iter().filter_map(Player::id) {
            if !chosen.contains(&id) {
                debug!("{} may activate {}", sender, id);
                self.send_system(MessageKind::ActivatePlayer, sender.raw(), &PlayerRef::new(id));
            }
        }

        let seed = self.random.reseed();
        self.send_system(MessageKind::SyncRandom, BROADCAST, &SyncRandom { seed });
        let state = self.snapshot(seed)?.to_bytes()?;
        self.send_raw(MessageKind::GameLoad, sender.raw(), state);
        self.send_system(MessageKind::SetupDone, sender.raw(), &ClientRef::new(sender));
        self.negotiations.insert(sender, NegotiationPhase::Joining);
        Ok(())
    }

    pub(crate) fn handle_setup_done(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let done: ClientRef = wire::decode(payload)?;
        if done.peer_id() != Some(self.peer_id) {
            warn!("{} finished setup of client {}, we are {}", sender, done.client_id, self.peer_id);
        }
        self.phase = NegotiationPhase::Joining;
        self.send_system(MessageKind::Connected, BROADCAST, &ClientRef::new(self.peer_id));
        Ok(())
    }

    pub(crate) fn handle_connected(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let connected: ClientRef = wire::decode(payload)?;
        let Some(client) = connected.peer_id() else {
            warn!("Connected message names invalid client {}", connected.client_id);
            return Ok(());
        };
        if client == self.peer_id {
            self.phase = NegotiationPhase::Joined;
        }
        if self.is_admin() {
            self.negotiations.insert(client, NegotiationPhase::Joined);
        }
        info!("{} joined the game", client);
        self.emit(SessionEvent::ClientJoined(client));
        Ok(())
    }

    pub(crate) fn handle_disconnect(&mut self, sender: PeerId) {
        if sender != self.peer_id || self.is_admin() {
            info!("{} leaves the game", sender);
            return;
        }
        if let Some(admin) = self.admin {
            self.transport.disconnect(admin);
        }
        self.admin_disconnected();
    }

    /// Moves a suspended player into this peer's id space, keeping its
    /// sequence number unless another player already holds that id
    fn rescope_player(&mut self, old: PlayerId) -> PlayerId {
        let mut new = old.rescoped(self.peer_id);
        if new == old {
            return old;
        }
        if self.registry.contains(new) {
            match self.next_player_id() {
                Some(free) => new = free,
                None => {
                    warn!("No free id to move {} to", old);
                    return old;
                }
            }
        }
        if self.registry.rekey(old, new) {
            self.emit(SessionEvent::PlayerIdChanged { old, new });
            new
        } else {
            old
        }
    }

    fn preselect_deactivations(&mut self, newcomers: &[Player]) -> Vec<PlayerId> {
        let active: Vec<&Player> = self.registry.active_players().collect();
        let joining: Vec<&Player> = newcomers.iter().collect();
        let mut chosen: Vec<PlayerId> = Vec::new();
        for id in self.hooks.new_players_join(&active, &joining) {
            let known = active.iter().chain(joining.iter()).any(|p| p.id() == Some(id));
            if known && !chosen.contains(&id) {
                chosen.push(id);
            } else if !known {
                warn!("Game picked unknown {} for deactivation", id);
            }
        }
        chosen
    }

    fn refuse_setup(&mut self, peer: PeerId, code: i32, reason: String) {
        error!("Refusing {}: {}", peer, reason);
        let report = ErrorReport {
            code,
            message: reason.clone(),
        };
        self.send_system(MessageKind::Error, peer.raw(), &report);
        self.transport.disconnect(peer);
        self.negotiations.remove(&peer);
        self.emit(SessionEvent::SetupRefused { peer, reason });
        if !self.is_admin() {
            self.admin_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::QueueTransport;
    use shared::Envelope;

    fn session(cookie: i32) -> GameSession<QueueTransport> {
        GameSession::new(
            SessionConfig {
                cookie,
                ..SessionConfig::default()
            },
            QueueTransport::new(),
        )
    }

    fn setup_from_admin(cookie: i32, version: i16) -> Envelope {
        Envelope::new(
            MessageKind::SetupGame,
            2,
            PeerId::ADMIN,
            wire::encode(&SetupGame { version, cookie }).unwrap(),
        )
    }

    #[test]
    fn test_client_connected_sends_setup() {
        let mut admin = session(42);
        admin.client_connected(PeerId(2));

        let sent = admin.transport_mut().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(MessageKind::SetupGame));
        assert_eq!(sent[0].receiver, 2);
        let setup: SetupGame = wire::decode(&sent[0].payload).unwrap();
        assert_eq!(setup, SetupGame { version: PROTOCOL_VERSION, cookie: 42 });
        assert_eq!(admin.client_phase(PeerId(2)), Some(NegotiationPhase::Verifying));
    }

    #[test]
    fn test_client_refuses_wrong_cookie() {
        let mut client = session(7);
        client.connect_to_admin(PeerId(2), PeerId::ADMIN);
        client.handle_message(setup_from_admin(42, PROTOCOL_VERSION));

        let sent = client.transport_mut().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(MessageKind::Error));
        assert_eq!(sent[0].receiver, PeerId::ADMIN.raw());
        let report: ErrorReport = wire::decode(&sent[0].payload).unwrap();
        assert_eq!(report.code, ErrorReport::COOKIE_MISMATCH);
        assert_eq!(client.transport_mut().take_disconnects(), vec![PeerId::ADMIN]);
        assert!(client.is_admin());
    }

    #[test]
    fn test_client_refuses_wrong_version() {
        let mut client = session(42);
        client.connect_to_admin(PeerId(2), PeerId::ADMIN);
        client.handle_message(setup_from_admin(42, PROTOCOL_VERSION + 1));

        let sent = client.transport_mut().drain();
        let report: ErrorReport = wire::decode(&sent[0].payload).unwrap();
        assert_eq!(report.code, ErrorReport::VERSION_MISMATCH);
        assert_eq!(client.transport_mut().take_disconnects(), vec![PeerId::ADMIN]);
    }

    #[test]
    fn test_client_offers_rescoped_players() {
        let mut client = session(42);
        client.set_policy(Policy::Local, true);
        let local = client.add_player(Player::new(0).with_name("carol")).unwrap();
        assert_eq!(local.owner(), PeerId::ADMIN);

        client.connect_to_admin(PeerId(3), PeerId::ADMIN);
        client.handle_message(setup_from_admin(42, PROTOCOL_VERSION));

        let moved = PlayerId::new(local.sequence(), PeerId(3));
        assert!(client.active_players().is_empty());
        assert_eq!(client.inactive_players(), &[moved]);
        assert_eq!(client.phase(), NegotiationPhase::Reconciling);

        let sent = client.transport_mut().drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(MessageKind::SetupGameContinue));
        let records = read_records(&mut Reader::new(&sent[0].payload)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].player_id(), Some(moved));
        assert_eq!(records[0].state.id, moved.raw() as i32);
    }

    #[test]
    fn test_client_offers_only_active_players() {
        let mut client = session(42);
        client.set_policy(Policy::Local, true);
        let carol = client.add_player(Player::new(0).with_name("carol")).unwrap();
        let dave = client.add_player(Player::new(0).with_name("dave")).unwrap();
        client.inactivate_player(dave);

        client.connect_to_admin(PeerId(3), PeerId::ADMIN);
        client.handle_message(setup_from_admin(42, PROTOCOL_VERSION));

        let sent = client.transport_mut().drain();
        let records = read_records(&mut Reader::new(&sent[0].payload)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].player_id(), Some(carol.rescoped(PeerId(3))));
        assert!(client.inactive_players().contains(&dave));
    }

    #[test]
    fn test_rescope_avoids_taken_id() {
        let mut client = session(42);
        client.set_policy(Policy::Local, true);
        let carol = client.add_player(Player::new(0).with_name("carol")).unwrap();
        let taken = carol.rescoped(PeerId(3));
        client.system_add_player(Player::new(0).with_id(taken).with_name("old"));
        client.inactivate_player(taken);

        client.connect_to_admin(PeerId(3), PeerId::ADMIN);
        client.handle_message(setup_from_admin(42, PROTOCOL_VERSION));

        let sent = client.transport_mut().drain();
        let records = read_records(&mut Reader::new(&sent[0].payload)).unwrap();
        assert_eq!(records.len(), 1);
        let moved = records[0].player_id().unwrap();
        assert_eq!(moved.owner(), PeerId(3));
        assert_ne!(moved, taken);
        assert_eq!(client.player(taken).unwrap().name(), "old");
        assert_eq!(client.player(moved).unwrap().name(), "carol");
    }

    #[test]
    fn test_offer_without_handshake_ignored() {
        let mut admin = session(42);
        let mut writer = Writer::new();
        write_records(&mut writer, &[]).unwrap();
        admin.handle_message(Envelope::new(
            MessageKind::SetupGameContinue,
            PeerId::ADMIN.raw(),
            PeerId(5),
            writer.into_bytes(),
        ));
        assert_eq!(admin.transport().pending(), 0);
    }

    #[test]
    fn test_leave_is_client_only() {
        let mut admin = session(42);
        assert!(!admin.leave());

        let mut client = session(42);
        client.connect_to_admin(PeerId(2), PeerId::ADMIN);
        assert!(client.leave());
        let sent = client.transport_mut().drain();
        assert_eq!(sent[0].kind(), Some(MessageKind::Disconnect));

        client.handle_message(sent[0].clone());
        assert!(client.is_admin());
        assert_eq!(client.transport_mut().take_disconnects(), vec![PeerId::ADMIN]);
    }
}

//! Save streams
//!
//! The same byte layout serves save files and the `GameLoad` message that
//! brings a joining client up to date:
//!
//! `cookie`, `policy`, `player_counter`, `seed`, session properties, the
//! game's pre-player blob, `count` player records, then [`SESSION_SENTINEL`].

use crate::error::{LoadError, LoadErrorKind};
use crate::event::SessionEvent;
use crate::player::{read_records, write_records, PlayerRecord, Replicable};
use crate::session::GameSession;
use crate::transport::Transport;
use log::{debug, info, warn};
use shared::{HandlerSnapshot, PeerId, PlayerId, Policy, Reader, WireError, Writer};

/// Trailing marker of a session stream
pub const SESSION_SENTINEL: i16 = 4210;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub cookie: i32,
    pub policy: Policy,
    pub player_counter: i32,
    pub seed: i32,
    pub properties: HandlerSnapshot,
    pub pre_players: Vec<u8>,
    pub players: Vec<PlayerRecord>,
}

impl SessionSnapshot {
    pub fn write(&self, writer: &mut Writer) -> Result<(), WireError> {
        writer.put(&self.cookie)?;
        writer.put(&self.policy)?;
        writer.put(&self.player_counter)?;
        writer.put(&self.seed)?;
        self.properties.write(writer)?;
        writer.put(&self.pre_players)?;
        write_records(writer, &self.players)?;
        writer.put(&SESSION_SENTINEL)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = Writer::new();
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let snapshot = Self {
            cookie: reader.get()?,
            policy: reader.get()?,
            player_counter: reader.get()?,
            seed: reader.get()?,
            properties: HandlerSnapshot::read(reader)?,
            pre_players: reader.get()?,
            players: read_records(reader)?,
        };
        reader.expect_sentinel("session", SESSION_SENTINEL)?;
        Ok(snapshot)
    }

    /// Reads only the leading cookie
    pub fn peek_cookie(bytes: &[u8]) -> Result<i32, WireError> {
        Reader::new(bytes).get()
    }
}

impl<T: Transport> GameSession<T> {
    /// Serializes the session and its active players. Draws a fresh seed
    /// for the stream and restarts the local sequence from it.
    pub fn save(&mut self) -> Result<Vec<u8>, WireError> {
        let seed = self.random.reseed();
        let bytes = self.snapshot(seed)?.to_bytes()?;
        info!(
            "Saved session with {} players ({} bytes)",
            self.player_count(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// Restores a stream written by [`GameSession::save`]. The whole stream
    /// is decoded before anything changes, so a failed load leaves the
    /// session untouched. `reset` drops every player first.
    pub fn load(&mut self, bytes: &[u8], reset: bool) -> Result<(), LoadError> {
        self.begin_batch();
        let result = self.load_stream(bytes, reset, false);
        self.end_batch();
        result
    }

    pub(crate) fn snapshot(&mut self, seed: i32) -> Result<SessionSnapshot, WireError> {
        let players = self
            .registry
            .active_players()
            .map(|player| player.record())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SessionSnapshot {
            cookie: self.config.cookie,
            policy: self.policy,
            player_counter: self.player_counter,
            seed,
            properties: self.data.snapshot()?,
            pre_players: self.hooks.save_pre_players(),
            players,
        })
    }

    pub(crate) fn handle_game_load(&mut self, sender: PeerId, payload: &[u8]) {
        if self.is_admin() || self.admin != Some(sender) {
            warn!("Ignoring game state from {}: not our admin", sender);
            return;
        }
        if let Err(e) = self.load_stream(payload, false, true) {
            warn!("Failed to load game state from {}: {}", sender, e);
            self.emit(SessionEvent::LoadFailed {
                kind: e.kind,
                message: e.message,
            });
        }
    }

    fn load_stream(&mut self, bytes: &[u8], reset: bool, from_network: bool) -> Result<(), LoadError> {
        let cookie = SessionSnapshot::peek_cookie(bytes)?;
        if cookie != self.config.cookie {
            return Err(LoadError::new(
                LoadErrorKind::CookieMismatch,
                format!("stream cookie {} does not match {}", cookie, self.config.cookie),
            ));
        }
        let snapshot = SessionSnapshot::read(&mut Reader::new(bytes))?;
        let mut ids: Vec<PlayerId> = Vec::with_capacity(snapshot.players.len());
        for record in &snapshot.players {
            let id = record.player_id().ok_or_else(|| {
                LoadError::new(LoadErrorKind::Corrupt, format!("invalid player id {}", record.id))
            })?;
            if ids.contains(&id) {
                return Err(LoadError::new(
                    LoadErrorKind::Corrupt,
                    format!("{} is saved twice", id),
                ));
            }
            ids.push(id);
        }

        self.commit_snapshot(snapshot, &ids, reset, from_network);
        Ok(())
    }

    fn commit_snapshot(&mut self, snapshot: SessionSnapshot, ids: &[PlayerId], reset: bool, from_network: bool) {
        if reset {
            for id in self.registry.clear() {
                self.emit(SessionEvent::PlayerLeft(id));
            }
        }
        if snapshot.policy != self.policy {
            debug!("Switching policy from {} to {}", self.policy, snapshot.policy);
        }
        // before the shells are created, they take the session policy
        self.set_policy(snapshot.policy, true);
        self.player_counter = snapshot.player_counter;
        self.random.set_seed(snapshot.seed);

        let mut locked = self.registry.ids();
        self.data.lock_direct_emit();
        for id in &locked {
            if let Some(player) = self.registry.get_mut(*id) {
                player.handler_mut().lock_direct_emit();
            }
        }

        self.data.apply_snapshot(&snapshot.properties);
        self.hooks.load_pre_players(&snapshot.pre_players);

        for (record, id) in snapshot.players.iter().zip(ids.iter().copied()) {
            if let Some(player) = self.registry.get_mut(id) {
                player.apply_state(&record.state);
                continue;
            }
            let Some(mut player) = self.create_player_shell(record, from_network) else {
                continue;
            };
            player.handler_mut().lock_direct_emit();
            player.apply_state(&record.state);
            if self.system_add_player(player) {
                locked.push(id);
            }
        }

        self.data.unlock_direct_emit();
        for id in &locked {
            if let Some(player) = self.registry.get_mut(*id) {
                player.handler_mut().unlock_direct_emit();
            }
        }

        info!(
            "Loaded session with {} players, seed {}",
            snapshot.players.len(),
            snapshot.seed
        );
        self.emit(SessionEvent::Loaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GameStatus, SessionConfig};
    use crate::event::PropertyOwner;
    use crate::hooks::GameHooks;
    use crate::player::Player;
    use crate::session::GAME_STATUS;
    use crate::transport::NullTransport;
    use shared::{PropertyId, PropertyKey};
    use std::cell::RefCell;
    use std::rc::Rc;

    const SCORE: PropertyKey<i32> = PropertyKey::new(PropertyId::user(0), "score");

    struct Board {
        cells: Vec<u8>,
    }

    impl GameHooks for Board {
        fn save_pre_players(&mut self) -> Vec<u8> {
            self.cells.clone()
        }

        fn load_pre_players(&mut self, data: &[u8]) {
            self.cells = data.to_vec();
        }
    }

    fn local_session(cookie: i32) -> GameSession<NullTransport> {
        let mut session = GameSession::new(
            SessionConfig {
                cookie,
                policy: Policy::Local,
                ..SessionConfig::default()
            },
            NullTransport,
        );
        session.register_property(SCORE, Policy::Local, 0).unwrap();
        session
    }

    fn populated() -> GameSession<NullTransport> {
        let mut session = local_session(42);
        session.add_player(Player::new(1).with_name("ann").with_priority(3));
        session.add_player(Player::new(2).with_name("ben"));
        session.change_property(SCORE, 17).unwrap();
        session.set_game_status(GameStatus::Pause).unwrap();
        session
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut saved = populated();
        let bytes = saved.save().unwrap();

        let mut restored = local_session(42);
        restored.load(&bytes, true).unwrap();

        assert_eq!(restored.property(SCORE), Some(&17));
        assert_eq!(restored.game_status(), GameStatus::Pause);
        assert_eq!(restored.active_players(), saved.active_players());
        assert_eq!(restored.unique_player_counter(), saved.unique_player_counter());
        assert_eq!(restored.random().seed(), saved.random().seed());
        for id in saved.active_players() {
            let a = saved.player(*id).unwrap();
            let b = restored.player(*id).unwrap();
            assert_eq!(a.name(), b.name());
            assert_eq!(a.rtti(), b.rtti());
            assert_eq!(a.network_priority(), b.network_priority());
            assert!(!b.is_virtual());
        }

        // saving the restored session gives the same stream
        let mut again = local_session(42);
        again.load(&bytes, true).unwrap();
        assert_eq!(restored.snapshot(7).unwrap(), again.snapshot(7).unwrap());
    }

    #[test]
    fn test_load_restores_policy() {
        let mut saved = populated();
        let bytes = saved.save().unwrap();
        let ann = saved.active_players()[0];

        let mut restored = GameSession::new(
            SessionConfig {
                cookie: 42,
                ..SessionConfig::default()
            },
            NullTransport,
        );
        restored.register_property(SCORE, Policy::Clean, 0).unwrap();
        restored.system_add_player(Player::new(1).with_id(ann).with_name("old"));
        assert_eq!(restored.policy(), Policy::Clean);

        restored.load(&bytes, false).unwrap();

        assert_eq!(restored.policy(), saved.policy());
        assert_eq!(restored.data().policy(SCORE.id()), Some(Policy::Local));
        for id in restored.active_players() {
            let handler = restored.player(*id).unwrap().data();
            assert_eq!(handler.policy(crate::player::NAME.id()), Some(Policy::Local));
        }
    }

    #[test]
    fn test_save_reseeds() {
        let mut session = populated();
        let bytes = session.save().unwrap();
        let snapshot = SessionSnapshot::read(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(snapshot.seed, session.random().seed());
        assert_eq!(snapshot.cookie, 42);
        assert_eq!(snapshot.players.len(), 2);
    }

    #[test]
    fn test_cookie_mismatch_applies_nothing() {
        let bytes = populated().save().unwrap();
        let mut other = local_session(7);
        let err = other.load(&bytes, true).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::CookieMismatch);
        assert_eq!(other.player_count(), 0);
        assert_eq!(other.property(SCORE), Some(&0));
    }

    #[test]
    fn test_truncated_stream_applies_nothing() {
        let bytes = populated().save().unwrap();
        let mut target = local_session(42);
        target.add_player(Player::new(0).with_name("keep"));

        let err = target.load(&bytes[..bytes.len() - 1], true).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Corrupt);
        assert_eq!(target.player_count(), 1);
        assert_eq!(target.property(SCORE), Some(&0));
    }

    #[test]
    fn test_bad_trailing_sentinel_rejected() {
        let mut bytes = populated().save().unwrap();
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&1i16.to_le_bytes());
        let err = local_session(42).load(&bytes, false).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Corrupt);
    }

    #[test]
    fn test_load_without_reset_updates_existing() {
        let mut saved = populated();
        let bytes = saved.save().unwrap();
        let first = saved.active_players()[0];

        let mut target = local_session(42);
        target.system_add_player(Player::new(1).with_id(first).with_name("old"));
        target.load(&bytes, false).unwrap();

        assert_eq!(target.player_count(), 2);
        assert_eq!(target.player(first).unwrap().name(), "ann");
    }

    #[test]
    fn test_pre_players_blob_travels() {
        let mut saved = GameSession::with_hooks(
            SessionConfig::default(),
            NullTransport,
            Box::new(Board { cells: vec![1, 0, 2] }),
        );
        let bytes = saved.save().unwrap();
        let snapshot = SessionSnapshot::read(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(snapshot.pre_players, vec![1, 0, 2]);
    }

    #[test]
    fn test_notifications_follow_complete_load() {
        let bytes = populated().save().unwrap();
        let mut target = local_session(42);
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        target.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        target.load(&bytes, true).unwrap();

        let events = log.borrow();
        assert_eq!(events.last(), Some(&SessionEvent::Loaded));
        let last_join = events
            .iter()
            .rposition(|e| matches!(e, SessionEvent::PlayerJoined(_)))
            .unwrap();
        let first_change = events
            .iter()
            .position(|e| matches!(e, SessionEvent::PropertyChanged { .. }))
            .unwrap();
        assert!(last_join < first_change);
        assert!(events.contains(&SessionEvent::PropertyChanged {
            owner: PropertyOwner::Session,
            property: GAME_STATUS.id(),
        }));
    }
}

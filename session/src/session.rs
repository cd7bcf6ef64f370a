//! Game session controller
//!
//! [`GameSession`] is the single dispatch point for inbound messages and the
//! owner of all replicated state on one peer:
//! - the session property handler (player limits, game status, application
//!   properties)
//! - the player registry
//! - the shared random sequence
//! - the negotiation state of joining clients
//!
//! Every player or property mutation goes through the session, which decides
//! from the policy whether it is applied now, sent to the network, or both.
//! Observers receive [`SessionEvent`]s at the end of each call, after the
//! state they describe is complete.

use crate::config::{GameStatus, Role, SessionConfig};
use crate::error::SessionError;
use crate::event::{Observer, PropertyOwner, SessionEvent};
use crate::hooks::{DefaultHooks, GameHooks};
use crate::negotiation::NegotiationPhase;
use crate::player::{Player, PlayerRecord, Replicable, TURN};
use crate::registry::PlayerRegistry;
use crate::transport::Transport;
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::{
    is_player_address, wire, Envelope, ErrorReport, MessageKind, PeerId, PlayerId, PlayerRef,
    Policy, PropertyError, PropertyId, PropertyKey, PropertyReplicator, PropertyValue,
    RandomSequence, Reader, SyncRandom, BROADCAST,
};
use std::collections::BTreeMap;

pub const MAX_PLAYERS: PropertyKey<i32> = PropertyKey::new(PropertyId::builtin(1), "max_players");
pub const MIN_PLAYERS: PropertyKey<u32> = PropertyKey::new(PropertyId::builtin(2), "min_players");
pub const GAME_STATUS: PropertyKey<GameStatus> =
    PropertyKey::new(PropertyId::builtin(3), "game_status");

pub struct GameSession<T: Transport> {
    pub(crate) config: SessionConfig,
    pub(crate) role: Role,
    pub(crate) peer_id: PeerId,
    pub(crate) admin: Option<PeerId>,
    pub(crate) policy: Policy,
    pub(crate) data: PropertyReplicator,
    pub(crate) registry: PlayerRegistry,
    pub(crate) player_counter: i32,
    pub(crate) random: RandomSequence,
    pub(crate) phase: NegotiationPhase,
    pub(crate) negotiations: BTreeMap<PeerId, NegotiationPhase>,
    pub(crate) transport: T,
    pub(crate) hooks: Box<dyn GameHooks>,
    observers: Vec<Observer>,
    events: Vec<SessionEvent>,
    batch_depth: u32,
}

impl<T: Transport> GameSession<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self::with_hooks(config, transport, Box::new(DefaultHooks))
    }

    pub fn with_hooks(config: SessionConfig, transport: T, hooks: Box<dyn GameHooks>) -> Self {
        let mut data = PropertyReplicator::new(MessageKind::GameProperty);
        if let Err(e) = register_session_properties(&mut data, &config) {
            error!("Failed to register session properties: {}", e);
        }
        info!(
            "Created session (cookie {}, policy {}, max players {})",
            config.cookie, config.policy, config.max_players
        );

        Self {
            role: Role::Admin,
            peer_id: PeerId::ADMIN,
            admin: None,
            policy: config.policy,
            data,
            registry: PlayerRegistry::new(),
            player_counter: 0,
            random: RandomSequence::new(config.seed),
            phase: NegotiationPhase::Idle,
            negotiations: BTreeMap::new(),
            transport,
            hooks,
            observers: Vec::new(),
            events: Vec::new(),
            batch_depth: 0,
            config,
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&SessionEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn cookie(&self) -> i32 {
        self.config.cookie
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn game_status(&self) -> GameStatus {
        self.data.value(GAME_STATUS).copied().unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.game_status() == GameStatus::Run
    }

    pub fn max_players(&self) -> i32 {
        self.data.value(MAX_PLAYERS).copied().unwrap_or(-1)
    }

    pub fn min_players(&self) -> u32 {
        self.data.value(MIN_PLAYERS).copied().unwrap_or_default()
    }

    /// Number of active players
    pub fn player_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn unique_player_counter(&self) -> i32 {
        self.player_counter
    }

    pub fn random(&self) -> &RandomSequence {
        &self.random
    }

    /// The shared sequence. Draw from it only in code every peer runs in
    /// the same order, or the peers drift apart.
    pub fn random_mut(&mut self) -> &mut RandomSequence {
        &mut self.random
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.registry.get(id)
    }

    pub fn active_players(&self) -> &[PlayerId] {
        self.registry.active_ids()
    }

    pub fn inactive_players(&self) -> &[PlayerId] {
        self.registry.inactive_ids()
    }

    pub fn data(&self) -> &PropertyReplicator {
        &self.data
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Changes the default policy; `recursive` also rewrites every session
    /// and player property
    pub fn set_policy(&mut self, policy: Policy, recursive: bool) {
        self.policy = policy;
        if recursive {
            self.data.set_policy_all(policy);
            for id in self.registry.ids() {
                if let Some(player) = self.registry.get_mut(id) {
                    player.handler_mut().set_policy_all(policy);
                }
            }
        }
    }

    /// Adds an application property to the session handler
    pub fn register_property<V: PropertyValue>(
        &mut self,
        key: PropertyKey<V>,
        policy: Policy,
        initial: V,
    ) -> Result<(), SessionError> {
        self.data.register(key, policy, initial)?;
        Ok(())
    }

    pub fn property<V: PropertyValue>(&self, key: PropertyKey<V>) -> Option<&V> {
        self.data.value(key)
    }

    pub fn change_property<V: PropertyValue>(
        &mut self,
        key: PropertyKey<V>,
        value: V,
    ) -> Result<(), SessionError> {
        let result = self.change_session_property(key, value);
        self.flush_events();
        result
    }

    pub fn change_player_property<V: PropertyValue>(
        &mut self,
        id: PlayerId,
        key: PropertyKey<V>,
        value: V,
    ) -> Result<(), SessionError> {
        let player = self
            .registry
            .get_mut(id)
            .ok_or(SessionError::UnknownPlayer(id))?;
        if let Some(payload) = player.handler_mut().change_value(key, value)? {
            self.send_raw(MessageKind::PlayerProperty, id.raw(), payload);
        }
        self.flush_events();
        Ok(())
    }

    /// Requests a new game status. `Run` turns into `Pause` while fewer than
    /// the minimum number of players are active.
    pub fn set_game_status(&mut self, status: GameStatus) -> Result<(), SessionError> {
        let status = if status == GameStatus::Run && self.player_count() < self.min_players() as usize {
            info!(
                "Only {} of {} required players, pausing instead of running",
                self.player_count(),
                self.min_players()
            );
            GameStatus::Pause
        } else {
            status
        };
        self.change_property(GAME_STATUS, status)
    }

    pub fn set_max_players(&mut self, max_players: i32) -> Result<(), SessionError> {
        if !self.is_admin() {
            return Err(SessionError::NotAdmin("change the player limit"));
        }
        self.change_property(MAX_PLAYERS, max_players)
    }

    pub fn set_min_players(&mut self, min_players: u32) -> Result<(), SessionError> {
        if !self.is_admin() {
            return Err(SessionError::NotAdmin("change the player minimum"));
        }
        self.change_property(MIN_PLAYERS, min_players)
    }

    /// Adds a player through the session policy.
    ///
    /// Returns the player's id, or `None` when the session is full and the
    /// player was dropped. Under `Clean` the player only joins once the
    /// `AddPlayer` echo arrives. Its properties take the session policy.
    pub fn add_player(&mut self, mut player: Player) -> Option<PlayerId> {
        let claimed = self.player_count() + self.registry.pending_count();
        if self.is_full(claimed) {
            warn!(
                "Session already holds {} of {} players, dropping the new player",
                claimed,
                self.max_players()
            );
            return None;
        }

        let id = match player.id() {
            Some(id) => id,
            None => {
                let Some(id) = self.next_player_id() else {
                    warn!("No free player id left for {}", self.peer_id);
                    return None;
                };
                player.set_id(id);
                id
            }
        };
        player.handler_mut().set_policy_all(self.policy);

        let record = match self.policy {
            Policy::Local => None,
            Policy::Clean | Policy::Dirty => match player.record().and_then(|r| r.to_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    error!("Failed to encode {}: {}", id, e);
                    return None;
                }
            },
        };

        debug!("Adding {} with policy {}", id, self.policy);
        match self.policy {
            Policy::Clean => self.registry.push_pending(player),
            Policy::Local | Policy::Dirty => {
                self.system_add_player(player);
            }
        }
        if let Some(bytes) = record {
            self.send_raw(MessageKind::AddPlayer, BROADCAST, bytes);
        }
        self.flush_events();
        Some(id)
    }

    fn is_full(&self, count: usize) -> bool {
        let max = self.max_players();
        max >= 0 && count >= max as usize
    }

    /// Mints the next id of this peer. The sequence wraps, so ids still
    /// held by a registered or pending player are skipped.
    pub(crate) fn next_player_id(&mut self) -> Option<PlayerId> {
        for _ in 0..=PlayerId::MAX_SEQUENCE {
            self.player_counter = self.player_counter.wrapping_add(1);
            let id = PlayerId::new(self.player_counter as u32, self.peer_id);
            if !self.registry.contains(id) && !self.registry.is_pending(id) {
                return Some(id);
            }
        }
        None
    }

    /// Registers a player on this peer only. A duplicate id is a protocol
    /// violation: the new player is dropped and the registered one kept.
    pub fn system_add_player(&mut self, mut player: Player) -> bool {
        let Some(id) = player.id() else {
            warn!("Refusing to register a player without id");
            return false;
        };
        // changes made while building the player are not reported
        player.handler_mut().take_notifications();
        match self.registry.insert_active(player) {
            Ok(id) => {
                info!("{} joined the game", id);
                self.emit(SessionEvent::PlayerJoined(id));
                self.flush_events();
                true
            }
            Err(_) => {
                warn!("Duplicate add of {}, keeping the registered player", id);
                false
            }
        }
    }

    /// Removes a player through the session policy; `target` limits the
    /// network request to one peer
    pub fn remove_player(&mut self, id: PlayerId, target: Option<PeerId>) -> bool {
        if !self.registry.contains(id) {
            warn!("Cannot remove unknown {}", id);
            return false;
        }
        if self.policy != Policy::Clean {
            self.system_remove_player(id);
        }
        if self.policy != Policy::Local {
            let receiver = target.map_or(BROADCAST, PeerId::raw);
            self.send_system(MessageKind::RemovePlayer, receiver, &PlayerRef::new(id));
        }
        self.flush_events();
        true
    }

    pub fn system_remove_player(&mut self, id: PlayerId) -> bool {
        if self.registry.remove(id).is_none() {
            debug!("{} is already gone", id);
            return false;
        }
        info!("{} left the game", id);
        self.emit(SessionEvent::PlayerLeft(id));

        if self.is_running() && self.player_count() < self.min_players() as usize {
            self.pause_for_missing_players();
        }
        self.flush_events();
        true
    }

    pub fn inactivate_player(&mut self, id: PlayerId) -> bool {
        if self.policy != Policy::Clean && !self.system_inactivate_player(id) {
            return false;
        }
        if self.policy != Policy::Local {
            self.send_system(MessageKind::InactivatePlayer, BROADCAST, &PlayerRef::new(id));
        }
        self.flush_events();
        true
    }

    /// Requests reactivation. The request is sent even when this peer does
    /// not hold the player, since only the owner keeps inactive players.
    pub fn activate_player(&mut self, id: PlayerId) -> bool {
        match self.policy {
            Policy::Local => {
                let activated = self.system_activate_player(id);
                self.flush_events();
                return activated;
            }
            Policy::Dirty => {
                self.system_activate_player(id);
            }
            Policy::Clean => {}
        }
        self.send_system(MessageKind::ActivatePlayer, BROADCAST, &PlayerRef::new(id));
        self.flush_events();
        true
    }

    /// Suspends a player without destroying it. Virtual players have no
    /// local shell to keep and are removed instead.
    pub fn system_inactivate_player(&mut self, id: PlayerId) -> bool {
        let Some(player) = self.registry.get(id) else {
            debug!("Cannot inactivate unknown {}", id);
            return false;
        };
        if !player.is_active() {
            debug!("{} is already inactive", id);
            return false;
        }
        if player.is_virtual() {
            self.system_remove_player(id);
        } else {
            self.registry.deactivate(id);
            info!("{} is now inactive", id);
            self.emit(SessionEvent::PlayerLeft(id));
        }
        // remote players are recorded too, their owner keeps the shell
        if self.is_admin() {
            self.registry.note_deactivated(id);
        }
        self.flush_events();
        true
    }

    /// Brings an inactive player back. It re-enters through
    /// [`GameSession::add_player`], so the player limit applies.
    pub fn system_activate_player(&mut self, id: PlayerId) -> bool {
        match self.registry.get(id) {
            None => {
                debug!("Cannot activate unknown {}", id);
                return false;
            }
            Some(player) if player.is_active() => {
                debug!("{} is already active", id);
                return false;
            }
            Some(_) => {}
        }
        let Some(mut player) = self.registry.remove(id) else {
            return false;
        };
        player.set_active(true);
        info!("Reactivating {}", id);
        self.add_player(player).is_some()
    }

    /// Drops every player
    pub fn reset(&mut self) {
        for id in self.registry.clear() {
            self.emit(SessionEvent::PlayerLeft(id));
        }
        self.flush_events();
    }

    /// Reseeds the shared random sequence on every peer. Admin only; returns
    /// the new seed.
    pub fn sync_random(&mut self) -> Option<i32> {
        if !self.is_admin() {
            warn!("Only the admin may resynchronize the random sequence");
            return None;
        }
        let seed = self.random.reseed();
        info!("Resynchronizing random sequence with seed {}", seed);
        self.send_system(MessageKind::SyncRandom, BROADCAST, &SyncRandom { seed });
        Some(seed)
    }

    /// Sends application message `kind` (offset from the user base)
    pub fn send_message(&mut self, kind: u32, receiver: u32, payload: Vec<u8>) {
        self.send_raw(MessageKind::User(kind), receiver, payload);
    }

    /// Sends input for `player` to every peer. Accepted only while the game
    /// runs and the player may move.
    pub fn send_player_input(&mut self, id: PlayerId, input: Vec<u8>) -> Result<(), SessionError> {
        self.check_input_allowed(id)?;
        self.send_raw(MessageKind::PlayerInput, id.raw(), input);
        Ok(())
    }

    /// Sets a player's turn through the policy path. `exclusive` takes the
    /// turn from every other active player.
    pub fn set_player_turn(&mut self, id: PlayerId, turn: bool, exclusive: bool) -> Result<(), SessionError> {
        if !self.registry.contains(id) {
            return Err(SessionError::UnknownPlayer(id));
        }
        if turn && exclusive {
            let others: Vec<PlayerId> = self
                .registry
                .active_players()
                .filter(|player| player.my_turn())
                .filter_map(Player::id)
                .filter(|other| *other != id)
                .collect();
            for other in others {
                self.change_player_property(other, TURN, false)?;
            }
        }
        self.change_player_property(id, TURN, turn)
    }

    /// Hands the turn to the active player after `last` (or the first one)
    pub fn next_player(&mut self, last: Option<PlayerId>, exclusive: bool) -> Option<PlayerId> {
        let next = self.successor(last)?;
        match self.set_player_turn(next, true, exclusive) {
            Ok(()) => Some(next),
            Err(e) => {
                warn!("Failed to pass the turn to {}: {}", next, e);
                None
            }
        }
    }

    /// Single entry point for inbound messages
    pub fn handle_message(&mut self, envelope: Envelope) {
        self.batch_depth += 1;
        self.dispatch(envelope);
        self.batch_depth -= 1;
        self.flush_events();
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let Envelope {
            message_id,
            receiver,
            sender,
            payload,
        } = envelope;
        let from_self = sender == self.peer_id;

        if is_player_address(receiver) {
            if let Some(id) = PlayerId::from_raw(receiver) {
                match self.registry.get(id) {
                    Some(player) if player.is_active() => {
                        self.deliver_to_player(id, message_id, &payload, sender);
                        return;
                    }
                    Some(_) => debug!("Message {} for inactive {}", message_id, id),
                    None => debug!("Message {} for unknown {}", message_id, id),
                }
            }
        }

        if self.data.process_message(message_id, &payload, from_self) {
            return;
        }

        let Some(kind) = MessageKind::from_id(message_id) else {
            warn!("Dropping message with unknown id {} from {}", message_id, sender);
            return;
        };

        let result = match kind {
            MessageKind::SetupGame => self.handle_setup_game(sender, &payload),
            MessageKind::SetupGameContinue => self.handle_setup_game_continue(sender, &payload),
            MessageKind::SetupDone => self.handle_setup_done(sender, &payload),
            MessageKind::Connected => self.handle_connected(&payload),
            MessageKind::GameLoad => {
                self.handle_game_load(sender, &payload);
                Ok(())
            }
            MessageKind::AddPlayer => self.handle_add_player(sender, &payload),
            MessageKind::RemovePlayer => self.handle_player_ref(kind, sender, &payload),
            MessageKind::ActivatePlayer => self.handle_player_ref(kind, sender, &payload),
            MessageKind::InactivatePlayer => self.handle_player_ref(kind, sender, &payload),
            MessageKind::SyncRandom => self.handle_sync_random(sender, &payload),
            MessageKind::Disconnect => {
                self.handle_disconnect(sender);
                Ok(())
            }
            MessageKind::Error => self.handle_error(sender, &payload),
            MessageKind::User(user_kind) => {
                self.emit(SessionEvent::NetworkData {
                    kind: user_kind,
                    receiver,
                    sender,
                    payload,
                });
                Ok(())
            }
            MessageKind::PlayerProperty | MessageKind::PlayerInput | MessageKind::GameProperty => {
                debug!("Dropping {:?} from {}: no active player for it", kind, sender);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Dropping {:?} from {}: {}", kind, sender, e);
        }
    }

    fn deliver_to_player(&mut self, id: PlayerId, message_id: u32, payload: &[u8], sender: PeerId) {
        let from_self = sender == self.peer_id;
        let Some(player) = self.registry.get_mut(id) else {
            return;
        };
        if player.handler_mut().process_message(message_id, payload, from_self) {
            return;
        }

        match MessageKind::from_id(message_id) {
            Some(MessageKind::PlayerInput) => self.process_player_input(id, payload),
            Some(MessageKind::User(kind)) => self.emit(SessionEvent::PlayerData {
                player: id,
                kind,
                sender,
                payload: payload.to_vec(),
            }),
            _ => warn!("{} cannot handle message {} from {}", id, message_id, sender),
        }
    }

    fn handle_add_player(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        if sender == self.peer_id {
            if self.policy == Policy::Dirty {
                return Ok(());
            }
            match self.registry.pop_pending() {
                Some(player) if self.is_full(self.player_count()) => {
                    warn!("Game filled up before {:?} joined, dropping it", player.id());
                }
                Some(player) => {
                    self.system_add_player(player);
                }
                None => warn!("Echo of AddPlayer without a pending player"),
            }
            return Ok(());
        }

        let record = PlayerRecord::read(&mut Reader::new(payload))?;
        let Some(id) = record.player_id() else {
            warn!("AddPlayer from {} carries invalid id {}", sender, record.id);
            return Ok(());
        };
        if id.owner() != sender {
            error!("{} tried to add {} which it does not own", sender, id);
            return Ok(());
        }
        if self.is_full(self.player_count()) {
            warn!("Dropping {} from {}: the game is full", id, sender);
            return Ok(());
        }
        if let Some(player) = self.instantiate_player(&record, true) {
            self.system_add_player(player);
        }
        Ok(())
    }

    fn handle_player_ref(&mut self, kind: MessageKind, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let player_ref: PlayerRef = wire::decode(payload)?;
        let Some(id) = player_ref.player_id() else {
            warn!("{:?} from {} names invalid id {}", kind, sender, player_ref.id);
            return Ok(());
        };
        if sender == self.peer_id && self.policy == Policy::Dirty {
            return Ok(());
        }
        match kind {
            MessageKind::RemovePlayer => {
                self.system_remove_player(id);
            }
            MessageKind::ActivatePlayer => {
                self.system_activate_player(id);
            }
            MessageKind::InactivatePlayer => {
                self.system_inactivate_player(id);
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_sync_random(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let SyncRandom { seed } = wire::decode(payload)?;
        if sender != self.peer_id {
            debug!("Reseeding random sequence with {} from {}", seed, sender);
            self.random.set_seed(seed);
        }
        Ok(())
    }

    fn handle_error(&mut self, sender: PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let report: ErrorReport = wire::decode(payload)?;
        warn!("{} reported error {}: {}", sender, report.code, report.message);
        self.emit(SessionEvent::RemoteError {
            sender,
            code: report.code,
            message: report.message,
        });
        Ok(())
    }

    fn process_player_input(&mut self, id: PlayerId, input: &[u8]) {
        if let Err(e) = self.check_input_allowed(id) {
            debug!("Ignoring input: {}", e);
            return;
        }
        let Some(player) = self.registry.get(id) else {
            return;
        };
        if !self.hooks.player_input(player, input) {
            return;
        }
        self.player_input_finished(id);
    }

    /// Runs after a finished input on every peer in the same order, so turn
    /// and status changes here are applied locally.
    fn player_input_finished(&mut self, id: PlayerId) {
        let Some(player) = self.registry.get(id) else {
            return;
        };
        let result = self.hooks.check_game_over(player);
        if result != 0 {
            info!("Game over with result {} after input of {}", result, id);
            if let Err(e) = self.data.set_local(GAME_STATUS, GameStatus::End) {
                error!("Failed to end the game: {}", e);
            }
            self.emit(SessionEvent::GameOver { result, player: id });
            return;
        }

        if player.async_input() {
            return;
        }
        self.set_turn_local(id, false);
        if let Some(next) = self.successor(Some(id)) {
            for other in self.registry.active_ids().to_vec() {
                self.set_turn_local(other, other == next);
            }
        }
    }

    fn set_turn_local(&mut self, id: PlayerId, turn: bool) {
        let Some(player) = self.registry.get_mut(id) else {
            return;
        };
        if player.my_turn() == turn {
            return;
        }
        if let Err(e) = player.handler_mut().set_local(TURN, turn) {
            error!("Failed to set turn of {}: {}", id, e);
        }
    }

    fn check_input_allowed(&self, id: PlayerId) -> Result<(), SessionError> {
        let player = self.registry.get(id).ok_or(SessionError::UnknownPlayer(id))?;
        if !player.is_active() {
            return Err(SessionError::InactivePlayer(id));
        }
        let status = self.game_status();
        if status != GameStatus::Run {
            return Err(SessionError::NotRunning(status));
        }
        if !player.async_input() && !player.my_turn() {
            return Err(SessionError::NotYourTurn(id));
        }
        Ok(())
    }

    fn successor(&self, last: Option<PlayerId>) -> Option<PlayerId> {
        let active = self.registry.active_ids();
        if active.is_empty() {
            return None;
        }
        let index = last
            .and_then(|last| active.iter().position(|id| *id == last))
            .map_or(0, |index| (index + 1) % active.len());
        Some(active[index])
    }

    fn change_session_property<V: PropertyValue>(
        &mut self,
        key: PropertyKey<V>,
        value: V,
    ) -> Result<(), SessionError> {
        if let Some(payload) = self.data.change_value(key, value)? {
            self.send_raw(MessageKind::GameProperty, BROADCAST, payload);
        }
        Ok(())
    }

    /// Under `Local` every peer pauses on its own; otherwise the admin
    /// decides for everyone.
    fn pause_for_missing_players(&mut self) {
        if self.policy != Policy::Local && !self.is_admin() {
            return;
        }
        info!("Not enough players left, pausing the game");
        if let Err(e) = self.change_session_property(GAME_STATUS, GameStatus::Pause) {
            error!("Failed to pause the game: {}", e);
        }
    }

    /// Builds a player for a received or saved record through the game's
    /// factory and applies its saved state
    pub(crate) fn instantiate_player(&mut self, record: &PlayerRecord, is_virtual: bool) -> Option<Player> {
        let mut player = self.create_player_shell(record, is_virtual)?;
        player.apply_state(&record.state);
        Some(player)
    }

    pub(crate) fn create_player_shell(&mut self, record: &PlayerRecord, is_virtual: bool) -> Option<Player> {
        let Some(id) = record.player_id() else {
            warn!("Player record carries invalid id {}", record.id);
            return None;
        };
        let mut player = self.hooks.create_player(record.rtti, record.io_value, is_virtual);
        player.set_id(id);
        player.set_virtual(is_virtual);
        player.set_io_value(record.io_value);
        player.handler_mut().set_policy_all(self.policy);
        Some(player)
    }

    pub(crate) fn send_system<P: Serialize>(&mut self, kind: MessageKind, receiver: u32, payload: &P) {
        match wire::encode(payload) {
            Ok(bytes) => self.send_raw(kind, receiver, bytes),
            Err(e) => error!("Failed to encode {:?}: {}", kind, e),
        }
    }

    pub(crate) fn send_raw(&mut self, kind: MessageKind, receiver: u32, payload: Vec<u8>) {
        debug!(
            "Sending {:?} to {} ({} bytes)",
            kind,
            receiver,
            payload.len()
        );
        self.transport
            .send(Envelope::new(kind, receiver, self.peer_id, payload));
    }

    /// Queues an event behind the property changes released before it
    pub(crate) fn emit(&mut self, event: SessionEvent) {
        self.collect_property_changes();
        self.events.push(event);
    }

    pub(crate) fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub(crate) fn end_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.flush_events();
    }

    /// Delivers queued events unless a dispatch or load is still running
    pub(crate) fn flush_events(&mut self) {
        if self.batch_depth > 0 {
            return;
        }
        self.collect_property_changes();
        let events = std::mem::take(&mut self.events);
        for event in &events {
            for observer in &mut self.observers {
                observer(event);
            }
        }
    }

    fn collect_property_changes(&mut self) {
        for change in self.data.take_notifications() {
            self.events.push(SessionEvent::PropertyChanged {
                owner: PropertyOwner::Session,
                property: change.property,
            });
        }
        for id in self.registry.ids() {
            let Some(player) = self.registry.get_mut(id) else {
                continue;
            };
            for change in player.handler_mut().take_notifications() {
                self.events.push(SessionEvent::PropertyChanged {
                    owner: PropertyOwner::Player(id),
                    property: change.property,
                });
            }
        }
    }
}

impl GameSession<crate::transport::QueueTransport> {
    /// Feeds everything this session sent back into it, the way a lone
    /// admin's message server would. Returns the number of delivered
    /// messages.
    pub fn deliver_loopback(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let outgoing = self.transport.drain();
            if outgoing.is_empty() {
                return delivered;
            }
            for envelope in outgoing {
                delivered += 1;
                self.handle_message(envelope);
            }
        }
    }
}

fn register_session_properties(
    data: &mut PropertyReplicator,
    config: &SessionConfig,
) -> Result<(), PropertyError> {
    data.register(MAX_PLAYERS, config.policy, config.max_players)?;
    data.register(MIN_PLAYERS, config.policy, config.min_players)?;
    data.register(GAME_STATUS, config.policy, GameStatus::Init)?;
    Ok(())
}

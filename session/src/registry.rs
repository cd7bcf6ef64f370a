//! Player arena and membership lists
//!
//! Players live in one arena keyed by id. The active and inactive lists are
//! ordered id sets over that arena and every registered id is in exactly one
//! of them. Outside code keeps ids and resolves them here on each use.

use crate::player::Player;
use shared::PlayerId;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: HashMap<PlayerId, Player>,
    active: Vec<PlayerId>,
    inactive: Vec<PlayerId>,
    /// Players the admin deactivated, most recent first
    deactivated: Vec<PlayerId>,
    /// Players waiting for the echo of their own `AddPlayer`
    pending: VecDeque<Player>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered players, active and inactive
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn is_active(&self, id: PlayerId) -> bool {
        self.players.get(&id).is_some_and(Player::is_active)
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn active_ids(&self) -> &[PlayerId] {
        &self.active
    }

    pub fn inactive_ids(&self) -> &[PlayerId] {
        &self.inactive
    }

    /// Active ids followed by inactive ids
    pub fn ids(&self) -> Vec<PlayerId> {
        self.active.iter().chain(&self.inactive).copied().collect()
    }

    /// Active players in list order
    pub fn active_players(&self) -> impl Iterator<Item = &Player> {
        self.active.iter().filter_map(|id| self.players.get(id))
    }

    pub fn find_by_user_id(&self, user_id: i32) -> Option<PlayerId> {
        self.active_players()
            .find(|player| player.user_id() == user_id)
            .and_then(Player::id)
    }

    /// Appends a player to the active list. Hands the player back when it
    /// has no id or the id is taken.
    pub(crate) fn insert_active(&mut self, mut player: Player) -> Result<PlayerId, Player> {
        let Some(id) = player.id() else {
            return Err(player);
        };
        if self.players.contains_key(&id) {
            return Err(player);
        }
        player.set_active(true);
        self.active.push(id);
        self.players.insert(id, player);
        Ok(id)
    }

    /// Takes a player out of the arena and every list
    pub(crate) fn remove(&mut self, id: PlayerId) -> Option<Player> {
        let player = self.players.remove(&id)?;
        self.active.retain(|other| *other != id);
        self.inactive.retain(|other| *other != id);
        self.deactivated.retain(|other| *other != id);
        Some(player)
    }

    /// Moves an active player to the front of the inactive list
    pub(crate) fn deactivate(&mut self, id: PlayerId) -> bool {
        let Some(index) = self.active.iter().position(|other| *other == id) else {
            return false;
        };
        self.active.remove(index);
        self.inactive.insert(0, id);
        if let Some(player) = self.players.get_mut(&id) {
            player.set_active(false);
        }
        true
    }

    /// Moves an inactive player to the end of the active list
    pub(crate) fn reactivate(&mut self, id: PlayerId) -> bool {
        let Some(index) = self.inactive.iter().position(|other| *other == id) else {
            return false;
        };
        self.inactive.remove(index);
        self.active.push(id);
        if let Some(player) = self.players.get_mut(&id) {
            player.set_active(true);
        }
        true
    }

    /// Gives a registered player a new id, keeping its list position
    pub(crate) fn rekey(&mut self, old: PlayerId, new: PlayerId) -> bool {
        if old == new {
            return self.players.contains_key(&old);
        }
        if self.players.contains_key(&new) {
            return false;
        }
        let Some(mut player) = self.players.remove(&old) else {
            return false;
        };
        player.set_id(new);
        self.players.insert(new, player);
        for list in [&mut self.active, &mut self.inactive, &mut self.deactivated] {
            for entry in list.iter_mut().filter(|entry| **entry == old) {
                *entry = new;
            }
        }
        true
    }

    /// Drops every player; returns the ids that were registered
    pub(crate) fn clear(&mut self) -> Vec<PlayerId> {
        let ids = self.ids();
        self.players.clear();
        self.active.clear();
        self.inactive.clear();
        self.deactivated.clear();
        self.pending.clear();
        ids
    }

    pub fn deactivated_ids(&self) -> &[PlayerId] {
        &self.deactivated
    }

    pub(crate) fn note_deactivated(&mut self, id: PlayerId) {
        self.deactivated.retain(|other| *other != id);
        self.deactivated.insert(0, id);
    }

    pub(crate) fn forget_deactivated(&mut self, id: PlayerId) {
        self.deactivated.retain(|other| *other != id);
    }

    pub(crate) fn push_pending(&mut self, player: Player) {
        self.pending.push_back(player);
    }

    pub(crate) fn pop_pending(&mut self) -> Option<Player> {
        self.pending.pop_front()
    }

    pub(crate) fn is_pending(&self, id: PlayerId) -> bool {
        self.pending.iter().any(|player| player.id() == Some(id))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Picks `excess` players to deactivate from `(id, network priority)`
/// candidates: lowest priority first, lower id first on equal priority.
/// The result depends only on the candidate set, not on its order.
pub fn choose_deactivations(candidates: &[(PlayerId, i32)], excess: usize) -> Vec<PlayerId> {
    let mut ordered = candidates.to_vec();
    ordered.sort_by_key(|(id, priority)| (*priority, *id));
    ordered.into_iter().take(excess).map(|(id, _)| id).collect()
}

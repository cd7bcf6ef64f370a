//! Game-logic collaborator consulted by the session

use crate::player::Player;
use shared::PlayerId;

/// Decisions the session delegates to the game. Every method has a default,
/// so a game only overrides what it needs.
pub trait GameHooks {
    /// Builds the player object for a record received from the network or a
    /// save stream. The session assigns id, virtual flag and saved state
    /// afterwards.
    fn create_player(&mut self, rtti: i32, io_value: i32, _is_virtual: bool) -> Player {
        let mut player = Player::new(rtti);
        player.set_io_value(io_value);
        player
    }

    /// Asked for each player of a peer that went away. `true` keeps the
    /// player (the game takes over its input), `false` removes it.
    fn replace_player_io(&mut self, _player: &Player) -> bool {
        false
    }

    /// Lets the admin pick players to deactivate before the priority rule
    /// runs when `joining` players arrive.
    fn new_players_join(&mut self, _active: &[&Player], _joining: &[&Player]) -> Vec<PlayerId> {
        Vec::new()
    }

    /// Extra game state written before the player list
    fn save_pre_players(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn load_pre_players(&mut self, _data: &[u8]) {}

    /// Consumes one input of `player`. Returning `true` finishes the input,
    /// which runs the game-over check and passes the turn.
    fn player_input(&mut self, _player: &Player, _input: &[u8]) -> bool {
        false
    }

    /// Non-zero ends the game with that result
    fn check_game_over(&mut self, _player: &Player) -> i32 {
        0
    }
}

#[derive(Debug, Default)]
pub struct DefaultHooks;

impl GameHooks for DefaultHooks {}

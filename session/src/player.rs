//! Player entities
//!
//! A [`Player`] is plain data plus its own [`PropertyReplicator`]. Game
//! specific players add their own properties to that handler instead of
//! wrapping the type; anything that carries an id and a handler can be
//! driven through [`Replicable`].

use log::error;
use shared::{
    HandlerSnapshot, MessageKind, PlayerId, Policy, PropertyError, PropertyId, PropertyKey,
    PropertyReplicator, Reader, WireError, Writer,
};

/// Trailing marker of a saved player state
pub const PLAYER_SENTINEL: i16 = 7285;

pub const GROUP: PropertyKey<String> = PropertyKey::new(PropertyId::builtin(1), "group");
pub const USER_ID: PropertyKey<i32> = PropertyKey::new(PropertyId::builtin(2), "user_id");
pub const ASYNC_INPUT: PropertyKey<bool> = PropertyKey::new(PropertyId::builtin(3), "async_input");
pub const TURN: PropertyKey<bool> = PropertyKey::new(PropertyId::builtin(4), "turn");
pub const NAME: PropertyKey<String> = PropertyKey::new(PropertyId::builtin(5), "name");

/// Something with an id and a property handler of its own
pub trait Replicable {
    fn replicable_id(&self) -> Option<PlayerId>;
    fn handler(&self) -> &PropertyReplicator;
    fn handler_mut(&mut self) -> &mut PropertyReplicator;
}

#[derive(Debug)]
pub struct Player {
    id: Option<PlayerId>,
    rtti: i32,
    io_value: i32,
    is_virtual: bool,
    is_active: bool,
    network_priority: i32,
    data: PropertyReplicator,
}

impl Player {
    /// Creates an unregistered player; `rtti` tells the game which kind of
    /// player to rebuild when the record travels.
    pub fn new(rtti: i32) -> Self {
        let mut data = PropertyReplicator::new(MessageKind::PlayerProperty);
        if let Err(e) = register_builtins(&mut data) {
            error!("Failed to register player properties: {}", e);
        }
        Self {
            id: None,
            rtti,
            io_value: 0,
            is_virtual: false,
            is_active: true,
            network_priority: 0,
            data,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.set_builtin(NAME, name.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.set_builtin(GROUP, group.to_string());
        self
    }

    pub fn with_user_id(mut self, user_id: i32) -> Self {
        self.set_builtin(USER_ID, user_id);
        self
    }

    pub fn with_async_input(mut self, async_input: bool) -> Self {
        self.set_builtin(ASYNC_INPUT, async_input);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.network_priority = priority;
        self
    }

    pub fn with_id(mut self, id: PlayerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<PlayerId> {
        self.id
    }

    pub fn set_id(&mut self, id: PlayerId) {
        self.id = Some(id);
    }

    pub fn rtti(&self) -> i32 {
        self.rtti
    }

    pub fn io_value(&self) -> i32 {
        self.io_value
    }

    pub fn set_io_value(&mut self, io_value: i32) {
        self.io_value = io_value;
    }

    /// True when the authoritative copy lives on another peer
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub(crate) fn set_virtual(&mut self, is_virtual: bool) {
        self.is_virtual = is_virtual;
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub(crate) fn set_active(&mut self, is_active: bool) {
        self.is_active = is_active;
    }

    pub fn network_priority(&self) -> i32 {
        self.network_priority
    }

    pub fn set_network_priority(&mut self, priority: i32) {
        self.network_priority = priority;
    }

    pub fn name(&self) -> &str {
        self.data.value(NAME).map(String::as_str).unwrap_or_default()
    }

    pub fn group(&self) -> &str {
        self.data.value(GROUP).map(String::as_str).unwrap_or_default()
    }

    pub fn user_id(&self) -> i32 {
        self.data.value(USER_ID).copied().unwrap_or_default()
    }

    pub fn async_input(&self) -> bool {
        self.data.value(ASYNC_INPUT).copied().unwrap_or_default()
    }

    pub fn my_turn(&self) -> bool {
        self.data.value(TURN).copied().unwrap_or_default()
    }

    pub fn data(&self) -> &PropertyReplicator {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PropertyReplicator {
        &mut self.data
    }

    /// Wire form of this player as sent in `AddPlayer`, `SetupGameContinue`
    /// and save streams
    pub fn record(&self) -> Result<PlayerRecord, WireError> {
        let id = self.id.map_or(0, |id| id.raw() as i32);
        Ok(PlayerRecord {
            rtti: self.rtti,
            id,
            io_value: self.io_value,
            state: PlayerState {
                id,
                priority: self.network_priority,
                properties: self.data.snapshot()?,
            },
        })
    }

    /// Applies saved state: priority and every saved property value
    pub fn apply_state(&mut self, state: &PlayerState) {
        self.network_priority = state.priority;
        self.data.apply_snapshot(&state.properties);
    }

    fn set_builtin<T: shared::PropertyValue>(&mut self, key: PropertyKey<T>, value: T) {
        if let Err(e) = self.data.set_local(key, value) {
            error!("Failed to set {:?}: {}", key, e);
        }
    }
}

impl Replicable for Player {
    fn replicable_id(&self) -> Option<PlayerId> {
        self.id
    }

    fn handler(&self) -> &PropertyReplicator {
        &self.data
    }

    fn handler_mut(&mut self) -> &mut PropertyReplicator {
        &mut self.data
    }
}

fn register_builtins(data: &mut PropertyReplicator) -> Result<(), PropertyError> {
    data.register(GROUP, Policy::Local, String::new())?;
    data.register(USER_ID, Policy::Local, 0)?;
    data.register(ASYNC_INPUT, Policy::Local, false)?;
    data.register(TURN, Policy::Local, false)?;
    data.register(NAME, Policy::Local, String::new())?;
    Ok(())
}

/// Saved player state: `id`, `priority`, property handler, sentinel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerState {
    pub id: i32,
    pub priority: i32,
    pub properties: HandlerSnapshot,
}

impl PlayerState {
    pub fn write(&self, writer: &mut Writer) -> Result<(), WireError> {
        writer.put(&self.id)?;
        writer.put(&self.priority)?;
        self.properties.write(writer)?;
        writer.put(&PLAYER_SENTINEL)
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let id = reader.get()?;
        let priority = reader.get()?;
        let properties = HandlerSnapshot::read(reader)?;
        reader.expect_sentinel("player", PLAYER_SENTINEL)?;
        Ok(Self {
            id,
            priority,
            properties,
        })
    }
}

/// `rtti`, `id`, `io_value`, then the player state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerRecord {
    pub rtti: i32,
    pub id: i32,
    pub io_value: i32,
    pub state: PlayerState,
}

impl PlayerRecord {
    pub fn player_id(&self) -> Option<PlayerId> {
        u32::try_from(self.id).ok().and_then(PlayerId::from_raw)
    }

    pub fn write(&self, writer: &mut Writer) -> Result<(), WireError> {
        writer.put(&self.rtti)?;
        writer.put(&self.id)?;
        writer.put(&self.io_value)?;
        self.state.write(writer)
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            rtti: reader.get()?,
            id: reader.get()?,
            io_value: reader.get()?,
            state: PlayerState::read(reader)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = Writer::new();
        self.write(&mut writer)?;
        Ok(writer.into_bytes())
    }
}

/// `count` followed by that many records
pub fn write_records(writer: &mut Writer, records: &[PlayerRecord]) -> Result<(), WireError> {
    writer.put_count(records.len())?;
    records.iter().try_for_each(|record| record.write(writer))
}

pub fn read_records(reader: &mut Reader<'_>) -> Result<Vec<PlayerRecord>, WireError> {
    let count = reader.get_count()?;
    (0..count).map(|_| PlayerRecord::read(reader)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PeerId;

    const SCORE: PropertyKey<i32> = PropertyKey::new(PropertyId::user(0), "score");

    #[test]
    fn test_player_creation() {
        let player = Player::new(7)
            .with_name("alice")
            .with_group("red")
            .with_user_id(3)
            .with_priority(5);

        assert_eq!(player.id(), None);
        assert_eq!(player.rtti(), 7);
        assert_eq!(player.name(), "alice");
        assert_eq!(player.group(), "red");
        assert_eq!(player.user_id(), 3);
        assert_eq!(player.network_priority(), 5);
        assert!(player.is_active());
        assert!(!player.is_virtual());
        assert!(!player.async_input());
        assert!(!player.my_turn());
    }

    #[test]
    fn test_builtins_use_player_message_kind() {
        let player = Player::new(0);
        assert_eq!(player.data().message_kind(), MessageKind::PlayerProperty);
        assert_eq!(player.data().len(), 5);
        assert!(player.data().contains(TURN.id()));
    }

    #[test]
    fn test_record_carries_state() {
        let mut player = Player::new(2)
            .with_name("bob")
            .with_priority(9)
            .with_id(PlayerId::new(4, PeerId(2)));
        player.set_io_value(0x11);
        player.data_mut().register(SCORE, Policy::Local, 120).unwrap();

        let record = player.record().unwrap();
        assert_eq!(record.rtti, 2);
        assert_eq!(record.io_value, 0x11);
        assert_eq!(record.player_id(), Some(PlayerId::new(4, PeerId(2))));
        assert_eq!(record.state.id, record.id);

        let bytes = record.to_bytes().unwrap();
        let decoded = PlayerRecord::read(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, record);

        let mut copy = Player::new(2);
        copy.data_mut().register(SCORE, Policy::Local, 0).unwrap();
        copy.apply_state(&decoded.state);
        assert_eq!(copy.name(), "bob");
        assert_eq!(copy.network_priority(), 9);
        assert_eq!(copy.data().value(SCORE), Some(&120));
    }

    #[test]
    fn test_missing_player_sentinel_rejected() {
        let player = Player::new(0).with_id(PlayerId::new(1, PeerId::ADMIN));
        let bytes = player.record().unwrap().to_bytes().unwrap();
        let truncated = &bytes[..bytes.len() - 2];
        assert!(PlayerRecord::read(&mut Reader::new(truncated)).is_err());
    }

    #[test]
    fn test_record_list() {
        let records: Vec<PlayerRecord> = (1..=3)
            .map(|seq| {
                Player::new(0)
                    .with_id(PlayerId::new(seq, PeerId::ADMIN))
                    .record()
                    .unwrap()
            })
            .collect();

        let mut writer = Writer::new();
        write_records(&mut writer, &records).unwrap();
        let bytes = writer.into_bytes();
        let decoded = read_records(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_unassigned_record_has_no_id() {
        let record = Player::new(0).record().unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(record.player_id(), None);
    }
}

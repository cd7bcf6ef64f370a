//! Policy-gated replicated properties
//!
//! A [`PropertyReplicator`] owns a set of typed values keyed by [`PropertyId`].
//! Mutations go through [`PropertyReplicator::change_value`], which decides
//! from the property's [`Policy`] whether the value changes now, after the
//! network echoes the change back, or both:
//!
//! - `Local` applies immediately and never touches the network
//! - `Clean` only produces the change payload; the value is applied when the
//!   echoed message comes back through [`PropertyReplicator::process_message`]
//! - `Dirty` applies immediately and also produces the payload; its own echo
//!   is ignored
//!
//! Every applied change yields exactly one [`PropertyChanged`] notification.
//! Notifications are held back while direct emit is locked and released in
//! order once the outermost lock is dropped.

use crate::protocol::MessageKind;
use crate::wire::{self, Reader, WireError, Writer};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Trailing marker of a saved handler
pub const HANDLER_SENTINEL: i16 = 6239;

/// Consistency mode of a single property
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    Local,
    Clean,
    Dirty,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Policy::Local => "local",
            Policy::Clean => "clean",
            Policy::Dirty => "dirty",
        };
        f.write_str(name)
    }
}

/// Id of a property inside one handler. Ids below [`PropertyId::USER_BASE`]
/// belong to the session and player built-ins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(u16);

impl PropertyId {
    pub const USER_BASE: u16 = 256;

    pub const fn builtin(id: u16) -> Self {
        assert!(id < Self::USER_BASE, "built-in property ids stay below 256");
        PropertyId(id)
    }

    pub const fn user(offset: u16) -> Self {
        assert!(offset <= u16::MAX - Self::USER_BASE, "user property id out of range");
        PropertyId(Self::USER_BASE + offset)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_user(self) -> bool {
        self.0 >= Self::USER_BASE
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Typed handle to a property. Holding the key is the only way to read or
/// write the value, so a property is always used with the type it was
/// registered with.
pub struct PropertyKey<T> {
    id: PropertyId,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PropertyKey<T> {
    pub const fn new(id: PropertyId, name: &'static str) -> Self {
        Self {
            id,
            name,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> PropertyId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropertyKey<T> {}

impl<T> fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Anything that can live in a property
pub trait PropertyValue: Serialize + DeserializeOwned + Clone + fmt::Debug + 'static {}

impl<T> PropertyValue for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + 'static {}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("property {0} is already registered")]
    AlreadyRegistered(PropertyId),
    #[error("property {0} is not registered")]
    Unregistered(PropertyId),
    #[error("property {0} holds a different value type")]
    TypeMismatch(PropertyId),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Notification for one applied change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyChanged {
    pub property: PropertyId,
}

trait Slot {
    fn name(&self) -> &'static str;
    fn policy(&self) -> Policy;
    fn set_policy(&mut self, policy: Policy);
    fn encode(&self) -> Result<Vec<u8>, WireError>;
    fn apply(&mut self, bytes: &[u8]) -> Result<(), WireError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedSlot<T> {
    name: &'static str,
    policy: Policy,
    value: T,
}

impl<T: PropertyValue> Slot for TypedSlot<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn policy(&self) -> Policy {
        self.policy
    }

    fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        wire::encode(&self.value)
    }

    fn apply(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.value = wire::decode(bytes)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Saved state of a whole handler: `(id, encoded value)` pairs in id order.
///
/// Decoding a snapshot never touches live properties, so a load can be fully
/// validated before anything is applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerSnapshot {
    entries: Vec<(PropertyId, Vec<u8>)>,
}

impl HandlerSnapshot {
    pub fn write(&self, writer: &mut Writer) -> Result<(), WireError> {
        let count = u32::try_from(self.entries.len()).map_err(|_| WireError::Length(self.entries.len()))?;
        writer.put(&count)?;
        for (id, bytes) in &self.entries {
            writer.put(id)?;
            writer.put(bytes)?;
        }
        writer.put(&HANDLER_SENTINEL)
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let count: u32 = reader.get()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let id: PropertyId = reader.get()?;
            let bytes: Vec<u8> = reader.get()?;
            entries.push((id, bytes));
        }
        reader.expect_sentinel("property handler", HANDLER_SENTINEL)?;
        Ok(Self { entries })
    }

    pub fn get(&self, id: PropertyId) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Decodes one entry with the key's type
    pub fn value<T: PropertyValue>(&self, key: PropertyKey<T>) -> Option<Result<T, WireError>> {
        self.get(key.id()).map(wire::decode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handler of one owner's replicated properties
pub struct PropertyReplicator {
    message_kind: MessageKind,
    slots: BTreeMap<PropertyId, Box<dyn Slot>>,
    emit_locks: u32,
    deferred: Vec<PropertyChanged>,
    emitted: Vec<PropertyChanged>,
}

impl PropertyReplicator {
    /// `message_kind` is the id this handler claims in
    /// [`PropertyReplicator::process_message`]
    pub fn new(message_kind: MessageKind) -> Self {
        Self {
            message_kind,
            slots: BTreeMap::new(),
            emit_locks: 0,
            deferred: Vec::new(),
            emitted: Vec::new(),
        }
    }

    pub fn message_kind(&self) -> MessageKind {
        self.message_kind
    }

    pub fn register<T: PropertyValue>(
        &mut self,
        key: PropertyKey<T>,
        policy: Policy,
        initial: T,
    ) -> Result<(), PropertyError> {
        if self.slots.contains_key(&key.id()) {
            return Err(PropertyError::AlreadyRegistered(key.id()));
        }
        self.slots.insert(
            key.id(),
            Box::new(TypedSlot {
                name: key.name(),
                policy,
                value: initial,
            }),
        );
        Ok(())
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current value; `None` if unregistered or registered with another type
    pub fn value<T: PropertyValue>(&self, key: PropertyKey<T>) -> Option<&T> {
        let slot = self.slots.get(&key.id())?;
        slot.as_any()
            .downcast_ref::<TypedSlot<T>>()
            .map(|typed| &typed.value)
    }

    pub fn policy(&self, id: PropertyId) -> Option<Policy> {
        self.slots.get(&id).map(|slot| slot.policy())
    }

    pub fn set_policy(&mut self, id: PropertyId, policy: Policy) -> Result<(), PropertyError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(PropertyError::Unregistered(id))?;
        slot.set_policy(policy);
        Ok(())
    }

    pub fn set_policy_all(&mut self, policy: Policy) {
        for slot in self.slots.values_mut() {
            slot.set_policy(policy);
        }
    }

    /// Applies a value locally whatever the policy and notifies
    pub fn set_local<T: PropertyValue>(
        &mut self,
        key: PropertyKey<T>,
        value: T,
    ) -> Result<(), PropertyError> {
        self.typed_slot_mut(key)?.value = value;
        self.notify(key.id());
        Ok(())
    }

    /// Mutates a property according to its policy.
    ///
    /// Returns the payload to send with this handler's message kind, or
    /// `None` when the property is `Local`.
    pub fn change_value<T: PropertyValue>(
        &mut self,
        key: PropertyKey<T>,
        value: T,
    ) -> Result<Option<Vec<u8>>, PropertyError> {
        let policy = self.typed_slot_mut(key)?.policy;
        let payload = match policy {
            Policy::Local => None,
            Policy::Clean | Policy::Dirty => {
                let mut writer = Writer::new();
                writer.put(&key.id())?;
                writer.put(&value)?;
                Some(writer.into_bytes())
            }
        };
        if policy != Policy::Clean {
            self.typed_slot_mut(key)?.value = value;
            self.notify(key.id());
        }
        Ok(payload)
    }

    /// Applies one inbound property message.
    ///
    /// Returns `false` when `message_id` is not this handler's kind. A claimed
    /// message naming an unknown property, or carrying a value that does not
    /// decode, is logged and dropped.
    pub fn process_message(&mut self, message_id: u32, payload: &[u8], is_sender_self: bool) -> bool {
        if message_id != self.message_kind.id() {
            return false;
        }

        let mut reader = Reader::new(payload);
        let id: PropertyId = match reader.get() {
            Ok(id) => id,
            Err(e) => {
                warn!("Malformed {:?} message: {}", self.message_kind, e);
                return true;
            }
        };

        let Some(slot) = self.slots.get_mut(&id) else {
            warn!("{:?} message for unregistered property {}", self.message_kind, id);
            return true;
        };

        if is_sender_self && slot.policy() == Policy::Dirty {
            debug!("Skipping echo of dirty property {} ({})", id, slot.name());
            return true;
        }

        match slot.apply(reader.remaining()) {
            Ok(()) => self.notify(id),
            Err(e) => warn!("Dropping value for property {} ({}): {}", id, slot.name(), e),
        }
        true
    }

    pub fn lock_direct_emit(&mut self) {
        self.emit_locks += 1;
    }

    /// Releases one lock; the last release flushes the held notifications
    pub fn unlock_direct_emit(&mut self) {
        if self.emit_locks == 0 {
            warn!("unlock_direct_emit called without a matching lock");
            return;
        }
        self.emit_locks -= 1;
        if self.emit_locks == 0 {
            self.emitted.append(&mut self.deferred);
        }
    }

    pub fn is_emit_locked(&self) -> bool {
        self.emit_locks > 0
    }

    /// Drains the notifications released so far
    pub fn take_notifications(&mut self) -> Vec<PropertyChanged> {
        std::mem::take(&mut self.emitted)
    }

    pub fn snapshot(&self) -> Result<HandlerSnapshot, WireError> {
        let entries = self
            .slots
            .iter()
            .map(|(id, slot)| slot.encode().map(|bytes| (*id, bytes)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HandlerSnapshot { entries })
    }

    pub fn save(&self, writer: &mut Writer) -> Result<(), WireError> {
        self.snapshot()?.write(writer)
    }

    /// Applies every entry of a snapshot, notifying once per applied value.
    /// Entries for properties this handler does not know are skipped.
    pub fn apply_snapshot(&mut self, snapshot: &HandlerSnapshot) {
        for (id, bytes) in &snapshot.entries {
            let Some(slot) = self.slots.get_mut(id) else {
                warn!("Saved state names unregistered property {}", id);
                continue;
            };
            match slot.apply(bytes) {
                Ok(()) => self.notify(*id),
                Err(e) => warn!("Skipping saved value of property {} ({}): {}", id, slot.name(), e),
            }
        }
    }

    pub fn load(&mut self, reader: &mut Reader<'_>) -> Result<(), WireError> {
        let snapshot = HandlerSnapshot::read(reader)?;
        self.apply_snapshot(&snapshot);
        Ok(())
    }

    fn typed_slot_mut<T: PropertyValue>(
        &mut self,
        key: PropertyKey<T>,
    ) -> Result<&mut TypedSlot<T>, PropertyError> {
        let slot = self
            .slots
            .get_mut(&key.id())
            .ok_or(PropertyError::Unregistered(key.id()))?;
        slot.as_any_mut()
            .downcast_mut::<TypedSlot<T>>()
            .ok_or(PropertyError::TypeMismatch(key.id()))
    }

    fn notify(&mut self, property: PropertyId) {
        let change = PropertyChanged { property };
        if self.emit_locks > 0 {
            self.deferred.push(change);
        } else {
            self.emitted.push(change);
        }
    }
}

impl fmt::Debug for PropertyReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyReplicator")
            .field("message_kind", &self.message_kind)
            .field("properties", &self.slots.keys().collect::<Vec<_>>())
            .field("emit_locks", &self.emit_locks)
            .finish()
    }
}

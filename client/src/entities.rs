//! Interactive world objects and the participant's inventory
//!
//! Items and locks live in an [`EntityRegistry`] under stable ids instead of
//! being tagged onto scene objects. The inventory holds items by value while
//! they are carried and puts them back in the registry when dropped.

use crate::signals::GameplaySignal;
use shared::{LockKind, Vec3};
use std::collections::BTreeMap;

pub const INVENTORY_SLOTS: usize = 3;

/// Loudness of an item hitting the floor.
pub const DROP_SOUND_RADIUS: f32 = 20.0;

/// Distance in front of the participant where dropped items land.
pub const DROP_DISTANCE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// Something that can be carried; opens the lock of the same kind
    Item { kind: LockKind, position: Vec3 },
    /// A lock on the exit door; `engaged` once the right item was used on it
    Lock { kind: LockKind, engaged: bool },
}

impl Entity {
    pub fn is_interactable(&self) -> bool {
        match self {
            Entity::Item { .. } => true,
            Entity::Lock { engaged, .. } => !engaged,
        }
    }
}

#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, Entity>,
    next_id: u32,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One item and one lock of every kind. Items are scattered around the
    /// spawn area; the locks sit on the exit door.
    pub fn with_default_layout() -> Self {
        let mut registry = Self::new();
        let item_positions = [
            Vec3::new(-10.0, 1.0, -10.0),
            Vec3::new(12.0, 1.0, 4.0),
            Vec3::new(0.0, 1.0, 20.0),
        ];
        for (kind, position) in LockKind::ALL.into_iter().zip(item_positions) {
            registry.spawn(Entity::Item { kind, position });
        }
        for kind in LockKind::ALL {
            registry.spawn(Entity::Lock {
                kind,
                engaged: false,
            });
        }
        registry
    }

    pub fn spawn(&mut self, entity: Entity) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(id, entity);
        id
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    pub fn interactables(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities
            .iter()
            .filter(|(_, entity)| entity.is_interactable())
            .map(|(id, entity)| (*id, entity))
    }

    pub fn item_of_kind(&self, kind: LockKind) -> Option<EntityId> {
        self.entities.iter().find_map(|(id, entity)| match entity {
            Entity::Item { kind: k, .. } if *k == kind => Some(*id),
            _ => None,
        })
    }

    /// First lock of `kind`, engaged or not.
    pub fn lock_of_kind(&self, kind: LockKind) -> Option<EntityId> {
        self.entities.iter().find_map(|(id, entity)| match entity {
            Entity::Lock { kind: k, .. } if *k == kind => Some(*id),
            _ => None,
        })
    }

    /// Marks the lock of `kind` engaged. Returns false if it already was.
    pub fn engage_lock(&mut self, kind: LockKind) -> bool {
        let Some(id) = self.lock_of_kind(kind) else {
            return false;
        };
        match self.entities.get_mut(&id) {
            Some(Entity::Lock { engaged, .. }) if !*engaged => {
                *engaged = true;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Inventory {
    slots: [Option<LockKind>; INVENTORY_SLOTS],
    active: usize,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots(&self) -> &[Option<LockKind>; INVENTORY_SLOTS] {
        &self.slots
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Out-of-range indices are ignored.
    pub fn set_active_slot(&mut self, index: usize) {
        if index < INVENTORY_SLOTS {
            self.active = index;
        }
    }

    pub fn active_item(&self) -> Option<LockKind> {
        self.slots[self.active]
    }

    pub fn slot_of(&self, kind: LockKind) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(kind))
    }

    /// Moves an item from the world into the first free slot.
    ///
    /// Returns false and leaves the world untouched when the inventory is
    /// full or `id` is not an item.
    pub fn pick_up(&mut self, registry: &mut EntityRegistry, id: EntityId) -> bool {
        let kind = match registry.get(id) {
            Some(Entity::Item { kind, .. }) => *kind,
            _ => return false,
        };
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            return false;
        };

        registry.remove(id);
        self.slots[slot] = Some(kind);
        true
    }

    /// Puts the active item back into the world in front of the participant.
    ///
    /// Dropping makes noise; the returned signal carries it.
    pub fn drop_active(
        &mut self,
        registry: &mut EntityRegistry,
        position: Vec3,
        facing_yaw: f32,
    ) -> Option<(EntityId, GameplaySignal)> {
        let kind = self.slots[self.active].take()?;

        let landing = Vec3::new(
            position.x - facing_yaw.sin() * DROP_DISTANCE,
            1.0,
            position.z - facing_yaw.cos() * DROP_DISTANCE,
        );
        let id = registry.spawn(Entity::Item {
            kind,
            position: landing,
        });
        Some((
            id,
            GameplaySignal::SoundEmitted {
                position: landing,
                radius: DROP_SOUND_RADIUS,
            },
        ))
    }

    /// Uses the active item on a lock.
    ///
    /// When the kinds match the item is consumed, the lock is engaged and an
    /// unlock request is returned. Anything else leaves both sides unchanged.
    pub fn use_on_lock(
        &mut self,
        registry: &mut EntityRegistry,
        lock: EntityId,
    ) -> Option<GameplaySignal> {
        let held = self.active_item()?;
        match registry.get(lock) {
            Some(Entity::Lock { kind, engaged }) if *kind == held && !engaged => {}
            _ => return None,
        }

        self.slots[self.active] = None;
        registry.engage_lock(held);
        Some(GameplaySignal::UnlockRequested(held))
    }
}

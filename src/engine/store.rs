use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SharedUnitState};

/// The system of record in memory: one lock-guarded state per unit plus a
/// reverse index from occupancy/hold ids to their unit.
pub struct UnitStore {
    units: DashMap<Ulid, SharedUnitState>,
    entity_to_unit: DashMap<Ulid, Ulid>,
    // Kept beside the map so the unit limit can be checked while holding an
    // entry (DashMap::len would deadlock on the entry's shard).
    unit_total: AtomicUsize,
}

impl Default for UnitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitStore {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            entity_to_unit: DashMap::new(),
            unit_total: AtomicUsize::new(0),
        }
    }

    // ── Units ────────────────────────────────────────────────

    pub fn unit_count(&self) -> usize {
        self.unit_total.load(Ordering::Acquire)
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.units.get(id).map(|e| e.value().clone())
    }

    /// Insert a fresh unit state unless one already exists. Returns the state
    /// that ends up in the map.
    pub fn insert_unit(&self, unit: Unit) -> SharedUnitState {
        match self.units.entry(unit.id) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(slot) => {
                self.unit_total.fetch_add(1, Ordering::AcqRel);
                slot.insert(Arc::new(RwLock::new(UnitState::new(unit)))).value().clone()
            }
        }
    }

    /// Register a unit that does not exist yet and return its state already
    /// write-locked, so no reader or writer sees it before the caller has
    /// persisted it. `Ok(None)` when the unit exists.
    pub fn claim_new_unit(
        &self,
        unit: Unit,
        max_units: usize,
    ) -> Result<Option<OwnedRwLockWriteGuard<UnitState>>, EngineError> {
        match self.units.entry(unit.id) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let state = Arc::new(RwLock::new(UnitState::new(unit)));
                let guard = state
                    .clone()
                    .try_write_owned()
                    .map_err(|_| EngineError::Infrastructure("new unit state already locked".into()))?;
                self.unit_total
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max_units).then_some(n + 1))
                    .map_err(|_| EngineError::LimitExceeded("too many units"))?;
                slot.insert(state);
                Ok(Some(guard))
            }
        }
    }

    /// Drop a unit registered by `claim_new_unit` whose creation failed.
    pub fn remove_unit(&self, id: &Ulid) {
        if self.units.remove(id).is_some() {
            self.unit_total.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// True while `state` is the live entry for `id`, i.e. it has not been
    /// rolled back since the caller fetched it.
    pub fn is_current(&self, id: &Ulid, state: &SharedUnitState) -> bool {
        self.units.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), state))
    }

    pub fn unit_ids(&self) -> Vec<Ulid> {
        self.units.iter().map(|e| *e.key()).collect()
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn unit_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_unit.get(entity_id).map(|e| *e.value())
    }

    pub fn map_entity(&self, entity_id: Ulid, unit_id: Ulid) {
        self.entity_to_unit.insert(entity_id, unit_id);
    }

    /// Claim an occupancy/hold id for `unit_id`. False when any unit already
    /// owns it. Ids are unique across the tenant, not per unit.
    pub fn reserve_entity(&self, entity_id: Ulid, unit_id: Ulid) -> bool {
        match self.entity_to_unit.entry(entity_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(unit_id);
                true
            }
        }
    }

    /// Undo a `reserve_entity` whose write never became durable.
    pub fn release_entity(&self, entity_id: &Ulid, unit_id: Ulid) {
        self.entity_to_unit.remove_if(entity_id, |_, owner| *owner == unit_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to a unit's state. The caller holds the write lock.
    pub fn apply_event(&self, us: &mut UnitState, event: &Event) {
        match event {
            Event::UnitUpserted {
                name,
                nightly_rate,
                active,
                ..
            } => {
                us.unit.name = name.clone();
                us.unit.nightly_rate = *nightly_rate;
                us.unit.active = *active;
            }
            Event::OccupancyCreated {
                id,
                unit_id,
                requester,
                stay,
                state,
                created_at,
                hold_id,
            } => {
                us.insert_occupancy(Occupancy {
                    id: *id,
                    unit_id: *unit_id,
                    requester: requester.clone(),
                    stay: *stay,
                    state: *state,
                    created_at: *created_at,
                    hold_id: *hold_id,
                });
                self.map_entity(*id, *unit_id);
            }
            Event::OccupancyTransitioned { id, state, .. } => {
                if let Some(o) = us.occupancy_mut(*id) {
                    o.state = *state;
                }
            }
            Event::HoldPlaced {
                id,
                unit_id,
                requester,
                stay,
                expires_at,
                created_at,
            } => {
                us.insert_hold(Hold {
                    id: *id,
                    unit_id: *unit_id,
                    requester: requester.clone(),
                    stay: *stay,
                    expires_at: *expires_at,
                    state: HoldState::Active,
                    created_at: *created_at,
                });
                self.map_entity(*id, *unit_id);
            }
            Event::HoldReleased { id, .. } => set_hold_state(us, *id, HoldState::Released),
            Event::HoldExpired { id, .. } => set_hold_state(us, *id, HoldState::Expired),
            Event::HoldConsumed {
                id,
                unit_id,
                occupancy_id,
                created_at,
            } => {
                let Some(hold) = us.hold_mut(*id) else { return };
                hold.state = HoldState::Consumed;
                let occupancy = Occupancy {
                    id: *occupancy_id,
                    unit_id: *unit_id,
                    requester: hold.requester.clone(),
                    stay: hold.stay,
                    state: OccupancyState::Pending,
                    created_at: *created_at,
                    hold_id: Some(*id),
                };
                us.insert_occupancy(occupancy);
                self.map_entity(*occupancy_id, *unit_id);
            }
        }
    }
}

fn set_hold_state(us: &mut UnitState, id: Ulid, state: HoldState) {
    if let Some(h) = us.hold_mut(id) {
        h.state = state;
    }
}

use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, today, validate_requester, validate_stay};
use super::{Engine, EngineError, WalCommand};

/// What `expire_hold` found under the unit lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldExpiry {
    Expired,
    NotDue,
    AlreadyExpired,
    /// Consumed or released before the sweep reached it.
    Settled(HoldState),
}

impl Engine {
    /// Create or update a unit's catalog data. Deactivating a unit blocks new
    /// claims but leaves existing ones untouched.
    pub async fn upsert_unit(
        &self,
        id: Ulid,
        name: Option<String>,
        nightly_rate: Amount,
        active: bool,
    ) -> Result<Unit, EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("unit name too long"));
        }
        if nightly_rate < 0 {
            return Err(EngineError::Validation("nightly_rate must not be negative".into()));
        }

        let event = Event::UnitUpserted {
            id,
            name: name.clone(),
            nightly_rate,
            active,
        };

        let unit = Unit {
            id,
            name,
            nightly_rate,
            active,
        };
        if let Some(mut guard) = self.store.claim_new_unit(unit, MAX_UNITS_PER_TENANT)? {
            if let Err(e) = self.persist_and_apply(id, &mut guard, &event).await {
                self.store.remove_unit(&id);
                return Err(e);
            }
            info!("unit {id} registered");
            return Ok(guard.unit.clone());
        }

        let mut guard = self.lock_unit_write(id).await?;
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.unit.clone())
    }

    /// Record a pending or confirmed occupancy. The overlap re-check and the
    /// insert run under the unit's write lock.
    pub async fn create_occupancy(
        &self,
        id: Ulid,
        unit_id: Ulid,
        requester: &str,
        stay: Stay,
        state: OccupancyState,
    ) -> Result<Occupancy, EngineError> {
        if !state.is_active() {
            return Err(EngineError::Validation(format!(
                "occupancy must start pending or confirmed, not {state}"
            )));
        }
        validate_stay(&stay, today(), self.config.grace_days)?;
        validate_requester(requester)?;

        let mut guard = self.lock_unit_write(unit_id).await?;
        self.ensure_claimable(&guard, id)?;

        let now = now_ms();
        if let Err(conflicts) = check_no_conflict(&guard, stay, now) {
            warn!("occupancy {id} on unit {unit_id} rejected: {} conflicts", conflicts.len());
            metrics::counter!(crate::observability::AVAILABILITY_CONFLICTS_TOTAL, "path" => "occupancy").increment(1);
            return Err(EngineError::Conflict { unit_id, conflicts });
        }

        let event = Event::OccupancyCreated {
            id,
            unit_id,
            requester: requester.to_string(),
            stay,
            state,
            created_at: now,
            hold_id: None,
        };
        self.persist_new_claim(id, unit_id, &mut guard, &event).await?;
        debug!("occupancy {id} created on unit {unit_id} for {stay}");
        guard.occupancy(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move an occupancy along its lifecycle. Only pending→confirmed,
    /// pending→cancelled and confirmed→cancelled are legal.
    pub async fn transition_occupancy(&self, id: Ulid, to: OccupancyState) -> Result<Occupancy, EngineError> {
        let (unit_id, mut guard) = self.resolve_entity_write(&id).await?;
        let from = guard.occupancy(id).ok_or(EngineError::NotFound(id))?.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: from.as_str(),
                to: to.as_str(),
            });
        }

        let event = Event::OccupancyTransitioned { id, unit_id, state: to };
        self.persist_and_apply(unit_id, &mut guard, &event).await?;
        debug!("occupancy {id}: {from} -> {to}");
        guard.occupancy(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Place a time-boxed hold. Re-validates against occupancies and other
    /// live holds under the unit's write lock.
    pub async fn create_hold(
        &self,
        id: Ulid,
        unit_id: Ulid,
        requester: &str,
        stay: Stay,
        hold_minutes: u32,
    ) -> Result<Hold, EngineError> {
        if hold_minutes == 0 {
            return Err(EngineError::Validation("hold_minutes must be at least 1".into()));
        }
        if hold_minutes > MAX_HOLD_MINUTES {
            return Err(EngineError::LimitExceeded("hold too long"));
        }
        validate_stay(&stay, today(), self.config.grace_days)?;
        validate_requester(requester)?;

        let mut guard = self.lock_unit_write(unit_id).await?;
        self.ensure_claimable(&guard, id)?;

        let now = now_ms();
        if let Err(conflicts) = check_no_conflict(&guard, stay, now) {
            warn!("hold {id} on unit {unit_id} rejected: {} conflicts", conflicts.len());
            metrics::counter!(crate::observability::AVAILABILITY_CONFLICTS_TOTAL, "path" => "hold").increment(1);
            return Err(EngineError::NotAvailable { unit_id, conflicts });
        }

        let event = Event::HoldPlaced {
            id,
            unit_id,
            requester: requester.to_string(),
            stay,
            expires_at: now + i64::from(hold_minutes) * 60_000,
            created_at: now,
        };
        self.persist_new_claim(id, unit_id, &mut guard, &event).await?;
        debug!("hold {id} placed on unit {unit_id} for {stay}, {hold_minutes} min");
        guard.hold(id).cloned().ok_or(EngineError::HoldNotFound(id))
    }

    /// The requester abandoned checkout. Releasing a hold that already
    /// expired or was released is a no-op.
    pub async fn release_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        let (unit_id, mut guard) = self.resolve_hold_write(id).await?;
        let hold = guard.hold(id).ok_or(EngineError::HoldNotFound(id))?;
        match hold.state {
            HoldState::Active => {}
            HoldState::Released | HoldState::Expired => return Ok(hold.clone()),
            HoldState::Consumed => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: HoldState::Consumed.as_str(),
                    to: HoldState::Released.as_str(),
                });
            }
        }

        let event = Event::HoldReleased { id, unit_id };
        self.persist_and_apply(unit_id, &mut guard, &event).await?;
        debug!("hold {id} released");
        guard.hold(id).cloned().ok_or(EngineError::HoldNotFound(id))
    }

    /// Promote an active, unexpired hold into a pending occupancy with the
    /// same requester and stay. One WAL record covers both changes.
    pub async fn consume_hold(&self, hold_id: Ulid, occupancy_id: Ulid) -> Result<Occupancy, EngineError> {
        let (unit_id, mut guard) = self.resolve_hold_write(hold_id).await?;
        let hold = guard.hold(hold_id).ok_or(EngineError::HoldNotFound(hold_id))?;
        let now = now_ms();
        match hold.state {
            HoldState::Active if hold.is_blocking(now) => {}
            HoldState::Active | HoldState::Expired => {
                debug!("hold {hold_id} expired before consumption");
                return Err(EngineError::HoldExpired(hold_id));
            }
            HoldState::Consumed | HoldState::Released => return Err(EngineError::HoldNotFound(hold_id)),
        }
        if self.store.unit_for_entity(&occupancy_id).is_some() {
            return Err(EngineError::AlreadyExists(occupancy_id));
        }
        if guard.record_count() >= MAX_RECORDS_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many records on unit"));
        }

        let event = Event::HoldConsumed {
            id: hold_id,
            unit_id,
            occupancy_id,
            created_at: now,
        };
        self.persist_new_claim(occupancy_id, unit_id, &mut guard, &event).await?;
        debug!("hold {hold_id} consumed into occupancy {occupancy_id}");
        guard
            .occupancy(occupancy_id)
            .cloned()
            .ok_or(EngineError::NotFound(occupancy_id))
    }

    /// Scan for active holds past their expiry. Contended units are skipped
    /// and picked up on the next sweep.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for unit_id in self.store.unit_ids() {
            let Some(us) = self.store.get_unit(&unit_id) else { continue };
            if let Ok(guard) = us.try_read() {
                expired.extend(
                    guard
                        .holds
                        .iter()
                        .filter(|h| h.state == HoldState::Active && h.expires_at <= now)
                        .map(|h| (h.id, unit_id)),
                );
            }
        }
        expired
    }

    /// Transition one hold to expired if it is still active and past due.
    /// A hold the sweep saw as lapsed may have been consumed or released by
    /// the time its unit lock is acquired; that is reported, not an error.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<HoldExpiry, EngineError> {
        let (unit_id, mut guard) = self.resolve_hold_write(id).await?;
        let hold = guard.hold(id).ok_or(EngineError::HoldNotFound(id))?;
        match hold.state {
            HoldState::Active if hold.expires_at > now => return Ok(HoldExpiry::NotDue),
            HoldState::Active => {}
            HoldState::Expired => return Ok(HoldExpiry::AlreadyExpired),
            settled @ (HoldState::Consumed | HoldState::Released) => {
                warn!("hold {id} on unit {unit_id} was {settled} before it could expire");
                metrics::counter!(crate::observability::HOLD_EXPIRY_RACES_LOST_TOTAL, "state" => settled.as_str())
                    .increment(1);
                return Ok(HoldExpiry::Settled(settled));
            }
        }
        let event = Event::HoldExpired { id, unit_id };
        self.persist_and_apply(unit_id, &mut guard, &event).await?;
        Ok(HoldExpiry::Expired)
    }

    /// Storage hygiene sweep. Readers already ignore lapsed holds, so this
    /// only changes what listings and the WAL show.
    pub async fn expire_due_holds(&self, now: Ms) -> usize {
        let mut count = 0;
        for (hold_id, unit_id) in self.collect_expired_holds(now) {
            match self.expire_hold(hold_id, now).await {
                Ok(HoldExpiry::Expired) => {
                    count += 1;
                    debug!("expired hold {hold_id} on unit {unit_id}");
                }
                Ok(_) => {}
                Err(e) => debug!("expiry skip {hold_id}: {e}"),
            }
        }
        if count > 0 {
            metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(count as u64);
        }
        count
    }

    /// Compact the WAL down to the events needed to recreate current state.
    /// Settled holds past the retention window are dropped; occupancies never are.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let now = now_ms();
        let retention_ms = self.config.hold_retention.as_millis() as Ms;
        let mut events = Vec::new();

        for unit_id in self.store.unit_ids() {
            let guard = self.lock_unit_read(unit_id).await?;

            let unit = &guard.unit;
            events.push(Event::UnitUpserted {
                id: unit.id,
                name: unit.name.clone(),
                nightly_rate: unit.nightly_rate,
                active: unit.active,
            });

            let mut kept_holds = HashSet::new();
            for hold in &guard.holds {
                let settled = hold.state != HoldState::Active;
                if settled && hold.expires_at + retention_ms <= now {
                    continue;
                }
                kept_holds.insert(hold.id);
                events.push(Event::HoldPlaced {
                    id: hold.id,
                    unit_id,
                    requester: hold.requester.clone(),
                    stay: hold.stay,
                    expires_at: hold.expires_at,
                    created_at: hold.created_at,
                });
                match hold.state {
                    HoldState::Active | HoldState::Consumed => {}
                    HoldState::Released => events.push(Event::HoldReleased { id: hold.id, unit_id }),
                    HoldState::Expired => events.push(Event::HoldExpired { id: hold.id, unit_id }),
                }
            }

            for occ in &guard.occupancies {
                match occ.hold_id.filter(|h| kept_holds.contains(h)) {
                    // Recreated by the consume record so the hold ends up consumed too.
                    Some(hold_id) => {
                        events.push(Event::HoldConsumed {
                            id: hold_id,
                            unit_id,
                            occupancy_id: occ.id,
                            created_at: occ.created_at,
                        });
                        if occ.state != OccupancyState::Pending {
                            events.push(Event::OccupancyTransitioned {
                                id: occ.id,
                                unit_id,
                                state: occ.state,
                            });
                        }
                    }
                    None => events.push(Event::OccupancyCreated {
                        id: occ.id,
                        unit_id,
                        requester: occ.requester.clone(),
                        stay: occ.stay,
                        state: occ.state,
                        created_at: occ.created_at,
                        hold_id: occ.hold_id,
                    }),
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Infrastructure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Infrastructure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Infrastructure(format!("WAL compaction: {e}")))?;
        info!("WAL compacted to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Checks shared by every new claim, made under the unit's write lock.
    fn ensure_claimable(&self, us: &UnitState, id: Ulid) -> Result<(), EngineError> {
        if self.store.unit_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if !us.unit.active {
            return Err(EngineError::UnitInactive(us.unit.id));
        }
        if us.record_count() >= MAX_RECORDS_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many records on unit"));
        }
        Ok(())
    }

    /// Persist an event that introduces `claim_id`. The id is reserved
    /// tenant-wide first: two units locked independently could otherwise both
    /// pass `ensure_claimable` for the same id.
    async fn persist_new_claim(
        &self,
        claim_id: Ulid,
        unit_id: Ulid,
        us: &mut UnitState,
        event: &Event,
    ) -> Result<(), EngineError> {
        if !self.store.reserve_entity(claim_id, unit_id) {
            return Err(EngineError::AlreadyExists(claim_id));
        }
        if let Err(e) = self.persist_and_apply(unit_id, us, event).await {
            self.store.release_entity(&claim_id, unit_id);
            return Err(e);
        }
        Ok(())
    }

    async fn resolve_hold_write(
        &self,
        id: Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<UnitState>), EngineError> {
        self.resolve_entity_write(&id).await.map_err(|e| match e {
            EngineError::NotFound(_) => EngineError::HoldNotFound(id),
            other => other,
        })
    }
}

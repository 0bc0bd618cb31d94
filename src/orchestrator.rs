use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::{CheckOptions, Engine, EngineError};
use crate::model::*;
use crate::pricing::{Pricing, PricingError, Quote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Checkout flow: place a hold, confirm later with `confirm`.
    Hold { minutes: u32 },
    /// Admin or instant booking: create the occupancy straight away.
    Direct { confirmed: bool },
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub unit_id: Ulid,
    pub requester: String,
    pub stay: Stay,
    pub discount_code: Option<String>,
    pub flow: Flow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Held { hold: Hold, quote: Quote },
    Booked { occupancy: Occupancy, quote: Quote },
    /// The stay is taken. `next_window` is the first free stay of the same
    /// length after the requested check-in, if any.
    Unavailable {
        reason: Unavailable,
        next_window: Option<Stay>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
}

/// Sequences check → price → claim. The engine's write-time re-check is the
/// correctness backstop; this only orders the steps and shapes the answer.
pub struct BookingOrchestrator<P> {
    engine: Arc<Engine>,
    pricing: P,
}

impl<P: Pricing> BookingOrchestrator<P> {
    pub fn new(engine: Arc<Engine>, pricing: P) -> Self {
        Self { engine, pricing }
    }

    pub async fn reserve(&self, req: ReservationRequest) -> Result<ReservationOutcome, OrchestratorError> {
        let verdict = self
            .engine
            .check_availability(req.unit_id, req.stay, CheckOptions::default())
            .await?;
        if let Some(reason) = verdict.reason {
            return Ok(self.unavailable(req.unit_id, req.stay, reason).await);
        }

        let unit = self.engine.get_unit(req.unit_id).await?;
        let quote = self
            .pricing
            .quote(&unit, &req.stay, req.discount_code.as_deref())
            .await?;

        let claimed = match req.flow {
            Flow::Hold { minutes } => self
                .engine
                .create_hold(Ulid::new(), req.unit_id, &req.requester, req.stay, minutes)
                .await
                .map(|hold| ReservationOutcome::Held {
                    hold,
                    quote: quote.clone(),
                }),
            Flow::Direct { confirmed } => {
                let state = if confirmed {
                    OccupancyState::Confirmed
                } else {
                    OccupancyState::Pending
                };
                self.engine
                    .create_occupancy(Ulid::new(), req.unit_id, &req.requester, req.stay, state)
                    .await
                    .map(|occupancy| ReservationOutcome::Booked {
                        occupancy,
                        quote: quote.clone(),
                    })
            }
        };

        match claimed {
            Ok(outcome) => {
                info!("reserved unit {} for {} ({:?})", req.unit_id, req.stay, req.flow);
                Ok(outcome)
            }
            // Lost the race between the check and the claim.
            Err(e) if e.is_unavailable() => {
                debug!("reservation on unit {} lost a race: {e}", req.unit_id);
                let reason = Unavailable::Conflicts(e.conflicts().to_vec());
                Ok(self.unavailable(req.unit_id, req.stay, reason).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Promote a hold into a pending occupancy.
    pub async fn confirm(&self, hold_id: Ulid) -> Result<Occupancy, OrchestratorError> {
        Ok(self.engine.consume_hold(hold_id, Ulid::new()).await?)
    }

    /// The requester walked away from checkout.
    pub async fn abandon(&self, hold_id: Ulid) -> Result<Hold, OrchestratorError> {
        Ok(self.engine.release_hold(hold_id).await?)
    }

    async fn unavailable(&self, unit_id: Ulid, stay: Stay, reason: Unavailable) -> ReservationOutcome {
        let next_window = match reason {
            Unavailable::UnitInactive => None,
            Unavailable::Conflicts(_) => self
                .engine
                .next_available_window(unit_id, stay.nights(), stay.check_in)
                .await
                .unwrap_or_else(|e| {
                    debug!("no next-window hint for unit {unit_id}: {e}");
                    None
                }),
        };
        ReservationOutcome::Unavailable { reason, next_window }
    }
}

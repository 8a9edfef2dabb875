use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Visibility};

/// Optional narrowing applied after the visibility filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<Ulid>,
    pub status: Option<Status>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.id.is_none_or(|id| booking.id == id)
            && self.status.is_none_or(|s| booking.status == s)
    }
}

/// A provider known to the service, with its current workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSummary {
    pub id: Ulid,
    /// Bookings currently `Assigned` or `InProgress` to this provider.
    pub active: usize,
    pub completed: usize,
}

impl Engine {
    /// Bookings the actor may see, newest first.
    pub async fn list_bookings(
        &self,
        actor: &Actor,
        filter: BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let visibility = Visibility::for_actor(actor);
        self.store
            .find(&move |b: &Booking| visibility.allows(b) && filter.matches(b))
            .await
    }

    /// A single booking. Invisible bookings are reported as `NotFound`.
    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.get(id).await?;
        if !Visibility::for_actor(actor).allows(&booking) {
            return Err(EngineError::NotFound(id));
        }
        Ok(booking)
    }

    /// The audit trail of a visible booking, oldest first.
    pub async fn history(&self, actor: &Actor, id: Ulid) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(self.get_booking(actor, id).await?.history)
    }

    /// Every provider holding a booking or recorded in a booking's history, by id.
    /// Admin only; used to pick the target of a forced assignment.
    pub async fn list_providers(&self, actor: &Actor) -> Result<Vec<ProviderSummary>, EngineError> {
        if actor.role != Role::Admin {
            return Err(EngineError::Forbidden("only admins list providers"));
        }
        let bookings = self.store.find(&|_: &Booking| true).await?;

        let mut providers: BTreeMap<Ulid, ProviderSummary> = BTreeMap::new();
        for b in &bookings {
            let acted = b
                .history
                .iter()
                .filter(|e| e.actor.role == Role::Provider)
                .filter_map(|e| e.actor.id);
            for id in acted.chain(b.provider) {
                providers.entry(id).or_insert(ProviderSummary {
                    id,
                    active: 0,
                    completed: 0,
                });
            }
        }
        for b in &bookings {
            let Some(id) = b.provider else { continue };
            if let Some(summary) = providers.get_mut(&id) {
                match b.status {
                    Status::Assigned | Status::InProgress => summary.active += 1,
                    Status::Completed => summary.completed += 1,
                    Status::Pending | Status::Cancelled => {}
                }
            }
        }
        Ok(providers.into_values().collect())
    }
}

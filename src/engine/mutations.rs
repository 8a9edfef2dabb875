use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{mutation, precondition};
use super::{lifecycle, now_ms, Engine, EngineError};

fn check_field(value: &str, required: bool, empty: &'static str, too_long: &'static str) -> Result<(), EngineError> {
    if required && value.trim().is_empty() {
        return Err(EngineError::InvalidInput(empty));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

fn validate_details(details: &BookingDetails) -> Result<(), EngineError> {
    check_field(&details.service_type, true, "service_type is required", "service_type too long")?;
    check_field(&details.date, true, "date is required", "date too long")?;
    if let Some(location) = &details.location {
        check_field(location, false, "", "location too long")?;
    }
    Ok(())
}

fn record_transition(action: Action) {
    metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => action.metric_label())
        .increment(1);
}

impl Engine {
    /// Open a new `Pending` booking for a customer. `id` lets the caller pick
    /// the identifier; otherwise one is generated.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        id: Option<Ulid>,
        details: BookingDetails,
    ) -> Result<Booking, EngineError> {
        let id = id.unwrap_or_else(Ulid::new);
        if actor.role != Role::Customer {
            return Err(EngineError::not_eligible(id, "only customers create bookings"));
        }
        validate_details(&details)?;

        let booking = Booking::new(id, actor, details, now_ms());
        self.store.create(booking.clone()).await?;
        record_transition(Action::Created);
        info!(booking = %id, customer = %actor.id, "booking created");
        Ok(booking)
    }

    /// Request a status change. The decision runs under the record lock
    /// against the latest committed booking.
    pub async fn transition(
        &self,
        id: Ulid,
        request: TransitionRequest,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        let actor = request.actor;
        let booking = self
            .store
            .update(
                id,
                mutation(move |current: &Booking| {
                    lifecycle::decide(current, &request, now).map(Some)
                }),
            )
            .await?;
        if let Some(entry) = booking.last_entry() {
            record_transition(entry.action);
        }
        info!(
            booking = %id,
            actor = %actor.id,
            role = %actor.role,
            status = %booking.status,
            "booking transitioned"
        );
        Ok(booking)
    }

    /// Move a `Pending` booking to `Assigned`. Providers accept for
    /// themselves; admins name the provider.
    pub async fn assign(
        &self,
        id: Ulid,
        actor: &Actor,
        provider: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let mut request = TransitionRequest::new(*actor, Status::Assigned);
        request.provider = provider;
        self.transition(id, request).await
    }

    /// Remove a finished booking. Admin only.
    pub async fn delete_booking(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        if actor.role != Role::Admin {
            return Err(EngineError::not_eligible(id, "only admins delete bookings"));
        }
        self.store
            .delete(
                id,
                precondition(move |current: &Booking| {
                    if current.status.is_terminal() {
                        Ok(())
                    } else {
                        Err(EngineError::not_eligible(
                            current.id,
                            "only completed or cancelled bookings can be deleted",
                        ))
                    }
                }),
            )
            .await?;
        info!(booking = %id, admin = %actor.id, "booking deleted");
        Ok(())
    }
}

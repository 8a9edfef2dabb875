//! Who ends up on a booking when it moves into `Assigned`.
//!
//! A provider can only claim a booking for themselves. An admin assigns on
//! someone else's behalf and must name the provider. The booking must still
//! be `Pending`; a booking someone else already claimed is `NotEligible`.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn resolve(
    booking: &Booking,
    actor: &Actor,
    explicit: Option<Ulid>,
    now: Ms,
) -> Result<Change, EngineError> {
    if booking.status.is_terminal() {
        return Err(EngineError::InvalidTransition {
            from: booking.status,
            to: Status::Assigned,
        });
    }

    let provider = match actor.role {
        Role::Provider => match explicit {
            Some(p) if p != actor.id => {
                return Err(EngineError::not_eligible(
                    booking.id,
                    "providers can only assign themselves",
                ));
            }
            _ => actor.id,
        },
        Role::Admin => explicit.ok_or(EngineError::not_eligible(
            booking.id,
            "admin assignment requires a provider",
        ))?,
        Role::Customer | Role::System => {
            return Err(EngineError::not_eligible(
                booking.id,
                "only providers and admins assign bookings",
            ));
        }
    };

    if booking.status != Status::Pending {
        return Err(EngineError::not_eligible(booking.id, "booking is no longer pending"));
    }

    Ok(Change {
        status: Status::Assigned,
        provider: Some(provider),
        entry: HistoryEntry::new(Action::Assigned, ActorRef::from(actor), now),
    })
}

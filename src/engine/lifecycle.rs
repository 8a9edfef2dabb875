//! Booking lifecycle state machine.
//!
//! ```text
//!            accept/assign           start             complete
//! Pending ───────────────▶ Assigned ───────▶ InProgress ─────────▶ Completed
//!    ▲                        │                  │
//!    └──────── reject ────────┘                  │
//!    │                        │                  │
//!    └────────────────────────┴──────────────────┴──── cancel ───▶ Cancelled
//! ```
//!
//! `decide` is the single decision point: it validates a
//! [`TransitionRequest`] against the table and returns the [`Change`] to
//! persist. Admins may additionally force any non-terminal booking into any
//! other state except `Assigned`, which always goes through the assignment
//! resolver.

use ulid::Ulid;

use crate::model::*;

use super::assignment;
use super::EngineError;

/// Which actors may take an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Who {
    Anyone,
    Only(&'static [Role]),
}

impl Who {
    fn admits(&self, role: Role) -> bool {
        match self {
            Who::Anyone => role != Role::System,
            Who::Only(roles) => roles.contains(&role),
        }
    }
}

struct Edge {
    from: &'static [Status],
    to: Status,
    who: Who,
}

const TABLE: &[Edge] = &[
    Edge {
        from: &[Status::Pending],
        to: Status::Assigned,
        who: Who::Only(&[Role::Provider, Role::Admin]),
    },
    Edge {
        from: &[Status::Assigned],
        to: Status::Pending,
        who: Who::Anyone,
    },
    Edge {
        from: &[Status::Assigned],
        to: Status::InProgress,
        who: Who::Only(&[Role::Provider]),
    },
    Edge {
        from: &[Status::InProgress],
        to: Status::Completed,
        who: Who::Only(&[Role::Provider]),
    },
    Edge {
        from: &[Status::Pending, Status::Assigned, Status::InProgress],
        to: Status::Cancelled,
        who: Who::Anyone,
    },
];

fn edge(from: Status, to: Status) -> Option<&'static Edge> {
    TABLE.iter().find(|e| e.to == to && e.from.contains(&from))
}

/// Ordinary (non-override) targets the given role could request from `from`.
#[cfg(test)]
fn table_targets(from: Status, role: Role) -> Vec<Status> {
    Status::ALL
        .into_iter()
        .filter(|to| edge(from, *to).is_some_and(|e| e.who.admits(role)))
        .collect()
}

/// History label for a non-assignment transition.
pub fn action_for(from: Status, to: Status, role: Role) -> Action {
    match (from, to) {
        (Status::Assigned, Status::Pending) => Action::RejectedByProvider,
        (_, Status::Cancelled) => Action::CancelledBy(role),
        _ => Action::StatusChangeTo(to),
    }
}

/// Validate `request` against `booking` and produce the change to commit.
pub fn decide(
    booking: &Booking,
    request: &TransitionRequest,
    now: Ms,
) -> Result<Change, EngineError> {
    let from = booking.status;
    let to = request.target;
    let actor = &request.actor;

    if let Some(expected) = request.expected
        && expected != from
    {
        return Err(EngineError::Conflict(booking.id));
    }
    if from.is_terminal() {
        return Err(EngineError::InvalidTransition { from, to });
    }
    if to == Status::Assigned {
        return assignment::resolve(booking, actor, request.provider, now);
    }
    if from == to {
        return Err(EngineError::InvalidTransition { from, to });
    }

    match actor.role {
        Role::System => {
            return Err(EngineError::not_eligible(
                booking.id,
                "system actor cannot request transitions",
            ));
        }
        Role::Admin => {}
        Role::Customer | Role::Provider => {
            let e = edge(from, to).ok_or(EngineError::InvalidTransition { from, to })?;
            if !e.who.admits(actor.role) {
                return Err(EngineError::not_eligible(booking.id, "role may not take this transition"));
            }
            authorize_identity(booking, actor)?;
        }
    }

    change_for(booking, actor, to, request.provider, now)
}

/// Customers act on their own bookings; providers on bookings assigned to them.
fn authorize_identity(booking: &Booking, actor: &Actor) -> Result<(), EngineError> {
    match actor.role {
        Role::Customer if booking.customer != actor.id => Err(EngineError::not_eligible(
            booking.id,
            "booking belongs to another customer",
        )),
        Role::Provider if booking.provider != Some(actor.id) => Err(EngineError::not_eligible(
            booking.id,
            "booking is not assigned to this provider",
        )),
        _ => Ok(()),
    }
}

/// Side effects keep `provider` set exactly while the status requires one;
/// `Completed` keeps the last provider on record.
fn change_for(
    booking: &Booking,
    actor: &Actor,
    to: Status,
    explicit_provider: Option<Ulid>,
    now: Ms,
) -> Result<Change, EngineError> {
    let provider = match to {
        Status::Pending | Status::Cancelled => None,
        Status::Completed => booking.provider,
        Status::Assigned | Status::InProgress => {
            let p = explicit_provider.or(booking.provider);
            if p.is_none() {
                return Err(EngineError::not_eligible(booking.id, "target state requires a provider"));
            }
            p
        }
    };
    Ok(Change {
        status: to,
        provider,
        entry: HistoryEntry::new(
            action_for(booking.status, to, actor.role),
            ActorRef::from(actor),
            now,
        ),
    })
}

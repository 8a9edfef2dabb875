use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Who is acting. `System` is reserved for background work and is never
/// accepted from a client login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Provider,
    Admin,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Provider => "provider",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "provider" => Ok(Role::Provider),
            "admin" => Ok(Role::Admin),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A verified `(id, role)` pair supplied by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn customer(id: Ulid) -> Self {
        Self::new(id, Role::Customer)
    }

    pub fn provider(id: Ulid) -> Self {
        Self::new(id, Role::Provider)
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(id, Role::Admin)
    }

    /// Parse a login name of the form `<role>:<ulid>`. `system` is refused.
    pub fn from_login(login: &str) -> Result<Self, String> {
        let (role, id) = login
            .split_once(':')
            .ok_or_else(|| format!("expected <role>:<id>, got {login:?}"))?;
        let role: Role = role.parse()?;
        if role == Role::System {
            return Err("system role cannot log in".into());
        }
        let id = Ulid::from_string(id).map_err(|e| format!("bad actor id: {e}"))?;
        Ok(Self { id, role })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl Status {
    #[cfg(test)]
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Assigned,
        Status::InProgress,
        Status::Completed,
        Status::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Assigned => "Assigned",
            Status::InProgress => "InProgress",
            Status::Completed => "Completed",
            Status::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    /// Case-insensitive; `In-progress` and `in_progress` are accepted too.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_' && *c != ' ')
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "pending" => Ok(Status::Pending),
            "assigned" => Ok(Status::Assigned),
            "inprogress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// What a history entry records. Serialized as its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Action {
    Created,
    Assigned,
    RejectedByProvider,
    CancelledBy(Role),
    StatusChangeTo(Status),
    TimeoutCheck,
}

impl Action {
    /// Bounded-cardinality label for metrics (drops the role/status suffix).
    pub fn metric_label(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Assigned => "assigned",
            Action::RejectedByProvider => "rejected-by-provider",
            Action::CancelledBy(_) => "cancelled",
            Action::StatusChangeTo(_) => "status-change",
            Action::TimeoutCheck => "timeout-check",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Created => f.write_str("created"),
            Action::Assigned => f.write_str("assigned"),
            Action::RejectedByProvider => f.write_str("rejected-by-provider"),
            Action::CancelledBy(role) => write!(f, "cancelled-by-{role}"),
            Action::StatusChangeTo(status) => write!(f, "status-change-to-{status}"),
            Action::TimeoutCheck => f.write_str("timeout-check"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => return Ok(Action::Created),
            "assigned" => return Ok(Action::Assigned),
            "rejected-by-provider" => return Ok(Action::RejectedByProvider),
            "timeout-check" => return Ok(Action::TimeoutCheck),
            _ => {}
        }
        if let Some(role) = s.strip_prefix("cancelled-by-") {
            return Ok(Action::CancelledBy(role.parse()?));
        }
        if let Some(status) = s.strip_prefix("status-change-to-") {
            return Ok(Action::StatusChangeTo(status.parse()?));
        }
        Err(format!("unknown history action: {s}"))
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.to_string()
    }
}

impl TryFrom<String> for Action {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Structured actor reference kept in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub role: Role,
    pub id: Option<Ulid>,
}

impl ActorRef {
    pub fn system() -> Self {
        Self {
            role: Role::System,
            id: None,
        }
    }
}

impl From<&Actor> for ActorRef {
    fn from(actor: &Actor) -> Self {
        Self {
            role: actor.role,
            id: Some(actor.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: Action,
    pub actor: ActorRef,
    pub at: Ms,
}

impl HistoryEntry {
    pub fn new(action: Action, actor: ActorRef, at: Ms) -> Self {
        Self { action, actor, at }
    }
}

/// Client-supplied descriptive attributes of a new booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub service_type: String,
    pub date: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub customer: Ulid,
    pub provider: Option<Ulid>,
    pub service_type: String,
    pub date: String,
    pub location: Option<String>,
    pub status: Status,
    /// Append-only; only `apply` touches it.
    pub history: Vec<HistoryEntry>,
    pub created_at: Ms,
}

impl Booking {
    /// A fresh `Pending` booking seeded with its `created` entry.
    pub fn new(id: Ulid, customer: &Actor, details: BookingDetails, now: Ms) -> Self {
        Self {
            id,
            customer: customer.id,
            provider: None,
            service_type: details.service_type,
            date: details.date,
            location: details.location,
            status: Status::Pending,
            history: vec![HistoryEntry::new(Action::Created, ActorRef::from(customer), now)],
            created_at: now,
        }
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    pub fn apply(&mut self, change: Change) {
        self.status = change.status;
        self.provider = change.provider;
        self.history.push(change.entry);
    }
}

/// The only shape a stored booking is mutated through: new status, new
/// provider value, and exactly one audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub status: Status,
    pub provider: Option<Ulid>,
    pub entry: HistoryEntry,
}

/// A capability-tagged transition request, validated once by the lifecycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub actor: Actor,
    pub target: Status,
    /// Explicit provider for admin assignment or admin override into `InProgress`.
    pub provider: Option<Ulid>,
    /// Compare-and-set guard on the current status.
    pub expected: Option<Status>,
}

impl TransitionRequest {
    pub fn new(actor: Actor, target: Status) -> Self {
        Self {
            actor,
            target,
            provider: None,
            expected: None,
        }
    }

    pub fn with_provider(mut self, provider: Ulid) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn expecting(mut self, status: Status) -> Self {
        self.expected = Some(status);
        self
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated { booking: Booking },
    BookingChanged { id: Ulid, change: Change },
    BookingDeleted { id: Ulid },
}

#[cfg(test)]
impl Event {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { booking } => booking.id,
            Event::BookingChanged { id, .. } | Event::BookingDeleted { id } => *id,
        }
    }
}

use ulid::Ulid;

use crate::model::*;

/// Which bookings an actor may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Bookings the customer created.
    OwnBookings(Ulid),
    /// Bookings assigned to the provider, plus the open pool of unclaimed `Pending` ones.
    AssignedOrOpen(Ulid),
    Everything,
    Nothing,
}

impl Visibility {
    pub fn for_actor(actor: &Actor) -> Self {
        match actor.role {
            Role::Customer => Visibility::OwnBookings(actor.id),
            Role::Provider => Visibility::AssignedOrOpen(actor.id),
            Role::Admin => Visibility::Everything,
            Role::System => Visibility::Nothing,
        }
    }

    pub fn allows(&self, booking: &Booking) -> bool {
        match *self {
            Visibility::OwnBookings(id) => booking.customer == id,
            Visibility::AssignedOrOpen(id) => {
                booking.provider == Some(id)
                    || (booking.status == Status::Pending && booking.provider.is_none())
            }
            Visibility::Everything => true,
            Visibility::Nothing => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(customer: Ulid, status: Status, provider: Option<Ulid>) -> Booking {
        let mut b = Booking::new(
            Ulid::new(),
            &Actor::customer(customer),
            BookingDetails {
                service_type: "Cleaning".into(),
                date: "2026-10-22".into(),
                location: None,
            },
            0,
        );
        b.status = status;
        b.provider = provider;
        b
    }

    #[test]
    fn customer_sees_only_own() {
        let me = Ulid::new();
        let v = Visibility::for_actor(&Actor::customer(me));
        assert!(v.allows(&booking(me, Status::Completed, Some(Ulid::new()))));
        assert!(!v.allows(&booking(Ulid::new(), Status::Pending, None)));
    }

    #[test]
    fn provider_sees_assigned_and_open_pool() {
        let me = Ulid::new();
        let other = Ulid::new();
        let v = Visibility::for_actor(&Actor::provider(me));
        assert!(v.allows(&booking(Ulid::new(), Status::Pending, None)));
        assert!(v.allows(&booking(Ulid::new(), Status::Assigned, Some(me))));
        assert!(v.allows(&booking(Ulid::new(), Status::Completed, Some(me))));
        assert!(!v.allows(&booking(Ulid::new(), Status::Assigned, Some(other))));
        assert!(!v.allows(&booking(Ulid::new(), Status::Cancelled, None)));
    }

    #[test]
    fn admin_sees_all_and_system_nothing() {
        let b = booking(Ulid::new(), Status::Cancelled, None);
        assert!(Visibility::for_actor(&Actor::admin(Ulid::new())).allows(&b));
        assert!(!Visibility::for_actor(&Actor::new(Ulid::new(), Role::System)).allows(&b));
    }
}

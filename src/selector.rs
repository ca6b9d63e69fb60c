use crate::{availability::AvailabilitySnapshot, models::BackendId};

/// Fixed priority: primary, then secondary, then nothing.
pub fn select(snapshot: &AvailabilitySnapshot) -> Option<BackendId> {
    BackendId::ALL
        .into_iter()
        .find(|backend| snapshot.state(*backend).is_available())
}

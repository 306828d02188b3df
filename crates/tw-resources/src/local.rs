//! In-process stand-in for a cluster's grouped-placement primitive.

use std::collections::BTreeMap;
use tracing::debug;
use tw_types::{PlacementGroupFactory, ResourceSet};

use crate::manager::ReservationToken;
use crate::placement::PlacementBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Queued,
    Placed { remaining_polls: u32 },
}

#[derive(Debug)]
struct Reservation {
    required: ResourceSet,
    state: ReservationState,
}

/// Single resource pool. A reservation is placed on creation when it fits,
/// otherwise it queues and each poll retries queued reservations in creation
/// order. A placed reservation becomes ready after `placement_delay` polls.
#[derive(Debug)]
pub struct LocalCluster {
    total: ResourceSet,
    available: ResourceSet,
    placement_delay: u32,
    reservations: BTreeMap<ReservationToken, Reservation>,
    next_token: u64,
}

impl LocalCluster {
    pub fn new(total: ResourceSet) -> Self {
        Self {
            available: total.clone(),
            total,
            placement_delay: 0,
            reservations: BTreeMap::new(),
            next_token: 0,
        }
    }

    pub fn with_placement_delay(mut self, polls: u32) -> Self {
        self.placement_delay = polls;
        self
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}

impl PlacementBackend for LocalCluster {
    fn total_resources(&self) -> ResourceSet {
        self.total.clone()
    }

    fn available_resources(&self) -> ResourceSet {
        self.available.clone()
    }

    fn create(&mut self, resources: &PlacementGroupFactory) -> ReservationToken {
        let token = ReservationToken(self.next_token);
        self.next_token += 1;
        let required = resources.required_resources();
        let state = if self.available.contains(&required) {
            self.available.subtract(&required);
            ReservationState::Placed {
                remaining_polls: self.placement_delay,
            }
        } else {
            ReservationState::Queued
        };
        self.reservations.insert(token, Reservation { required, state });
        token
    }

    fn poll(&mut self) {
        for (token, reservation) in self.reservations.iter_mut() {
            match reservation.state {
                ReservationState::Placed { remaining_polls } if remaining_polls > 0 => {
                    reservation.state = ReservationState::Placed {
                        remaining_polls: remaining_polls - 1,
                    };
                }
                ReservationState::Queued if self.available.contains(&reservation.required) => {
                    self.available.subtract(&reservation.required);
                    reservation.state = ReservationState::Placed {
                        remaining_polls: self.placement_delay,
                    };
                    debug!(reservation = token.0, "reservation placed");
                }
                _ => {}
            }
        }
    }

    fn is_ready(&self, token: ReservationToken) -> bool {
        self.reservations.get(&token).is_some_and(|reservation| {
            reservation.state == ReservationState::Placed { remaining_polls: 0 }
        })
    }

    fn remove(&mut self, token: ReservationToken) {
        if let Some(reservation) = self.reservations.remove(&token) {
            if matches!(reservation.state, ReservationState::Placed { .. }) {
                self.available.add(&reservation.required);
            }
        }
    }
}

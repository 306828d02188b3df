//! The resource-manager contract shared by every admission strategy.

use serde::{Deserialize, Serialize};
use std::fmt;
use tw_types::{PlacementGroupFactory, ResourceError, ResourceSet, TwResult};

/// Handle to a staged resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Opaque substrate-level reservation (e.g. a placement group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationToken(pub u64);

/// Resources granted to one trial.
///
/// Deliberately not `Clone`: exactly one owner holds it until it is released.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    request: RequestId,
    resources: PlacementGroupFactory,
    reservation: Option<ReservationToken>,
}

impl Allocation {
    pub(crate) fn new(
        request: RequestId,
        resources: PlacementGroupFactory,
        reservation: Option<ReservationToken>,
    ) -> Self {
        Self {
            request,
            resources,
            reservation,
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn bundles(&self) -> &[ResourceSet] {
        self.resources.bundles()
    }

    pub fn resources(&self) -> ResourceSet {
        self.resources.required_resources()
    }

    pub fn reservation(&self) -> Option<ReservationToken> {
        self.reservation
    }
}

/// Tracks cluster capacity and the staged/committed requests against it.
///
/// Committed totals never exceed [`ResourceManager::total_resources`] for any
/// resource name. Transient unavailability leaves a request staged; only a
/// request that can never fit is rejected.
pub trait ResourceManager: Send {
    fn name(&self) -> &'static str;

    /// Declared cluster capacity.
    fn total_resources(&self) -> &ResourceSet;

    /// Stage a request. Fails with `CapacityExceeded` only when the request
    /// exceeds total capacity.
    fn request(&mut self, resources: &PlacementGroupFactory) -> TwResult<RequestId>;

    /// Let the substrate make progress on staged requests.
    fn update_state(&mut self) {}

    fn is_ready(&self, request: RequestId) -> bool;

    /// Turn a ready request into an allocation. Fails with `NotReady` otherwise.
    fn commit(&mut self, request: RequestId) -> TwResult<Allocation>;

    /// Drop a staged request. Unknown or already cancelled requests are ignored.
    fn cancel(&mut self, request: RequestId);

    /// Return committed resources. Releasing twice is a no-op.
    fn release(&mut self, allocation: &Allocation);

    fn staged_count(&self) -> usize;

    /// Sum of all committed allocations.
    fn committed_resources(&self) -> ResourceSet;

    /// Capacity not held by committed allocations (or substrate reservations).
    fn available_resources(&self) -> ResourceSet {
        let mut available = self.total_resources().clone();
        available.subtract(&self.committed_resources());
        available
    }
}

/// Reject requests that no amount of waiting could satisfy.
pub(crate) fn ensure_feasible(total: &ResourceSet, resources: &PlacementGroupFactory) -> TwResult<()> {
    match total.shortfall(&resources.required_resources()) {
        Some((resource, requested, capacity)) => Err(ResourceError::CapacityExceeded {
            resource,
            requested,
            capacity,
        }
        .into()),
        None => Ok(()),
    }
}

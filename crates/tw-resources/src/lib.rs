//! # tw-resources
//!
//! Resource admission for Tunewell trials. A [`ResourceManager`] stages
//! resource requests, reports when they are ready, commits them into
//! allocations and takes released capacity back. Two strategies ship:
//! [`FixedResourceManager`] (in-process accounting) and
//! [`PlacementGroupResourceManager`] (substrate reservations, here backed by
//! the in-process [`LocalCluster`]).

mod fixed;
mod local;
mod manager;
mod placement;

pub use fixed::FixedResourceManager;
pub use local::LocalCluster;
pub use manager::{Allocation, RequestId, ReservationToken, ResourceManager};
pub use placement::{PlacementBackend, PlacementGroupResourceManager};

use tw_types::{ResourceManagerKind, ResourceSet};

/// Build the configured strategy over the given capacity.
pub fn create_resource_manager(
    kind: ResourceManagerKind,
    total: ResourceSet,
    placement_delay: u32,
) -> Box<dyn ResourceManager> {
    match kind {
        ResourceManagerKind::Fixed => Box::new(FixedResourceManager::new(total)),
        ResourceManagerKind::PlacementGroup => Box::new(PlacementGroupResourceManager::new(
            LocalCluster::new(total).with_placement_delay(placement_delay),
        )),
    }
}

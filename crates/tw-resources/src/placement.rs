//! Reservation of bundles through the substrate's grouped-placement primitive.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use tw_types::{PlacementGroupFactory, ResourceError, ResourceSet, TwResult};

use crate::manager::{ensure_feasible, Allocation, RequestId, ReservationToken, ResourceManager};

/// Grouped-placement primitive of the execution substrate.
///
/// A reservation may take several polls to be placed and become ready;
/// callers only ever observe it through non-blocking queries.
pub trait PlacementBackend: Send {
    fn total_resources(&self) -> ResourceSet;

    /// Capacity not held by any placed reservation.
    fn available_resources(&self) -> ResourceSet;

    fn create(&mut self, resources: &PlacementGroupFactory) -> ReservationToken;

    /// Advance substrate-side placement.
    fn poll(&mut self);

    fn is_ready(&self, token: ReservationToken) -> bool;

    /// Drop a reservation, returning anything it holds. Unknown tokens are ignored.
    fn remove(&mut self, token: ReservationToken);
}

#[derive(Debug)]
struct StagedGroup {
    resources: PlacementGroupFactory,
    token: ReservationToken,
}

/// Strategy backed by substrate reservations; readiness may lag by several steps.
#[derive(Debug)]
pub struct PlacementGroupResourceManager<B: PlacementBackend> {
    backend: B,
    total: ResourceSet,
    staged: BTreeMap<RequestId, StagedGroup>,
    committed: HashMap<RequestId, (ResourceSet, ReservationToken)>,
    next_request: u64,
}

impl<B: PlacementBackend> PlacementGroupResourceManager<B> {
    pub fn new(backend: B) -> Self {
        let total = backend.total_resources();
        info!(total = %total, "placement group resource manager created");
        Self {
            backend,
            total,
            staged: BTreeMap::new(),
            committed: HashMap::new(),
            next_request: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: PlacementBackend> ResourceManager for PlacementGroupResourceManager<B> {
    fn name(&self) -> &'static str {
        "placement_group"
    }

    fn total_resources(&self) -> &ResourceSet {
        &self.total
    }

    fn request(&mut self, resources: &PlacementGroupFactory) -> TwResult<RequestId> {
        ensure_feasible(&self.total, resources)?;
        let id = RequestId::new(self.next_request);
        self.next_request += 1;
        let token = self.backend.create(resources);
        debug!(request = %id, reservation = token.0, resources = %resources, "staged placement group");
        self.staged.insert(
            id,
            StagedGroup {
                resources: resources.clone(),
                token,
            },
        );
        Ok(id)
    }

    fn update_state(&mut self) {
        self.backend.poll();
    }

    fn is_ready(&self, request: RequestId) -> bool {
        self.staged
            .get(&request)
            .is_some_and(|group| self.backend.is_ready(group.token))
    }

    fn commit(&mut self, request: RequestId) -> TwResult<Allocation> {
        let Some(group) = self.staged.get(&request) else {
            return Err(ResourceError::UnknownRequest {
                request: request.as_u64(),
            }
            .into());
        };
        if !self.backend.is_ready(group.token) {
            return Err(ResourceError::NotReady {
                request: request.as_u64(),
            }
            .into());
        }

        let group = self
            .staged
            .remove(&request)
            .ok_or(ResourceError::UnknownRequest {
                request: request.as_u64(),
            })?;
        self.committed
            .insert(request, (group.resources.required_resources(), group.token));
        Ok(Allocation::new(request, group.resources, Some(group.token)))
    }

    fn cancel(&mut self, request: RequestId) {
        match self.staged.remove(&request) {
            Some(group) => self.backend.remove(group.token),
            None => debug!(request = %request, "cancel of unknown request ignored"),
        }
    }

    fn release(&mut self, allocation: &Allocation) {
        match self.committed.remove(&allocation.request()) {
            Some((_, token)) => self.backend.remove(token),
            None => debug!(request = %allocation.request(), "allocation already released"),
        }
    }

    fn staged_count(&self) -> usize {
        self.staged.len()
    }

    fn committed_resources(&self) -> ResourceSet {
        ResourceSet::sum(self.committed.values().map(|(resources, _)| resources))
    }

    fn available_resources(&self) -> ResourceSet {
        self.backend.available_resources()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCluster;
    use tw_types::{TwError, CPU, GPU};

    fn cluster(delay: u32) -> LocalCluster {
        let total = ResourceSet::from_f64_pairs([(CPU, 4.0), (GPU, 2.0)]).unwrap();
        LocalCluster::new(total).with_placement_delay(delay)
    }

    fn two_bundles() -> PlacementGroupFactory {
        PlacementGroupFactory::from_bundles([vec![(CPU, 1.0)], vec![(CPU, 3.0), (GPU, 1.0)]])
            .unwrap()
    }

    #[test]
    fn readiness_follows_substrate_polls() {
        let mut manager = PlacementGroupResourceManager::new(cluster(2));
        let id = manager.request(&two_bundles()).unwrap();
        assert!(!manager.is_ready(id));
        assert!(matches!(
            manager.commit(id),
            Err(TwError::Resource(ResourceError::NotReady { .. }))
        ));

        manager.update_state();
        assert!(!manager.is_ready(id));
        manager.update_state();
        assert!(manager.is_ready(id));

        let allocation = manager.commit(id).unwrap();
        assert_eq!(allocation.bundles().len(), 2);
        assert!(allocation.reservation().is_some());
        assert_eq!(manager.committed_resources(), two_bundles().required_resources());
    }

    #[test]
    fn second_group_waits_for_release() {
        let mut manager = PlacementGroupResourceManager::new(cluster(0));
        let first = manager.request(&two_bundles()).unwrap();
        let second = manager.request(&two_bundles()).unwrap();
        assert!(manager.is_ready(first));
        assert!(!manager.is_ready(second));

        let allocation = manager.commit(first).unwrap();
        manager.update_state();
        assert!(!manager.is_ready(second));

        manager.release(&allocation);
        manager.release(&allocation);
        manager.update_state();
        assert!(manager.is_ready(second));
        assert!(manager.committed_resources().is_empty());
    }

    #[test]
    fn cancel_frees_backlog_and_reservation() {
        let mut manager = PlacementGroupResourceManager::new(cluster(0));
        let id = manager.request(&two_bundles()).unwrap();
        assert!(manager.is_ready(id));
        assert_eq!(manager.staged_count(), 1);

        manager.cancel(id);
        manager.cancel(id);
        assert_eq!(manager.staged_count(), 0);
        assert_eq!(manager.available_resources(), manager.total_resources().clone());
    }

    #[test]
    fn infeasible_group_rejected() {
        let mut manager = PlacementGroupResourceManager::new(cluster(0));
        let too_big = PlacementGroupFactory::from_bundles([vec![(CPU, 2.0)], vec![(CPU, 3.0)]])
            .unwrap();
        assert!(matches!(
            manager.request(&too_big),
            Err(TwError::Resource(ResourceError::CapacityExceeded { .. }))
        ));
        assert_eq!(manager.staged_count(), 0);
    }
}

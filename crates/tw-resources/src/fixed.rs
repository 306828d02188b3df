//! In-process resource accounting against a fixed capacity table.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use tw_types::{PlacementGroupFactory, ResourceError, ResourceSet, TwResult};

use crate::manager::{ensure_feasible, Allocation, RequestId, ResourceManager};

/// Synchronous strategy: a staged request is ready as soon as the uncommitted
/// capacity can hold it.
#[derive(Debug)]
pub struct FixedResourceManager {
    total: ResourceSet,
    committed_total: ResourceSet,
    staged: BTreeMap<RequestId, PlacementGroupFactory>,
    committed: HashMap<RequestId, ResourceSet>,
    next_request: u64,
}

impl FixedResourceManager {
    pub fn new(total: ResourceSet) -> Self {
        Self {
            total,
            committed_total: ResourceSet::new(),
            staged: BTreeMap::new(),
            committed: HashMap::new(),
            next_request: 0,
        }
    }

    fn fits(&self, resources: &PlacementGroupFactory) -> bool {
        self.available_resources()
            .contains(&resources.required_resources())
    }
}

impl ResourceManager for FixedResourceManager {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn total_resources(&self) -> &ResourceSet {
        &self.total
    }

    fn request(&mut self, resources: &PlacementGroupFactory) -> TwResult<RequestId> {
        ensure_feasible(&self.total, resources)?;
        let id = RequestId::new(self.next_request);
        self.next_request += 1;
        self.staged.insert(id, resources.clone());
        debug!(request = %id, resources = %resources, "staged fixed request");
        Ok(id)
    }

    fn is_ready(&self, request: RequestId) -> bool {
        self.staged
            .get(&request)
            .is_some_and(|resources| self.fits(resources))
    }

    fn commit(&mut self, request: RequestId) -> TwResult<Allocation> {
        let Some(resources) = self.staged.get(&request) else {
            return Err(ResourceError::UnknownRequest {
                request: request.as_u64(),
            }
            .into());
        };
        if !self.fits(resources) {
            return Err(ResourceError::NotReady {
                request: request.as_u64(),
            }
            .into());
        }

        let resources = self
            .staged
            .remove(&request)
            .ok_or(ResourceError::UnknownRequest {
                request: request.as_u64(),
            })?;
        let required = resources.required_resources();
        self.committed_total.add(&required);
        self.committed.insert(request, required);
        Ok(Allocation::new(request, resources, None))
    }

    fn cancel(&mut self, request: RequestId) {
        if self.staged.remove(&request).is_none() {
            debug!(request = %request, "cancel of unknown request ignored");
        }
    }

    fn release(&mut self, allocation: &Allocation) {
        match self.committed.remove(&allocation.request()) {
            Some(resources) => self.committed_total.subtract(&resources),
            None => debug!(request = %allocation.request(), "allocation already released"),
        }
    }

    fn staged_count(&self) -> usize {
        self.staged.len()
    }

    fn committed_resources(&self) -> ResourceSet {
        self.committed_total.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::{ResourceAmount, TwError, CPU, GPU};

    fn total() -> ResourceSet {
        ResourceSet::from_f64_pairs([(CPU, 4.0), (GPU, 1.0)]).unwrap()
    }

    fn request(cpu: f64, gpu: f64) -> PlacementGroupFactory {
        PlacementGroupFactory::from_bundles([vec![(CPU, cpu), (GPU, gpu)]]).unwrap()
    }

    #[test]
    fn request_is_ready_when_capacity_exists() {
        let mut manager = FixedResourceManager::new(total());
        let id = manager.request(&request(1.0, 0.5)).unwrap();
        assert!(manager.is_ready(id));
        assert_eq!(manager.staged_count(), 1);

        let allocation = manager.commit(id).unwrap();
        assert_eq!(manager.staged_count(), 0);
        assert_eq!(allocation.resources().get(GPU), ResourceAmount::new(0, 5000));
        assert!(allocation.reservation().is_none());
    }

    #[test]
    fn fractional_requests_pack_until_full() {
        let mut manager = FixedResourceManager::new(total());
        let mut allocations = Vec::new();
        for _ in 0..2 {
            let id = manager.request(&request(1.0, 0.5)).unwrap();
            allocations.push(manager.commit(id).unwrap());
        }

        let third = manager.request(&request(1.0, 0.5)).unwrap();
        assert!(!manager.is_ready(third));
        assert!(matches!(
            manager.commit(third),
            Err(TwError::Resource(ResourceError::NotReady { .. }))
        ));

        manager.release(&allocations[0]);
        assert!(manager.is_ready(third));
        manager.commit(third).unwrap();
    }

    #[test]
    fn infeasible_request_rejected_immediately() {
        let mut manager = FixedResourceManager::new(total());
        let err = manager.request(&request(1.0, 2.0)).unwrap_err();
        assert!(matches!(
            err,
            TwError::Resource(ResourceError::CapacityExceeded { ref resource, .. }) if resource == GPU
        ));

        let custom = PlacementGroupFactory::from_bundles([vec![("a", 1.0)]]).unwrap();
        assert!(manager.request(&custom).is_err());
        assert_eq!(manager.staged_count(), 0);
    }

    #[test]
    fn release_and_cancel_are_idempotent() {
        let mut manager = FixedResourceManager::new(total());
        let id = manager.request(&request(2.0, 1.0)).unwrap();
        let allocation = manager.commit(id).unwrap();

        manager.release(&allocation);
        manager.release(&allocation);
        assert!(manager.committed_resources().is_empty());
        assert_eq!(manager.available_resources(), total());

        let staged = manager.request(&request(1.0, 0.0)).unwrap();
        manager.cancel(staged);
        manager.cancel(staged);
        assert_eq!(manager.staged_count(), 0);
        assert!(manager.commit(staged).is_err());
    }

    #[test]
    fn committed_never_exceeds_total() {
        let mut manager = FixedResourceManager::new(total());
        let mut live = Vec::new();
        for round in 0..20 {
            let id = manager.request(&request(1.0 + (round % 3) as f64, 0.25)).unwrap();
            if manager.is_ready(id) {
                live.push(manager.commit(id).unwrap());
            } else {
                manager.cancel(id);
            }
            if round % 4 == 3 && !live.is_empty() {
                let allocation = live.remove(0);
                manager.release(&allocation);
            }
            assert!(manager.total_resources().contains(&manager.committed_resources()));
        }
    }
}

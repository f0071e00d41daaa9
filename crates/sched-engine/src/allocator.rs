//! Resource allocation: best-fit bin packing and atomic gang placement
//!
//! The allocator selects a node and a stable set of GPUs, then hands the
//! whole composite to the repository's transactional commit. It never writes
//! entities piecemeal, so a crash mid-placement cannot leave dangling GPU
//! bindings.

use chrono::Utc;
use sched_core::{
    Allocation, AllocationId, AllocationRequest, AllocationState, Error, Gpu, JobId, Node, NodeId,
    Placement, Repository, Result,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Places allocation requests onto fleet nodes
pub struct Allocator {
    repo: Arc<dyn Repository>,

    /// When false, GPU availability ignores throttle state and cooling
    thermal_aware: bool,
}

impl Allocator {
    /// Create a new allocator over the given repository
    pub fn new(repo: Arc<dyn Repository>, thermal_aware: bool) -> Self {
        Self {
            repo,
            thermal_aware,
        }
    }

    /// Attempt to allocate resources for a request
    ///
    /// Non-gang requests place on the best-fit node (smallest surplus of
    /// available GPUs, ties broken by node id for determinism). Gang requests
    /// bind the full GPU set on one node or fail without side effects.
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<Placement> {
        debug!(
            job_id = %request.job_id,
            gpus = request.resources.gpu_count,
            gang = request.gang_scheduling,
            "attempting allocation"
        );

        let candidates = self.filter_nodes(request).await?;
        if candidates.is_empty() {
            return Err(Error::insufficient_resources(format!(
                "no schedulable node can hold {} GPUs / {} cores / {} MB",
                request.resources.gpu_count, request.resources.cpu_cores, request.resources.memory_mb
            )));
        }

        if request.gang_scheduling {
            self.gang_allocate(request, &candidates).await
        } else {
            self.best_fit_allocate(request, &candidates).await
        }
    }

    /// Release an allocation and return its resources to the node
    ///
    /// Idempotent: releasing an already-released allocation is a no-op.
    pub async fn free(&self, allocation_id: &AllocationId) -> Result<()> {
        let released = self
            .repo
            .release_allocation(allocation_id, AllocationState::Completed, None)
            .await?;
        info!(
            %allocation_id,
            job_id = %released.job_id,
            "allocation freed"
        );
        Ok(())
    }

    /// Schedulable nodes whose coarse counters, labels, and (anti-)affinity
    /// hints fit the request
    ///
    /// Preferred nodes are sorted to the front; the remainder follows in
    /// node-id order so placement is deterministic.
    async fn filter_nodes(&self, request: &AllocationRequest) -> Result<Vec<Node>> {
        // Affinity pins the candidate set to the peer job's node. A peer
        // without an active allocation leaves the hint advisory and the
        // whole fleet in play.
        let colocate_node = match &request.colocate_with {
            Some(job_id) => self.active_node_of(job_id).await?,
            None => None,
        };

        let mut excluded: HashSet<NodeId> = HashSet::new();
        for job_id in &request.anti_colocate_with {
            if let Some(node_id) = self.active_node_of(job_id).await? {
                excluded.insert(node_id);
            }
        }

        let mut nodes: Vec<Node> = self
            .repo
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.has_capacity(&request.resources))
            .filter(|n| n.matches_labels(&request.required_labels))
            .filter(|n| colocate_node.as_ref().map_or(true, |id| &n.id == id))
            .filter(|n| !excluded.contains(&n.id))
            .collect();

        nodes.sort_by(|a, b| {
            let a_preferred = request.preferred_nodes.contains(&a.id);
            let b_preferred = request.preferred_nodes.contains(&b.id);
            b_preferred
                .cmp(&a_preferred)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(nodes)
    }

    /// Node hosting a job's active allocation, if it has one
    async fn active_node_of(&self, job_id: &JobId) -> Result<Option<NodeId>> {
        Ok(self
            .repo
            .list_allocations_by_job(job_id)
            .await?
            .into_iter()
            .find(|a| a.is_active())
            .map(|a| a.node_id))
    }

    /// GPUs on `node` that pass the availability predicate and model hint,
    /// in stable (index, id) order
    async fn available_gpus(&self, request: &AllocationRequest, node: &Node) -> Result<Vec<Gpu>> {
        let now = Utc::now();
        let mut gpus: Vec<Gpu> = self
            .repo
            .list_gpus_by_node(&node.id)
            .await?
            .into_iter()
            .filter(|g| g.is_available(self.thermal_aware, now))
            .filter(|g| request.gpu_model.map_or(true, |m| g.model == m))
            .collect();
        gpus.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        Ok(gpus)
    }

    /// Best-fit: minimize leftover available GPUs on the chosen node
    async fn best_fit_allocate(
        &self,
        request: &AllocationRequest,
        candidates: &[Node],
    ) -> Result<Placement> {
        let wanted = request.resources.gpu_count as usize;
        let mut best: Option<(usize, &Node, Vec<Gpu>)> = None;

        for node in candidates {
            let gpus = self.available_gpus(request, node).await?;
            if gpus.len() < wanted {
                continue;
            }
            let waste = gpus.len() - wanted;
            // Candidates arrive preferred-first then id-ordered, so a strict
            // improvement test keeps ties on the earlier node.
            if best.as_ref().map_or(true, |(w, _, _)| waste < *w) {
                best = Some((waste, node, gpus));
            }
        }

        let Some((_, node, gpus)) = best else {
            return Err(Error::insufficient_resources(format!(
                "no node with {} available GPUs",
                wanted
            )));
        };

        self.commit(request, node, &gpus[..wanted]).await
    }

    /// Gang: the first node that can hold the entire GPU set wins
    async fn gang_allocate(
        &self,
        request: &AllocationRequest,
        candidates: &[Node],
    ) -> Result<Placement> {
        let wanted = request.resources.gpu_count as usize;

        for node in candidates {
            let gpus = self.available_gpus(request, node).await?;
            if gpus.len() >= wanted {
                return self.commit(request, node, &gpus[..wanted]).await;
            }
        }

        Err(Error::gang_impossible(format!(
            "no single node can hold a gang of {} GPUs",
            wanted
        )))
    }

    /// Build the allocation and run the repository's atomic commit
    async fn commit(
        &self,
        request: &AllocationRequest,
        node: &Node,
        gpus: &[Gpu],
    ) -> Result<Placement> {
        let allocation = Allocation::new(
            request.job_id.clone(),
            request.tenant_id.clone(),
            node.id.clone(),
            gpus.iter().map(|g| g.id.clone()).collect(),
            request.resources.cpu_cores,
            request.resources.memory_mb,
        );

        let committed = self.repo.commit_allocation(&allocation).await?;

        info!(
            allocation_id = %committed.id,
            job_id = %request.job_id,
            node_id = %node.id,
            gpus = committed.gpu_ids.len(),
            "allocation created"
        );

        Ok(Placement {
            allocation_id: committed.id,
            node_id: committed.node_id,
            gpu_ids: committed.gpu_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sched_core::{GpuId, GpuModel, JobId, NodeId, ResourceRequest, TenantId};
    use sched_store::MemoryRepository;

    async fn add_node(repo: &MemoryRepository, id: &str, gpus: u32) {
        let node = Node::new(id, format!("{id}.fleet:7070"), gpus, 64, 512_000);
        repo.create_node(&node).await.unwrap();
        for i in 0..gpus {
            let gpu = Gpu::new(format!("{id}-gpu-{i}"), id, i, GpuModel::A100, 80_000);
            repo.create_gpu(&gpu).await.unwrap();
        }
    }

    fn request(gpus: u32) -> AllocationRequest {
        AllocationRequest {
            job_id: JobId::generate(),
            tenant_id: TenantId::new("tenant-1"),
            resources: ResourceRequest::new(gpus, 16_000, 4, 16_000),
            gang_scheduling: false,
            preferred_nodes: Vec::new(),
            required_labels: Default::default(),
            colocate_with: None,
            anti_colocate_with: Vec::new(),
            gpu_model: None,
        }
    }

    #[tokio::test]
    async fn test_no_nodes_is_insufficient_resources() {
        let repo = Arc::new(MemoryRepository::new());
        let allocator = Allocator::new(repo, true);

        let err = allocator.allocate(&request(1)).await.unwrap_err();
        assert!(err.is_resource_error());
    }

    #[tokio::test]
    async fn test_best_fit_prefers_smallest_surplus() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-big", 8).await;
        add_node(&repo, "node-snug", 2).await;
        let allocator = Allocator::new(repo.clone(), true);

        let placement = allocator.allocate(&request(2)).await.unwrap();
        // node-snug leaves zero spare GPUs and wins over node-big.
        assert_eq!(placement.node_id, NodeId::new("node-snug"));
        assert_eq!(placement.gpu_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_best_fit_tie_breaks_by_node_id() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-b", 4).await;
        add_node(&repo, "node-a", 4).await;
        let allocator = Allocator::new(repo, true);

        let placement = allocator.allocate(&request(2)).await.unwrap();
        assert_eq!(placement.node_id, NodeId::new("node-a"));
    }

    #[tokio::test]
    async fn test_gpus_selected_in_stable_index_order() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        let allocator = Allocator::new(repo, true);

        let placement = allocator.allocate(&request(2)).await.unwrap();
        assert_eq!(
            placement.gpu_ids,
            vec![GpuId::new("node-a-gpu-0"), GpuId::new("node-a-gpu-1")]
        );
    }

    #[tokio::test]
    async fn test_gang_requires_single_node() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 2).await;
        add_node(&repo, "node-b", 2).await;
        let allocator = Allocator::new(repo, true);

        // Four GPUs exist in the fleet but no single node has them.
        let mut req = request(4);
        req.gang_scheduling = true;
        // Coarse node filter already rejects both nodes.
        let err = allocator.allocate(&req).await.unwrap_err();
        assert!(err.is_resource_error());
    }

    #[tokio::test]
    async fn test_gang_binds_whole_set_or_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;

        // One GPU is sick, so only 3 of 4 pass the availability predicate
        // while the node's coarse counter still says 4.
        let mut sick = repo.get_gpu(&GpuId::new("node-a-gpu-3")).await.unwrap();
        sick.update_telemetry(0.0, 90.0, 100.0);
        repo.update_gpu(&sick).await.unwrap();

        let allocator = Allocator::new(repo.clone(), true);
        let mut req = request(4);
        req.gang_scheduling = true;

        let err = allocator.allocate(&req).await.unwrap_err();
        assert!(matches!(err, Error::GangImpossible(_)));

        // Nothing was bound.
        for gpu in repo.list_gpus().await.unwrap() {
            assert!(!gpu.is_allocated());
        }
    }

    #[tokio::test]
    async fn test_gang_success_on_one_node() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        let allocator = Allocator::new(repo.clone(), true);

        let mut req = request(4);
        req.gang_scheduling = true;

        let placement = allocator.allocate(&req).await.unwrap();
        assert_eq!(placement.gpu_ids.len(), 4);

        let node = repo.get_node(&NodeId::new("node-a")).await.unwrap();
        assert_eq!(node.available_gpus, 0);
    }

    #[tokio::test]
    async fn test_gpu_exclusivity_across_allocations() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        let allocator = Allocator::new(repo.clone(), true);

        let first = allocator.allocate(&request(2)).await.unwrap();
        let second = allocator.allocate(&request(2)).await.unwrap();

        // Each GPU is bound to at most one active allocation.
        for id in &first.gpu_ids {
            assert!(!second.gpu_ids.contains(id));
        }
        let err = allocator.allocate(&request(1)).await.unwrap_err();
        assert!(err.is_resource_error());
    }

    #[tokio::test]
    async fn test_thermal_filtering_toggle() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 1).await;

        let mut hot = repo.get_gpu(&GpuId::new("node-a-gpu-0")).await.unwrap();
        hot.thermal_throttle = true;
        repo.update_gpu(&hot).await.unwrap();

        let aware = Allocator::new(repo.clone(), true);
        assert!(aware.allocate(&request(1)).await.is_err());

        let blind = Allocator::new(repo, false);
        assert!(blind.allocate(&request(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_required_labels_filter_nodes() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        let mut labeled = repo.get_node(&NodeId::new("node-a")).await.unwrap();
        labeled.labels.insert("zone".into(), "us-east".into());
        repo.update_node(&labeled).await.unwrap();

        let allocator = Allocator::new(repo, true);

        let ok = request(1).with_required_label("zone", "us-east");
        assert!(allocator.allocate(&ok).await.is_ok());

        let miss = request(1).with_required_label("zone", "eu-west");
        assert!(allocator.allocate(&miss).await.is_err());
    }

    #[tokio::test]
    async fn test_preferred_nodes_win_ties() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        add_node(&repo, "node-b", 4).await;
        let allocator = Allocator::new(repo, true);

        let req = request(2).with_preferred_nodes(vec![NodeId::new("node-b")]);
        let placement = allocator.allocate(&req).await.unwrap();
        assert_eq!(placement.node_id, NodeId::new("node-b"));
    }

    #[tokio::test]
    async fn test_colocation_pins_to_peer_node() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        add_node(&repo, "node-b", 2).await;
        let allocator = Allocator::new(repo.clone(), true);

        // Without the hint, best-fit would pick the snugger node-b.
        let peer = request(1);
        let peer_placement = allocator.allocate(&peer).await.unwrap();
        assert_eq!(peer_placement.node_id, NodeId::new("node-b"));

        let req = request(1).with_colocate_with(peer.job_id.clone());
        let placement = allocator.allocate(&req).await.unwrap();
        assert_eq!(placement.node_id, NodeId::new("node-b"));

        // A peer with no active allocation leaves the hint advisory.
        let req = request(1).with_colocate_with(JobId::new("job-ghost"));
        assert!(allocator.allocate(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_anti_colocation_excludes_peer_nodes() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 4).await;
        add_node(&repo, "node-b", 4).await;
        let allocator = Allocator::new(repo.clone(), true);

        let rival = request(1);
        let rival_placement = allocator.allocate(&rival).await.unwrap();
        assert_eq!(rival_placement.node_id, NodeId::new("node-a"));

        let req = request(1).with_anti_colocate_with(vec![rival.job_id.clone()]);
        let placement = allocator.allocate(&req).await.unwrap();
        assert_eq!(placement.node_id, NodeId::new("node-b"));

        // Excluding every hosting node leaves nothing to place on.
        let other = request(1).with_anti_colocate_with(vec![rival.job_id.clone()]);
        let other_placement = allocator.allocate(&other).await.unwrap();
        assert_eq!(other_placement.node_id, NodeId::new("node-b"));

        let boxed_out = request(1)
            .with_anti_colocate_with(vec![rival.job_id.clone(), other.job_id.clone()]);
        let err = allocator.allocate(&boxed_out).await.unwrap_err();
        assert!(err.is_resource_error());
    }

    #[tokio::test]
    async fn test_gpu_model_hint() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 2).await;

        let mut v100 = repo.get_gpu(&GpuId::new("node-a-gpu-1")).await.unwrap();
        v100.model = GpuModel::V100;
        repo.update_gpu(&v100).await.unwrap();

        let allocator = Allocator::new(repo, true);

        let req = request(1).with_gpu_model(GpuModel::V100);
        let placement = allocator.allocate(&req).await.unwrap();
        assert_eq!(placement.gpu_ids, vec![GpuId::new("node-a-gpu-1")]);

        let req = request(2).with_gpu_model(GpuModel::V100);
        assert!(allocator.allocate(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_free_returns_resources() {
        let repo = Arc::new(MemoryRepository::new());
        add_node(&repo, "node-a", 2).await;
        let allocator = Allocator::new(repo.clone(), true);

        let placement = allocator.allocate(&request(2)).await.unwrap();
        allocator.free(&placement.allocation_id).await.unwrap();

        let node = repo.get_node(&NodeId::new("node-a")).await.unwrap();
        assert_eq!(node.available_gpus, 2);
        // Idempotent second free.
        allocator.free(&placement.allocation_id).await.unwrap();
        assert_eq!(
            repo.get_node(&NodeId::new("node-a")).await.unwrap().available_gpus,
            2
        );
    }
}

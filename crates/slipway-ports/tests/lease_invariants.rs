//! Lease pool invariants under arbitrary and concurrent operation sequences.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use slipway_core::ProjectId;
use slipway_ports::{HealthProbe, PortLeaseRegistry};

struct NeverHealthy;

#[async_trait::async_trait]
impl HealthProbe for NeverHealthy {
    async fn probe(&self, _host: &str, _port: u16) -> bool {
        false
    }
}

fn registry(size: u16) -> PortLeaseRegistry {
    PortLeaseRegistry::new(4000..=4000 + size - 1, "127.0.0.1", Arc::new(NeverHealthy))
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    ReleaseProject(usize),
    ReleasePort(u16),
}

fn op_strategy(projects: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..projects).prop_map(Op::Allocate),
        (0..projects).prop_map(Op::ReleaseProject),
        (3990u16..4030).prop_map(Op::ReleasePort),
    ]
}

proptest! {
    #[test]
    fn free_plus_leased_equals_pool_size(
        size in 1u16..20,
        ops in prop::collection::vec(op_strategy(30), 0..200),
    ) {
        let registry = registry(size);
        let projects: Vec<ProjectId> = (0..30).map(|_| ProjectId::new()).collect();

        for op in ops {
            match op {
                Op::Allocate(i) => {
                    let before = registry.lease_for(projects[i]);
                    match registry.allocate(projects[i]) {
                        Ok(lease) => {
                            if let Some(prev) = before {
                                prop_assert_eq!(prev, lease);
                            }
                        }
                        Err(_) => prop_assert_eq!(registry.stats().free, 0),
                    }
                }
                Op::ReleaseProject(i) => {
                    if let Some(lease) = registry.lease_for(projects[i]) {
                        prop_assert!(registry.release_lease(&lease));
                    }
                }
                Op::ReleasePort(port) => {
                    registry.release(port);
                }
            }

            let stats = registry.stats();
            prop_assert_eq!(stats.free + stats.leased, usize::from(size));
            prop_assert_eq!(stats.size, usize::from(size));
        }
    }

    #[test]
    fn double_allocate_consumes_one_port(size in 2u16..50) {
        let registry = registry(size);
        let project = ProjectId::new();

        let a = registry.allocate(project).unwrap();
        let b = registry.allocate(project).unwrap();

        prop_assert_eq!(a.port, b.port);
        prop_assert_eq!(registry.stats().free, usize::from(size) - 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_share_a_port() {
    let registry = Arc::new(registry(64));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.allocate(ProjectId::new()).ok().map(|l| l.port)
        }));
    }

    let mut ports = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Some(port) => assert!(ports.insert(port), "port {port} leased twice"),
            None => exhausted += 1,
        }
    }

    assert_eq!(ports.len(), 64);
    assert_eq!(exhausted, 36);
    assert_eq!(registry.stats().free, 0);
}

//! Placement and discovery against live worker daemons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use galileo::Runtime;
use galileo::controller::ClusterController;
use galileo::runtime::{RouterType, RuntimeConfig};
use galileo::substrate::{InMemorySubstrate, Substrate};
use galileo::worker::api::{ClientConfig, ClientDescription};
use galileo::worker::{WorkerDaemon, WorkerState};
use tokio_util::sync::CancellationToken;

struct Fleet {
    daemons: Vec<WorkerDaemon>,
    shutdown: CancellationToken,
    runners: Vec<tokio::task::JoinHandle<()>>,
}

async fn start_fleet(substrate: Arc<InMemorySubstrate>, names: &[&str]) -> Fleet {
    let shutdown = CancellationToken::new();
    let mut daemons = Vec::new();
    let mut runners = Vec::new();

    for name in names {
        let runtime = Arc::new(Runtime::with_substrate(
            RuntimeConfig {
                worker_name: name.to_string(),
                // Debug routing keeps placement tests off the network
                router_type: RouterType::DebugRouter,
                ..Default::default()
            },
            substrate.clone(),
        ));
        let daemon = WorkerDaemon::new(runtime.worker_context().await.unwrap());
        runners.push(tokio::spawn({
            let daemon = daemon.clone();
            let shutdown = shutdown.clone();
            async move {
                daemon.run(shutdown).await.unwrap();
            }
        }));
        daemons.push(daemon);
    }

    for daemon in &daemons {
        let mut states = daemon.state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *states.borrow() != WorkerState::Running {
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("worker did not come up");
    }

    Fleet {
        daemons,
        shutdown,
        runners,
    }
}

impl Fleet {
    async fn stop(self) {
        self.shutdown.cancel();
        for runner in self.runners {
            runner.await.unwrap();
        }
    }
}

fn fake_client(worker: &str, seq: usize) -> ClientDescription {
    ClientDescription {
        client_id: format!("{worker}:preload:{seq}"),
        worker: worker.to_string(),
        config: ClientConfig::new("preload"),
    }
}

#[test_log::test(tokio::test)]
async fn ping_returns_each_live_worker_once() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let fleet = start_fleet(substrate.clone(), &["a", "b", "c"]).await;

    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate);
    let cluster = runtime.cluster();

    let mut names = cluster.ping().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);

    fleet.stop().await;
}

#[test_log::test(tokio::test)]
async fn placement_packs_onto_least_loaded_workers() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let fleet = start_fleet(substrate.clone(), &["a", "b", "c"]).await;

    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate);
    let cluster = runtime.cluster();

    // Skewed current loads: a=5, b=2, c=1
    for (worker, count) in [("a", 5), ("b", 2), ("c", 1)] {
        for seq in 0..count {
            cluster
                .register_client(&fake_client(worker, seq))
                .await
                .unwrap();
        }
    }

    let created = cluster
        .create_clients(&ClientConfig::new("myservice"), 5)
        .await
        .unwrap();
    assert_eq!(created.len(), 5);

    let mut per_worker: HashMap<String, usize> = HashMap::new();
    for description in &created {
        *per_worker.entry(description.worker.clone()).or_default() += 1;
    }
    assert_eq!(per_worker.get("a"), None);
    assert_eq!(per_worker.get("b"), Some(&2));
    assert_eq!(per_worker.get("c"), Some(&3));

    // Every created client is registered under its worker
    for description in &created {
        let loaded = cluster
            .get_client_description(&description.client_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&loaded, description);
    }

    fleet.stop().await;
}

#[test_log::test(tokio::test)]
async fn discover_resets_membership_and_workers_reregister() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let fleet = start_fleet(substrate.clone(), &["a", "b"]).await;

    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate.clone());
    let cluster = runtime.cluster();

    // A stale worker that no longer answers
    cluster
        .register_worker("ghost", &HashMap::new())
        .await
        .unwrap();
    cluster.register_client(&fake_client("ghost", 0)).await.unwrap();

    cluster.discover().await.unwrap();

    // Live workers re-register on the broadcast; the ghost stays gone
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut workers = cluster.list_workers(None).await.unwrap();
            workers.sort();
            if workers == vec!["a", "b"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("live workers did not re-register");

    let stale = substrate
        .smembers("galileo:worker:ghost:clients")
        .await
        .unwrap();
    assert!(stale.is_empty());

    fleet.stop().await;
}

#[test_log::test(tokio::test)]
async fn closed_clients_leave_the_registry() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let fleet = start_fleet(substrate.clone(), &["solo"]).await;

    let runtime = Runtime::with_substrate(RuntimeConfig::default(), substrate);
    let cluster = runtime.cluster();

    let created = cluster
        .create_clients(&ClientConfig::new("svc"), 2)
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(cluster.list_clients(None).await.unwrap().len(), 2);

    cluster.close_client(&created[0].client_id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while cluster.list_clients(None).await.unwrap().len() != 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client was not unregistered");

    assert_eq!(fleet.daemons[0].clients().len(), 1);

    fleet.stop().await;
}

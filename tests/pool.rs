mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Fixture, state_of};
use serde_json::json;
use workermaster::wm::error::WmError;
use workermaster::wm::ports::is_port_free;
use workermaster::wm::reclaim::NoopReclaimer;
use workermaster::wm::supervisor::Supervisor;
use workermaster::wm::wire::{self, ExchangeTimeouts};

fn supervisor(fx: &Fixture) -> Supervisor {
    Supervisor::new(&fx.cfg, Arc::new(NoopReclaimer)).unwrap()
}

fn probe() -> ExchangeTimeouts {
    ExchangeTimeouts {
        connect: Duration::from_secs(1),
        io: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_same_target_reuses_worker() {
    let fx = Fixture::new(2, &[]);
    let sup = supervisor(&fx);
    let a = fx.target("a.exe");

    let first = sup.ensure_worker(&a).await.unwrap();
    let second = sup.ensure_worker(&a).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.launches(), 1);
    assert_eq!(sup.snapshot().workers.len(), 1);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_distinct_targets_get_distinct_ports() {
    let fx = Fixture::new(3, &[]);
    let sup = supervisor(&fx);
    let (first, last) = fx.range();

    let mut ports = HashSet::new();
    for name in ["a.exe", "b.exe", "c.exe"] {
        let info = sup.ensure_worker(&fx.target(name)).await.unwrap();
        assert!((first..=last).contains(&info.port));
        ports.insert(info.port);
    }
    assert_eq!(ports.len(), 3);

    let snap = sup.snapshot();
    assert_eq!(snap.workers.len(), 3);
    let targets: HashSet<_> = snap.workers.iter().map(|w| w.binary_path.clone()).collect();
    assert_eq!(targets.len(), 3);
    assert!(snap.reserved.is_empty());

    sup.stop_all().await;
    assert!(sup.snapshot().workers.is_empty());
}

#[tokio::test]
async fn test_fresh_worker_answers_hello() {
    let fx = Fixture::new(1, &[]);
    let sup = supervisor(&fx);
    let info = sup.ensure_worker(&fx.target("a.exe")).await.unwrap();

    let resp = wire::exchange("127.0.0.1", info.port, &json!({"action": "hello"}), probe())
        .await
        .unwrap();
    assert_eq!(resp, json!({"success": true, "message": "hi"}));

    sup.stop_all().await;
}

#[tokio::test]
async fn test_third_target_evicts_least_recently_used() {
    let fx = Fixture::new(2, &[]);
    let sup = supervisor(&fx);
    let (first, last) = fx.range();
    let (a, b, c) = (fx.target("A"), fx.target("B"), fx.target("C"));

    let wa = sup.ensure_worker(&a).await.unwrap();
    assert_eq!(wa.port, first);
    let wb = sup.ensure_worker(&b).await.unwrap();
    assert_eq!(wb.port, last);

    let wc = sup.ensure_worker(&c).await.unwrap();
    // A was the oldest; its port is the one that came free.
    assert_eq!(wc.port, wa.port);

    let snap = sup.snapshot();
    let targets: HashSet<_> = snap
        .workers
        .iter()
        .filter_map(|w| w.binary_path.clone())
        .collect();
    assert_eq!(targets, HashSet::from([b.clone(), c.clone()]));
    assert!(!common::pid_alive(wa.pid));

    sup.stop_all().await;
}

#[tokio::test]
async fn test_touching_a_worker_protects_it_from_eviction() {
    let fx = Fixture::new(2, &[]);
    let sup = supervisor(&fx);
    let (a, b, c) = (fx.target("A"), fx.target("B"), fx.target("C"));

    sup.ensure_worker(&a).await.unwrap();
    let wb = sup.ensure_worker(&b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    sup.ensure_worker(&a).await.unwrap();

    sup.ensure_worker(&c).await.unwrap();
    let targets: HashSet<_> = sup
        .snapshot()
        .workers
        .iter()
        .filter_map(|w| w.binary_path.clone())
        .collect();
    assert_eq!(targets, HashSet::from([a.clone(), c.clone()]));
    assert!(!common::pid_alive(wb.pid));

    sup.stop_all().await;
}

#[tokio::test]
async fn test_foreign_listener_below_capacity_rejects_instead_of_evicting() {
    let fx = Fixture::new(2, &[]);
    let sup = supervisor(&fx);
    let (first, last) = fx.range();
    let _foreign = std::net::TcpListener::bind(("127.0.0.1", last)).unwrap();
    let (a, b) = (fx.target("A"), fx.target("B"));

    let wa = sup.ensure_worker(&a).await.unwrap();
    assert_eq!(wa.port, first);

    let err = sup.ensure_worker(&b).await.unwrap_err();
    assert!(matches!(err, WmError::PortExhausted { .. }), "{err}");

    // A is untouched and still serving.
    assert!(common::pid_alive(wa.pid));
    let snap = sup.snapshot();
    assert_eq!(snap.workers.len(), 1);
    assert_eq!(snap.workers[0].binary_path.as_ref(), Some(&a));
    assert!(snap.reserved.is_empty());
    assert_eq!(fx.launches(), 1);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_evict_lru_frees_port_before_reuse() {
    let fx = Fixture::new(1, &[]);
    let sup = supervisor(&fx);
    let info = sup.ensure_worker(&fx.target("a.exe")).await.unwrap();
    assert!(!is_port_free("127.0.0.1", info.port));

    assert_eq!(sup.evict_lru().await, Some(info.port));
    assert!(sup.snapshot().workers.is_empty());
    assert!(is_port_free("127.0.0.1", info.port));
}

#[tokio::test]
async fn test_corrupted_state_is_quarantined_and_retried_once() {
    let fx = Fixture::new(1, &["--fail-if-state-exists"]);
    let sup = supervisor(&fx);
    let target = fx.target("x.exe");
    let state = state_of(&target);
    std::fs::write(&state, b"broken database").unwrap();

    let info = sup.ensure_worker(&target).await.unwrap();
    assert_eq!(fx.launches(), 2);
    assert!(!state.exists());
    let bak = std::path::PathBuf::from(format!("{}.bak", state.display()));
    assert_eq!(std::fs::read(&bak).unwrap(), b"broken database");
    assert_eq!(sup.snapshot().workers.len(), 1);
    assert!(wire::hello("127.0.0.1", info.port, probe()).await);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_failed_retry_is_not_retried_again() {
    let mut fx = Fixture::new(1, &["--never-ready"]);
    fx.cfg.timeouts.startup = Duration::from_millis(800);
    let sup = supervisor(&fx);
    let target = fx.target("y.exe");
    std::fs::write(state_of(&target), b"db").unwrap();

    let err = sup.ensure_worker(&target).await.unwrap_err();
    match err {
        WmError::WorkerStartupTimeout { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fx.launches(), 2);
    let snap = sup.snapshot();
    assert!(snap.workers.is_empty());
    assert!(snap.reserved.is_empty());
}

#[tokio::test]
async fn test_startup_timeout_without_state_has_single_attempt() {
    let mut fx = Fixture::new(1, &["--never-ready"]);
    fx.cfg.timeouts.startup = Duration::from_millis(500);
    let sup = supervisor(&fx);
    let target = fx.target("z.exe");

    let err = sup.ensure_worker(&target).await.unwrap_err();
    assert!(matches!(err, WmError::WorkerStartupTimeout { attempts: 1, .. }));
    assert_eq!(fx.launches(), 1);
    assert!(sup.snapshot().reserved.is_empty());
}

#[tokio::test]
async fn test_only_state_artifact_is_enough_to_start() {
    let fx = Fixture::new(1, &[]);
    let sup = supervisor(&fx);
    let target = fx.dir.path().join("gone.exe");
    std::fs::write(state_of(&target), b"db").unwrap();

    let info = sup.ensure_worker(&target).await.unwrap();
    assert_eq!(info.binary_path, target);
    sup.stop_all().await;
}

#[tokio::test]
async fn test_stubborn_worker_is_killed_and_port_released() {
    let fx = Fixture::new(1, &["--ignore-stop", "--ignore-sigterm"]);
    let sup = supervisor(&fx);
    let info = sup.ensure_worker(&fx.target("a.exe")).await.unwrap();

    let started = Instant::now();
    sup.terminate_worker(info.port).await.unwrap();
    let t = &fx.cfg.timeouts;
    // stop_server was ignored, then SIGTERM was ignored.
    assert!(started.elapsed() >= t.stop_grace + t.term_wait);
    assert!(!common::pid_alive(info.pid));
    assert!(is_port_free("127.0.0.1", info.port));
    assert!(sup.snapshot().workers.is_empty());
}

#[tokio::test]
async fn test_cooperative_worker_exits_on_stop_server() {
    let fx = Fixture::new(1, &[]);
    let sup = supervisor(&fx);
    let info = sup.ensure_worker(&fx.target("a.exe")).await.unwrap();

    let started = Instant::now();
    sup.terminate_worker(info.port).await.unwrap();
    assert!(started.elapsed() < fx.cfg.timeouts.stop_grace + fx.cfg.timeouts.term_wait);
    assert!(!common::pid_alive(info.pid));
}

#[tokio::test]
async fn test_dead_worker_is_replaced() {
    let fx = Fixture::new(1, &[]);
    let sup = supervisor(&fx);
    let target = fx.target("a.exe");
    let first = sup.ensure_worker(&target).await.unwrap();

    common::sigkill(first.pid);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = sup.ensure_worker(&target).await.unwrap();
    assert_ne!(first.pid, second.pid);
    assert_eq!(fx.launches(), 2);
    assert_eq!(sup.snapshot().workers.len(), 1);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_concurrent_requests_for_one_target_leave_one_worker() {
    let fx = Fixture::new(2, &["--ready-delay-ms", "200"]);
    let sup = Arc::new(supervisor(&fx));
    let target = fx.target("race.exe");

    let (s1, s2) = (Arc::clone(&sup), Arc::clone(&sup));
    let (t1, t2) = (target.clone(), target.clone());
    let h1 = tokio::spawn(async move { s1.ensure_worker(&t1).await });
    let h2 = tokio::spawn(async move { s2.ensure_worker(&t2).await });
    let r1 = h1.await.unwrap().unwrap();
    let r2 = h2.await.unwrap().unwrap();

    assert_eq!(r1, r2);
    let snap = sup.snapshot();
    assert_eq!(snap.workers.len(), 1);
    assert!(snap.reserved.is_empty());

    sup.stop_all().await;
}

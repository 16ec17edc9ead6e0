//! Multi-pod simulations.
//!
//! Several pod agents share one in-memory store and one manual clock, and
//! the tests drive their ticks by hand. No timers or network involved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use signalpool_autoscale::PublishOutcome;
use signalpool_core::PoolConfig;
use signalpool_state::*;
use signalpoold::PodAgent;

fn pool_config() -> PoolConfig {
    PoolConfig {
        heartbeat_interval_s: 5,
        heartbeat_ttl_s: 30,
        sampling_interval_s: 5,
        queue_capacity_per_pod: 100,
        debounce_window_s: 10,
        min_pods: 1,
        max_pods: 20,
        ..PoolConfig::default()
    }
}

fn spawn_pool(n: usize, store: &SharedStore, clock: &ManualClock) -> Vec<PodAgent> {
    (0..n).map(|i| pod(i, store, clock)).collect()
}

fn pod(i: usize, store: &SharedStore, clock: &ManualClock) -> PodAgent {
    PodAgent::new(
        format!("pricer-{i}"),
        pool_config(),
        store.clone(),
        Arc::new(clock.clone()),
    )
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("SPX-2026-{i:05}")).collect()
}

fn owners(agent: &PodAgent, keys: &[String]) -> BTreeMap<String, String> {
    keys.iter()
        .map(|k| (k.clone(), agent.assign(k).unwrap()))
        .collect()
}

async fn start_all(pool: &[PodAgent]) {
    for agent in pool {
        agent.start().await.unwrap();
    }
    for agent in pool {
        agent.failover_tick().await.unwrap();
    }
}

// ── End to end ─────────────────────────────────────────────────

#[tokio::test]
async fn overload_scales_up_once_and_new_pod_takes_a_fair_share() {
    let clock = ManualClock::new(1_700_000_000_000);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let mut pool = spawn_pool(4, &store, &clock);
    start_all(&pool).await;

    for agent in &pool {
        assert_eq!(agent.router().members().len(), 4);
    }

    // Every pod computes the same owner for every key.
    let work = keys(1_000);
    let before = owners(&pool[0], &work);
    for agent in &pool[1..] {
        assert_eq!(owners(agent, &work), before);
    }

    // Three of four pods run well over capacity.
    for (i, agent) in pool.iter().enumerate() {
        let depth = if i < 3 { 200 } else { 20 };
        for _ in 0..depth {
            agent.gauge().enqueue();
        }
    }

    let mut published = Vec::new();
    for _tick in 0..3 {
        for agent in &pool {
            agent.sample_tick().await.unwrap();
            agent.heartbeat_tick().await.unwrap();
        }
        for agent in &pool {
            match agent.evaluation_tick().await.unwrap() {
                PublishOutcome::Published(d) => published.push(d),
                PublishOutcome::Hold
                | PublishOutcome::LockDenied
                | PublishOutcome::Debounced { .. } => {}
            }
        }
        clock.advance(Duration::from_secs(5));
    }

    assert_eq!(published.len(), 1, "exactly one decision per debounce window");
    let decision = &published[0];
    assert_eq!(decision.direction, ScaleDirection::Up);
    assert_eq!(decision.active_pods, 4);
    assert_eq!(decision.metrics_snapshot.total_queue_size, 620);

    let stored = pool[3].coordinator().latest_decision().await.unwrap().unwrap();
    assert_eq!(&stored, decision);

    // The orchestrator adds a fifth pod.
    pool.push(pod(4, &store, &clock));
    pool[4].start().await.unwrap();
    for agent in &pool {
        agent.heartbeat_tick().await.unwrap();
    }
    for agent in &pool {
        let report = agent.failover_tick().await.unwrap();
        assert_eq!(agent.router().members().len(), 5, "{report:?}");
    }

    let after = owners(&pool[2], &work);
    for agent in &pool {
        assert_eq!(owners(agent, &work), after);
    }

    let moved: Vec<_> = work.iter().filter(|k| before[*k] != after[*k]).collect();
    for key in &moved {
        assert_eq!(after[*key], "pricer-4", "{key} moved between surviving pods");
    }
    let fraction = moved.len() as f64 / work.len() as f64;
    assert!(
        (0.15..=0.25).contains(&fraction),
        "moved fraction was {fraction}"
    );
}

// ── Failover ───────────────────────────────────────────────────

#[tokio::test]
async fn silent_pod_goes_stale_and_loses_its_keys() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(3, &store, &clock);
    start_all(&pool).await;

    let work = keys(1_000);
    let before = owners(&pool[0], &work);
    assert!(before.values().any(|owner| owner == "pricer-2"));

    // pricer-2 stops heartbeating; the others keep going.
    clock.set(25_000);
    pool[0].heartbeat_tick().await.unwrap();
    pool[1].heartbeat_tick().await.unwrap();
    clock.set(31_000);

    let report = pool[0].failover_tick().await.unwrap();
    assert_eq!(report.stale, vec!["pricer-2"]);
    assert!(report.ring_changed);

    let after = owners(&pool[0], &work);
    for key in &work {
        assert_ne!(after[key], "pricer-2");
        if before[key] != "pricer-2" {
            assert_eq!(after[key], before[key], "{key} moved off a live pod");
        }
    }
}

#[tokio::test]
async fn draining_pod_stops_receiving_work_then_departs() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(3, &store, &clock);
    start_all(&pool).await;

    pool[1].registry().mark_draining("pricer-1").await.unwrap();
    pool[0].failover_tick().await.unwrap();
    assert_eq!(pool[0].router().members(), vec!["pricer-0", "pricer-2"]);
    let ring = pool[0].router().ring();
    assert!(keys(500).iter().all(|k| !ring.is_owned_by(k, "pricer-1")));

    pool[1].leave().await;
    let report = pool[0].failover_tick().await.unwrap();
    assert_eq!(report.departed, vec!["pricer-1"]);
    assert!(pool[0].registry().list_all().await.unwrap().iter().all(|r| r.pod_id != "pricer-1"));
}

// ── Degradation ────────────────────────────────────────────────

#[tokio::test]
async fn failing_store_keeps_routing_from_cached_ring() {
    let clock = ManualClock::new(0);
    let faulty = Arc::new(FaultyStore::new(MemoryStore::with_clock(Arc::new(
        clock.clone(),
    ))));
    let store: SharedStore = faulty.clone();
    let pool = spawn_pool(3, &store, &clock);
    start_all(&pool).await;

    let work = keys(1_000);
    let before = owners(&pool[1], &work);

    faulty.set_failing(true);
    assert!(pool[1].failover_tick().await.is_err());
    assert!(!pool[1].router().refresh().await);
    assert!(pool[1].heartbeat_tick().await.unwrap_err().is_transient());
    assert!(pool[1].evaluation_tick().await.is_err());

    assert_eq!(owners(&pool[1], &work), before);
    assert!(pool[1].registry().last_known_good().await.is_some());

    // Recovery needs no intervention.
    faulty.set_failing(false);
    assert!(pool[1].heartbeat_tick().await.is_ok());
    assert!(pool[1].failover_tick().await.unwrap().is_quiet());
}

#[tokio::test]
async fn silent_metrics_do_not_trigger_scale_down() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(3, &store, &clock);
    start_all(&pool).await;

    // Nobody publishes metrics: the pool looks idle but is only silent.
    for _ in 0..4 {
        for agent in &pool {
            agent.heartbeat_tick().await.unwrap();
            assert_eq!(agent.evaluation_tick().await.unwrap(), PublishOutcome::Hold);
        }
        clock.advance(Duration::from_secs(5));
    }
    assert!(pool[0].coordinator().latest_decision().await.unwrap().is_none());
}

/// Runs `ticks` rounds where every pod heartbeats but only `pool[0]`
/// samples, and returns every published decision.
async fn run_with_one_reporter(
    pool: &[PodAgent],
    clock: &ManualClock,
    ticks: usize,
) -> Vec<ScalingDecision> {
    let mut published = Vec::new();
    for _ in 0..ticks {
        pool[0].sample_tick().await.unwrap();
        for agent in pool {
            agent.heartbeat_tick().await.unwrap();
        }
        for agent in pool {
            if let PublishOutcome::Published(d) = agent.evaluation_tick().await.unwrap() {
                published.push(d);
            }
        }
        clock.advance(Duration::from_secs(5));
    }
    published
}

#[tokio::test]
async fn partly_silent_pool_does_not_scale_down() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(4, &store, &clock);
    start_all(&pool).await;

    for _ in 0..5 {
        pool[0].gauge().enqueue();
    }
    let published = run_with_one_reporter(&pool, &clock, 4).await;
    assert!(published.is_empty(), "{published:?}");
}

#[tokio::test]
async fn one_overloaded_reporter_scales_up_despite_silent_peers() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(4, &store, &clock);
    start_all(&pool).await;

    for _ in 0..350 {
        pool[0].gauge().enqueue();
    }
    let published = run_with_one_reporter(&pool, &clock, 4).await;
    assert_eq!(published.len(), 1, "{published:?}");
    assert_eq!(published[0].direction, ScaleDirection::Up);
    assert_eq!(published[0].active_pods, 4);
}

#[tokio::test]
async fn idle_pool_scales_down_once() {
    let clock = ManualClock::new(0);
    let store: SharedStore = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let pool = spawn_pool(3, &store, &clock);
    start_all(&pool).await;

    let mut outcomes: HashMap<&'static str, usize> = HashMap::new();
    for _ in 0..3 {
        for agent in &pool {
            agent.sample_tick().await.unwrap();
        }
        for agent in &pool {
            let kind = match agent.evaluation_tick().await.unwrap() {
                PublishOutcome::Published(d) => {
                    assert_eq!(d.direction, ScaleDirection::Down);
                    "published"
                }
                PublishOutcome::Hold => "hold",
                PublishOutcome::LockDenied => "denied",
                PublishOutcome::Debounced { .. } => "debounced",
            };
            *outcomes.entry(kind).or_default() += 1;
        }
        clock.advance(Duration::from_secs(5));
    }
    assert_eq!(outcomes.get("published"), Some(&1));
}

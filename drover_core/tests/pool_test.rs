//! Application pool behavior, driven end to end with the dummy spawner.

use std::sync::Arc;
use std::time::Duration;

use drover_core::pool::{
    AuthOptions, DummySpawner, GetError, Options, Pool, PoolConfig, SpawnError,
};

fn pool_with(max: usize, concurrency: i32) -> (Arc<Pool>, Arc<DummySpawner>) {
    let spawner = Arc::new(DummySpawner::new(concurrency));
    let config = PoolConfig {
        max,
        max_idle_time: Duration::from_secs(300),
    };
    (Pool::new(config, spawner.clone()), spawner)
}

fn options(name: &str) -> Options {
    Options::new(name)
        .min_processes(0)
        .max_request_queue_time(Duration::from_secs(2))
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn basic_get_spawns_a_process_and_returns_a_session() {
    let (pool, spawner) = pool_with(4, 1);

    let session = pool.get(options("app")).await.expect("session");
    assert_eq!(pool.group_count(), 1);
    assert_eq!(pool.alive_process_count(), 1);
    assert_eq!(spawner.spawned_count(), 1);
    assert!(session.pid() >= 1000);
    pool.verify_invariants();

    session.close(false, false);
    pool.verify_invariants();
    assert_eq!(pool.alive_process_count(), 1);
}

#[tokio::test]
async fn noop_requests_touch_nothing() {
    let (pool, spawner) = pool_with(4, 1);
    let session = pool.get(options("app").noop(true)).await.expect("session");
    assert!(session.is_noop());
    session.close(false, false);
    assert_eq!(spawner.spawned_count(), 0);
    assert_eq!(pool.alive_process_count(), 0);
}

#[tokio::test]
async fn a_queued_waiter_is_answered_when_a_session_closes() {
    let (pool, _) = pool_with(1, 1);

    let first = pool.get(options("app")).await.expect("first session");
    assert_eq!(pool.alive_process_count(), 1);

    // The only slot is taken: this get must queue.
    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.get(options("app")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    first.close(false, false);
    let second = waiter.await.unwrap().expect("queued waiter gets a session");
    second.close(false, false);
    pool.verify_invariants();
}

#[tokio::test]
async fn waiters_time_out_with_request_queue_full() {
    let (pool, _) = pool_with(1, 1);

    let held = pool.get(options("app")).await.expect("session");
    let result = pool
        .get(options("app").max_request_queue_time(Duration::from_millis(30)))
        .await;
    assert!(matches!(result, Err(GetError::RequestQueueFull)));
    held.close(false, false);
}

#[tokio::test]
async fn a_full_queue_rejects_immediately() {
    let (pool, _) = pool_with(1, 1);

    let held = pool.get(options("app")).await.expect("session");
    let pool2 = pool.clone();
    let queued = tokio::spawn(async move {
        pool2
            .get(options("app").max_request_queue_size(1))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The queue bound is 1 and one waiter is already parked.
    let result = pool
        .get(options("app").max_request_queue_size(1))
        .await;
    assert!(matches!(result, Err(GetError::RequestQueueFull)));

    held.close(false, false);
    let second = queued.await.unwrap().expect("queued waiter succeeds");
    second.close(false, false);
}

#[tokio::test]
async fn spawn_failures_are_delivered_through_the_callback() {
    let (pool, spawner) = pool_with(4, 1);
    spawner.fail_next(SpawnError::new("INTERNAL_ERROR", "exit status 1").with_log("boom"));

    match pool.get(options("app")).await {
        Err(GetError::SpawnFailed {
            category,
            summary,
            details,
        }) => {
            assert_eq!(category, "INTERNAL_ERROR");
            assert_eq!(summary, "exit status 1");
            assert_eq!(details.as_deref(), Some("boom"));
        }
        other => panic!("expected SpawnFailed, got {:?}", other.map(|_| ())),
    }

    // The group recovers on the next request.
    let session = pool.get(options("app")).await.expect("session");
    session.close(false, false);
}

#[tokio::test]
async fn max_requests_detaches_the_process_on_session_close() {
    let (pool, _) = pool_with(4, 1);

    let session = pool.get(options("app").max_requests(1)).await.expect("session");
    assert_eq!(pool.alive_process_count(), 1);
    session.close(false, false);
    assert_eq!(pool.alive_process_count(), 0);
    pool.verify_invariants();
}

#[tokio::test]
async fn forced_eviction_frees_capacity_for_a_starving_group() {
    let (pool, _) = pool_with(1, 1);

    // Group A occupies the whole pool, then goes idle.
    let session = pool.get(options("a")).await.expect("session for a");
    session.close(false, false);
    assert_eq!(pool.group_summary("a"), Some((1, 0, 0)));

    // Group B's first process can only exist by evicting A's idle one.
    let session = pool.get(options("b")).await.expect("session for b");
    assert_eq!(pool.group_summary("a"), Some((0, 0, 0)));
    assert_eq!(pool.group_summary("b"), Some((1, 0, 0)));
    assert_eq!(pool.alive_process_count(), 1);
    session.close(false, false);
    pool.verify_invariants();
}

#[tokio::test]
async fn eviction_picks_the_oldest_idle_process() {
    let (pool, _) = pool_with(2, 1);

    let a = pool.get(options("a")).await.expect("a");
    a.close(false, false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let b = pool.get(options("b")).await.expect("b");
    b.close(false, false);

    // Group A's process has the older last_used timestamp.
    let c = pool.get(options("c")).await.expect("c");
    assert_eq!(pool.group_summary("a"), Some((0, 0, 0)));
    assert_eq!(pool.group_summary("b"), Some((1, 0, 0)));
    c.close(false, false);
}

#[tokio::test]
async fn rolling_restart_preserves_availability() {
    let (pool, _) = pool_with(4, 10);
    let opts = options("app").min_processes(3).rolling_restart(true);

    // Build up three enabled processes with live sessions on each.
    let s1 = pool.get(opts.clone()).await.expect("session 1");
    wait_for("three processes", || {
        pool.group_summary("app") == Some((3, 0, 0))
    })
    .await;
    let s2 = pool.get(opts.clone()).await.expect("session 2");
    let s3 = pool.get(opts.clone()).await.expect("session 3");

    assert!(pool.restart_group("app", drover_core::pool::RestartMethod::Rolling));
    // Everything moved to disabling; a new generation is spawning.
    let (enabled, disabling, _) = pool.group_summary("app").unwrap();
    assert_eq!(enabled, 0);
    assert_eq!(disabling, 3);

    // Old-generation processes still serve while the spawn is in flight.
    let bridging = pool.get(opts.clone()).await.expect("session during restart");
    bridging.close(false, false);

    wait_for("new generation", || {
        matches!(pool.group_summary("app"), Some((e, _, _)) if e >= 1)
    })
    .await;

    // New requests land on the new generation.
    let fresh = pool.get(opts.clone()).await.expect("session on new generation");

    // As the old sessions drain, their processes are garbage collected.
    s1.close(false, false);
    s2.close(false, false);
    s3.close(false, false);
    wait_for("old generation drained", || {
        matches!(pool.group_summary("app"), Some((_, 0, 0)))
    })
    .await;

    fresh.close(false, false);
    pool.verify_invariants();
}

#[tokio::test]
async fn blocking_restart_queues_requests_until_the_new_generation() {
    let (pool, spawner) = pool_with(4, 1);

    let session = pool.get(options("app")).await.expect("session");
    session.close(false, false);
    assert_eq!(spawner.spawned_count(), 1);

    assert!(pool.restart_group("app", drover_core::pool::RestartMethod::Blocking));
    assert_eq!(pool.group_summary("app"), Some((0, 0, 0)));

    // This request waits for the restart spawn, then succeeds.
    let session = pool.get(options("app")).await.expect("session after restart");
    assert_eq!(spawner.spawned_count(), 2);
    session.close(false, false);
    pool.verify_invariants();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disable_completes_when_the_last_session_drains() {
    let (pool, _) = pool_with(4, 2);

    let session = pool.get(options("app")).await.expect("session");
    let gupid = session.gupid().to_string();

    let pool2 = pool.clone();
    let gupid2 = gupid.clone();
    let disable = tokio::task::spawn_blocking(move || pool2.disable_process(&gupid2));

    // The process drains in the disabling list while a replacement spawns.
    wait_for("process moves to disabling", || {
        matches!(pool.group_summary("app"), Some((_, 1, 0)))
    })
    .await;
    wait_for("replacement process", || {
        matches!(pool.group_summary("app"), Some((1, 1, 0)))
    })
    .await;

    session.close(false, false);
    let result = disable.await.unwrap();
    assert_eq!(result, drover_core::pool::DisableResult::Success);
    assert_eq!(pool.group_summary("app"), Some((1, 0, 1)));
    pool.verify_invariants();
}

#[tokio::test]
async fn idle_gc_respects_the_group_minimum() {
    let spawner = Arc::new(DummySpawner::new(1));
    let pool = Pool::new(
        PoolConfig {
            max: 4,
            max_idle_time: Duration::from_millis(30),
        },
        spawner,
    );

    let session = pool.get(options("app")).await.expect("session");
    session.close(false, false);
    assert_eq!(pool.alive_process_count(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.collect_idle_processes();
    assert_eq!(pool.alive_process_count(), 0);

    // With a minimum of one the same process survives GC.
    let session = pool.get(options("app").min_processes(1)).await.expect("session");
    session.close(false, false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.collect_idle_processes();
    assert_eq!(pool.alive_process_count(), 1);
}

#[tokio::test]
async fn a_touched_restart_file_triggers_a_restart() {
    let (pool, spawner) = pool_with(4, 1);
    let dir = tempfile::tempdir().unwrap();
    let restart_file = dir.path().join("restart.txt");
    let opts = || options("app").restart_file(&restart_file);

    let session = pool.get(opts()).await.expect("session");
    let first_gupid = session.gupid().to_string();
    session.close(false, false);
    assert_eq!(spawner.spawned_count(), 1);

    // Touching the restart file makes the next get tear the old generation
    // down and wait for a fresh one.
    std::fs::write(&restart_file, "x").unwrap();
    let session = pool.get(opts()).await.expect("session after restart");
    assert_ne!(session.gupid(), first_gupid);
    assert_eq!(spawner.spawned_count(), 2);
    session.close(false, false);

    // Without another touch, no further restart happens.
    let session = pool.get(opts()).await.expect("session");
    assert_eq!(spawner.spawned_count(), 2);
    session.close(false, false);
    pool.verify_invariants();
}

#[tokio::test]
async fn detach_requires_authorization() {
    let (pool, _) = pool_with(4, 1);
    let mut opts = options("app");
    opts.api_key = Some("sesame".to_string());

    let session = pool.get(opts).await.expect("session");
    let gupid = session.gupid().to_string();
    session.close(false, false);

    let denied = pool.detach_process(&gupid, &AuthOptions::default());
    assert!(denied.is_err());

    let allowed = pool.detach_process(
        &gupid,
        &AuthOptions {
            uid: None,
            api_key: Some("sesame".to_string()),
        },
    );
    assert_eq!(allowed.unwrap(), true);
    assert_eq!(pool.alive_process_count(), 0);
}

#[tokio::test]
async fn oobw_disables_the_process_and_reenables_it_afterwards() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // A minimal session-protocol worker that accepts the OOBW request.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address =
        drover_core::connection::AddressSpec::Tcp(listener.local_addr().unwrap().to_string());
    let oobw_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let oobw_seen2 = oobw_seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let oobw_seen = oobw_seen2.clone();
            tokio::spawn(async move {
                let mut size = [0u8; 4];
                if stream.read_exact(&mut size).await.is_err() {
                    return;
                }
                let mut body = vec![0u8; u32::from_be_bytes(size) as usize];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                if body.windows(4).any(|w| w == b"OOBW") {
                    oobw_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
            });
        }
    });

    let spawner = Arc::new(DummySpawner::new(1).fallback_address(address));
    let pool = Pool::new(
        PoolConfig {
            max: 4,
            max_idle_time: Duration::from_secs(300),
        },
        spawner,
    );

    let session = pool.get(options("app")).await.expect("session");
    let gupid = session.gupid().to_string();
    session.close(false, false);

    pool.request_oobw(&gupid);
    wait_for("OOBW request reaches the worker", || {
        oobw_seen.load(std::sync::atomic::Ordering::SeqCst) == 1
    })
    .await;
    wait_for("process re-enabled after OOBW", || {
        pool.group_summary("app") == Some((1, 0, 0))
    })
    .await;
    pool.verify_invariants();
}

#[tokio::test]
async fn shutdown_answers_queued_waiters() {
    let (pool, _) = pool_with(1, 1);
    let held = pool.get(options("app")).await.expect("session");

    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.get(options("app")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(GetError::ShuttingDown)
    ));
    assert_eq!(pool.alive_process_count(), 0);
    drop(held);
}

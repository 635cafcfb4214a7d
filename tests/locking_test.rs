//! Integration tests for advisory-lock coordination.
//!
//! Requires a running PostgreSQL database; set PGHOST (and optionally
//! PGUSER/PGPASSWORD/PGDATABASE) to run, skipped otherwise.

use pg_tracking_client::{
    LockOptions, OperationContext, PgClient, PgClientConfig, PgClientError, PoolRegistry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn test_config() -> Option<PgClientConfig> {
    let _ = tracing_subscriber::fmt().try_init();
    let host = match std::env::var("PGHOST") {
        Ok(host) => host,
        Err(_) => {
            eprintln!("Skipping test: PGHOST not set");
            return None;
        }
    };
    let username = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("PGPASSWORD").unwrap_or_default();
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| username.clone());
    Some(PgClientConfig::new(host, username, password, database))
}

fn unique_key(prefix: &str) -> String {
    format!("{}_{}", prefix, rand::random::<u32>())
}

#[tokio::test]
async fn test_contention_immediate_failure_and_scheduled_retry() {
    let Some(config) = test_config() else { return };
    let client = Arc::new(PgClient::new(Arc::new(PoolRegistry::new()), config).unwrap());
    client.start().await.unwrap();

    let key = unique_key("tracked_lock");
    let done_with_first = Arc::new(AtomicBool::new(false));

    // First caller holds the lock for 1500ms.
    let first = client
        .query_with_context(OperationContext::new("first-lock"))
        .unwrap();
    let first_key = key.clone();
    let first_done = Arc::clone(&done_with_first);
    let first_task = tokio::spawn(async move {
        first
            .with_advisory_lock(
                &first_key,
                |_attempt| {
                    let done = Arc::clone(&first_done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(1500)).await;
                        done.store(true, Ordering::SeqCst);
                        Ok::<bool, PgClientError>(true)
                    }
                },
                LockOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !done_with_first.load(Ordering::SeqCst),
        "second attempt must race the first holder"
    );

    // Immediate attempt while held: busy, body never runs.
    let second_ran = Arc::new(AtomicBool::new(false));
    let second_flag = Arc::clone(&second_ran);
    let second_err = client
        .query_with_context(OperationContext::new("second-lock"))
        .unwrap()
        .with_advisory_lock(
            &key,
            |_attempt| {
                let flag = Arc::clone(&second_flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<bool, PgClientError>(false)
                }
            },
            LockOptions { immediate: true },
        )
        .await
        .expect_err("lock is held by the first caller");
    assert!(second_err.is_lock_busy());
    assert!(
        !second_ran.load(Ordering::SeqCst),
        "second lock body must not run"
    );

    // Scheduled retry: busy now, free after the first caller releases.
    let third = client
        .query_with_context(OperationContext::new("third-lock"))
        .unwrap();
    let third_result = third
        .try_advisory_lock(
            &key,
            |attempt| async move { Ok::<u32, PgClientError>(attempt.retry_count) },
            &[Duration::from_millis(2000)],
        )
        .await;

    let first_result = first_task.await.unwrap();
    assert!(first_result.unwrap(), "first lock body completes");
    assert_eq!(
        third_result.unwrap(),
        1,
        "third caller succeeds on its single retry"
    );

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_blocking_acquisition_waits_for_release() {
    let Some(config) = test_config() else { return };
    let client = Arc::new(PgClient::new(Arc::new(PoolRegistry::new()), config).unwrap());
    client.start().await.unwrap();

    let key = unique_key("tracked_lock_wait");
    let released = Arc::new(AtomicBool::new(false));

    let holder = client
        .query_with_context(OperationContext::new("holder"))
        .unwrap();
    let holder_key = key.clone();
    let holder_released = Arc::clone(&released);
    let holder_task = tokio::spawn(async move {
        holder
            .with_advisory_lock(
                &holder_key,
                |_attempt| {
                    let released = Arc::clone(&holder_released);
                    async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        released.store(true, Ordering::SeqCst);
                        Ok::<(), PgClientError>(())
                    }
                },
                LockOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The blocking waiter queues at the database until the holder releases.
    let clock = Instant::now();
    let waiter_released = Arc::clone(&released);
    client
        .query_with_context(OperationContext::new("waiter"))
        .unwrap()
        .with_advisory_lock(
            &key,
            |_attempt| {
                let released = Arc::clone(&waiter_released);
                async move {
                    assert!(
                        released.load(Ordering::SeqCst),
                        "waiter must enter only after the holder released"
                    );
                    Ok::<(), PgClientError>(())
                }
            },
            LockOptions::default(),
        )
        .await
        .unwrap();
    assert!(clock.elapsed() >= Duration::from_millis(300));

    holder_task.await.unwrap().unwrap();
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_retry_schedule_exhaustion_surfaces_busy() {
    let Some(config) = test_config() else { return };
    let client = Arc::new(PgClient::new(Arc::new(PoolRegistry::new()), config).unwrap());
    client.start().await.unwrap();

    let key = unique_key("tracked_lock_exhaust");

    let holder = client
        .query_with_context(OperationContext::new("holder"))
        .unwrap();
    let holder_key = key.clone();
    let holder_task = tokio::spawn(async move {
        holder
            .with_advisory_lock(
                &holder_key,
                |_attempt| async {
                    tokio::time::sleep(Duration::from_millis(1200)).await;
                    Ok::<(), PgClientError>(())
                },
                LockOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Initial attempt plus one 100ms retry, all inside the holder's window.
    let impatient_ran = Arc::new(AtomicBool::new(false));
    let impatient_flag = Arc::clone(&impatient_ran);
    let err = client
        .query_with_context(OperationContext::new("impatient"))
        .unwrap()
        .try_advisory_lock(
            &key,
            |_attempt| {
                let flag = Arc::clone(&impatient_flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<(), PgClientError>(())
                }
            },
            &[Duration::from_millis(100)],
        )
        .await
        .expect_err("schedule is exhausted while the lock is held");
    assert!(err.is_lock_busy());
    assert!(
        !impatient_ran.load(Ordering::SeqCst),
        "body must not run while the lock stays held"
    );

    holder_task.await.unwrap().unwrap();
    client.stop().await.unwrap();
}

//! End-to-end pool tests driving the real `corral-worker` binary.

use std::time::Duration;

use futures::future::join_all;

use corral::{
    CallOptions, Command, CorralError, Field, FieldKind, FieldValues, Pool, PoolConfig, PoolStatus,
    builtin,
};

fn test_config(min: usize, max: usize) -> PoolConfig {
    let mut config = PoolConfig::new(env!("CARGO_BIN_EXE_corral-worker"));
    config.min = min;
    config.max = max;
    // keep pruning out of tests that don't exercise it
    config.max_idle = Duration::from_secs(60);
    config.recycle_after = 0;
    config.stop_grace = Duration::from_secs(2);
    config
}

async fn wait_until(
    pool: &Pool,
    deadline: Duration,
    pred: impl Fn(&PoolStatus) -> bool,
) -> PoolStatus {
    let start = tokio::time::Instant::now();
    loop {
        let status = pool.status().await.unwrap();
        if pred(&status) {
            return status;
        }
        if start.elapsed() > deadline {
            panic!("condition not reached in time, last status: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn assert_consistent(status: &PoolStatus) {
    // a worker is in exactly one of the three states
    assert_eq!(
        status.ready + status.busy + status.stopping,
        status.total,
        "inconsistent status: {status:?}"
    );
}

async fn echo(pool: &Pool, text: &str) -> corral::Result<FieldValues> {
    let args = FieldValues::new().with("text", text);
    pool.submit(&builtin::ECHO, args, CallOptions::default())
        .await
}

async fn worker_pid(pool: &Pool) -> i64 {
    pool.submit(&builtin::PID, FieldValues::new(), CallOptions::default())
        .await
        .unwrap()
        .get_int("pid")
        .unwrap()
}

fn sleep_job(pool: &Pool, millis: i64, options: CallOptions) -> corral::Call {
    let args = FieldValues::new().with("millis", millis);
    pool.submit(&builtin::SLEEP, args, options)
}

#[tokio::test]
async fn test_start_yields_min_ready_workers() {
    let pool = Pool::new(test_config(3, 5));
    pool.start().await.unwrap();

    let status = pool.status().await.unwrap();
    assert_consistent(&status);
    assert_eq!(status.ready, 3);
    assert_eq!(status.busy, 0);
    assert_eq!(status.total, 3);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let pool = Pool::new(test_config(1, 2));
    pool.start().await.unwrap();

    let reply = echo(&pool, "hello pool").await.unwrap();
    assert_eq!(reply.get_str("text"), Some("hello pool"));

    // the call alias behaves identically
    let args = FieldValues::new().with("text", "via call");
    let reply = pool
        .call(&builtin::ECHO, args, CallOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.get_str("text"), Some("via call"));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_fire_and_forget_resolves_immediately() {
    // same wire name as echo, but no answer requested
    const ECHO_NOWAIT: Command = Command {
        name: "echo",
        args: &[Field {
            name: "text",
            kind: FieldKind::Str,
        }],
        response: &[],
        requires_answer: false,
    };

    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let args = FieldValues::new().with("text", "no answer");
    let reply = pool
        .submit(&ECHO_NOWAIT, args, CallOptions::default())
        .await
        .unwrap();
    assert!(reply.is_empty());

    // the worker processed it and still answers
    let reply = echo(&pool, "still alive").await.unwrap();
    assert_eq!(reply.get_str("text"), Some("still alive"));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_saturated_pool_queues_in_fifo_order() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    // occupy the single worker, then queue numbered jobs behind it
    let blocker = sleep_job(&pool, 300, CallOptions::default());
    let seqs: Vec<_> = (0..4)
        .map(|_| pool.submit(&builtin::SEQ, FieldValues::new(), CallOptions::default()))
        .collect();

    let status = pool.status().await.unwrap();
    assert_consistent(&status);
    assert_eq!(status.total, 1);
    assert!(status.queued >= 3, "expected queued jobs: {status:?}");

    blocker.await.unwrap();
    let mut observed = Vec::new();
    for call in seqs {
        observed.push(call.await.unwrap().get_int("seq").unwrap());
    }
    // strict FIFO drain: the per-process counter matches submission order
    assert_eq!(observed, vec![1, 2, 3, 4]);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_submissions_beyond_max_grow_then_queue() {
    let pool = Pool::new(test_config(1, 2));
    pool.start().await.unwrap();

    let jobs: Vec<_> = (0..5)
        .map(|_| sleep_job(&pool, 200, CallOptions::default()))
        .collect();

    let status = pool.status().await.unwrap();
    assert_consistent(&status);
    assert!(status.total <= 2, "pool exceeded max: {status:?}");
    assert!(status.queued >= 1, "expected queued jobs: {status:?}");

    for result in join_all(jobs).await {
        result.unwrap();
    }

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_recycle_after_one_rotates_worker_processes() {
    let mut config = test_config(1, 1);
    config.recycle_after = 1;
    let pool = Pool::new(config);
    pool.start().await.unwrap();

    let first = worker_pid(&pool).await;
    let second = worker_pid(&pool).await;
    assert_ne!(first, second, "consecutive jobs ran in the same process");

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_recycle_disabled_reuses_worker_process() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let first = worker_pid(&pool).await;
    let second = worker_pid(&pool).await;
    assert_eq!(first, second, "worker was retired with recycling disabled");

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_crashed_worker_rejects_job_and_is_replaced() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let args = FieldValues::new().with("code", 7i64);
    let result = pool
        .submit(&builtin::EXIT, args, CallOptions::default())
        .await;
    assert!(
        matches!(result, Err(CorralError::WorkerLost(_))),
        "unexpected result: {result:?}"
    );

    // the job is not retried, but the pool replaced the worker
    let reply = echo(&pool, "recovered").await.unwrap();
    assert_eq!(reply.get_str("text"), Some("recovered"));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_rejects_job_and_replaces_worker() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let before = worker_pid(&pool).await;
    let result = sleep_job(&pool, 10_000, CallOptions::timeout(Duration::from_millis(200))).await;
    assert!(
        matches!(result, Err(CorralError::Timeout)),
        "unexpected result: {result:?}"
    );

    let after = worker_pid(&pool).await;
    assert_ne!(before, after, "timed-out worker process was reused");

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_zero_timeout_fails_near_immediately() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let result = sleep_job(&pool, 500, CallOptions::timeout(Duration::ZERO)).await;
    assert!(matches!(result, Err(CorralError::Timeout)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_absolute_deadline_rejects_job() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    let result = sleep_job(&pool, 10_000, CallOptions::deadline(deadline)).await;
    assert!(matches!(result, Err(CorralError::Timeout)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_default_call_timeout_applies() {
    let mut config = test_config(1, 1);
    config.call_timeout = Some(Duration::from_millis(200));
    let pool = Pool::new(config);
    pool.start().await.unwrap();

    let result = sleep_job(&pool, 10_000, CallOptions::default()).await;
    assert!(matches!(result, Err(CorralError::Timeout)));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_keeps_worker_usable() {
    const BOGUS: Command = Command {
        name: "bogus",
        args: &[],
        response: &[],
        requires_answer: true,
    };

    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let before = worker_pid(&pool).await;
    let result = pool
        .submit(&BOGUS, FieldValues::new(), CallOptions::default())
        .await;
    assert!(matches!(result, Err(CorralError::UnknownCommand(_))));

    // a command-level failure does not cost the worker
    let after = worker_pid(&pool).await;
    assert_eq!(before, after);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_idle_pruning_shrinks_back_to_min() {
    let mut config = test_config(1, 3);
    config.max_idle = Duration::from_secs(1);
    let pool = Pool::new(config);
    pool.start().await.unwrap();

    // force growth to max
    let jobs: Vec<_> = (0..3)
        .map(|_| sleep_job(&pool, 100, CallOptions::default()))
        .collect();
    for result in join_all(jobs).await {
        result.unwrap();
    }
    let status = pool.status().await.unwrap();
    assert!(status.total >= 2, "pool did not grow: {status:?}");

    // surplus workers go idle and get pruned back down to min
    let status = wait_until(&pool, Duration::from_secs(15), |s| s.total == 1).await;
    assert_eq!(status.ready, 1);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_all_workers() {
    let pool = Pool::new(test_config(2, 4));
    pool.start().await.unwrap();
    echo(&pool, "warmup").await.unwrap();

    pool.stop().await.unwrap();
    let status = pool.status().await.unwrap();
    assert_eq!(status.total, 0);
    assert_eq!(status.queued, 0);

    let result = echo(&pool, "too late").await;
    assert!(matches!(result, Err(CorralError::PoolStopped)));
}

#[tokio::test]
async fn test_stop_fails_queued_jobs() {
    let pool = Pool::new(test_config(1, 1));
    pool.start().await.unwrap();

    let blocker = sleep_job(&pool, 500, CallOptions::default());
    let queued = echo(&pool, "never runs");

    pool.stop().await.unwrap();

    // the queued job is failed, the in-flight one ran to completion
    assert!(matches!(queued.await, Err(CorralError::PoolStopped)));
    blocker.await.unwrap();
}

#[tokio::test]
async fn test_adjust_pool_size_resizes_running_pool() {
    let pool = Pool::new(test_config(1, 2));
    pool.start().await.unwrap();
    assert_eq!(pool.status().await.unwrap().total, 1);

    pool.adjust_pool_size(2, 3).await.unwrap();
    let status = wait_until(&pool, Duration::from_secs(10), |s| s.ready == 2).await;
    assert_eq!(status.min, 2);
    assert_eq!(status.max, 3);

    // invalid bounds are rejected without touching the running pool
    let result = pool.adjust_pool_size(3, 1).await;
    assert!(matches!(result, Err(CorralError::InvalidArgument(_))));
    let status = pool.status().await.unwrap();
    assert_eq!(status.min, 2);
    assert_eq!(status.max, 3);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_grow_to_and_shrink_to() {
    let pool = Pool::new(test_config(1, 4));
    pool.start().await.unwrap();

    pool.grow_to(3).await.unwrap();
    let status = pool.status().await.unwrap();
    assert_consistent(&status);
    assert_eq!(status.ready, 3);

    assert!(matches!(
        pool.grow_to(9).await,
        Err(CorralError::InvalidArgument(_))
    ));

    pool.shrink_to(1).await.unwrap();
    let status = wait_until(&pool, Duration::from_secs(10), |s| s.total == 1).await;
    assert_eq!(status.ready, 1);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_log_dir_receives_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(1, 1);
    config.launch.args = vec![
        "--log-dir".to_string(),
        dir.path().to_string_lossy().into_owned(),
    ];
    let pool = Pool::new(config);
    pool.start().await.unwrap();
    echo(&pool, "logged").await.unwrap();
    pool.stop().await.unwrap();

    // daily rotation appends the date to the file name
    let has_log = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("worker.log")
        });
    assert!(has_log, "worker wrote no log file");
}

#[tokio::test]
async fn test_concurrent_jobs_spread_across_workers() {
    let pool = Pool::new(test_config(2, 2));
    pool.start().await.unwrap();

    // two sleeps in parallel finish well under the sequential time
    let started = tokio::time::Instant::now();
    let jobs = vec![
        sleep_job(&pool, 300, CallOptions::default()),
        sleep_job(&pool, 300, CallOptions::default()),
    ];
    for result in join_all(jobs).await {
        result.unwrap();
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(550),
        "jobs did not run concurrently: {elapsed:?}"
    );

    pool.stop().await.unwrap();
}

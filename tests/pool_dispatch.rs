//! Pool tests with real worker processes (the `rjq worker` child of the
//! test build) and an in-process store.

mod common;

use std::time::{Duration, Instant};

use common::{worker_command, FakeStore};
use rjq::orchestrator::Context;
use rjq::queue::keys;
use rjq::worker::{StrategyKind, WorkerCommand, WorkerState};
use rjq::{Pool, PoolConfig, Producer};
use serde_json::json;

const DEADLINE: Duration = Duration::from_secs(10);

fn pool(config: PoolConfig, strategy: StrategyKind) -> Pool {
    let command = worker_command(&config.job_type, &config.handler);
    Pool::new(config, command, strategy.build())
}

/// Runs dispatch passes until `done` holds or the deadline passes.
async fn dispatch_until<F>(pool: &mut Pool, ctx: &mut Context, mut done: F) -> bool
where
    F: FnMut(&Pool, &Context) -> bool,
{
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        pool.dispatch(ctx).await.unwrap();
        if done(pool, ctx) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn submit(store: &FakeStore, job_type: &str, args: Vec<serde_json::Value>) -> String {
    Producer::with_client(store.client())
        .submit(job_type, args)
        .await
        .unwrap()
}

fn state_of(store: &FakeStore, id: &str) -> Option<String> {
    store.hash(&keys::job(id)).get("state").cloned()
}

async fn run_to_completion(strategy: StrategyKind) {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(PoolConfig::new("mail").with_handler("noop").with_limit(2), strategy);

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(submit(&store, "mail", vec![json!(n)]).await);
    }

    let finished = dispatch_until(&mut pool, &mut ctx, |_, _| {
        ids.iter().all(|id| state_of(&store, id).as_deref() == Some("done"))
    })
    .await;
    assert!(finished, "jobs did not complete");

    assert_eq!(ctx.stats.counters.done, 5);
    assert_eq!(ctx.stats.counters.queue, 5);
    assert_eq!(ctx.stats.counters.fail, 0);
    assert!(pool.len() <= 2);
    assert!(store.list("mail.queue").is_empty());
    assert!(store.hash("mail.pending").is_empty());

    let record = store.hash(&keys::job(&ids[0]));
    assert_eq!(record["host"], "test-host");
    assert!(record.contains_key("duration"));

    pool.teardown(&mut ctx).await;
    assert!(pool.is_empty());
    assert_eq!(ctx.stats.counters.workers, 0);
}

#[tokio::test]
async fn test_jobs_complete_with_poll_strategy() {
    run_to_completion(StrategyKind::Poll).await;
}

#[tokio::test]
async fn test_jobs_complete_with_readiness_strategy() {
    run_to_completion(StrategyKind::Readiness).await;
}

#[tokio::test]
async fn test_full_pool_leaves_jobs_queued() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(
        PoolConfig::new("slow").with_handler("sleep").with_limit(2),
        StrategyKind::Poll,
    );
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(submit(&store, "slow", vec![json!(30)]).await);
    }

    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 2).await);
    let pops = |store: &FakeStore| store.commands().iter().filter(|c| *c == "RPOP").count();
    let before = pops(&store);
    for _ in 0..5 {
        assert!(!pool.dispatch(&mut ctx).await.unwrap());
    }
    assert_eq!(pops(&store), before);
    assert_eq!(pool.len(), 2);
    assert_eq!(store.list("slow.queue"), vec![ids[2].clone()]);

    // Tearing down puts both running jobs back.
    pool.teardown(&mut ctx).await;
    assert_eq!(ctx.stats.counters.fail, 2);
    let mut queued = store.list("slow.queue");
    queued.sort();
    let mut all = ids.clone();
    all.sort();
    assert_eq!(queued, all);
    assert!(store.hash("slow.pending").is_empty());
}

#[tokio::test]
async fn test_failing_handler_requeues_and_keeps_worker() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(PoolConfig::new("mail").with_handler("fail").with_limit(1), StrategyKind::Poll);
    let id = submit(&store, "mail", vec![]).await;

    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("error")).await
    );
    assert_eq!(ctx.stats.counters.fail, 1);
    assert_eq!(ctx.stats.counters.done, 0);
    assert_eq!(store.list("mail.queue"), vec![id.clone()]);
    assert_eq!(store.hash(&keys::job(&id))["try"], "1");

    assert_eq!(pool.len(), 1);
    assert_eq!(pool.workers()[0].state(), WorkerState::Idle);
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_crashed_worker_requeues_job_once() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(PoolConfig::new("mail").with_handler("crash"), StrategyKind::Poll);
    let id = submit(&store, "mail", vec![]).await;

    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("error")).await
    );
    // One requeue per crash, never a duplicate queue entry.
    let record = store.hash(&keys::job(&id));
    assert_eq!(record["try"], ctx.stats.counters.fail.to_string());
    assert_eq!(store.list("mail.queue"), vec![id.clone()]);
    assert!(store.hash("mail.pending").is_empty());
    assert!(pool.in_flight().is_empty());
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_idle_worker_is_replaced_after_idle_timeout() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(
        PoolConfig::new("mail")
            .with_handler("noop")
            .with_limit(1)
            .with_idle_timeout(Duration::from_millis(50)),
        StrategyKind::Poll,
    );
    let id = submit(&store, "mail", vec![]).await;
    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("done")).await
    );
    assert_eq!(pool.workers()[0].id(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let index = pool.get_worker(&mut ctx).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.workers()[index].id(), 2);
    assert_eq!(ctx.stats.counters.workers, 1);
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_stuck_worker_is_killed_and_job_requeued_once() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(
        PoolConfig::new("slow")
            .with_handler("sleep")
            .with_limit(1)
            .with_busy_timeout(Duration::from_millis(200)),
        StrategyKind::Poll,
    );
    let id = submit(&store, "slow", vec![json!(30)]).await;
    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 1).await);
    let pid = pool.workers()[0].pid();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let index = pool.get_worker(&mut ctx).await.unwrap();
    assert_ne!(pool.workers()[index].pid(), pid);

    assert_eq!(ctx.stats.counters.fail, 1);
    assert_eq!(store.list("slow.queue"), vec![id.clone()]);
    let record = store.hash(&keys::job(&id));
    assert_eq!(record["state"], "error");
    assert_eq!(record["try"], "1");
    assert!(store.hash("slow.pending").is_empty());
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_unstartable_worker_leaves_job_queued() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = Pool::new(
        PoolConfig::new("mail"),
        WorkerCommand::new("/nonexistent/rjq-worker"),
        StrategyKind::Poll.build(),
    );
    let id = submit(&store, "mail", vec![]).await;

    assert!(!pool.dispatch(&mut ctx).await.unwrap());
    assert!(pool.is_empty());
    assert_eq!(ctx.stats.counters.errors, 1);
    assert_eq!(store.list("mail.queue"), vec![id]);
}

#[tokio::test]
async fn test_drain_waits_for_running_job() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(PoolConfig::new("slow").with_handler("sleep"), StrategyKind::Poll);
    let id = submit(&store, "slow", vec![json!(0.3)]).await;
    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 1).await);

    // The first drain step keeps the busy worker.
    assert!(!pool.drain(&mut ctx).await);

    let deadline = Instant::now() + DEADLINE;
    while !pool.drain(&mut ctx).await && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pool.is_empty());
    assert_eq!(state_of(&store, &id).as_deref(), Some("done"));
    assert_eq!(ctx.stats.counters.done, 1);
    assert_eq!(ctx.stats.counters.fail, 0);
}

#[tokio::test]
async fn test_store_outage_is_ridden_out() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(PoolConfig::new("mail").with_handler("noop"), StrategyKind::Poll);
    let id = submit(&store, "mail", vec![]).await;

    store.set_down(true);
    let shutdown = ctx.shutdown.clone();
    let restore = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.set_down(false);
    };
    // Dispatch blocks in the reconnect loop until the store is back.
    let (claimed, ()) = tokio::join!(pool.dispatch(&mut ctx), restore);
    assert!(claimed.unwrap());
    assert!(shutdown.is_running());

    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("done")).await
    );
    assert!(ctx.stats.counters.errors >= 1);
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_completion_is_retried_after_lost_connection() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(
        PoolConfig::new("slow").with_handler("sleep").with_limit(1),
        StrategyKind::Poll,
    );
    let id = submit(&store, "slow", vec![json!(0.3)]).await;
    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 1).await);

    // The connection drops on the first completion batch.
    store.close_on("HDEL", 1);
    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("done")).await
    );
    assert_eq!(ctx.stats.counters.done, 1);
    assert_eq!(ctx.stats.counters.fail, 0);
    assert!(store.hash("slow.pending").is_empty());
    assert!(store.list("slow.queue").is_empty());
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_job_is_requeued_when_completion_keeps_failing() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    let mut pool = pool(
        PoolConfig::new("slow").with_handler("sleep").with_limit(1),
        StrategyKind::Poll,
    );
    let id = submit(&store, "slow", vec![json!(0.3)]).await;
    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 1).await);

    // Both completion attempts lose the connection.
    store.close_on("HDEL", 2);
    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("error")).await
    );
    assert_eq!(ctx.stats.counters.done, 0);
    assert_eq!(ctx.stats.counters.fail, 1);
    assert!(ctx.stats.counters.errors >= 1);
    assert_eq!(store.list("slow.queue"), vec![id.clone()]);
    assert!(store.hash("slow.pending").is_empty());
    assert_eq!(pool.workers()[0].state(), WorkerState::Idle);
    pool.teardown(&mut ctx).await;
}

#[tokio::test]
async fn test_readiness_keeps_exited_worker_until_output_ends() {
    let store = FakeStore::start().await;
    let mut ctx = store.context();
    // The shell exits at once; its background child holds stdout for a second.
    let command = WorkerCommand::new("/bin/sh").arg("-c").arg("sleep 1 & sleep 0.1");
    let mut pool = Pool::new(
        PoolConfig::new("mail").with_limit(1),
        command,
        StrategyKind::Readiness.build(),
    );
    let id = submit(&store, "mail", vec![]).await;
    assert!(dispatch_until(&mut pool, &mut ctx, |pool, _| pool.busy_count() == 1).await);

    let until = Instant::now() + Duration::from_millis(500);
    while Instant::now() < until {
        pool.dispatch(&mut ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.busy_count(), 1);
    assert_eq!(state_of(&store, &id).as_deref(), Some("progress"));

    assert!(
        dispatch_until(&mut pool, &mut ctx, |_, _| state_of(&store, &id).as_deref() == Some("error")).await
    );
    assert_eq!(ctx.stats.counters.fail, 1);
    assert_eq!(store.list("mail.queue"), vec![id.clone()]);
    pool.teardown(&mut ctx).await;
}

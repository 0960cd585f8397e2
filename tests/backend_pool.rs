//! `BackendPool` membership and dispatch against scripted workers.

use std::sync::Arc;

use relayframe::{
    backend::{BackendOptions, BackendPool},
    buffer_pool::PooledBuf,
    dispatch::Dispatcher,
    message::MessageType,
    request::Request,
    seq_id::SeqIdAllocator,
};
use relayframe_testing::{Behaviour, WorkerHandle, duplex_worker, frames};
use rstest::rstest;
use tokio::time::{self, Duration, Instant};

fn attach_workers(pool: &Arc<BackendPool>, n: usize) -> Vec<WorkerHandle> {
    let allocator = SeqIdAllocator::new();
    (0..n)
        .map(|i| {
            let (stream, worker) = duplex_worker(Behaviour::Echo);
            let options = BackendOptions {
                seq_ids: allocator.allocate(),
                ..BackendOptions::default()
            };
            pool.attach(stream, format!("worker-{i}"), options);
            worker
        })
        .collect()
}

fn call(method: &str, seq_id: i32) -> Request {
    Request::from_frame(PooledBuf::from(frames::call(method, seq_id)), false)
        .expect("valid call frame")
}

#[rstest]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn calls_are_spread_evenly(#[case] n: usize) {
    let pool = BackendPool::new("user", false);
    let workers = attach_workers(&pool, n);
    assert_eq!(pool.active_count(), n);

    for seq in 0..(2 * n) {
        let seq = i32::try_from(seq).expect("small");
        let request = pool.call(call("get", seq)).await.expect("answered");
        assert!(request.error().is_none());
        assert_eq!(request.service(), "user");
        assert_eq!(frames::header(request.response_data().expect("reply")).seq_id, seq);
    }
    for worker in &workers {
        assert_eq!(worker.calls(), 2);
    }
}

#[tokio::test]
async fn closed_worker_leaves_the_pool() {
    let pool = BackendPool::new("user", false);
    let mut workers = attach_workers(&pool, 2);

    workers.remove(0).close().await;
    let deadline = Instant::now() + Duration::from_secs(1);
    while pool.active_count() != 1 && Instant::now() < deadline {
        time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pool.active_count(), 1);

    for seq in 0..4 {
        let request = pool.call(call("get", seq)).await.expect("answered");
        assert!(request.error().is_none());
    }
    assert_eq!(workers[0].calls(), 4);
}

#[tokio::test]
async fn empty_pool_answers_without_blocking() {
    let pool = BackendPool::new("user", false);
    let request = time::timeout(Duration::from_millis(50), pool.call(call("get", 11)))
        .await
        .expect("answered at once")
        .expect("answered");

    let reply = request.response_data().expect("exception stored");
    assert_eq!(request.response_type(), Some(MessageType::Exception));
    assert_eq!(frames::header(reply).seq_id, 11);
    assert!(frames::is_exception_containing(reply, "user.get Not Found"));
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_quiet_then_releases_workers() {
    let pool = BackendPool::new("user", false);
    let workers = attach_workers(&pool, 2);
    let start = Instant::now();

    let traffic = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(2)).await;
            pool.call(call("get", 1)).await.expect("answered")
        })
    };
    pool.stop(Duration::from_secs(5)).await;

    assert!(start.elapsed() >= Duration::from_secs(7));
    assert!(traffic.await.expect("joined").error().is_none());
    assert_eq!(pool.active_count(), 0);
    assert!(pool.connections().is_empty());
    drop(workers);
}

//! Integration tests for connection sharing across sessions.

use futures::future::join_all;
use rstest::rstest;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use xrepo::backend::{BackendError, BackendRegistry};
use xrepo::{ConnectionPool, RepoUri, WorkspaceKey};

mod common;
use common::{FakeBackend, Script};

const MUX: &str = "git://github.com/gorilla/mux?0a192a19";

fn pool_over(backend: &Arc<FakeBackend>) -> ConnectionPool {
    let backend: Arc<FakeBackend> = Arc::clone(backend);
    let registry = BackendRegistry::new().with(backend);
    ConnectionPool::new(registry, Duration::from_secs(60))
}

fn key(root: &str) -> WorkspaceKey {
    let uri: RepoUri = root.parse().unwrap();
    WorkspaceKey::new("go", &uri)
}

#[rstest]
#[case(2)]
#[case(16)]
#[tokio::test]
async fn concurrent_acquires_share_one_handshake(#[case] clients: usize) {
    let backend = Arc::new(
        FakeBackend::new()
            .workspace(MUX, Script::default())
            .start_delay(Duration::from_millis(50)),
    );
    let pool = pool_over(&backend);

    let leases = join_all((0..clients).map(|_| {
        let pool = pool.clone();
        async move { pool.acquire(&key(MUX)).await }
    }))
    .await;

    assert!(leases.iter().all(Result::is_ok));
    assert_eq!(backend.start_count(), 1);
    let stats = pool.stats();
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.live, 1);
    assert_eq!(stats.leased, clients);

    drop(leases);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test]
async fn distinct_revisions_get_distinct_connections() {
    let other = "git://github.com/gorilla/mux?ffffffff";
    let backend = Arc::new(
        FakeBackend::new()
            .workspace(MUX, Script::default())
            .workspace(other, Script::default()),
    );
    let pool = pool_over(&backend);

    let a = pool.acquire(&key(MUX)).await.unwrap();
    let b = pool.acquire(&key(other)).await.unwrap();
    let file_key = key(&format!("{MUX}#mux.go"));
    let c = pool.acquire(&file_key).await.unwrap();

    assert_eq!(backend.start_count(), 2);
    assert_eq!(a.key(), c.key());
    assert_ne!(a.key(), b.key());
}

#[tokio::test]
async fn failed_start_is_shared_then_retried() {
    let backend = Arc::new(FakeBackend::new().start_delay(Duration::from_millis(20)));
    let pool = pool_over(&backend);

    let mux = key(MUX);
    let (first, second) = tokio::join!(pool.acquire(&mux), pool.acquire(&mux));
    assert!(first.is_err());
    assert!(second.is_err());
    assert_eq!(backend.start_count(), 1);

    assert!(pool.acquire(&key(MUX)).await.is_err());
    assert_eq!(backend.start_count(), 2);
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn abandoned_acquire_does_not_cancel_creation() {
    let backend = Arc::new(
        FakeBackend::new()
            .workspace(MUX, Script::default())
            .start_delay(Duration::from_millis(50)),
    );
    let pool = pool_over(&backend);

    let abandoned = tokio::time::timeout(Duration::from_millis(5), pool.acquire(&key(MUX))).await;
    assert!(abandoned.is_err());

    let lease = pool.acquire(&key(MUX)).await.unwrap();
    assert_eq!(backend.start_count(), 1);
    assert_eq!(pool.stats().leased, 1);
    drop(lease);
}

#[tokio::test]
async fn exited_connection_is_replaced_after_failed_call() {
    let backend = Arc::new(FakeBackend::new().workspace(MUX, Script::default().exited()));
    let pool = pool_over(&backend);
    let cancel = CancellationToken::new();

    for attempt in 1..=3 {
        let lease = pool.acquire(&key(MUX)).await.unwrap();
        let result = lease.call("textDocument/hover", Value::Null, &cancel).await;
        assert!(matches!(result, Err(BackendError::Exited)));
        assert_eq!(backend.start_count(), attempt);
    }
}

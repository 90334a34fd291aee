// LockManager timeouts against a SQLite file whose write lock is held by
// another connection, as when a second runner stalls mid-transaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cronfleet_core::{JobId, RunnerId};
use cronfleet_scheduler::{LockError, LockManager};
use cronfleet_store::{LeaseStatus, LockStore, SqliteLockStore};

const TTL: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_acquire_leaves_no_lease_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.db");
    let path = path.to_str().unwrap().to_string();

    // The busy handler outlasts the manager's timeout, so the write is still
    // queued behind the lock when the caller gives up.
    let store = Arc::new(SqliteLockStore::open(&path, Duration::from_secs(10)).unwrap());
    let lock = LockManager::new(
        store.clone(),
        RunnerId::new("pi"),
        Duration::from_millis(300),
    );
    let job = JobId::new("card_sync");

    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(1_500));
        blocker.execute_batch("COMMIT").unwrap();
    });

    let err = lock.try_acquire(&job, TTL).await.unwrap_err();
    assert!(
        matches!(&err, LockError::StoreUnavailable(msg) if msg.contains("timed out")),
        "{err}"
    );

    // Once the lock clears, the queued write commits and is handed straight back.
    let deadline = Instant::now() + Duration::from_secs(10);
    let lease = loop {
        if let Some(lease) = store.get_lease(&job).await.unwrap() {
            if lease.status == LeaseStatus::Free {
                break lease;
            }
        }
        assert!(Instant::now() < deadline, "late acquisition was never released");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    holder.join().unwrap();

    assert_eq!(lease.holder_id, RunnerId::new("pi"));
    assert_eq!(lease.fencing_token, 1);
    assert!(!store.validate_fence(&job, 1).await.unwrap());

    // The next acquisition by anyone succeeds immediately.
    let other = LockManager::new(store, RunnerId::new("desktop"), Duration::from_secs(2));
    let next = other.try_acquire(&job, TTL).await.unwrap();
    assert_eq!(next.fencing_token, 2);
}

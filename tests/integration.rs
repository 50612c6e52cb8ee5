//! End-to-end tests over the real local index and a filesystem batch store.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use hex_literal::hex;

use ctlog_store::admin::{AdminTable, SignatureAlgorithm, Tree, TreeState};
use ctlog_store::config::SignerConfig;
use ctlog_store::frontier::{leaf_hash, node_hash};
use ctlog_store::local::Local;
use ctlog_store::quota::QuotaManager;
use ctlog_store::remote::{FileStore, Remote};
use ctlog_store::signer::Sequencer;
use ctlog_store::storage::LogStorage;
use ctlog_store::types::now_nanos;
use ctlog_store::{Leaf, StorageError};

const TREE_ID: i64 = 1;

struct Harness {
    _dir: tempfile::TempDir,
    local: Arc<Local>,
    remote: Arc<Remote<FileStore>>,
    storage: Arc<LogStorage<FileStore>>,
    sequencer: Sequencer<FileStore>,
    quota: Arc<QuotaManager>,
    tree: Tree,
    leaves_dir: std::path::PathBuf,
}

fn test_tree(tree_id: i64) -> Tree {
    Tree {
        tree_id,
        state: TreeState::Active,
        signature_algorithm: SignatureAlgorithm::Ed25519,
        max_root_duration: Duration::from_secs(3600),
        create_time: Utc::now(),
        update_time: Utc::now(),
    }
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let leaves_dir = dir.path().join("leaves");
    let local = Arc::new(Local::open(&dir.path().join("index.redb")).unwrap());
    let remote = Arc::new(Remote::new(FileStore::new(&leaves_dir).unwrap()));
    let tree = test_tree(TREE_ID);
    let admin = AdminTable::new(vec![tree.clone()]);
    let storage = Arc::new(LogStorage::new(local.clone(), remote.clone(), admin));

    let quota = Arc::new(QuotaManager::new(1000));
    let config = SignerConfig {
        batch_size: 100,
        run_interval: Duration::from_secs(1),
        guard_window: Duration::ZERO,
    };
    let sequencer = Sequencer::new(
        storage.clone(),
        quota.clone(),
        config,
        SigningKey::from_bytes(&[7u8; 32]),
    );

    Harness {
        _dir: dir,
        local,
        remote,
        storage,
        sequencer,
        quota,
        tree,
        leaves_dir,
    }
}

async fn init(h: &Harness) {
    h.sequencer.init_log(&h.tree).await.unwrap();
}

async fn queue(h: &Harness, value: &[u8], ts: i64) -> bool {
    let leaf = Leaf::new(value.to_vec(), b"chain".to_vec());
    let queued = h
        .storage
        .queue_leaves(&h.tree, vec![leaf], ts)
        .await
        .unwrap();
    queued[0].duplicate
}

#[tokio::test]
async fn test_uninitialized_tree_surfaces() {
    let h = harness();
    assert!(matches!(
        h.storage.snapshot_for_tree(TREE_ID),
        Err(StorageError::TreeNeedsInit(TREE_ID)),
    ));
    // queueing against an uninitialized tree is refused the same way
    let leaf = Leaf::new(b"A".to_vec(), Vec::new());
    assert!(matches!(
        h.storage.queue_leaves(&h.tree, vec![leaf], 1).await,
        Err(StorageError::TreeNeedsInit(TREE_ID)),
    ));
}

#[tokio::test]
async fn test_empty_tree_root() {
    let h = harness();
    init(&h).await;

    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let root = tx.latest_signed_log_root();
    assert_eq!(root.tree_size, 0);
    assert_eq!(root.tree_revision, 0);
    assert_eq!(
        root.root_hash,
        hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"),
    );
}

#[tokio::test]
async fn test_single_leaf_integration() {
    let h = harness();
    init(&h).await;

    assert!(!queue(&h, b"A", now_nanos()).await);
    let sequenced = h.sequencer.integrate_once(&h.tree).await.unwrap();
    assert_eq!(sequenced, 1);

    let mut tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let root = tx.latest_signed_log_root().clone();
    assert_eq!(root.tree_size, 1);
    assert_eq!(root.tree_revision, 1);
    assert_eq!(
        root.root_hash,
        hex!("559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd"),
    );

    // the leaf reads back, verified against the stored level-0 node
    let leaves = tx.get_leaves_by_index(&[0]).await.unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].leaf_value, b"A");
    assert_eq!(leaves[0].leaf_index, 0);

    // both persisted indices point at sequence 0
    let leaf = Leaf::new(b"A".to_vec(), b"chain".to_vec());
    let snapshot = h.storage.local().snapshot().unwrap();
    assert_eq!(
        snapshot
            .sequence_by_merkle_hash(TREE_ID, &[leaf.merkle_leaf_hash.clone()])
            .unwrap(),
        [0],
    );
    assert_eq!(
        snapshot
            .sequence_by_identity_hash(TREE_ID, &[leaf.leaf_identity_hash.clone()])
            .unwrap(),
        [0],
    );
    // the queue is drained
    assert_eq!(h.storage.local().unsequenced(TREE_ID).unwrap(), 0);
}

#[tokio::test]
async fn test_two_and_three_leaf_roots() {
    let h = harness();
    init(&h).await;

    let base = now_nanos();
    queue(&h, b"A", base).await;
    queue(&h, b"B", base + 1).await;
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let expected = node_hash(&leaf_hash(b"A"), &leaf_hash(b"B"));
    assert_eq!(tx.latest_signed_log_root().root_hash, expected);

    // a third leaf in a second cycle: H(H(A|B) | C)
    queue(&h, b"C", base + 2).await;
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let root = tx.latest_signed_log_root();
    assert_eq!(root.tree_size, 3);
    assert_eq!(root.tree_revision, 2);
    assert_eq!(root.root_hash, node_hash(&expected, &leaf_hash(b"C")));
}

#[tokio::test]
async fn test_multi_cycle_matches_single_cycle() {
    // integrating in several batches must end at the same root as a
    // reference frontier fed the same leaves in one go
    let h = harness();
    init(&h).await;

    let mut reference = ctlog_store::frontier::Frontier::new();
    let base = now_nanos();
    for round in 0..5i64 {
        for i in 0..7i64 {
            let value = format!("cert-{round}-{i}");
            queue(&h, value.as_bytes(), base + round * 10 + i).await;
            reference.append(leaf_hash(value.as_bytes()));
        }
        assert_eq!(h.sequencer.integrate_once(&h.tree).await.unwrap(), 7);
    }

    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let root = tx.latest_signed_log_root();
    assert_eq!(root.tree_size, 35);
    assert_eq!(root.root_hash, reference.head());
}

#[tokio::test]
async fn test_duplicate_queue_before_signing() {
    let h = harness();
    init(&h).await;

    let ts = now_nanos();
    assert!(!queue(&h, b"dup", ts).await);
    assert!(queue(&h, b"dup", ts + 1).await);

    // only one queue entry exists
    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    let leaves = tx.dequeue_leaves(100, ts + 3_600_000_000_000).unwrap();
    assert_eq!(leaves.len(), 1);
    tx.rollback();
}

#[tokio::test]
async fn test_duplicate_after_integration_served_from_remote() {
    let h = harness();
    init(&h).await;

    let base = now_nanos();
    queue(&h, b"first", base).await;
    queue(&h, b"second", base + 1).await;
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    // within the cache TTL a duplicate is answered from the in-flight
    // cache, which still holds the unsequenced copy
    let leaf = Leaf::new(b"second".to_vec(), b"other-chain".to_vec());
    let queued = h
        .storage
        .queue_leaves(&h.tree, vec![leaf.clone()], base + 2)
        .await
        .unwrap();
    assert!(queued[0].duplicate);
    assert_eq!(queued[0].leaf.leaf_index, -1);

    // a fresh process has an empty cache and answers from the identity
    // index plus the remote store
    let fresh = LogStorage::new(
        h.local.clone(),
        h.remote.clone(),
        AdminTable::new(vec![h.tree.clone()]),
    );
    let queued = fresh
        .queue_leaves(&h.tree, vec![leaf], base + 3)
        .await
        .unwrap();
    assert!(queued[0].duplicate);
    assert_eq!(queued[0].leaf.leaf_index, 1);
    assert_eq!(queued[0].leaf.leaf_value, b"second");
    // nothing new hit the queue
    assert_eq!(h.storage.local().unsequenced(TREE_ID).unwrap(), 0);

    // the quirk at sequence zero: the very first leaf is never answered
    // from the identity index, so its resubmission queues again
    let first = Leaf::new(b"first".to_vec(), b"chain".to_vec());
    let queued = fresh
        .queue_leaves(&h.tree, vec![first], base + 4)
        .await
        .unwrap();
    assert!(!queued[0].duplicate);
    assert_eq!(h.storage.local().unsequenced(TREE_ID).unwrap(), 1);
}

#[tokio::test]
async fn test_get_leaves_by_range_and_hash() {
    let h = harness();
    init(&h).await;

    let base = now_nanos();
    for (i, value) in [b"A", b"B", b"C"].iter().enumerate() {
        queue(&h, *value, base + i as i64).await;
    }
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    let mut tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();

    // ranges clamp to the tree size
    let leaves = tx.get_leaves_by_range(1, 100).await.unwrap();
    assert_eq!(leaves.len(), 2);
    assert_eq!(leaves[0].leaf_value, b"B");
    assert!(matches!(
        tx.get_leaves_by_range(-1, 1).await,
        Err(StorageError::BadInput(_)),
    ));
    assert!(matches!(
        tx.get_leaves_by_index(&[3]).await,
        Err(StorageError::BadInput(_)),
    ));

    // hash lookups drop unknown hashes silently
    let known = leaf_hash(b"C").to_vec();
    let unknown = vec![0u8; 32];
    let leaves = tx.get_leaves_by_hash(&[unknown, known], false).await.unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].leaf_value, b"C");
    assert_eq!(leaves[0].leaf_index, 2);

    // valid hashes submitted out of sequence order resolve in the
    // caller's order, repeats included
    let hashes = vec![
        leaf_hash(b"C").to_vec(),
        leaf_hash(b"A").to_vec(),
        leaf_hash(b"C").to_vec(),
    ];
    let leaves = tx.get_leaves_by_hash(&hashes, false).await.unwrap();
    let found: Vec<(i64, Vec<u8>)> = leaves
        .iter()
        .map(|leaf| (leaf.leaf_index, leaf.leaf_value.clone()))
        .collect();
    assert_eq!(
        found,
        [
            (2, b"C".to_vec()),
            (0, b"A".to_vec()),
            (2, b"C".to_vec()),
        ],
    );
}

#[tokio::test]
async fn test_corrupt_remote_fails_reads() {
    let h = harness();
    init(&h).await;

    queue(&h, b"A", now_nanos()).await;
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    // overwrite the stored batch with a leaf whose hash disagrees with the
    // node the signer recorded
    let fake = format!(
        r#"[{{"MerkleLeafHash":"{}","LeafValue":"{}","ExtraData":"","LeafIndex":0,"LeafIdentityHash":"{}"}}]"#,
        STANDARD.encode([0u8; 32]),
        STANDARD.encode(b"evil"),
        STANDARD.encode([1u8; 32]),
    );
    std::fs::write(h.leaves_dir.join("leaves-1").join("0"), fake).unwrap();

    let mut tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    assert!(matches!(
        tx.get_leaves_by_index(&[0]).await,
        Err(StorageError::MerkleMismatch(0)),
    ));
}

#[tokio::test]
async fn test_fsm_guards_transaction_order() {
    let h = harness();
    init(&h).await;

    // a queueing transaction cannot move on to sequencing
    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    tx.queue_leaves(vec![Leaf::new(b"A".to_vec(), Vec::new())], now_nanos())
        .await
        .unwrap();
    let err = tx.update_sequenced_leaves(&mut []).await.unwrap_err();
    assert!(matches!(err, StorageError::IllegalTransition { .. }));
    tx.rollback();

    // sequenced leaves cannot be stored without a dequeue
    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    let err = tx.update_sequenced_leaves(&mut []).await.unwrap_err();
    assert!(matches!(err, StorageError::IllegalTransition { .. }));
    tx.rollback();
}

#[tokio::test]
async fn test_checksum_guard_rejects_modified_leaves() {
    let h = harness();
    init(&h).await;
    queue(&h, b"A", now_nanos()).await;

    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    let mut leaves = tx.dequeue_leaves(10, now_nanos()).unwrap();
    leaves[0].leaf_value = b"tampered".to_vec();
    leaves[0].leaf_index = 0;
    let err = tx.update_sequenced_leaves(&mut leaves).await.unwrap_err();
    assert!(matches!(err, StorageError::ChecksumMismatch));
    tx.rollback();
}

#[tokio::test]
async fn test_root_mismatch_is_rejected() {
    let h = harness();
    init(&h).await;

    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    let mut bad = tx.latest_signed_log_root().clone();
    bad.root_hash = vec![0xaa; 32];
    assert!(matches!(
        tx.store_signed_log_root(&bad),
        Err(StorageError::RootMismatch),
    ));
    tx.rollback();
}

#[tokio::test]
async fn test_rolled_back_dequeue_leaves_queue_intact() {
    let h = harness();
    init(&h).await;
    queue(&h, b"A", now_nanos()).await;

    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    assert_eq!(tx.dequeue_leaves(10, now_nanos()).unwrap().len(), 1);
    tx.rollback();

    // the leaf is still there for the next cycle
    assert_eq!(h.storage.local().unsequenced(TREE_ID).unwrap(), 1);
    assert_eq!(h.sequencer.integrate_once(&h.tree).await.unwrap(), 1);
}

#[tokio::test]
async fn test_crash_between_remote_put_and_commit_recovers() {
    let h = harness();
    init(&h).await;

    let base = now_nanos();
    queue(&h, b"A", base).await;
    queue(&h, b"B", base + 1).await;

    // drive the integration by hand and "crash" after the remote upload
    let mut tx = h.storage.begin_for_tree(TREE_ID).unwrap();
    let mut leaves = tx.dequeue_leaves(10, base + 10).unwrap();
    assert_eq!(leaves.len(), 2);
    for (i, leaf) in leaves.iter_mut().enumerate() {
        leaf.leaf_index = i as i64;
        leaf.integrate_timestamp = base + 99;
    }
    tx.update_sequenced_leaves(&mut leaves).await.unwrap();
    tx.rollback();

    // the remote is now ahead of the local index; no root was published
    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    assert_eq!(tx.latest_signed_log_root().tree_size, 0);
    drop(tx);

    // the next signer run dequeues the same leaves, merges the same batch
    // offsets, and publishes the same root the crashed run would have
    assert_eq!(h.sequencer.integrate_once(&h.tree).await.unwrap(), 2);
    let mut tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    let root = tx.latest_signed_log_root().clone();
    assert_eq!(root.tree_size, 2);
    assert_eq!(root.root_hash, node_hash(&leaf_hash(b"A"), &leaf_hash(b"B")));

    let leaves = tx.get_leaves_by_range(0, 2).await.unwrap();
    assert_eq!(leaves[0].leaf_value, b"A");
    assert_eq!(leaves[1].leaf_value, b"B");
}

#[tokio::test]
async fn test_empty_dequeue_publishes_nothing() {
    let h = harness();
    init(&h).await;

    assert_eq!(h.sequencer.integrate_once(&h.tree).await.unwrap(), 0);
    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    assert_eq!(tx.latest_signed_log_root().tree_revision, 0);
}

#[tokio::test]
async fn test_quota_backpressure_with_signer_drain() {
    let h = harness();
    let quota = Arc::new(QuotaManager::new(10));
    h.quota.shutdown();
    init(&h).await;

    quota.watch_log(h.storage.local().clone(), TREE_ID);
    let spec = [ctlog_store::quota::Spec::tree_write(TREE_ID)];

    let base = now_nanos();
    for i in 0..10i64 {
        quota.get_tokens(1, &spec).unwrap();
        queue(&h, format!("cert-{i}").as_bytes(), base + i).await;
    }
    assert!(matches!(
        quota.get_tokens(1, &spec),
        Err(StorageError::QuotaExceeded),
    ));

    // the signer drains five and returns their tokens
    let config = SignerConfig {
        batch_size: 5,
        run_interval: Duration::from_secs(1),
        guard_window: Duration::ZERO,
    };
    let sequencer = Sequencer::new(
        h.storage.clone(),
        quota.clone(),
        config,
        SigningKey::from_bytes(&[7u8; 32]),
    );
    assert_eq!(sequencer.integrate_once(&h.tree).await.unwrap(), 5);

    for i in 0..5i64 {
        quota.get_tokens(1, &spec).unwrap();
        queue(&h, format!("more-{i}").as_bytes(), base + 100 + i).await;
    }
    assert!(matches!(
        quota.get_tokens(1, &spec),
        Err(StorageError::QuotaExceeded),
    ));
    quota.shutdown();
}

#[tokio::test]
async fn test_read_write_transaction_rolls_back_on_error() {
    let h = harness();
    init(&h).await;
    queue(&h, b"A", now_nanos()).await;

    let result: Result<(), StorageError> = h
        .storage
        .read_write_transaction(&h.tree, |mut tx| async move {
            let result = tx
                .dequeue_leaves(10, now_nanos())
                .map(|_| ())
                .and(Err(StorageError::BadInput("driver gave up".into())));
            (tx, result)
        })
        .await;
    assert!(result.is_err());

    // nothing was deleted from the queue
    assert_eq!(h.storage.local().unsequenced(TREE_ID).unwrap(), 1);
}

#[tokio::test]
async fn test_snapshot_reads_are_stable_across_integration() {
    let h = harness();
    init(&h).await;
    queue(&h, b"A", now_nanos()).await;

    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    h.sequencer.integrate_once(&h.tree).await.unwrap();

    // the old snapshot still reports the pre-integration world
    assert_eq!(tx.latest_signed_log_root().tree_size, 0);
    drop(tx);
    let tx = h.storage.snapshot_for_tree(TREE_ID).unwrap();
    assert_eq!(tx.latest_signed_log_root().tree_size, 1);
}

#[tokio::test]
async fn test_active_log_listing() {
    let h = harness();
    let listing = h.storage.snapshot();
    assert_eq!(listing.get_active_log_ids(), [TREE_ID]);
    assert!(matches!(
        listing.get_unsequenced_counts(),
        Err(StorageError::Unimplemented(_)),
    ));
}

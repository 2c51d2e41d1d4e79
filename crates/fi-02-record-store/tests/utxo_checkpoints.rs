//! Unspent-output repository: spends, checkpoints, reverts and packing.

use std::fs;
use std::path::PathBuf;

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use fi_02_record_store::{tombstone_outpoint, StorageError, UtxoRecord, UtxoRepository, UtxoStoreConfig};
use tempfile::TempDir;

fn outpoint(i: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([i + 1; 32]),
        vout: i as u32,
    }
}

fn record(i: u8) -> UtxoRecord {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&[i; 20]);
    UtxoRecord::new(outpoint(i), ScriptBuf::from_bytes(script))
}

fn base(dir: &TempDir) -> PathBuf {
    dir.path().join("utxos")
}

fn open(dir: &TempDir, config: UtxoStoreConfig) -> UtxoRepository {
    UtxoRepository::open(base(dir), config).unwrap()
}

fn outpoints(repo: &mut UtxoRepository) -> Vec<OutPoint> {
    let mut all: Vec<_> = repo.get_all().unwrap().into_iter().map(|r| r.outpoint).collect();
    all.sort();
    all
}

#[test]
fn test_append_get_delete() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    assert_eq!(repo.get(&outpoint(1)).unwrap(), Some(record(1)));
    assert_eq!(repo.get(&outpoint(2)).unwrap(), None);

    assert_eq!(repo.delete(&outpoint(1)).unwrap(), Some(record(1)));
    assert_eq!(repo.get(&outpoint(1)).unwrap(), None);
    assert_eq!(repo.delete(&outpoint(1)).unwrap(), None);
    assert_eq!(repo.len(), 0);
    assert_eq!(repo.tombstones(), 1);
}

#[test]
fn test_tombstone_outpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    let bogus = UtxoRecord::new(tombstone_outpoint(), ScriptBuf::new());

    assert!(matches!(
        repo.append(&bogus),
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(repo.is_empty());
}

#[test]
fn test_unchanged_checkpoint_pairs_with_one_revert() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.checkpoint().unwrap();
    assert_eq!(repo.checkpoint_depth(), 1);

    // The repeat is consumed first and changes nothing.
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(1)).unwrap(), Some(record(1)));

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(1)).unwrap(), None);
    assert!(!repo.revert_to_checkpoint().unwrap());
}

#[test]
fn test_revert_restores_spends_and_drops_appends() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    let data_len = repo.data_len();

    repo.delete(&outpoint(1)).unwrap();
    repo.append(&record(3)).unwrap();
    repo.checkpoint().unwrap();

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(outpoints(&mut repo), vec![outpoint(1), outpoint(2)]);
    assert_eq!(repo.get(&outpoint(3)).unwrap(), None);
    assert_eq!(repo.tombstones(), 0);
    assert_eq!(repo.data_len(), data_len);
}

#[test]
fn test_created_and_spent_in_same_interval() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();

    repo.append(&record(2)).unwrap();
    repo.delete(&outpoint(2)).unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.checkpoint().unwrap();
    assert!(repo.is_empty());

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
    assert_eq!(repo.tombstones(), 0);
}

#[test]
fn test_rollback_pending() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();

    repo.append(&record(2)).unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.rollback_pending().unwrap();

    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
    assert_eq!(repo.checkpoint_depth(), 1);
}

#[test]
fn test_revert_discards_uncheckpointed_changes_first() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());

    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    repo.append(&record(3)).unwrap();

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
}

#[test]
fn test_pruning_bounds_depth() {
    let dir = TempDir::new().unwrap();
    let config = UtxoStoreConfig::for_testing();
    let mut repo = open(&dir, config.clone());

    for i in 0..25 {
        repo.append(&record(i)).unwrap();
        repo.checkpoint().unwrap();
        assert!(repo.checkpoint_depth() < config.checkpoint_high_water);
    }

    let depth = repo.checkpoint_depth();
    assert!(depth >= config.checkpoint_low_water);
    for _ in 0..depth {
        assert!(repo.revert_to_checkpoint().unwrap());
    }
    assert!(!repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.len(), 25 - depth as u64);
}

#[test]
fn test_compact_keeps_set_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let config = UtxoStoreConfig::default()
        .with_pack_threshold(1_000)
        .with_checkpoint_depth(3, 1);
    let mut repo = open(&dir, config);

    for i in 0..10 {
        repo.append(&record(i)).unwrap();
    }
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(0)).unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(2)).unwrap();
    // Pruned to this one checkpoint; the first two spends are now final.
    repo.checkpoint().unwrap();
    assert_eq!(repo.checkpoint_depth(), 1);
    repo.delete(&outpoint(3)).unwrap();
    repo.append(&record(10)).unwrap();
    repo.checkpoint().unwrap();

    let live = outpoints(&mut repo);
    let before = repo.data_len();
    repo.compact().unwrap();

    assert!(repo.data_len() < before);
    assert_eq!(repo.tombstones(), 2);
    assert_eq!(outpoints(&mut repo), live);
    assert_eq!(repo.len(), 7);

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(3)).unwrap(), Some(record(3)));
    assert_eq!(repo.get(&outpoint(10)).unwrap(), None);

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(2)).unwrap(), Some(record(2)));
    assert_eq!(repo.get(&outpoint(0)).unwrap(), None);
    assert!(!repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.len(), 8);
}

#[test]
fn test_pack_runs_once_tombstones_are_final() {
    let dir = TempDir::new().unwrap();
    let config = UtxoStoreConfig::default()
        .with_pack_threshold(2)
        .with_checkpoint_depth(3, 1);
    let mut repo = open(&dir, config);

    for i in 0..10 {
        repo.append(&record(i)).unwrap();
    }
    repo.checkpoint().unwrap();
    for i in 0..5 {
        repo.delete(&outpoint(i)).unwrap();
        repo.checkpoint().unwrap();
    }

    assert_eq!(repo.tombstones(), 2);
    assert_eq!(repo.len(), 5);
    assert_eq!(
        outpoints(&mut repo),
        (5..10).map(outpoint).collect::<Vec<_>>()
    );
}

#[test]
fn test_checkpoints_survive_close() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.close().unwrap();

    let journal = dir.path().join("utxos.chk");
    assert!(journal.exists());

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert!(journal.exists());
    assert_eq!(repo.checkpoint_depth(), 2);
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(1)).unwrap(), Some(record(1)));
}

#[test]
fn test_journal_ahead_of_log_is_ignored() {
    let longer = TempDir::new().unwrap();
    let mut repo = open(&longer, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    repo.close().unwrap();

    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.close().unwrap();
    fs::copy(longer.path().join("utxos.chk"), dir.path().join("utxos.chk")).unwrap();

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.checkpoint_depth(), 0);
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
}

#[test]
fn test_checkpoints_survive_crash() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.append(&record(3)).unwrap();
    repo.checkpoint().unwrap();
    drop(repo);

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.checkpoint_depth(), 2);
    assert_eq!(outpoints(&mut repo), vec![outpoint(2), outpoint(3)]);

    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(outpoints(&mut repo), vec![outpoint(1), outpoint(2)]);
    assert_eq!(repo.tombstones(), 0);
    assert!(repo.revert_to_checkpoint().unwrap());
    assert!(repo.is_empty());
}

#[test]
fn test_crash_discards_uncheckpointed_changes() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.append(&record(3)).unwrap();
    drop(repo);

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.checkpoint_depth(), 1);
    assert_eq!(outpoints(&mut repo), vec![outpoint(1), outpoint(2)]);
    assert_eq!(repo.tombstones(), 0);
}

#[test]
fn test_crash_after_revert_keeps_revert() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.delete(&outpoint(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();
    assert!(repo.revert_to_checkpoint().unwrap());
    drop(repo);

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.checkpoint_depth(), 1);
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
}

#[test]
fn test_tags_follow_reverts_and_restarts() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.tip_tag(), None);

    repo.append(&record(1)).unwrap();
    repo.checkpoint_tagged([1; 32]).unwrap();
    repo.checkpoint_tagged([2; 32]).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint_tagged([3; 32]).unwrap();
    assert_eq!(repo.tip_tag(), Some([3; 32]));
    drop(repo);

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(repo.tip_tag(), Some([3; 32]));
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.tip_tag(), Some([2; 32]));
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.tip_tag(), Some([1; 32]));
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.tip_tag(), None);
}

#[test]
fn test_duplicate_outpoint_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();

    assert!(matches!(
        repo.append(&record(1)),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert_eq!(repo.len(), 1);

    // A spent outpoint may be created again.
    repo.delete(&outpoint(1)).unwrap();
    repo.append(&record(1)).unwrap();
    assert_eq!(repo.get(&outpoint(1)).unwrap(), Some(record(1)));
    assert_eq!(repo.len(), 1);
}

#[test]
fn test_journal_survives_compaction() {
    let dir = TempDir::new().unwrap();
    let config = UtxoStoreConfig::default()
        .with_pack_threshold(1_000)
        .with_checkpoint_depth(3, 1);
    let mut repo = open(&dir, config.clone());
    for i in 0..6 {
        repo.append(&record(i)).unwrap();
    }
    repo.checkpoint().unwrap();
    for i in 0..4 {
        repo.delete(&outpoint(i)).unwrap();
        repo.checkpoint().unwrap();
    }
    repo.append(&record(9)).unwrap();
    repo.checkpoint().unwrap();
    let before = repo.data_len();
    repo.compact().unwrap();
    assert!(repo.data_len() < before);
    let live = outpoints(&mut repo);
    let depth = repo.checkpoint_depth();
    drop(repo);

    assert!(!dir.path().join("utxos.pack.done").exists());
    let mut repo = open(&dir, config);
    assert_eq!(outpoints(&mut repo), live);
    assert_eq!(repo.checkpoint_depth(), depth);
    assert!(repo.revert_to_checkpoint().unwrap());
    assert_eq!(repo.get(&outpoint(9)).unwrap(), None);
}

#[test]
fn test_close_rolls_back_uncheckpointed_changes() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.checkpoint().unwrap();
    repo.append(&record(2)).unwrap();
    repo.close().unwrap();

    let mut repo = open(&dir, UtxoStoreConfig::default());
    assert_eq!(outpoints(&mut repo), vec![outpoint(1)]);
}

#[test]
fn test_snapshot_does_not_follow_writer() {
    let dir = TempDir::new().unwrap();
    let mut repo = open(&dir, UtxoStoreConfig::default());
    repo.append(&record(1)).unwrap();
    repo.append(&record(2)).unwrap();
    repo.checkpoint().unwrap();

    let mut snapshot = UtxoRepository::open_snapshot(base(&dir), UtxoStoreConfig::default()).unwrap();
    repo.delete(&outpoint(1)).unwrap();

    assert_eq!(snapshot.checkpoint_depth(), 0);
    assert_eq!(outpoints(&mut snapshot), vec![outpoint(1), outpoint(2)]);
    assert_eq!(outpoints(&mut repo), vec![outpoint(2)]);
}

use std::fs;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use tigstore::datafile::RECORD_PREFIX_LEN;
use tigstore::tig::{CHILD_COUNT_LEN, MAX_CHILDREN, TIG_HEADER_LEN};
use tigstore::{OpenMode, Result, Tig, TigChild, TigClass, TigId, TigStore, TigStoreError};

fn child(read_id: u32, reverse: bool, bgn: u32, end: u32) -> TigChild {
    TigChild {
        read_id,
        reverse,
        bgn,
        end,
        ahang: 0,
        bhang: 0,
    }
}

fn random_tig(rng: &mut StdRng) -> Tig {
    let mut tig = Tig::new();
    tig.source_id = rng.gen();
    tig.source_bgn = rng.gen_range(0..10_000);
    tig.source_end = tig.source_bgn + rng.gen_range(0..10_000);
    tig.class = match rng.gen_range(0..3) {
        0 => TigClass::Unset,
        1 => TigClass::Unassembled,
        _ => TigClass::Contig,
    };
    tig.suggest_repeat = rng.gen();
    tig.suggest_circular = rng.gen();
    let mut at = 0u32;
    for _ in 0..rng.gen_range(0..20) {
        let len = rng.gen_range(50..500);
        tig.children.push(TigChild {
            read_id: rng.gen(),
            reverse: rng.gen(),
            bgn: at,
            end: at + len,
            ahang: rng.gen_range(-100..100),
            bhang: rng.gen_range(-100..100),
        });
        at += rng.gen_range(1..len);
    }
    tig
}

#[test]
fn s1_create_insert_close_reopen_copy() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 100;
    tig.children.push(child(7, false, 0, 50));
    let id = store.insert(tig.clone(), false)?;
    assert_eq!(id, TigId(0));
    store.close()?;

    let mut store = TigStore::open(dir.path(), 1, OpenMode::ReadOnly)?;
    let copied = store.copy(TigId(0))?;
    tig.id = Some(TigId(0));
    assert_eq!(copied, tig);
    Ok(())
}

#[test]
fn s2_scalar_mutation_is_version_isolated() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 100;
    tig.children.push(child(7, false, 0, 50));
    store.insert(tig, false)?;
    store.close()?;

    let mut store = TigStore::open(dir.path(), 1, OpenMode::Write)?;
    store.set_suggest_repeat(TigId(0), true)?;
    store.next_version()?;
    store.close()?;

    let store = TigStore::open(dir.path(), 2, OpenMode::ReadOnly)?;
    assert!(store.suggest_repeat(TigId(0)));
    // The payload was never rewritten; the slot still points at version 1.
    assert_eq!(store.version_of(TigId(0)), 1);
    store.close()?;

    let store = TigStore::open(dir.path(), 1, OpenMode::ReadOnly)?;
    assert!(!store.suggest_repeat(TigId(0)));
    store.close()?;
    Ok(())
}

#[test]
fn s3_delete_marks_slot_and_copy_fails() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    store.insert(Tig::new(), false)?;
    store.insert(Tig::new(), false)?;
    store.delete(TigId(1))?;

    assert_eq!(store.num_tigs(), 2);
    assert!(store.is_deleted(TigId(1)));
    assert!(!store.is_deleted(TigId(0)));
    match store.copy(TigId(1)) {
        Err(TigStoreError::TigDeleted(id)) => assert_eq!(id, TigId(1)),
        other => panic!("expected TigDeleted, got {other:?}"),
    }
    Ok(())
}

#[test]
fn s4_oversized_child_count_is_corrupt_payload() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.children.push(child(7, false, 0, 50));
    store.insert(tig, false)?;
    store.close()?;

    // Overwrite the on-disk child count with a value past the sanity limit;
    // materializing that many children in memory is not realistic.
    let dat = dir.path().join("seqDB.v001.dat");
    let mut bytes = fs::read(&dat).unwrap();
    let count_at = RECORD_PREFIX_LEN as usize + TIG_HEADER_LEN;
    bytes[count_at..count_at + CHILD_COUNT_LEN]
        .copy_from_slice(&(MAX_CHILDREN + 1).to_le_bytes());
    fs::write(&dat, &bytes).unwrap();

    let mut store = TigStore::open(dir.path(), 1, OpenMode::ReadOnly)?;
    match store.copy(TigId(0)) {
        Err(TigStoreError::CorruptPayload { id, reason }) => {
            assert_eq!(id, TigId(0));
            assert_eq!(reason, "children count exceeds sanity limit");
        }
        other => panic!("expected CorruptPayload, got {other:?}"),
    }
    Ok(())
}

#[test]
fn s5_data_file_length_is_payloads_plus_prefixes() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(5);

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut payload_bytes = 0u64;
    for _ in 0..1000 {
        let tig = random_tig(&mut rng);
        payload_bytes += tig.encoded_len() as u64;
        store.insert(tig, false)?;
    }
    store.close()?;

    let dat_len = fs::metadata(dir.path().join("seqDB.v001.dat")).unwrap().len();
    assert_eq!(dat_len, payload_bytes + 1000 * RECORD_PREFIX_LEN);
    Ok(())
}

#[test]
fn s6_successive_versions_leave_prior_payloads_untouched() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(6);

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    for _ in 0..10 {
        let tig = random_tig(&mut rng);
        store.insert(tig, false)?;
    }
    store.close()?;
    let v1_payloads = fs::read(dir.path().join("seqDB.v001.dat")).unwrap();

    let mut store = TigStore::open(dir.path(), 1, OpenMode::Write)?;
    store.next_version()?;
    store.next_version()?;
    store.close()?;

    for version in 1..=3 {
        let store = TigStore::open(dir.path(), version, OpenMode::ReadOnly)?;
        assert_eq!(store.num_tigs(), 10);
        store.close()?;
    }
    assert_eq!(
        fs::read(dir.path().join("seqDB.v001.dat")).unwrap(),
        v1_payloads
    );
    Ok(())
}

#[test]
fn roundtrip_random_tigs() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(17);

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut originals = Vec::new();
    for _ in 0..50 {
        let tig = random_tig(&mut rng);
        let id = store.insert(tig.clone(), false)?;
        originals.push((id, tig));
    }
    for (id, mut original) in originals {
        original.id = Some(id);
        assert_eq!(store.copy(id)?, original);
    }
    Ok(())
}

#[test]
fn scalar_mutation_visible_without_any_load() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 1;
    store.insert(tig, false)?;

    store.set_source_id(TigId(0), 777)?;
    store.set_source_bgn(TigId(0), 10)?;
    store.set_source_end(TigId(0), 90)?;
    let copied = store.copy(TigId(0))?;
    assert_eq!(copied.source_id, 777);
    assert_eq!(copied.source_bgn, 10);
    assert_eq!(copied.source_end, 90);
    Ok(())
}

#[test]
fn cached_tig_and_fresh_copy_agree_after_setter() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    store.insert(Tig::new(), false)?;

    store.load(TigId(0))?;
    store.set_class(TigId(0), TigClass::Contig)?;
    assert_eq!(store.load(TigId(0))?.class, TigClass::Contig);

    store.flush_disk(TigId(0))?;
    assert_eq!(store.copy(TigId(0))?.class, TigClass::Contig);
    Ok(())
}

#[test]
fn delete_is_monotone_until_reinsert() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    store.insert(Tig::new(), false)?;
    store.delete(TigId(0))?;
    assert!(store.is_deleted(TigId(0)));

    match store.load(TigId(0)) {
        Err(TigStoreError::TigDeleted(_)) => {}
        other => panic!("expected TigDeleted, got {other:?}"),
    }

    let mut replacement = Tig::new();
    replacement.id = Some(TigId(0));
    replacement.source_id = 9;
    store.insert(replacement, false)?;
    assert!(!store.is_deleted(TigId(0)));
    assert_eq!(store.copy(TigId(0))?.source_id, 9);
    Ok(())
}

#[test]
fn unload_discard_loses_changes() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.children.push(child(7, false, 0, 50));
    store.insert(tig, false)?;

    let cached = store.load_mut(TigId(0))?;
    cached.children.push(child(8, true, 40, 90));
    store.unload(TigId(0), true)?;

    assert_eq!(store.load(TigId(0))?.children.len(), 1);
    Ok(())
}

#[test]
fn unload_persist_saves_changes() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.children.push(child(7, false, 0, 50));
    store.insert(tig, false)?;

    let cached = store.load_mut(TigId(0))?;
    cached.children.push(child(8, true, 40, 90));
    store.unload(TigId(0), false)?;

    assert_eq!(store.load(TigId(0))?.children.len(), 2);
    assert_eq!(store.children_count(TigId(0)), 2);
    Ok(())
}

#[test]
fn load_returns_the_same_cached_object() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 55;
    store.insert(tig, true)?;

    let first = store.load(TigId(0))? as *const Tig;
    let second = store.load(TigId(0))? as *const Tig;
    assert_eq!(first, second);

    store.unload(TigId(0), false)?;
    assert_eq!(store.copy(TigId(0))?.source_id, 55);
    Ok(())
}

#[test]
fn cached_reinsert_over_existing_id_detaches_old_payload() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.children.push(child(7, false, 0, 50));
    store.insert(tig, false)?;

    let mut replacement = Tig::new();
    replacement.id = Some(TigId(0));
    replacement.children.push(child(8, true, 40, 90));
    replacement.children.push(child(9, false, 80, 130));
    store.insert(replacement.clone(), true)?;

    // The slot already reports the new child count, so the old one-child
    // payload must not be addressable before the flush.
    assert_eq!(store.children_count(TigId(0)), 2);
    match store.copy(TigId(0)) {
        Err(TigStoreError::CorruptStore(_)) => {}
        other => panic!("expected CorruptStore, got {other:?}"),
    }

    store.flush_disk(TigId(0))?;
    assert_eq!(store.copy(TigId(0))?, replacement);
    assert_eq!(store.children_count(TigId(0)), 2);
    Ok(())
}

#[test]
fn insert_cached_defers_the_disk_write() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.children.push(child(3, false, 0, 10));
    store.insert(tig, true)?;
    assert!(!dir.path().join("seqDB.v001.dat").exists());

    store.flush_disk_all()?;
    assert!(dir.path().join("seqDB.v001.dat").exists());
    assert_eq!(store.version_of(TigId(0)), 1);
    Ok(())
}

#[test]
fn flush_cache_all_persists_then_empties() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(23);

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    for _ in 0..8 {
        store.insert(random_tig(&mut rng), true)?;
    }
    store.flush_cache_all(false)?;
    for raw in 0..store.num_tigs() {
        assert_eq!(store.version_of(TigId(raw)), 1);
    }
    store.close()?;

    let mut store = TigStore::open(dir.path(), 1, OpenMode::ReadOnly)?;
    for raw in 0..store.num_tigs() {
        store.copy(TigId(raw))?;
    }
    Ok(())
}

#[test]
fn append_mode_preserves_pending_version_content() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 1;
    store.insert(tig, false)?;
    store.close()?;

    // A writable session appends version-2 payloads, then a second Append
    // session keeps them while Write would have purged them.
    let mut store = TigStore::open(dir.path(), 1, OpenMode::Write)?;
    let mut tig = Tig::new();
    tig.id = Some(TigId(0));
    tig.source_id = 2;
    store.insert(tig, false)?;
    store.close()?;

    let v2_len = fs::metadata(dir.path().join("seqDB.v002.dat")).unwrap().len();
    let store = TigStore::open(dir.path(), 1, OpenMode::Append)?;
    store.close()?;
    assert_eq!(
        fs::metadata(dir.path().join("seqDB.v002.dat")).unwrap().len(),
        v2_len
    );
    Ok(())
}

#[test]
fn modify_mode_rewrites_the_open_version() -> Result<()> {
    let dir = tempdir().unwrap();

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut tig = Tig::new();
    tig.source_id = 1;
    store.insert(tig, false)?;
    store.close()?;

    let mut store = TigStore::open(dir.path(), 1, OpenMode::Modify)?;
    assert_eq!(store.current_version(), 1);
    let mut replacement = Tig::new();
    replacement.id = Some(TigId(0));
    replacement.source_id = 2;
    store.insert(replacement, false)?;
    store.close()?;

    let mut store = TigStore::open(dir.path(), 1, OpenMode::ReadOnly)?;
    assert_eq!(store.copy(TigId(0))?.source_id, 2);
    assert_eq!(store.version_of(TigId(0)), 1);
    Ok(())
}

#[test]
fn version_overflow_is_surfaced() -> Result<()> {
    let dir = tempdir().unwrap();

    // An empty index at the last representable version; advancing a real
    // store 1022 times would say the same thing much more slowly.
    fs::create_dir_all(dir.path()).unwrap();
    tigstore::index::SlotIndex::new().write(dir.path(), 1023)?;

    let err = TigStore::open(dir.path(), 1023, OpenMode::Write).unwrap_err();
    assert!(matches!(err, TigStoreError::VersionOverflow(_)));

    let mut store = TigStore::open(dir.path(), 1023, OpenMode::Modify)?;
    let err = store.next_version().unwrap_err();
    assert!(matches!(err, TigStoreError::VersionOverflow(_)));
    Ok(())
}

#[test]
fn truncated_data_file_is_detected_on_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(31);

    let mut store = TigStore::open(dir.path(), 0, OpenMode::Create)?;
    let mut last_len = 0;
    for _ in 0..3 {
        let tig = random_tig(&mut rng);
        last_len = tig.encoded_len() as u64;
        store.insert(tig, false)?;
    }
    store.close()?;

    // Cut into the final record's length prefix, as a crash mid-write would.
    let dat = dir.path().join("seqDB.v001.dat");
    let full = fs::metadata(&dat).unwrap().len();
    let last_offset = full - RECORD_PREFIX_LEN - last_len;
    fs::OpenOptions::new()
        .write(true)
        .open(&dat)
        .unwrap()
        .set_len(last_offset + 2)
        .unwrap();

    let err = TigStore::open(dir.path(), 1, OpenMode::ReadOnly).unwrap_err();
    assert!(matches!(err, TigStoreError::CorruptStore(_)));
    Ok(())
}

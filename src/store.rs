use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::datafile::{data_file_path, DataFile, RECORD_PREFIX_LEN};
use crate::error::{Result, TigStoreError};
use crate::index::{index_file_path, SlotIndex, MAX_VERSION};
use crate::tig::{Tig, TigClass, TigId};

/// How a store is opened: which version is read, which is written, and
/// whether the write target is purged first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Make a brand-new store writing version 1.
    Create,
    /// Read version v; no writes.
    ReadOnly,
    /// Read version v, write version v+1, purging v+1 first.
    Write,
    /// Read version v, write version v+1, preserving existing v+1 content.
    Append,
    /// Read and rewrite version v in place.
    Modify,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Disk-resident store of tigs with an in-memory metadata index and a cache
/// of live tig objects.
///
/// Ownership: `insert` consumes its argument; `load`/`load_mut` hand out
/// borrows of store-owned objects, valid until that id is unloaded or the
/// store closes; `copy` returns a caller-owned tig. The store is not
/// internally synchronized; callers with threads serialize access
/// themselves.
#[derive(Debug)]
pub struct TigStore {
    dir: PathBuf,
    mode: OpenMode,
    original_version: u32,
    current_version: u32,
    index: SlotIndex,
    cache: Vec<Option<Box<Tig>>>,
    data_files: BTreeMap<u32, DataFile>,
    closed: bool,
}

impl TigStore {
    /// Open the store at `path`. `version` is the version to read (ignored
    /// by `Create`, which always starts writing version 1).
    pub fn open(path: impl AsRef<Path>, version: u32, mode: OpenMode) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();

        if mode == OpenMode::Create {
            if version > 1 {
                return Err(TigStoreError::InvalidMode(
                    "Create always starts at version 1",
                ));
            }
            fs::create_dir_all(&dir)?;
            purge_version(&dir, 1)?;
            let store = Self {
                dir,
                mode,
                original_version: 1,
                current_version: 1,
                index: SlotIndex::new(),
                cache: Vec::new(),
                data_files: BTreeMap::new(),
                closed: false,
            };
            info!(path = %store.dir.display(), "store.create");
            return Ok(store);
        }

        if version == 0 || version > MAX_VERSION {
            return Err(TigStoreError::InvalidMode(
                "version to open must be between 1 and 1023",
            ));
        }
        if !index_file_path(&dir, version).exists() {
            return Err(TigStoreError::CorruptStore(format!(
                "no index for version {version} in {}",
                dir.display()
            )));
        }
        let index = SlotIndex::read(&dir, version)?;
        verify_slots(&index, &dir)?;

        let current_version = match mode {
            OpenMode::Create => unreachable!(),
            OpenMode::ReadOnly | OpenMode::Modify => version,
            OpenMode::Write | OpenMode::Append => {
                if version >= MAX_VERSION {
                    return Err(TigStoreError::VersionOverflow(MAX_VERSION));
                }
                version + 1
            }
        };
        if mode == OpenMode::Write {
            purge_version(&dir, current_version)?;
        }

        let mut cache = Vec::new();
        cache.resize_with(index.len() as usize, || None);
        let store = Self {
            dir,
            mode,
            original_version: version,
            current_version,
            index,
            cache,
            data_files: BTreeMap::new(),
            closed: false,
        };
        info!(
            path = %store.dir.display(),
            version,
            writing = store.current_version,
            ?mode,
            "store.open"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The version currently being read (read-only and modify) or written.
    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// The version the store was opened from.
    pub fn original_version(&self) -> u32 {
        self.original_version
    }

    pub fn num_tigs(&self) -> u32 {
        self.index.len()
    }

    /// Add or replace a tig, consuming it. With `keep_in_cache` the store
    /// takes the object into its cache and defers the disk write; otherwise
    /// the payload is written immediately.
    ///
    /// `tig.id` of `None` assigns the next dense identifier; an explicit id
    /// replaces that slot, clearing any deleted mark. The assigned id is
    /// returned.
    pub fn insert(&mut self, mut tig: Tig, keep_in_cache: bool) -> Result<TigId> {
        self.require_writable("insert")?;
        let id = tig.id.unwrap_or(TigId(self.index.len()));
        tig.id = Some(id);
        self.index.grow_for(id);
        self.cache.resize_with(self.index.len() as usize, || None);

        let slot = self.index.get_mut(id);
        slot.deleted = false;
        slot.sync_scalars_from(&tig);
        trace!(id = id.0, keep_in_cache, children = tig.children.len(), "store.insert");
        if keep_in_cache {
            // The old payload, if any, no longer describes this tig; the
            // slot points nowhere until the cached object is flushed.
            slot.clear_location();
            slot.flush_needed = true;
            self.cache[id.0 as usize] = Some(Box::new(tig));
        } else {
            slot.flush_needed = false;
            self.cache[id.0 as usize] = None;
            self.write_tig(id, &tig)?;
        }
        Ok(id)
    }

    /// Mark a tig deleted and drop any cached object without persisting it.
    /// The identifier is not reused; a later `insert` at the same id revives
    /// the slot with new content.
    pub fn delete(&mut self, id: TigId) -> Result<()> {
        self.require_writable("delete")?;
        self.check_id(id);
        self.cache[id.0 as usize] = None;
        let slot = self.index.get_mut(id);
        slot.flush_needed = false;
        slot.deleted = true;
        debug!(id = id.0, "store.delete");
        Ok(())
    }

    /// Load (and cache) the tig, returning a borrow of the store-owned
    /// object. Repeated loads return the same object until it is unloaded.
    pub fn load(&mut self, id: TigId) -> Result<&Tig> {
        self.ensure_cached(id)?;
        Ok(self.cache[id.0 as usize].as_deref().expect("just cached"))
    }

    /// Like `load`, but the borrow is mutable and the tig is marked as
    /// having pending changes, to be persisted on the next flush or unload.
    pub fn load_mut(&mut self, id: TigId) -> Result<&mut Tig> {
        self.require_writable("load_mut")?;
        self.ensure_cached(id)?;
        self.index.get_mut(id).flush_needed = true;
        Ok(self.cache[id.0 as usize].as_deref_mut().expect("just cached"))
    }

    /// Read and decode the tig into a caller-owned object, bypassing the
    /// cache entirely.
    pub fn copy(&mut self, id: TigId) -> Result<Tig> {
        self.check_id(id);
        let slot = self.index.get(id);
        if slot.deleted {
            return Err(TigStoreError::TigDeleted(id));
        }
        if !slot.has_payload() {
            return Err(TigStoreError::CorruptStore(format!(
                "tig {id} has no payload on disk"
            )));
        }
        let (version, offset) = (slot.version(), slot.offset());
        let bytes = self.data_file(version)?.read_record(offset)?;
        let mut tig = Tig::decode(id, &bytes)?;
        self.index.get(id).apply_scalars_to(&mut tig);
        Ok(tig)
    }

    /// Drop the cached object for `id`. Pending changes are persisted
    /// first unless `discard` is set, in which case they are lost.
    pub fn unload(&mut self, id: TigId, discard: bool) -> Result<()> {
        self.check_id(id);
        if self.cache[id.0 as usize].is_none() {
            return Ok(());
        }
        if !discard && self.index.get(id).flush_needed {
            self.flush_disk(id)?;
        }
        self.index.get_mut(id).flush_needed = false;
        self.cache[id.0 as usize] = None;
        trace!(id = id.0, discard, "store.unload");
        Ok(())
    }

    /// Persist one cached tig if it has pending changes.
    pub fn flush_disk(&mut self, id: TigId) -> Result<()> {
        self.check_id(id);
        if !self.index.get(id).flush_needed {
            return Ok(());
        }
        self.require_writable("flush_disk")?;
        let tig = self.cache[id.0 as usize]
            .take()
            .expect("flush_needed bit set without a cached tig");
        let result = self.write_tig(id, &tig);
        self.cache[id.0 as usize] = Some(tig);
        result
    }

    /// Persist every cached tig with pending changes.
    pub fn flush_disk_all(&mut self) -> Result<()> {
        for raw in 0..self.index.len() {
            self.flush_disk(TigId(raw))?;
        }
        Ok(())
    }

    /// Synonym for `unload`.
    pub fn flush_cache(&mut self, id: TigId, discard: bool) -> Result<()> {
        self.unload(id, discard)
    }

    /// Unload every cached tig, persisting pending changes first unless
    /// `discard` is set. Expensive; meant to reclaim memory before heavy
    /// external work.
    pub fn flush_cache_all(&mut self, discard: bool) -> Result<()> {
        if !discard {
            self.flush_disk_all()?;
        }
        for raw in 0..self.index.len() {
            let id = TigId(raw);
            self.index.get_mut(id).flush_needed = false;
            self.cache[raw as usize] = None;
        }
        debug!(discard, "store.flush_cache");
        Ok(())
    }

    /// Advance to the next version: flush pending tigs into the current
    /// data file, write the metadata index snapshot, then start a fresh
    /// data file. Slots keep their existing locations; only payloads
    /// rewritten afterwards carry the new version.
    pub fn next_version(&mut self) -> Result<()> {
        self.require_writable("next_version")?;
        if self.current_version >= MAX_VERSION {
            return Err(TigStoreError::VersionOverflow(MAX_VERSION));
        }
        self.flush_disk_all()?;
        if let Some(df) = self.data_files.get(&self.current_version) {
            df.sync()?;
        }
        self.index.write(&self.dir, self.current_version)?;
        self.current_version += 1;
        self.data_file(self.current_version)?;
        info!(version = self.current_version, "store.next_version");
        Ok(())
    }

    /// Flush pending state, write the index for the current version, and
    /// release all files. Dropping the store performs the same teardown on
    /// a best-effort basis.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    // Scalar accessors. These never touch the payload; identifiers out of
    // range are contract violations and abort.

    pub fn is_deleted(&self, id: TigId) -> bool {
        self.index.get(id).deleted
    }

    pub fn version_of(&self, id: TigId) -> u32 {
        self.index.get(id).version()
    }

    pub fn children_count(&self, id: TigId) -> u32 {
        self.index.get(id).children_len
    }

    pub fn source_id(&self, id: TigId) -> u32 {
        self.index.get(id).source_id
    }

    pub fn source_bgn(&self, id: TigId) -> u32 {
        self.index.get(id).source_bgn
    }

    pub fn source_end(&self, id: TigId) -> u32 {
        self.index.get(id).source_end
    }

    pub fn class(&self, id: TigId) -> TigClass {
        self.index.get(id).class
    }

    pub fn suggest_repeat(&self, id: TigId) -> bool {
        self.index.get(id).suggest_repeat
    }

    pub fn suggest_circular(&self, id: TigId) -> bool {
        self.index.get(id).suggest_circular
    }

    pub fn set_source_id(&mut self, id: TigId, value: u32) -> Result<()> {
        self.require_writable("set_source_id")?;
        self.check_id(id);
        self.index.get_mut(id).source_id = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.source_id = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    pub fn set_source_bgn(&mut self, id: TigId, value: u32) -> Result<()> {
        self.require_writable("set_source_bgn")?;
        self.check_id(id);
        self.index.get_mut(id).source_bgn = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.source_bgn = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    pub fn set_source_end(&mut self, id: TigId, value: u32) -> Result<()> {
        self.require_writable("set_source_end")?;
        self.check_id(id);
        self.index.get_mut(id).source_end = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.source_end = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    pub fn set_class(&mut self, id: TigId, value: TigClass) -> Result<()> {
        self.require_writable("set_class")?;
        self.check_id(id);
        self.index.get_mut(id).class = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.class = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    pub fn set_suggest_repeat(&mut self, id: TigId, value: bool) -> Result<()> {
        self.require_writable("set_suggest_repeat")?;
        self.check_id(id);
        self.index.get_mut(id).suggest_repeat = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.suggest_repeat = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    pub fn set_suggest_circular(&mut self, id: TigId, value: bool) -> Result<()> {
        self.require_writable("set_suggest_circular")?;
        self.check_id(id);
        self.index.get_mut(id).suggest_circular = value;
        if let Some(tig) = self.cache[id.0 as usize].as_deref_mut() {
            tig.suggest_circular = value;
        }
        self.mark_dirty_if_cached(id);
        Ok(())
    }

    fn check_id(&self, id: TigId) {
        assert!(id.0 < self.index.len(), "tig {id} out of range");
    }

    fn require_writable(&self, what: &'static str) -> Result<()> {
        if self.mode.writable() {
            Ok(())
        } else {
            Err(TigStoreError::InvalidMode(what))
        }
    }

    fn mark_dirty_if_cached(&mut self, id: TigId) {
        if self.cache[id.0 as usize].is_some() {
            self.index.get_mut(id).flush_needed = true;
        }
    }

    fn ensure_cached(&mut self, id: TigId) -> Result<()> {
        self.check_id(id);
        let slot = self.index.get(id);
        if slot.deleted {
            return Err(TigStoreError::TigDeleted(id));
        }
        if self.cache[id.0 as usize].is_some() {
            return Ok(());
        }
        if !slot.has_payload() {
            return Err(TigStoreError::CorruptStore(format!(
                "tig {id} has no payload on disk"
            )));
        }
        let (version, offset) = (slot.version(), slot.offset());
        let bytes = self.data_file(version)?.read_record(offset)?;
        let mut tig = Tig::decode(id, &bytes)?;
        self.index.get(id).apply_scalars_to(&mut tig);
        self.cache[id.0 as usize] = Some(Box::new(tig));
        trace!(id = id.0, version, offset, "store.load");
        Ok(())
    }

    /// Encode and append the payload to the current data file, then point
    /// the slot at it. The slot's scalars are refreshed from the tig so the
    /// embedded copy matches what was written.
    fn write_tig(&mut self, id: TigId, tig: &Tig) -> Result<()> {
        let bytes = tig.encode();
        let version = self.current_version;
        let offset = self.data_file(version)?.append(&bytes)?;
        let slot = self.index.get_mut(id);
        slot.sync_scalars_from(tig);
        slot.set_location(version, offset);
        slot.flush_needed = false;
        trace!(id = id.0, version, offset, len = bytes.len(), "store.write");
        Ok(())
    }

    fn data_file(&mut self, version: u32) -> Result<&mut DataFile> {
        match self.data_files.entry(version) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let writable = self.mode.writable() && version == self.current_version;
                let df = if writable {
                    DataFile::open_rw(&self.dir, version)?
                } else {
                    DataFile::open_ro(&self.dir, version)?
                };
                Ok(entry.insert(df))
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.mode.writable() {
            self.flush_disk_all()?;
            for df in self.data_files.values() {
                df.sync()?;
            }
            self.index.write(&self.dir, self.current_version)?;
        }
        self.cache.clear();
        self.data_files.clear();
        debug!(path = %self.dir.display(), "store.close");
        Ok(())
    }
}

impl Drop for TigStore {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.teardown() {
                warn!(%err, "store teardown failed during drop");
            }
        }
    }
}

fn purge_version(dir: &Path, version: u32) -> Result<()> {
    for path in [index_file_path(dir, version), data_file_path(dir, version)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Reopen-time recovery check: no slot may reference past the end of its
/// data file, as a process killed mid-write can leave a partial record at
/// the tail.
fn verify_slots(index: &SlotIndex, dir: &Path) -> Result<()> {
    let mut file_lens: BTreeMap<u32, u64> = BTreeMap::new();
    for (id, slot) in index.iter() {
        if slot.deleted || !slot.has_payload() {
            continue;
        }
        let version = slot.version();
        let len = match file_lens.entry(version) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let len = fs::metadata(data_file_path(dir, version))
                    .map(|m| m.len())
                    .unwrap_or(0);
                *entry.insert(len)
            }
        };
        if slot.offset() + RECORD_PREFIX_LEN > len {
            return Err(TigStoreError::CorruptStore(format!(
                "tig {id} references version {version} offset {} past end of data file ({len} bytes)",
                slot.offset()
            )));
        }
    }
    Ok(())
}

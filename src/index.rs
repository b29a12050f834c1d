use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TigStoreError};
use crate::tig::{Tig, TigClass, TigId};

pub const INDEX_MAGIC: [u8; 8] = *b"tgStore1";
pub const SLOT_LEN: usize = 28;
const INDEX_HEADER_LEN: usize = 16;

/// Slot versions are 10 bits; a store can hold at most this many versions.
pub const MAX_VERSION: u32 = (1 << 10) - 1;
/// Payload offsets are 40 bits, capping each data file at 1 TiB.
pub const MAX_OFFSET: u64 = (1 << 40) - 1;
/// Version 0 never owns a data file; a slot carrying it has no payload yet.
pub const NO_VERSION: u32 = 0;

// The packed location word, most significant bits first: 10-bit version,
// 40-bit offset, 14-bit reserved (written zero, ignored on read). The file
// format fixes these positions; never rely on compiler bitfield layout.
const VERSION_SHIFT: u32 = 54;
const OFFSET_SHIFT: u32 = 14;

const FLAG_REPEAT: u8 = 1 << 0;
const FLAG_CIRCULAR: u8 = 1 << 1;
const FLAG_DELETED: u8 = 1 << 2;

/// Fixed-size metadata for one tig identifier: an embedded copy of the
/// scalar header attributes, lifecycle bits, and the packed payload
/// location. Scalars are readable and writable without touching the
/// payload; the embedded copy is authoritative over the payload header.
#[derive(Clone, Debug)]
pub struct TigSlot {
    pub source_id: u32,
    pub source_bgn: u32,
    pub source_end: u32,
    pub children_len: u32,
    pub class: TigClass,
    pub suggest_repeat: bool,
    pub suggest_circular: bool,
    pub deleted: bool,
    /// Memory-only: the cached tig has changes not yet persisted.
    pub flush_needed: bool,
    location: u64,
}

impl TigSlot {
    /// A placeholder for an identifier that has never held content.
    pub fn vacant() -> Self {
        Self {
            source_id: 0,
            source_bgn: 0,
            source_end: 0,
            children_len: 0,
            class: TigClass::Unset,
            suggest_repeat: false,
            suggest_circular: false,
            deleted: true,
            flush_needed: false,
            location: 0,
        }
    }

    pub fn version(&self) -> u32 {
        (self.location >> VERSION_SHIFT) as u32
    }

    pub fn offset(&self) -> u64 {
        (self.location >> OFFSET_SHIFT) & MAX_OFFSET
    }

    pub fn has_payload(&self) -> bool {
        self.version() != NO_VERSION
    }

    pub fn set_location(&mut self, version: u32, offset: u64) {
        assert!(version <= MAX_VERSION, "slot version exceeds 10 bits");
        assert!(offset <= MAX_OFFSET, "slot offset exceeds 40 bits");
        self.location = (u64::from(version) << VERSION_SHIFT) | (offset << OFFSET_SHIFT);
    }

    /// Detach the slot from any on-disk payload; `has_payload` reports
    /// false until the next `set_location`.
    pub fn clear_location(&mut self) {
        self.location = 0;
    }

    /// Copy the scalar attributes out of a tig, as done whenever its payload
    /// is written. `children_len` is derived, never set independently.
    pub fn sync_scalars_from(&mut self, tig: &Tig) {
        self.source_id = tig.source_id;
        self.source_bgn = tig.source_bgn;
        self.source_end = tig.source_end;
        self.class = tig.class;
        self.suggest_repeat = tig.suggest_repeat;
        self.suggest_circular = tig.suggest_circular;
        self.children_len = tig.children.len() as u32;
    }

    /// Overlay the embedded scalars onto a freshly decoded tig, so callers
    /// observe scalar mutations that never rewrote the payload.
    pub fn apply_scalars_to(&self, tig: &mut Tig) {
        tig.source_id = self.source_id;
        tig.source_bgn = self.source_bgn;
        tig.source_end = self.source_end;
        tig.class = self.class;
        tig.suggest_repeat = self.suggest_repeat;
        tig.suggest_circular = self.suggest_circular;
    }

    fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SLOT_LEN);
        buf[0..4].copy_from_slice(&self.source_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.source_bgn.to_le_bytes());
        buf[8..12].copy_from_slice(&self.source_end.to_le_bytes());
        buf[12..16].copy_from_slice(&self.children_len.to_le_bytes());
        buf[16] = self.class.to_byte();
        let mut flags = 0u8;
        if self.suggest_repeat {
            flags |= FLAG_REPEAT;
        }
        if self.suggest_circular {
            flags |= FLAG_CIRCULAR;
        }
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        buf[17] = flags;
        buf[18..20].fill(0);
        buf[20..28].copy_from_slice(&self.location.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SLOT_LEN {
            return Err(TigStoreError::CorruptStore(
                "index slot truncated".to_string(),
            ));
        }
        let class = TigClass::from_byte(buf[16]).ok_or_else(|| {
            TigStoreError::CorruptStore(format!("index slot has unknown class tag {}", buf[16]))
        })?;
        let flags = buf[17];
        let raw = u64::from_le_bytes(buf[20..28].try_into().expect("slice is 8 bytes"));
        let version = (raw >> VERSION_SHIFT) as u32;
        let offset = (raw >> OFFSET_SHIFT) & MAX_OFFSET;
        let mut slot = Self {
            source_id: u32::from_le_bytes(buf[0..4].try_into().expect("slice is 4 bytes")),
            source_bgn: u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes")),
            source_end: u32::from_le_bytes(buf[8..12].try_into().expect("slice is 4 bytes")),
            children_len: u32::from_le_bytes(buf[12..16].try_into().expect("slice is 4 bytes")),
            class,
            suggest_repeat: flags & FLAG_REPEAT != 0,
            suggest_circular: flags & FLAG_CIRCULAR != 0,
            deleted: flags & FLAG_DELETED != 0,
            flush_needed: false,
            location: 0,
        };
        slot.set_location(version, offset);
        Ok(slot)
    }
}

pub(crate) fn index_file_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("seqDB.v{version:03}.tig"))
}

/// The whole-store metadata index: one slot per tig identifier, dense from
/// zero, wholly resident. Grows as identifiers are assigned and never
/// shrinks within a session.
#[derive(Debug, Default)]
pub struct SlotIndex {
    slots: Vec<TigSlot>,
}

impl SlotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: TigId) -> &TigSlot {
        assert!(id.0 < self.len(), "tig {id} out of range");
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TigId) -> &mut TigSlot {
        assert!(id.0 < self.len(), "tig {id} out of range");
        &mut self.slots[id.0 as usize]
    }

    /// Extend the index so `id` is addressable. Identifiers skipped over
    /// become vacant (deleted) placeholders; gaps are never reused.
    pub fn grow_for(&mut self, id: TigId) {
        while self.slots.len() <= id.0 as usize {
            self.slots.push(TigSlot::vacant());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TigId, &TigSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (TigId(i as u32), slot))
    }

    /// Write the index blob for `version` atomically: serialize to a temp
    /// file in the store directory, sync, rename into place.
    pub fn write(&self, dir: &Path, version: u32) -> Result<()> {
        let mut blob = Vec::with_capacity(INDEX_HEADER_LEN + self.slots.len() * SLOT_LEN);
        blob.extend_from_slice(&INDEX_MAGIC);
        blob.extend_from_slice(&version.to_le_bytes());
        blob.extend_from_slice(&self.len().to_le_bytes());
        let mut buf = [0u8; SLOT_LEN];
        for slot in &self.slots {
            slot.encode_into(&mut buf);
            blob.extend_from_slice(&buf);
        }

        let target = index_file_path(dir, version);
        let staging = target.with_extension("tig.tmp");
        let mut file = fs::File::create(&staging)?;
        file.write_all(&blob)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &target)?;
        debug!(version, slots = self.len(), "index.write");
        Ok(())
    }

    /// Load the index blob for `version`.
    pub fn read(dir: &Path, version: u32) -> Result<Self> {
        let path = index_file_path(dir, version);
        let blob = fs::read(&path)?;
        if blob.len() < INDEX_HEADER_LEN {
            return Err(TigStoreError::CorruptStore(format!(
                "index file {} shorter than header",
                path.display()
            )));
        }
        if blob[0..8] != INDEX_MAGIC {
            return Err(TigStoreError::CorruptStore(format!(
                "index file {} has bad magic",
                path.display()
            )));
        }
        let stored_version =
            u32::from_le_bytes(blob[8..12].try_into().expect("slice is 4 bytes"));
        if stored_version != version {
            return Err(TigStoreError::CorruptStore(format!(
                "index file {} labeled version {stored_version}, expected {version}",
                path.display()
            )));
        }
        let count = u32::from_le_bytes(blob[12..16].try_into().expect("slice is 4 bytes"));
        let expected = INDEX_HEADER_LEN + count as usize * SLOT_LEN;
        if blob.len() != expected {
            return Err(TigStoreError::CorruptStore(format!(
                "index file {} holds {} bytes, expected {expected} for {count} slots",
                path.display(),
                blob.len()
            )));
        }
        let mut slots = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let at = INDEX_HEADER_LEN + i * SLOT_LEN;
            slots.push(TigSlot::decode(&blob[at..at + SLOT_LEN])?);
        }
        debug!(version, slots = count, "index.read");
        Ok(Self { slots })
    }
}

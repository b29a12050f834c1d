use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::datafile::{data_file_path, DataFile};
use crate::error::Result;
use crate::index::SlotIndex;
use crate::tig::TigId;

/// Outcome of compacting one version's payload file.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub version: u32,
    pub records_copied: u32,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub duration_ms: f64,
}

/// Rewrite the payload file for `version`, keeping only records the index
/// still references. Offline and privileged: the store must not be open.
///
/// The plan is every non-deleted slot whose payload lives in this version's
/// file; their records are streamed into a staging file, the slots are
/// repointed at the new offsets, and the data file and index are swapped in
/// by rename. Slots whose payload lives in another version are untouched,
/// so the result is an equivalent store.
pub fn compact_version(path: impl AsRef<Path>, version: u32) -> Result<CompactionReport> {
    let dir = path.as_ref();
    let start = Instant::now();

    let mut index = SlotIndex::read(dir, version)?;
    let plan: Vec<TigId> = index
        .iter()
        .filter(|(_, slot)| !slot.deleted && slot.version() == version)
        .map(|(id, _)| id)
        .collect();

    let target = data_file_path(dir, version);
    let bytes_before = match fs::metadata(&target) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && plan.is_empty() => {
            // Nothing referenced and nothing on disk for this version.
            return Ok(CompactionReport {
                version,
                records_copied: 0,
                bytes_before: 0,
                bytes_after: 0,
                duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
            });
        }
        Err(err) => return Err(err.into()),
    };

    let src = DataFile::open_ro(dir, version)?;
    let staging_path = target.with_extension("dat.compact");
    let mut staging = DataFile::create_at(&staging_path, version)?;
    let mut records_copied = 0u32;
    for id in plan {
        let bytes = src.read_record(index.get(id).offset())?;
        let offset = staging.append(&bytes)?;
        index.get_mut(id).set_location(version, offset);
        records_copied += 1;
    }
    staging.sync()?;
    let bytes_after = staging.len();
    drop(staging);
    drop(src);

    fs::rename(&staging_path, &target)?;
    index.write(dir, version)?;

    let report = CompactionReport {
        version,
        records_copied,
        bytes_before,
        bytes_after,
        duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
    };
    info!(
        version,
        records = report.records_copied,
        reclaimed = report.bytes_before.saturating_sub(report.bytes_after),
        "compaction.done"
    );
    Ok(report)
}

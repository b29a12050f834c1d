use std::cmp::Ordering;

use crate::error::Result;
use crate::store::TigStore;
use crate::tig::TigId;

/// A coordinate span on a tig. `bgn > end` encodes reverse orientation, the
/// convention assembly layouts use for reads placed on the opposite strand.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Interval {
    pub bgn: u32,
    pub end: u32,
}

impl Interval {
    pub fn new(bgn: u32, end: u32) -> Self {
        Self { bgn, end }
    }

    pub fn is_reverse(&self) -> bool {
        self.bgn > self.end
    }

    pub fn lo(&self) -> u32 {
        self.bgn.min(self.end)
    }

    pub fn hi(&self) -> u32 {
        self.bgn.max(self.end)
    }

    pub fn len(&self) -> u32 {
        self.hi() - self.lo()
    }

    pub fn is_empty(&self) -> bool {
        self.bgn == self.end
    }
}

/// One candidate placement of a read on a tig, produced from overlap
/// evidence by a placer sitting above the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadPlacement {
    /// The read this placement is for.
    pub read_id: u32,
    /// The already-placed read the evidence came through.
    pub ref_id: u32,
    pub tig_id: TigId,
    /// Overlapping-region cluster this placement belongs to; negative
    /// clusters are ignored by convention of the placer.
    pub cluster_id: i32,
    /// Position on the tig.
    pub position: Interval,
    /// Portion of the position confirmed by overlaps.
    pub verified: Interval,
    /// Portion of the read covered by the evidence.
    pub covered: Interval,
    pub f_coverage: f64,
    pub errors: f64,
    pub aligned: u32,
    /// First and last tig children supporting this placement.
    pub tig_fidx: u32,
    pub tig_lidx: u32,
}

impl ReadPlacement {
    pub fn new(read_id: u32) -> Self {
        Self {
            read_id,
            ref_id: 0,
            tig_id: TigId(0),
            cluster_id: 0,
            position: Interval::default(),
            verified: Interval::default(),
            covered: Interval::default(),
            f_coverage: 0.0,
            errors: 0.0,
            aligned: 0,
            tig_fidx: u32::MAX,
            tig_lidx: 0,
        }
    }

    /// Error rate over the aligned bases.
    pub fn erate(&self) -> f64 {
        if self.aligned == 0 {
            0.0
        } else {
            self.errors / f64::from(self.aligned)
        }
    }
}

/// Order placements so reads in the same region of the same tig become
/// adjacent: by tig, then orientation, then position. Ties are arbitrary.
pub fn by_location(a: &ReadPlacement, b: &ReadPlacement) -> Ordering {
    a.tig_id
        .cmp(&b.tig_id)
        .then_with(|| a.position.is_reverse().cmp(&b.position.is_reverse()))
        .then_with(|| a.position.bgn.cmp(&b.position.bgn))
        .then_with(|| a.position.end.cmp(&b.position.end))
}

/// Order placements by cluster, grouping the members of each overlapping
/// region together.
pub fn by_cluster(a: &ReadPlacement, b: &ReadPlacement) -> Ordering {
    a.cluster_id.cmp(&b.cluster_id)
}

/// Which placements a placer should report.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PlacementFilter {
    /// Only placements spanning the whole read.
    pub full_match: bool,
    /// Only placements fully contained in the tig.
    pub no_extend: bool,
}

impl PlacementFilter {
    pub fn all() -> Self {
        Self::default()
    }
}

/// The read-placement collaborator. Implementations consume assembled tigs
/// from the store and derive candidate placements from overlap evidence;
/// the clustering algorithm itself lives outside the store.
pub trait PlaceReads {
    fn place_read(
        &mut self,
        store: &mut TigStore,
        target: TigId,
        read_id: u32,
        filter: PlacementFilter,
    ) -> Result<Vec<ReadPlacement>>;
}

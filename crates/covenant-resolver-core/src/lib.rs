//! Legal-description normalization and parcel matching for transcribed deed covenants.
//!
//! The crate is pure: it never touches storage. Callers hand it parcel and covenant
//! records, it hands back join keys, index snapshots, match sets, and reports.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod candidates;
pub mod consensus;
pub mod geometry;
pub mod index;
pub mod matching;
pub mod model;
pub mod normalize;
mod parallel;

pub use candidates::{
    build_join_keys, covenant_candidates, parcel_candidates, CandidateMetadata, CandidateSource,
    JoinCandidate,
};
pub use consensus::{apply_matches, match_manual_covenant, merge_final, resolve_and_match, FootprintSource};
pub use geometry::ParcelGeometry;
pub use index::{IndexedParcel, JoinIndexArena, JoinLookup, ParcelLegal, WorkflowIndex};
pub use matching::{
    MatchEngine, MatchOptions, MatchReport, MatchReportEntry, MatchRequest, MatchRun, MatchTarget,
    PinnedParcel, RecordMatch,
};
pub use model::{
    CovenantFields, CrowdSubject, ExtraParcelCandidate, FieldScores, LegalDescription,
    ManualCorrection, ManualCovenant, ManualPinLink, ParcelFootprint, ParcelMatchSet,
};
pub use normalize::{get_block, get_lots, standardize_addition, BlockParse, BlockStyle, LotParse, LotStyle};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolverError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("workflow scope violation: index belongs to workflow {expected}, lookup asked for {found}")]
    WorkflowScope { expected: WorkflowId, found: WorkflowId },
    #[error("lookup error: {0}")]
    Lookup(String),
    #[error("geometry error: {0}")]
    Geometry(String),
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// One logical batch/jurisdiction. Join keys are never compared across workflows.
    WorkflowId
);
row_id!(ParcelId);
row_id!(SubjectId);
row_id!(ManualCovenantId);
row_id!(CorrectionId);
row_id!(ExtraCandidateId);
row_id!(PinLinkId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MatchRunId(pub Ulid);

impl MatchRunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MatchRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MatchRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

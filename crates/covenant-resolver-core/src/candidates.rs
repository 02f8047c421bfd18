//! Join-key generation shared by the parcel side and the covenant side.
//!
//! Both sides go through [`build_join_keys`], so a parcel and a covenant
//! describing the same land produce byte-identical keys.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::index::ParcelLegal;
use crate::model::LegalDescription;
use crate::normalize::{get_block, get_lots, standardize_addition, BlockStyle, LotStyle};

/// Where a join candidate came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// The record's own addition/block/lot.
    Primary,
    PlatAlternateName,
    ManualParcelCandidate,
    ExtraParcelCandidate,
    ManualPinLink,
}

impl CandidateSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PlatAlternateName => "plat_alternate_name",
            Self::ManualParcelCandidate => "manual_parcel_candidate",
            Self::ExtraParcelCandidate => "extra_parcel_candidate",
            Self::ManualPinLink => "manual_pin_link",
        }
    }

    /// # Errors
    /// Returns an error string for unknown source names.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "primary" => Ok(Self::Primary),
            "plat_alternate_name" => Ok(Self::PlatAlternateName),
            "manual_parcel_candidate" => Ok(Self::ManualParcelCandidate),
            "extra_parcel_candidate" => Ok(Self::ExtraParcelCandidate),
            "manual_pin_link" => Ok(Self::ManualPinLink),
            _ => Err(format!("unsupported candidate source: {value}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateMetadata {
    /// Standardized addition the key was built from.
    pub addition: String,
    pub block_style: Option<BlockStyle>,
    pub lot_style: Option<LotStyle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JoinCandidate {
    pub join_key: String,
    pub source: CandidateSource,
    pub metadata: CandidateMetadata,
}

impl JoinCandidate {
    #[must_use]
    pub fn with_source(mut self, source: CandidateSource) -> Self {
        self.source = source;
        self
    }
}

/// Build `"{addition} block {block} lot {lot}"` keys, one per parsed lot.
///
/// Yields nothing when the addition standardizes to an empty string, the
/// block does not parse, or the lot does not parse. A partial answer would
/// produce keys that match the wrong land.
#[must_use]
pub fn build_join_keys(addition: Option<&str>, block: Option<&str>, lot: Option<&str>) -> Vec<JoinCandidate> {
    let addition = standardize_addition(addition);
    if addition.is_empty() {
        return Vec::new();
    }

    let block = get_block(block);
    let Some(block_key) = block.block else {
        return Vec::new();
    };

    let lots = get_lots(lot);
    let Some(lot_keys) = lots.lots else {
        return Vec::new();
    };

    let metadata = CandidateMetadata {
        addition: addition.clone(),
        block_style: block.style,
        lot_style: lots.style,
    };

    lot_keys
        .into_iter()
        .map(|lot_key| JoinCandidate {
            join_key: format!("{addition} block {block_key} lot {lot_key}"),
            source: CandidateSource::Primary,
            metadata: metadata.clone(),
        })
        .collect()
}

fn keys_for(legal: &LegalDescription, source: CandidateSource) -> impl Iterator<Item = JoinCandidate> {
    build_join_keys(legal.addition.as_deref(), legal.block.as_deref(), legal.lot.as_deref())
        .into_iter()
        .map(move |candidate| candidate.with_source(source))
}

/// Candidate keys for one parcel: its own plat name, each alternate plat
/// name, then each manual candidate. The first source to produce a key wins.
#[must_use]
pub fn parcel_candidates(parcel: &ParcelLegal) -> Vec<JoinCandidate> {
    let mut candidates = Vec::new();

    if parcel.lot.is_some() {
        candidates.extend(build_join_keys(
            parcel.plat_name.as_deref(),
            parcel.block.as_deref(),
            parcel.lot.as_deref(),
        ));
        for alternate in &parcel.alternate_additions {
            let legal = LegalDescription {
                addition: Some(alternate.clone()),
                block: parcel.block.clone(),
                lot: parcel.lot.clone(),
            };
            candidates.extend(keys_for(&legal, CandidateSource::PlatAlternateName));
        }
    }

    for manual in &parcel.manual_candidates {
        candidates.extend(keys_for(manual, CandidateSource::ManualParcelCandidate));
    }

    dedupe_by_key(candidates)
}

/// Candidate keys for one covenant record: the primary description, then
/// each extra description. Keys repeated across descriptions appear once.
#[must_use]
pub fn covenant_candidates(primary: Option<&LegalDescription>, extras: &[LegalDescription]) -> Vec<JoinCandidate> {
    let mut candidates = Vec::new();
    if let Some(primary) = primary {
        candidates.extend(keys_for(primary, CandidateSource::Primary));
    }
    for extra in extras {
        candidates.extend(keys_for(extra, CandidateSource::ExtraParcelCandidate));
    }
    dedupe_by_key(candidates)
}

fn dedupe_by_key(candidates: Vec<JoinCandidate>) -> Vec<JoinCandidate> {
    let mut seen = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.join_key.clone()))
        .collect()
}

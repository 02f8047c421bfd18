use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::geometry::ParcelGeometry;
use crate::matching::MatchTarget;
use crate::{
    CorrectionId, ExtraCandidateId, ManualCovenantId, ParcelId, PinLinkId, ResolverError, SubjectId,
    WorkflowId,
};

/// Addition, block, and lot as transcribed, before any normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LegalDescription {
    pub addition: Option<String>,
    pub block: Option<String>,
    pub lot: Option<String>,
}

impl LegalDescription {
    #[must_use]
    pub fn new(addition: Option<&str>, block: Option<&str>, lot: Option<&str>) -> Self {
        Self {
            addition: addition.map(ToString::to_string),
            block: block.map(ToString::to_string),
            lot: lot.map(ToString::to_string),
        }
    }
}

/// The covenant fields captured per deed. Used for crowd consensus values,
/// correction overrides, and the resolved final values alike.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CovenantFields {
    pub bool_covenant: Option<bool>,
    pub covenant_text: Option<String>,
    pub addition: Option<String>,
    pub lot: Option<String>,
    pub block: Option<String>,
    pub seller: Option<String>,
    pub buyer: Option<String>,
    /// ISO date, `YYYY-MM-DD`.
    pub deed_date: Option<String>,
}

impl CovenantFields {
    /// # Errors
    /// Returns `ResolverError::Validation` when `deed_date` is present but not
    /// a calendar date in `YYYY-MM-DD` form.
    pub fn validate(&self) -> Result<(), ResolverError> {
        let Some(deed_date) = self.deed_date.as_deref() else {
            return Ok(());
        };
        let format = time::format_description::parse("[year]-[month]-[day]")
            .map_err(|err| ResolverError::Validation(format!("invalid date format description: {err}")))?;
        time::Date::parse(deed_date.trim(), &format)
            .map(|_| ())
            .map_err(|err| ResolverError::Validation(format!("deed_date {deed_date:?} is not YYYY-MM-DD: {err}")))
    }

    #[must_use]
    pub fn legal_description(&self) -> LegalDescription {
        LegalDescription {
            addition: self.addition.clone(),
            block: self.block.clone(),
            lot: self.lot.clone(),
        }
    }
}

/// Crowd agreement scores, carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldScores {
    pub bool_covenant: Option<f64>,
    pub covenant_text: Option<f64>,
    pub addition: Option<f64>,
    pub lot: Option<f64>,
    pub block: Option<f64>,
    pub seller: Option<f64>,
    pub buyer: Option<f64>,
    pub deed_date_overall: Option<f64>,
    pub median: Option<f64>,
}

/// Parcel data the resolver needs once a match is known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParcelFootprint {
    pub parcel_id: ParcelId,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub geometry: Option<ParcelGeometry>,
}

/// Parcels matched to one covenant record plus everything derived from them.
///
/// The derived fields are only ever written together with the parcel set, so
/// `has_parcel_match` cannot drift from `matched_parcels`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParcelMatchSet {
    matched_parcels: BTreeSet<ParcelId>,
    has_parcel_match: bool,
    geometry_union: Option<ParcelGeometry>,
    parcel_addresses: Vec<String>,
    parcel_cities: Vec<String>,
}

impl ParcelMatchSet {
    /// Replace the match set with `footprints` and recompute the union,
    /// address list, and city list.
    pub fn set_matches(&mut self, footprints: &[ParcelFootprint]) {
        self.matched_parcels = footprints.iter().map(|footprint| footprint.parcel_id).collect();
        self.has_parcel_match = !self.matched_parcels.is_empty();
        self.geometry_union =
            ParcelGeometry::union_all(footprints.iter().filter_map(|footprint| footprint.geometry.as_ref()));
        self.parcel_addresses = distinct_sorted(footprints.iter().map(|footprint| &footprint.street_address));
        self.parcel_cities = distinct_sorted(footprints.iter().map(|footprint| &footprint.city));
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Rehydrate a persisted match set.
    #[must_use]
    pub fn restore(
        matched_parcels: BTreeSet<ParcelId>,
        geometry_union: Option<ParcelGeometry>,
        parcel_addresses: Vec<String>,
        parcel_cities: Vec<String>,
    ) -> Self {
        Self {
            has_parcel_match: !matched_parcels.is_empty(),
            matched_parcels,
            geometry_union,
            parcel_addresses,
            parcel_cities,
        }
    }

    #[must_use]
    pub fn matched_parcels(&self) -> &BTreeSet<ParcelId> {
        &self.matched_parcels
    }

    #[must_use]
    pub fn has_parcel_match(&self) -> bool {
        self.has_parcel_match
    }

    #[must_use]
    pub fn geometry_union(&self) -> Option<&ParcelGeometry> {
        self.geometry_union.as_ref()
    }

    #[must_use]
    pub fn parcel_addresses(&self) -> &[String] {
        &self.parcel_addresses
    }

    #[must_use]
    pub fn parcel_cities(&self) -> &[String] {
        &self.parcel_cities
    }
}

fn distinct_sorted<'a>(values: impl Iterator<Item = &'a Option<String>>) -> Vec<String> {
    values
        .flatten()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// One crowd-transcribed deed page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrowdSubject {
    pub id: SubjectId,
    pub workflow_id: WorkflowId,
    pub zoon_subject_id: i64,
    pub raw: CovenantFields,
    pub scores: FieldScores,
    pub final_values: CovenantFields,
    pub has_manual_correction: bool,
    pub matches: ParcelMatchSet,
}

impl CrowdSubject {
    /// Only confirmed covenants are matched against parcels.
    #[must_use]
    pub fn is_match_eligible(&self) -> bool {
        self.final_values.bool_covenant == Some(true)
    }
}

/// Reviewer overrides for a subject. A `None` field keeps the crowd value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualCorrection {
    pub id: CorrectionId,
    pub subject_id: SubjectId,
    pub fields: CovenantFields,
    pub comments: Option<String>,
}

/// Additional legal description recorded for a subject whose deed covers
/// more than one addition/block/lot combination.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExtraParcelCandidate {
    pub id: ExtraCandidateId,
    pub subject_id: SubjectId,
    pub legal: LegalDescription,
    pub comments: Option<String>,
}

/// A covenant entered by hand, outside the crowd pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualCovenant {
    pub id: ManualCovenantId,
    pub workflow_id: WorkflowId,
    pub bool_confirmed: bool,
    pub fields: CovenantFields,
    pub doc_num: Option<String>,
    pub city: Option<String>,
    pub comments: Option<String>,
    pub matches: ParcelMatchSet,
}

impl ManualCovenant {
    #[must_use]
    pub fn is_match_eligible(&self) -> bool {
        self.bool_confirmed
    }
}

/// Ties a covenant record directly to a parcel by PIN, bypassing the
/// legal-description join.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ManualPinLink {
    pub id: PinLinkId,
    pub target: MatchTarget,
    pub parcel_pin: String,
    pub comments: Option<String>,
}

//! Final-value resolution: crowd consensus overlaid with reviewer
//! corrections, followed by a single-record re-match.

use std::collections::{BTreeMap, BTreeSet};

use crate::index::JoinLookup;
use crate::matching::{MatchEngine, MatchOptions, MatchReport, MatchRequest, MatchTarget, PinnedParcel};
use crate::model::{
    CovenantFields, CrowdSubject, ExtraParcelCandidate, ManualCorrection, ManualCovenant, ParcelFootprint,
    ParcelMatchSet,
};
use crate::{ParcelId, ResolverError};

/// Supplies addresses, cities, and geometry for matched parcels.
pub trait FootprintSource {
    /// # Errors
    /// Returns `ResolverError::Lookup` when a parcel cannot be read.
    fn footprints(&self, parcel_ids: &BTreeSet<ParcelId>) -> Result<Vec<ParcelFootprint>, ResolverError>;
}

impl FootprintSource for BTreeMap<ParcelId, ParcelFootprint> {
    fn footprints(&self, parcel_ids: &BTreeSet<ParcelId>) -> Result<Vec<ParcelFootprint>, ResolverError> {
        parcel_ids
            .iter()
            .map(|parcel_id| {
                self.get(parcel_id)
                    .cloned()
                    .ok_or_else(|| ResolverError::Lookup(format!("parcel not found: {parcel_id}")))
            })
            .collect()
    }
}

/// Overlay `correction` on `raw` field by field.
///
/// A text override counts only when it is non-blank; boolean and date
/// overrides count whenever present. Without a correction the crowd values
/// pass through unchanged.
#[must_use]
pub fn merge_final(raw: &CovenantFields, correction: Option<&CovenantFields>) -> CovenantFields {
    let Some(correction) = correction else {
        return raw.clone();
    };

    CovenantFields {
        bool_covenant: correction.bool_covenant.or(raw.bool_covenant),
        covenant_text: text_override(correction.covenant_text.as_deref(), raw.covenant_text.as_deref()),
        addition: text_override(correction.addition.as_deref(), raw.addition.as_deref()),
        lot: text_override(correction.lot.as_deref(), raw.lot.as_deref()),
        block: text_override(correction.block.as_deref(), raw.block.as_deref()),
        seller: text_override(correction.seller.as_deref(), raw.seller.as_deref()),
        buyer: text_override(correction.buyer.as_deref(), raw.buyer.as_deref()),
        deed_date: correction.deed_date.clone().or_else(|| raw.deed_date.clone()),
    }
}

fn text_override(correction: Option<&str>, raw: Option<&str>) -> Option<String> {
    correction
        .filter(|value| !value.trim().is_empty())
        .or(raw)
        .map(ToString::to_string)
}

/// Replace `set` with `parcels`, pulling footprints for the derived fields.
///
/// # Errors
/// Propagates footprint lookup failures; `set` is untouched on error.
pub fn apply_matches<F: FootprintSource + ?Sized>(
    set: &mut ParcelMatchSet,
    parcels: &BTreeSet<ParcelId>,
    footprints: &F,
) -> Result<(), ResolverError> {
    let resolved = if parcels.is_empty() {
        Vec::new()
    } else {
        footprints.footprints(parcels)?
    };
    set.set_matches(&resolved);
    Ok(())
}

/// Recompute a subject's final values and re-match only that subject.
///
/// Ineligible subjects (final `bool_covenant` not true) have their matches
/// cleared and produce an empty report.
///
/// # Errors
/// Returns `ResolverError::Validation` when the correction or an extra
/// candidate belongs to another subject, plus any lookup error.
pub fn resolve_and_match<L, F>(
    subject: &mut CrowdSubject,
    correction: Option<&ManualCorrection>,
    extras: &[ExtraParcelCandidate],
    pins: &[PinnedParcel],
    lookup: &L,
    footprints: &F,
) -> Result<MatchReport, ResolverError>
where
    L: JoinLookup + ?Sized,
    F: FootprintSource + ?Sized,
{
    if let Some(correction) = correction.filter(|correction| correction.subject_id != subject.id) {
        return Err(ResolverError::Validation(format!(
            "correction {} belongs to subject {}, not {}",
            correction.id, correction.subject_id, subject.id
        )));
    }
    if let Some(extra) = extras.iter().find(|extra| extra.subject_id != subject.id) {
        return Err(ResolverError::Validation(format!(
            "extra parcel candidate {} belongs to subject {}, not {}",
            extra.id, extra.subject_id, subject.id
        )));
    }

    subject.final_values = merge_final(&subject.raw, correction.map(|correction| &correction.fields));
    subject.has_manual_correction = correction.is_some();

    if !subject.is_match_eligible() {
        tracing::debug!(subject_id = %subject.id, "subject is not a confirmed covenant; clearing matches");
        subject.matches.clear();
        return Ok(MatchReport::default());
    }

    let request = MatchRequest {
        target: MatchTarget::Subject(subject.id),
        workflow_id: subject.workflow_id,
        primary: Some(subject.final_values.legal_description()),
        extras: extras.iter().map(|extra| extra.legal.clone()).collect(),
        pins: pins.to_vec(),
    };
    let record = MatchEngine::new(lookup, subject.workflow_id, MatchOptions { workers: 1 }).match_record(&request)?;
    apply_matches(&mut subject.matches, &record.parcels, footprints)?;

    Ok(MatchReport { entries: record.entries })
}

/// Re-match one manual covenant. Unconfirmed covenants have their matches
/// cleared.
///
/// # Errors
/// Propagates lookup and footprint errors.
pub fn match_manual_covenant<L, F>(
    covenant: &mut ManualCovenant,
    pins: &[PinnedParcel],
    lookup: &L,
    footprints: &F,
) -> Result<MatchReport, ResolverError>
where
    L: JoinLookup + ?Sized,
    F: FootprintSource + ?Sized,
{
    if !covenant.is_match_eligible() {
        covenant.matches.clear();
        return Ok(MatchReport::default());
    }

    let request = MatchRequest {
        target: MatchTarget::ManualCovenant(covenant.id),
        workflow_id: covenant.workflow_id,
        primary: Some(covenant.fields.legal_description()),
        extras: Vec::new(),
        pins: pins.to_vec(),
    };
    let record = MatchEngine::new(lookup, covenant.workflow_id, MatchOptions { workers: 1 }).match_record(&request)?;
    apply_matches(&mut covenant.matches, &record.parcels, footprints)?;

    Ok(MatchReport { entries: record.entries })
}

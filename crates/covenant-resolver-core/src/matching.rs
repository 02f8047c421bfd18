use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::thread;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::candidates::{covenant_candidates, CandidateMetadata, CandidateSource};
use crate::index::JoinLookup;
use crate::model::LegalDescription;
use crate::parallel::fan_out;
use crate::{ManualCovenantId, MatchRunId, ParcelId, ResolverError, SubjectId, WorkflowId};

/// A covenant record that can receive parcel matches. Serialized as
/// `subject:<id>` or `manual_covenant:<id>` so it can key JSON maps.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MatchTarget {
    Subject(SubjectId),
    ManualCovenant(ManualCovenantId),
}

impl Display for MatchTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subject(id) => write!(f, "subject:{id}"),
            Self::ManualCovenant(id) => write!(f, "manual_covenant:{id}"),
        }
    }
}

impl FromStr for MatchTarget {
    type Err = ResolverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ResolverError::Validation(format!("invalid match target: {value}"));
        let (kind, id) = value.split_once(':').ok_or_else(invalid)?;
        let id = id.parse::<i64>().map_err(|_| invalid())?;
        match kind {
            "subject" => Ok(Self::Subject(SubjectId(id))),
            "manual_covenant" => Ok(Self::ManualCovenant(ManualCovenantId(id))),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for MatchTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MatchTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A PIN link, already resolved against the parcel table. `parcel_id` is
/// `None` when no parcel in the workflow carries the PIN.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PinnedParcel {
    pub pin: String,
    pub parcel_id: Option<ParcelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchRequest {
    pub target: MatchTarget,
    pub workflow_id: WorkflowId,
    pub primary: Option<LegalDescription>,
    pub extras: Vec<LegalDescription>,
    pub pins: Vec<PinnedParcel>,
}

/// One attempted key (or PIN) and what it hit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchReportEntry {
    /// The join key, or `pin:<PIN>` for a PIN link.
    pub join_key: String,
    pub matched: bool,
    pub target: MatchTarget,
    pub source: CandidateSource,
    pub metadata: Option<CandidateMetadata>,
    pub parcel_matches: Vec<ParcelId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchReport {
    pub entries: Vec<MatchReportEntry>,
}

impl MatchReport {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn matched_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.matched).count()
    }

    #[must_use]
    pub fn unmatched_count(&self) -> usize {
        self.len() - self.matched_count()
    }
}

/// Matches for a single record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordMatch {
    pub target: MatchTarget,
    pub parcels: BTreeSet<ParcelId>,
    pub entries: Vec<MatchReportEntry>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MatchOptions {
    pub workers: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self { workers: thread::available_parallelism().map_or(1, NonZeroUsize::get) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRun {
    pub run_id: MatchRunId,
    pub workflow_id: WorkflowId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Every requested target, including those that matched nothing.
    pub matches: BTreeMap<MatchTarget, BTreeSet<ParcelId>>,
    pub report: MatchReport,
}

impl MatchRun {
    #[must_use]
    pub fn matched_record_count(&self) -> usize {
        self.matches.values().filter(|parcels| !parcels.is_empty()).count()
    }
}

/// Resolves covenant records to parcels through a [`JoinLookup`].
///
/// Every hit is kept: a key shared by several parcels matches all of them,
/// and the primary description, extra descriptions, and PIN links all add to
/// the same set.
pub struct MatchEngine<'a, L: JoinLookup + ?Sized> {
    lookup: &'a L,
    workflow_id: WorkflowId,
    options: MatchOptions,
}

impl<'a, L: JoinLookup + ?Sized> MatchEngine<'a, L> {
    #[must_use]
    pub fn new(lookup: &'a L, workflow_id: WorkflowId, options: MatchOptions) -> Self {
        Self { lookup, workflow_id, options }
    }

    /// Match one record: primary keys, then extra-description keys, then PIN
    /// links.
    ///
    /// # Errors
    /// Returns `ResolverError::WorkflowScope` when the record belongs to a
    /// different workflow than the engine, or any error from the lookup.
    pub fn match_record(&self, request: &MatchRequest) -> Result<RecordMatch, ResolverError> {
        if request.workflow_id != self.workflow_id {
            return Err(ResolverError::WorkflowScope {
                expected: self.workflow_id,
                found: request.workflow_id,
            });
        }

        let candidates = covenant_candidates(request.primary.as_ref(), &request.extras);
        let keys = candidates
            .iter()
            .map(|candidate| candidate.join_key.clone())
            .collect::<Vec<_>>();
        let hits = if keys.is_empty() {
            BTreeMap::new()
        } else {
            self.lookup.lookup(self.workflow_id, &keys)?
        };

        let mut parcels = BTreeSet::new();
        let mut entries = Vec::with_capacity(candidates.len() + request.pins.len());

        for candidate in candidates {
            let parcel_matches = hits
                .get(&candidate.join_key)
                .map(|rows| rows.iter().map(|row| row.parcel_id).collect::<Vec<_>>())
                .unwrap_or_default();
            if parcel_matches.is_empty() {
                tracing::debug!(target_record = %request.target, join_key = %candidate.join_key, "NO MATCH");
            } else {
                tracing::debug!(
                    target_record = %request.target,
                    join_key = %candidate.join_key,
                    parcels = parcel_matches.len(),
                    "MATCH"
                );
            }
            parcels.extend(parcel_matches.iter().copied());
            entries.push(MatchReportEntry {
                matched: !parcel_matches.is_empty(),
                join_key: candidate.join_key,
                target: request.target,
                source: candidate.source,
                metadata: Some(candidate.metadata),
                parcel_matches,
            });
        }

        for pinned in &request.pins {
            if pinned.parcel_id.is_none() {
                tracing::warn!(target_record = %request.target, pin = %pinned.pin, "pin link names no parcel in workflow");
            }
            parcels.extend(pinned.parcel_id);
            entries.push(MatchReportEntry {
                join_key: format!("pin:{}", pinned.pin),
                matched: pinned.parcel_id.is_some(),
                target: request.target,
                source: CandidateSource::ManualPinLink,
                metadata: None,
                parcel_matches: pinned.parcel_id.into_iter().collect(),
            });
        }

        Ok(RecordMatch { target: request.target, parcels, entries })
    }
}

impl<L: JoinLookup + Sync + ?Sized> MatchEngine<'_, L> {
    /// Match a batch of records across the configured workers.
    ///
    /// The report lists all primary-description attempts first, then extra
    /// descriptions, then PIN links, each group in request order.
    ///
    /// # Errors
    /// Returns the first error any record produced.
    pub fn run(&self, requests: &[MatchRequest]) -> Result<MatchRun, ResolverError> {
        let run_id = MatchRunId::new();
        let started_at = OffsetDateTime::now_utc();

        let records = fan_out(requests, self.options.workers, |request| self.match_record(request))
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut matches = BTreeMap::new();
        let mut report = MatchReport::default();
        for stage in [
            CandidateSource::Primary,
            CandidateSource::ExtraParcelCandidate,
            CandidateSource::ManualPinLink,
        ] {
            for record in &records {
                report
                    .entries
                    .extend(record.entries.iter().filter(|entry| entry.source == stage).cloned());
            }
        }
        for record in records {
            matches
                .entry(record.target)
                .or_insert_with(BTreeSet::new)
                .extend(record.parcels);
        }

        let run = MatchRun { run_id, workflow_id: self.workflow_id, started_at, matches, report };
        tracing::info!(
            run_id = %run.run_id,
            workflow_id = %run.workflow_id,
            records = requests.len(),
            matched_records = run.matched_record_count(),
            attempts = run.report.len(),
            hits = run.report.matched_count(),
            "match run finished"
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ParcelLegal, WorkflowIndex};

    fn parcel(id: i64, plat: &str, block: &str, lot: &str) -> ParcelLegal {
        ParcelLegal {
            parcel_id: ParcelId(id),
            plat_name: Some(plat.to_string()),
            block: Some(block.to_string()),
            lot: Some(lot.to_string()),
            ..ParcelLegal::default()
        }
    }

    fn janes_index() -> WorkflowIndex {
        WorkflowIndex::build(
            WorkflowId(1),
            &[
                parcel(1, "Jane's Addition", "1", "1"),
                parcel(2, "Janes Addition", "1", "2"),
                parcel(3, "Janes Addition", "1", "3"),
                parcel(4, "Oak Park", "2", "5"),
            ],
            2,
        )
    }

    fn request(id: i64, legal: Option<LegalDescription>) -> MatchRequest {
        MatchRequest {
            target: MatchTarget::Subject(SubjectId(id)),
            workflow_id: WorkflowId(1),
            primary: legal,
            extras: Vec::new(),
            pins: Vec::new(),
        }
    }

    fn ids(values: &[i64]) -> BTreeSet<ParcelId> {
        values.iter().copied().map(ParcelId).collect()
    }

    fn record(engine: &MatchEngine<'_, WorkflowIndex>, request: &MatchRequest) -> RecordMatch {
        match engine.match_record(request) {
            Ok(record) => record,
            Err(err) => panic!("match should succeed: {err}"),
        }
    }

    #[test]
    fn multi_lot_covenant_matches_every_lot() {
        let index = janes_index();
        let engine = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 });
        let legal = LegalDescription::new(Some("JANE'S ADDITION"), Some("1"), Some("1,2"));

        let matched = record(&engine, &request(10, Some(legal)));
        assert_eq!(matched.parcels, ids(&[1, 2]));
        assert_eq!(matched.entries.len(), 2);
        assert!(matched.entries.iter().all(|entry| entry.matched));
    }

    #[test]
    fn blank_or_none_lot_yields_no_keys_and_no_parcels() {
        let index = janes_index();
        let engine = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 });

        for lot in [Some(""), Some("   "), Some("none"), None] {
            let legal = LegalDescription::new(Some("Janes Addition"), Some("1"), lot);
            let matched = record(&engine, &request(10, Some(legal)));
            assert!(matched.parcels.is_empty(), "lot {lot:?} should match nothing");
            assert!(matched.entries.is_empty(), "lot {lot:?} should produce no join keys");
        }
    }

    #[test]
    fn extras_and_pins_add_to_primary_matches() {
        let index = janes_index();
        let engine = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 });
        let mut req = request(10, Some(LegalDescription::new(Some("Janes"), Some("1"), Some("1"))));
        req.extras = vec![
            LegalDescription::new(Some("Oak Park"), Some("2"), Some("5")),
            LegalDescription::new(Some("Janes Addition"), Some("1"), Some("1")),
        ];
        req.pins = vec![
            PinnedParcel { pin: "27-029-24-11-0001".to_string(), parcel_id: Some(ParcelId(3)) },
            PinnedParcel { pin: "missing".to_string(), parcel_id: None },
        ];

        let matched = record(&engine, &req);
        assert_eq!(matched.parcels, ids(&[1, 3, 4]));

        let keys = matched.entries.iter().map(|entry| entry.join_key.as_str()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            [
                "janes block 1 lot 1",
                "oak park block 2 lot 5",
                "pin:27-029-24-11-0001",
                "pin:missing",
            ]
        );
        assert!(!matched.entries[3].matched);
        assert_eq!(matched.entries[3].source, CandidateSource::ManualPinLink);
    }

    #[test]
    fn unparseable_record_matches_nothing_without_error() {
        let index = janes_index();
        let engine = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 });
        let legal = LegalDescription::new(Some("Janes"), Some("nonsense"), Some("1"));

        let matched = record(&engine, &request(10, Some(legal)));
        assert!(matched.parcels.is_empty());
        assert!(matched.entries.is_empty());
    }

    #[test]
    fn record_from_other_workflow_is_rejected() {
        let index = janes_index();
        let engine = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 });
        let mut req = request(10, None);
        req.workflow_id = WorkflowId(2);

        assert_eq!(
            engine.match_record(&req),
            Err(ResolverError::WorkflowScope { expected: WorkflowId(1), found: WorkflowId(2) })
        );
    }

    #[test]
    fn run_is_identical_for_any_worker_count_and_groups_report_by_stage() {
        let index = janes_index();
        let mut with_extra = request(2, Some(LegalDescription::new(Some("Janes"), Some("1"), Some("2"))));
        with_extra.extras = vec![LegalDescription::new(Some("Oak Park"), Some("2"), Some("5"))];
        let requests = vec![
            request(1, Some(LegalDescription::new(Some("Janes"), Some("1"), Some("1-3")))),
            with_extra,
            request(3, Some(LegalDescription::new(Some("Elm"), Some("1"), Some("1")))),
        ];

        let serial = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 1 }).run(&requests);
        let parallel = MatchEngine::new(&index, WorkflowId(1), MatchOptions { workers: 3 }).run(&requests);
        let (serial, parallel) = match (serial, parallel) {
            (Ok(serial), Ok(parallel)) => (serial, parallel),
            other => panic!("runs should succeed: {other:?}"),
        };

        assert_eq!(serial.matches, parallel.matches);
        assert_eq!(serial.report, parallel.report);
        assert_eq!(serial.matches[&MatchTarget::Subject(SubjectId(1))], ids(&[1, 2, 3]));
        assert_eq!(serial.matches[&MatchTarget::Subject(SubjectId(2))], ids(&[2, 4]));
        assert!(serial.matches[&MatchTarget::Subject(SubjectId(3))].is_empty());
        assert_eq!(serial.matched_record_count(), 2);

        let last = serial.report.entries.last().map(|entry| entry.source);
        assert_eq!(last, Some(CandidateSource::ExtraParcelCandidate));
        assert_eq!(serial.report.unmatched_count(), 1);
    }

    #[test]
    fn match_target_round_trips_as_string_key() {
        let target = MatchTarget::ManualCovenant(ManualCovenantId(8));
        assert_eq!(target.to_string(), "manual_covenant:8");
        assert_eq!("manual_covenant:8".parse::<MatchTarget>(), Ok(target));
        assert!("parcel:8".parse::<MatchTarget>().is_err());
        assert!("subject:x".parse::<MatchTarget>().is_err());
    }
}

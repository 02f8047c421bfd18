//! Per-workflow join index: join key -> parcels.
//!
//! An index is built off to the side and swapped in whole, so readers see
//! either the previous snapshot or the new one, never a half-built table.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::candidates::{parcel_candidates, CandidateMetadata, CandidateSource};
use crate::model::LegalDescription;
use crate::normalize::standardize_addition;
use crate::parallel::fan_out;
use crate::{ParcelId, ResolverError, WorkflowId};

/// Parcel legal description as the index builder sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParcelLegal {
    pub parcel_id: ParcelId,
    pub plat_name: Option<String>,
    pub block: Option<String>,
    pub lot: Option<String>,
    /// Standardized alternate plat names registered for this parcel's plat.
    pub alternate_additions: Vec<String>,
    pub manual_candidates: Vec<LegalDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexedParcel {
    pub parcel_id: ParcelId,
    pub join_key: String,
    pub plat_name_standardized: String,
    pub source: CandidateSource,
    pub metadata: CandidateMetadata,
}

/// Anything that can answer "which parcels carry these join keys".
pub trait JoinLookup {
    /// Keys with no parcel are absent from the returned map.
    ///
    /// # Errors
    /// Returns `ResolverError::WorkflowScope` when asked about a workflow the
    /// lookup does not hold, or `ResolverError::Lookup` when the backing
    /// storage fails.
    fn lookup(
        &self,
        workflow_id: WorkflowId,
        join_keys: &[String],
    ) -> Result<BTreeMap<String, Vec<IndexedParcel>>, ResolverError>;
}

/// Immutable snapshot of one workflow's join candidates, sorted by
/// `(join_key, parcel_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowIndex {
    workflow_id: WorkflowId,
    rows: Vec<IndexedParcel>,
    by_key: BTreeMap<String, Range<usize>>,
}

impl WorkflowIndex {
    /// Generate candidates for every parcel, fanning out over `workers`
    /// threads. The result is identical for any worker count.
    #[must_use]
    pub fn build(workflow_id: WorkflowId, parcels: &[ParcelLegal], workers: usize) -> Self {
        let per_parcel = fan_out(parcels, workers, |parcel| {
            let plat_name_standardized = standardize_addition(parcel.plat_name.as_deref());
            parcel_candidates(parcel)
                .into_iter()
                .map(|candidate| IndexedParcel {
                    parcel_id: parcel.parcel_id,
                    join_key: candidate.join_key,
                    plat_name_standardized: plat_name_standardized.clone(),
                    source: candidate.source,
                    metadata: candidate.metadata,
                })
                .collect::<Vec<_>>()
        });

        let index = Self::from_rows(workflow_id, per_parcel.into_iter().flatten().collect());
        tracing::info!(
            workflow_id = %workflow_id,
            parcels = parcels.len(),
            candidates = index.len(),
            "join index built"
        );
        index
    }

    /// Wrap rows loaded from storage.
    #[must_use]
    pub fn from_rows(workflow_id: WorkflowId, mut rows: Vec<IndexedParcel>) -> Self {
        rows.sort_by(|left, right| {
            (left.join_key.as_str(), left.parcel_id, left.source)
                .cmp(&(right.join_key.as_str(), right.parcel_id, right.source))
        });
        rows.dedup_by(|later, earlier| later.join_key == earlier.join_key && later.parcel_id == earlier.parcel_id);

        let mut by_key: BTreeMap<String, Range<usize>> = BTreeMap::new();
        for (position, row) in rows.iter().enumerate() {
            by_key
                .entry(row.join_key.clone())
                .and_modify(|range| range.end = position + 1)
                .or_insert(position..position + 1);
        }

        Self { workflow_id, rows, by_key }
    }

    #[must_use]
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    #[must_use]
    pub fn rows(&self) -> &[IndexedParcel] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn parcels_for(&self, join_key: &str) -> &[IndexedParcel] {
        match self.by_key.get(join_key) {
            Some(range) => &self.rows[range.clone()],
            None => &[],
        }
    }
}

impl JoinLookup for WorkflowIndex {
    fn lookup(
        &self,
        workflow_id: WorkflowId,
        join_keys: &[String],
    ) -> Result<BTreeMap<String, Vec<IndexedParcel>>, ResolverError> {
        if workflow_id != self.workflow_id {
            return Err(ResolverError::WorkflowScope { expected: self.workflow_id, found: workflow_id });
        }

        Ok(join_keys
            .iter()
            .filter_map(|key| {
                let parcels = self.parcels_for(key);
                (!parcels.is_empty()).then(|| (key.clone(), parcels.to_vec()))
            })
            .collect())
    }
}

/// Current index snapshot per workflow.
#[derive(Debug, Default)]
pub struct JoinIndexArena {
    indexes: RwLock<HashMap<WorkflowId, Arc<WorkflowIndex>>>,
}

impl JoinIndexArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh index for `workflow_id` and swap it in. Readers holding
    /// the previous snapshot keep it until they drop their `Arc`.
    pub fn rebuild(&self, workflow_id: WorkflowId, parcels: &[ParcelLegal], workers: usize) -> Arc<WorkflowIndex> {
        self.install(WorkflowIndex::build(workflow_id, parcels, workers))
    }

    pub fn install(&self, index: WorkflowIndex) -> Arc<WorkflowIndex> {
        let index = Arc::new(index);
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.workflow_id(), Arc::clone(&index));
        index
    }

    #[must_use]
    pub fn get(&self, workflow_id: WorkflowId) -> Option<Arc<WorkflowIndex>> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&workflow_id)
            .cloned()
    }

    pub fn remove(&self, workflow_id: WorkflowId) -> Option<Arc<WorkflowIndex>> {
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&workflow_id)
    }
}

impl JoinLookup for JoinIndexArena {
    fn lookup(
        &self,
        workflow_id: WorkflowId,
        join_keys: &[String],
    ) -> Result<BTreeMap<String, Vec<IndexedParcel>>, ResolverError> {
        match self.get(workflow_id) {
            Some(index) => index.lookup(workflow_id, join_keys),
            None => Err(ResolverError::Lookup(format!(
                "no join index has been built for workflow {workflow_id}"
            ))),
        }
    }
}

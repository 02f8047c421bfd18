use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use covenant_resolver_core::{
    standardize_addition, CandidateMetadata, CandidateSource, IndexedParcel, JoinLookup, ParcelId,
    ResolverError, WorkflowId, WorkflowIndex,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::parcels::parcel_legals;
use crate::{from_json, insert_rows_batched, placeholders, to_json, SqliteStore, MAX_BOUND_PARAMETERS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRebuildSummary {
    pub workflow_id: WorkflowId,
    pub parcels: usize,
    pub candidates: usize,
    pub distinct_keys: usize,
}

impl SqliteStore {
    /// Regenerate the workflow's join candidates from scratch.
    ///
    /// Generation runs in memory across the configured workers; the old rows
    /// are replaced inside one transaction, so concurrent readers see either
    /// the old index or the new one.
    ///
    /// # Errors
    /// Returns an error when the workflow does not exist or any write fails.
    /// The previous index stays in place on error.
    pub fn rebuild_join_index(&mut self, workflow_id: WorkflowId) -> Result<IndexRebuildSummary> {
        let workers = self.options.workers;
        let batch_size = self.options.insert_batch_size;
        let tx = self.write_transaction()?;
        ensure_workflow(&tx, workflow_id)?;

        let legals = parcel_legals(&tx, workflow_id)?;
        let index = WorkflowIndex::build(workflow_id, &legals, workers);

        {
            let mut refresh = tx.prepare_cached("UPDATE parcels SET plat_standardized = ?1 WHERE parcel_id = ?2")?;
            for legal in &legals {
                refresh.execute(params![
                    standardize_addition(legal.plat_name.as_deref()),
                    legal.parcel_id.0
                ])?;
            }
        }

        tx.execute("DELETE FROM parcel_join_candidates WHERE workflow_id = ?1", params![workflow_id.0])
            .context("failed to clear previous join candidates")?;

        let rows = index
            .rows()
            .iter()
            .map(|row| {
                Ok(vec![
                    Value::Integer(workflow_id.0),
                    Value::Integer(row.parcel_id.0),
                    Value::Text(row.plat_name_standardized.clone()),
                    Value::Text(row.join_key.clone()),
                    Value::Text(row.source.as_str().to_string()),
                    Value::Text(to_json(&row.metadata, "candidate metadata")?),
                ])
            })
            .collect::<Result<Vec<_>>>()?;
        insert_rows_batched(
            &tx,
            "parcel_join_candidates",
            &["workflow_id", "parcel_id", "plat_name_standardized", "join_key", "source", "metadata_json"],
            &rows,
            batch_size,
        )?;
        tx.commit().context("failed to commit join index rebuild")?;

        let summary = IndexRebuildSummary {
            workflow_id,
            parcels: legals.len(),
            candidates: index.len(),
            distinct_keys: index.key_count(),
        };
        self.arena.install(index);
        tracing::info!(
            workflow_id = %workflow_id,
            parcels = summary.parcels,
            candidates = summary.candidates,
            "join index rebuilt"
        );
        Ok(summary)
    }

    /// Read the persisted index and make it the current in-memory snapshot.
    ///
    /// # Errors
    /// Returns an error when candidate rows cannot be read or decoded.
    pub fn load_join_index(&self, workflow_id: WorkflowId) -> Result<Arc<WorkflowIndex>> {
        let rows = self.join_candidate_rows(workflow_id)?;
        Ok(self.arena.install(WorkflowIndex::from_rows(workflow_id, rows)))
    }

    /// The in-memory snapshot, loading it on first use.
    ///
    /// # Errors
    /// Same conditions as [`SqliteStore::load_join_index`].
    pub fn join_index(&self, workflow_id: WorkflowId) -> Result<Arc<WorkflowIndex>> {
        match self.arena.get(workflow_id) {
            Some(index) => Ok(index),
            None => self.load_join_index(workflow_id),
        }
    }

    /// Persisted candidate rows ordered by join key, then parcel.
    ///
    /// # Errors
    /// Returns an error when candidate rows cannot be read or decoded.
    pub fn join_candidate_rows(&self, workflow_id: WorkflowId) -> Result<Vec<IndexedParcel>> {
        let mut stmt = self.conn.prepare(
            "SELECT parcel_id, join_key, plat_name_standardized, source, metadata_json
             FROM parcel_join_candidates
             WHERE workflow_id = ?1
             ORDER BY join_key ASC, parcel_id ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id.0], CandidateRow::from_row)?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?.into_indexed()?);
        }
        Ok(candidates)
    }
}

pub(crate) fn ensure_workflow(conn: &Connection, workflow_id: WorkflowId) -> Result<()> {
    conn.query_row("SELECT 1 FROM workflows WHERE workflow_id = ?1", params![workflow_id.0], |_| Ok(()))
        .optional()
        .context("failed to query workflow")?
        .ok_or_else(|| anyhow!("workflow not found: {workflow_id}"))
}

struct CandidateRow {
    parcel_id: i64,
    join_key: String,
    plat_name_standardized: String,
    source: String,
    metadata_json: String,
}

impl CandidateRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            parcel_id: row.get(0)?,
            join_key: row.get(1)?,
            plat_name_standardized: row.get(2)?,
            source: row.get(3)?,
            metadata_json: row.get(4)?,
        })
    }

    fn into_indexed(self) -> Result<IndexedParcel> {
        Ok(IndexedParcel {
            parcel_id: ParcelId(self.parcel_id),
            join_key: self.join_key,
            plat_name_standardized: self.plat_name_standardized,
            source: CandidateSource::parse(&self.source).map_err(|err| anyhow!(err))?,
            metadata: from_json::<CandidateMetadata>(&self.metadata_json, "candidate metadata")?,
        })
    }
}

/// Answers join-key lookups from the persisted candidate table. Used for
/// single-record re-matching inside a write transaction.
pub struct SqlJoinLookup<'a> {
    conn: &'a Connection,
}

impl<'a> SqlJoinLookup<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query(&self, workflow_id: WorkflowId, join_keys: &[String]) -> Result<BTreeMap<String, Vec<IndexedParcel>>> {
        let keys = join_keys.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
        let mut hits: BTreeMap<String, Vec<IndexedParcel>> = BTreeMap::new();

        for chunk in keys.chunks(MAX_BOUND_PARAMETERS - 1) {
            let sql = format!(
                "SELECT parcel_id, join_key, plat_name_standardized, source, metadata_json
                 FROM parcel_join_candidates
                 WHERE workflow_id = ? AND join_key IN ({})
                 ORDER BY join_key ASC, parcel_id ASC",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let bound = std::iter::once(Value::Integer(workflow_id.0))
                .chain(chunk.iter().map(|key| Value::Text(key.clone())));
            let rows = stmt.query_map(params_from_iter(bound), CandidateRow::from_row)?;
            for row in rows {
                let indexed = row?.into_indexed()?;
                hits.entry(indexed.join_key.clone()).or_default().push(indexed);
            }
        }

        Ok(hits)
    }
}

impl JoinLookup for SqlJoinLookup<'_> {
    fn lookup(
        &self,
        workflow_id: WorkflowId,
        join_keys: &[String],
    ) -> Result<BTreeMap<String, Vec<IndexedParcel>>, ResolverError> {
        self.query(workflow_id, join_keys)
            .map_err(|err| ResolverError::Lookup(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{migrated_store, oak_park, parcel};
    use crate::NewAlternateName;

    #[test]
    fn rebuild_twice_yields_identical_candidates() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;

        let first_summary = store.rebuild_join_index(workflow)?;
        let first = store.join_candidate_rows(workflow)?;
        let second_summary = store.rebuild_join_index(workflow)?;
        let second = store.join_candidate_rows(workflow)?;

        assert_eq!(first_summary, second_summary);
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert_eq!(first_summary.distinct_keys, 8);
        Ok(())
    }

    #[test]
    fn persisted_index_matches_in_memory_snapshot() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;
        store.rebuild_join_index(workflow)?;

        let cached = store.join_index(workflow)?;
        let reloaded = store.load_join_index(workflow)?;
        assert_eq!(*cached, *reloaded);
        Ok(())
    }

    #[test]
    fn rebuild_picks_up_alternate_names_and_drops_removed_parcels() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;
        store.rebuild_join_index(workflow)?;

        store.add_plat_alternate_name(
            workflow,
            &NewAlternateName { plat_name: "Oak Park".to_string(), alternate_name: "Oak Pk Addition".to_string() },
        )?;
        store.conn.execute("DELETE FROM parcels WHERE pin_primary = 'P-8'", [])?;
        let summary = store.rebuild_join_index(workflow)?;

        assert_eq!(summary.parcels, 7);
        assert_eq!(summary.candidates, 14);
        let keys = store
            .join_candidate_rows(workflow)?
            .into_iter()
            .map(|row| row.join_key)
            .collect::<BTreeSet<_>>();
        assert!(keys.contains("oak pk block 1 lot 1"));
        assert!(!keys.contains("oak park block 1 lot 8"));
        Ok(())
    }

    #[test]
    fn sql_lookup_is_scoped_to_its_workflow() -> Result<()> {
        let mut store = migrated_store()?;
        let first = oak_park(&mut store, "First County")?;
        let second = store.create_workflow("Second County")?.workflow_id;
        store.insert_parcels(second, &[parcel("Q-1", "Oak Park", "1", "1", 0.0)?])?;
        store.rebuild_join_index(first)?;
        store.rebuild_join_index(second)?;

        let lookup = SqlJoinLookup::new(&store.conn);
        let key = vec!["oak park block 1 lot 1".to_string()];
        let from_first = lookup.lookup(first, &key)?;
        let from_second = lookup.lookup(second, &key)?;

        let pin_of = |hits: &BTreeMap<String, Vec<IndexedParcel>>| -> Result<Vec<String>> {
            hits.values()
                .flatten()
                .map(|row| {
                    store
                        .get_parcel(row.parcel_id)?
                        .map(|record| record.pin_primary)
                        .ok_or_else(|| anyhow!("parcel {} vanished", row.parcel_id))
                })
                .collect()
        };
        assert_eq!(pin_of(&from_first)?, ["P-1"]);
        assert_eq!(pin_of(&from_second)?, ["Q-1"]);
        Ok(())
    }

    #[test]
    fn rebuild_of_unknown_workflow_fails() -> Result<()> {
        let mut store = migrated_store()?;
        assert!(store.rebuild_join_index(WorkflowId(42)).is_err());
        Ok(())
    }
}

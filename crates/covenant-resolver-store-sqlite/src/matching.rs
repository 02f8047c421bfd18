use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use covenant_resolver_core::{
    apply_matches, merge_final, ManualCovenantId, MatchEngine, MatchOptions, MatchRequest, MatchRun, MatchTarget,
    ParcelMatchSet, SubjectId, WorkflowId,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::covenants::{
    active_correction, load_extras, load_manual_covenant, load_subject, persist_final_values, pinned_parcels,
    write_match_columns, MatchTables, HAS_COVENANT_EXPR, MANUAL_COVENANT_TABLES, SUBJECT_TABLES,
};
use crate::index::ensure_workflow;
use crate::parcels::SqlFootprints;
use crate::{insert_rows_batched, rfc3339, write_ndjson_file, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchRunSummary {
    pub run_id: String,
    pub workflow_id: WorkflowId,
    pub started_at: String,
    pub finished_at: String,
    pub subjects: usize,
    pub manual_covenants: usize,
    pub matched_records: usize,
    pub join_attempts: usize,
    pub join_hits: usize,
}

/// Where a run's NDJSON report landed and what it contains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchReportFile {
    pub path: PathBuf,
    pub sha256: String,
    pub entries: usize,
}

impl SqliteStore {
    /// Match every covenant record in a workflow against its join index.
    ///
    /// Final values are recomputed first, so the run reflects every
    /// correction on file. Matching reads the in-memory index snapshot and
    /// fans out across the configured workers; the results replace all of
    /// the workflow's match rows in a single transaction.
    ///
    /// # Errors
    /// Returns an error when the workflow is unknown, a record cannot be
    /// loaded, or any write fails. Existing matches stay in place on error.
    pub fn run_workflow_match(&mut self, workflow_id: WorkflowId, rebuild: bool) -> Result<(MatchRun, MatchRunSummary)> {
        if rebuild {
            self.rebuild_join_index(workflow_id)?;
        } else {
            ensure_workflow(&self.conn, workflow_id)?;
        }
        let index = self.load_join_index(workflow_id)?;
        let batch_size = self.options.insert_batch_size;
        let options = MatchOptions { workers: self.options.workers };

        let tx = self.write_transaction()?;
        let plan = plan_requests(&tx, workflow_id)?;

        let run = MatchEngine::new(&*index, workflow_id, options)
            .run(&plan.requests)
            .context("match run failed")?;

        clear_workflow_matches(&tx, workflow_id)?;

        let mut subject_rows = Vec::new();
        let mut manual_rows = Vec::new();
        for (target, parcels) in &run.matches {
            for parcel_id in parcels {
                match target {
                    MatchTarget::Subject(id) => subject_rows.push(vec![Value::Integer(id.0), Value::Integer(parcel_id.0)]),
                    MatchTarget::ManualCovenant(id) => {
                        manual_rows.push(vec![Value::Integer(id.0), Value::Integer(parcel_id.0)]);
                    }
                }
            }
        }
        insert_rows_batched(&tx, SUBJECT_TABLES.match_table, &["subject_id", "parcel_id"], &subject_rows, batch_size)?;
        insert_rows_batched(
            &tx,
            MANUAL_COVENANT_TABLES.match_table,
            &["manual_covenant_id", "parcel_id"],
            &manual_rows,
            batch_size,
        )?;

        let footprints = SqlFootprints::new(&tx);
        for (target, parcels) in &run.matches {
            let mut set = ParcelMatchSet::default();
            apply_matches(&mut set, parcels, &footprints)
                .with_context(|| format!("failed to load footprints for {target}"))?;
            let (tables, record_id) = tables_for(*target);
            write_match_columns(&tx, tables, record_id, &set)?;
        }
        for target in &plan.ineligible {
            let (tables, record_id) = tables_for(*target);
            write_match_columns(&tx, tables, record_id, &ParcelMatchSet::default())?;
        }

        tx.execute(
            &format!("UPDATE parcels SET has_covenant = {HAS_COVENANT_EXPR} WHERE workflow_id = ?1"),
            params![workflow_id.0],
        )
        .context("failed to refresh parcel has_covenant")?;
        tx.commit().context("failed to commit match run")?;

        let summary = MatchRunSummary {
            run_id: run.run_id.to_string(),
            workflow_id,
            started_at: rfc3339(run.started_at)?,
            finished_at: rfc3339(OffsetDateTime::now_utc())?,
            subjects: plan.subjects,
            manual_covenants: plan.manual_covenants,
            matched_records: run.matched_record_count(),
            join_attempts: run.report.len(),
            join_hits: run.report.matched_count(),
        };
        tracing::info!(
            run_id = %summary.run_id,
            workflow_id = %workflow_id,
            subjects = summary.subjects,
            manual_covenants = summary.manual_covenants,
            matched_records = summary.matched_records,
            "workflow match persisted"
        );
        Ok((run, summary))
    }
}

/// Write a run's report as `match_report_<workflow>_<run_id>.ndjson` under
/// `dir`, one entry per line.
///
/// # Errors
/// Returns an error when the directory or file cannot be written.
pub fn write_match_report(run: &MatchRun, dir: &Path) -> Result<MatchReportFile> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let path = dir.join(format!("match_report_{}_{}.ndjson", run.workflow_id, run.run_id));
    let (sha256, entries) = write_ndjson_file(&path, &run.report.entries)?;
    tracing::info!(path = %path.display(), entries, "wrote match report");
    Ok(MatchReportFile { path, sha256, entries })
}

struct RunPlan {
    requests: Vec<MatchRequest>,
    ineligible: Vec<MatchTarget>,
    subjects: usize,
    manual_covenants: usize,
}

fn plan_requests(conn: &Connection, workflow_id: WorkflowId) -> Result<RunPlan> {
    let mut plan = RunPlan { requests: Vec::new(), ineligible: Vec::new(), subjects: 0, manual_covenants: 0 };

    for subject_id in record_ids(conn, "subjects", "subject_id", workflow_id)? {
        let subject_id = SubjectId(subject_id);
        let Some(mut subject) = load_subject(conn, subject_id)? else {
            continue;
        };
        let correction = active_correction(conn, subject_id)?;
        subject.final_values = merge_final(&subject.raw, correction.as_ref().map(|correction| &correction.fields));
        subject.has_manual_correction = correction.is_some();
        persist_final_values(conn, &subject)?;
        plan.subjects += 1;

        let target = MatchTarget::Subject(subject_id);
        if !subject.is_match_eligible() {
            plan.ineligible.push(target);
            continue;
        }
        plan.requests.push(MatchRequest {
            target,
            workflow_id,
            primary: Some(subject.final_values.legal_description()),
            extras: load_extras(conn, subject_id)?.into_iter().map(|extra| extra.legal).collect(),
            pins: pinned_parcels(conn, workflow_id, target)?,
        });
    }

    for manual_id in record_ids(conn, "manual_covenants", "manual_covenant_id", workflow_id)? {
        let manual_id = ManualCovenantId(manual_id);
        let Some(covenant) = load_manual_covenant(conn, manual_id)? else {
            continue;
        };
        plan.manual_covenants += 1;

        let target = MatchTarget::ManualCovenant(manual_id);
        if !covenant.is_match_eligible() {
            plan.ineligible.push(target);
            continue;
        }
        plan.requests.push(MatchRequest {
            target,
            workflow_id,
            primary: Some(covenant.fields.legal_description()),
            extras: Vec::new(),
            pins: pinned_parcels(conn, workflow_id, target)?,
        });
    }

    Ok(plan)
}

fn record_ids(conn: &Connection, table: &str, id_column: &str, workflow_id: WorkflowId) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {id_column} FROM {table} WHERE workflow_id = ?1 ORDER BY {id_column} ASC"
    ))?;
    let rows = stmt.query_map(params![workflow_id.0], |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn clear_workflow_matches(conn: &Connection, workflow_id: WorkflowId) -> Result<()> {
    for tables in [&SUBJECT_TABLES, &MANUAL_COVENANT_TABLES] {
        conn.execute(
            &format!(
                "DELETE FROM {match_table} WHERE {id} IN (SELECT {id} FROM {record_table} WHERE workflow_id = ?1)",
                match_table = tables.match_table,
                id = tables.id_column,
                record_table = tables.record_table,
            ),
            params![workflow_id.0],
        )
        .with_context(|| format!("failed to clear {}", tables.match_table))?;
    }
    Ok(())
}

fn tables_for(target: MatchTarget) -> (&'static MatchTables, i64) {
    match target {
        MatchTarget::Subject(id) => (&SUBJECT_TABLES, id.0),
        MatchTarget::ManualCovenant(id) => (&MANUAL_COVENANT_TABLES, id.0),
    }
}

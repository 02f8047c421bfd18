//! Covenant records and the manual inputs that steer their matching. Every
//! write here re-resolves the affected record before its transaction commits.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use covenant_resolver_core::{
    match_manual_covenant, resolve_and_match, CorrectionId, CovenantFields, CrowdSubject, ExtraCandidateId,
    ExtraParcelCandidate, FieldScores, LegalDescription, ManualCorrection, ManualCovenant, ManualCovenantId,
    ManualPinLink, MatchReport, MatchTarget, ParcelGeometry, ParcelId, ParcelMatchSet, PinLinkId, PinnedParcel,
    SubjectId, WorkflowId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::index::{ensure_workflow, SqlJoinLookup};
use crate::parcels::{parcel_ids_by_pin, SqlFootprints};
use crate::{bool_to_sql, from_json, now_rfc3339, placeholders, to_json, SqliteStore, MAX_BOUND_PARAMETERS};

/// One crowd-consensus row as loaded from NDJSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewSubject {
    pub zoon_subject_id: i64,
    pub raw: CovenantFields,
    #[serde(default)]
    pub scores: FieldScores,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewCorrection {
    pub zoon_subject_id: i64,
    pub fields: CovenantFields,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewExtraCandidate {
    pub zoon_subject_id: i64,
    #[serde(default)]
    pub addition: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub lot: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl NewExtraCandidate {
    #[must_use]
    pub fn legal(&self) -> LegalDescription {
        LegalDescription { addition: self.addition.clone(), block: self.block.clone(), lot: self.lot.clone() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewManualCovenant {
    #[serde(default)]
    pub bool_confirmed: bool,
    #[serde(default)]
    pub fields: CovenantFields,
    #[serde(default)]
    pub doc_num: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// A PIN link as loaded from NDJSON. Exactly one of `zoon_subject_id` and
/// `manual_covenant_id` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewPinLink {
    pub parcel_pin: String,
    #[serde(default)]
    pub zoon_subject_id: Option<i64>,
    #[serde(default)]
    pub manual_covenant_id: Option<i64>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Where a record's match set lives.
pub(crate) struct MatchTables {
    pub(crate) record_table: &'static str,
    pub(crate) id_column: &'static str,
    pub(crate) match_table: &'static str,
}

pub(crate) const SUBJECT_TABLES: MatchTables = MatchTables {
    record_table: "subjects",
    id_column: "subject_id",
    match_table: "subject_parcel_matches",
};

pub(crate) const MANUAL_COVENANT_TABLES: MatchTables = MatchTables {
    record_table: "manual_covenants",
    id_column: "manual_covenant_id",
    match_table: "manual_covenant_parcel_matches",
};

impl SqliteStore {
    /// Insert or refresh crowd-consensus rows and resolve each one.
    ///
    /// A row whose `(workflow, zoon_subject_id)` already exists has its raw
    /// values and scores replaced; corrections and extras are kept.
    ///
    /// # Errors
    /// Returns an error when the workflow is unknown, a deed date is not
    /// `YYYY-MM-DD`, or any write fails. Nothing is written on error.
    pub fn upsert_subjects(&mut self, workflow_id: WorkflowId, subjects: &[NewSubject]) -> Result<Vec<SubjectId>> {
        let tx = self.write_transaction()?;
        ensure_workflow(&tx, workflow_id)?;

        let mut ids = Vec::with_capacity(subjects.len());
        for subject in subjects {
            subject
                .raw
                .validate()
                .with_context(|| format!("invalid subject {}", subject.zoon_subject_id))?;
            let now = now_rfc3339()?;
            tx.execute(
                "INSERT INTO subjects(workflow_id, zoon_subject_id, raw_json, scores_json, date_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(workflow_id, zoon_subject_id) DO UPDATE SET
                   raw_json = excluded.raw_json,
                   scores_json = excluded.scores_json,
                   date_updated = excluded.date_updated",
                params![
                    workflow_id.0,
                    subject.zoon_subject_id,
                    to_json(&subject.raw, "subject raw values")?,
                    to_json(&subject.scores, "subject scores")?,
                    now,
                ],
            )
            .with_context(|| format!("failed to upsert subject {}", subject.zoon_subject_id))?;

            let subject_id = subject_id_by_zoon(&tx, workflow_id, subject.zoon_subject_id)?;
            resolve_subject_in(&tx, subject_id)?;
            ids.push(subject_id);
        }

        tx.commit().context("failed to commit subject upsert")?;
        tracing::info!(workflow_id = %workflow_id, subjects = ids.len(), "upserted subjects");
        Ok(ids)
    }

    /// # Errors
    /// Returns `subject not found` when the workflow has no such subject.
    pub fn subject_id_by_zoon(&self, workflow_id: WorkflowId, zoon_subject_id: i64) -> Result<SubjectId> {
        subject_id_by_zoon(&self.conn, workflow_id, zoon_subject_id)
    }

    /// # Errors
    /// Returns an error when the subject row cannot be read or decoded.
    pub fn get_subject(&self, subject_id: SubjectId) -> Result<Option<CrowdSubject>> {
        load_subject(&self.conn, subject_id)
    }

    /// Re-run matching for one subject without touching any other record.
    ///
    /// # Errors
    /// Returns an error when the subject is unknown or any write fails.
    pub fn resolve_subject(&mut self, subject_id: SubjectId) -> Result<MatchReport> {
        let tx = self.write_transaction()?;
        let report = resolve_subject_in(&tx, subject_id)?;
        tx.commit().context("failed to commit subject resolve")?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when the manual covenant is unknown or any write fails.
    pub fn resolve_manual_covenant(&mut self, manual_covenant_id: ManualCovenantId) -> Result<MatchReport> {
        let tx = self.write_transaction()?;
        let report = resolve_manual_covenant_in(&tx, manual_covenant_id)?;
        tx.commit().context("failed to commit manual covenant resolve")?;
        Ok(report)
    }

    /// Record a reviewer correction and re-resolve its subject. Only the
    /// oldest surviving correction for a subject is applied.
    ///
    /// # Errors
    /// Returns an error when the subject is unknown, the deed date is
    /// malformed, or any write fails.
    pub fn add_manual_correction(
        &mut self,
        subject_id: SubjectId,
        fields: &CovenantFields,
        comments: Option<&str>,
    ) -> Result<(CorrectionId, MatchReport)> {
        fields.validate().context("invalid manual correction")?;
        let tx = self.write_transaction()?;
        ensure_subject(&tx, subject_id)?;

        tx.execute(
            "INSERT INTO manual_corrections(subject_id, fields_json, comments, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![subject_id.0, to_json(fields, "manual correction")?, comments, now_rfc3339()?],
        )
        .context("failed to insert manual correction")?;
        let correction_id = CorrectionId(tx.last_insert_rowid());

        let report = resolve_subject_in(&tx, subject_id)?;
        tx.commit().context("failed to commit manual correction")?;
        tracing::info!(subject_id = %subject_id, correction_id = %correction_id, "manual correction applied");
        Ok((correction_id, report))
    }

    /// Remove a correction; the subject falls back to the next oldest
    /// correction, or to crowd values when none remain.
    ///
    /// # Errors
    /// Returns an error when the correction is unknown or any write fails.
    pub fn delete_manual_correction(&mut self, correction_id: CorrectionId) -> Result<MatchReport> {
        let tx = self.write_transaction()?;
        let subject_id = tx
            .query_row(
                "SELECT subject_id FROM manual_corrections WHERE correction_id = ?1",
                params![correction_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to query manual correction")?
            .map(SubjectId)
            .ok_or_else(|| anyhow!("manual correction not found: {correction_id}"))?;

        tx.execute("DELETE FROM manual_corrections WHERE correction_id = ?1", params![correction_id.0])
            .context("failed to delete manual correction")?;
        let report = resolve_subject_in(&tx, subject_id)?;
        tx.commit().context("failed to commit manual correction delete")?;
        tracing::info!(subject_id = %subject_id, correction_id = %correction_id, "manual correction removed");
        Ok(report)
    }

    /// # Errors
    /// Returns an error when correction rows cannot be read or decoded.
    pub fn manual_corrections(&self, subject_id: SubjectId) -> Result<Vec<ManualCorrection>> {
        let mut stmt = self.conn.prepare(
            "SELECT correction_id, fields_json, comments FROM manual_corrections
             WHERE subject_id = ?1 ORDER BY correction_id ASC",
        )?;
        let rows = stmt.query_map(params![subject_id.0], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
        })?;

        let mut corrections = Vec::new();
        for row in rows {
            let (id, fields_json, comments) = row?;
            corrections.push(ManualCorrection {
                id: CorrectionId(id),
                subject_id,
                fields: from_json(&fields_json, "manual correction")?,
                comments,
            });
        }
        Ok(corrections)
    }

    /// # Errors
    /// Returns an error when the subject is unknown or any write fails.
    pub fn add_extra_parcel_candidate(
        &mut self,
        subject_id: SubjectId,
        legal: &LegalDescription,
        comments: Option<&str>,
    ) -> Result<(ExtraCandidateId, MatchReport)> {
        let tx = self.write_transaction()?;
        ensure_subject(&tx, subject_id)?;

        tx.execute(
            "INSERT INTO extra_parcel_candidates(subject_id, addition, block, lot, comments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![subject_id.0, legal.addition, legal.block, legal.lot, comments, now_rfc3339()?],
        )
        .context("failed to insert extra parcel candidate")?;
        let extra_id = ExtraCandidateId(tx.last_insert_rowid());

        let report = resolve_subject_in(&tx, subject_id)?;
        tx.commit().context("failed to commit extra parcel candidate")?;
        Ok((extra_id, report))
    }

    /// # Errors
    /// Returns an error when the candidate is unknown or any write fails.
    pub fn delete_extra_parcel_candidate(&mut self, extra_id: ExtraCandidateId) -> Result<MatchReport> {
        let tx = self.write_transaction()?;
        let subject_id = tx
            .query_row(
                "SELECT subject_id FROM extra_parcel_candidates WHERE extra_id = ?1",
                params![extra_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to query extra parcel candidate")?
            .map(SubjectId)
            .ok_or_else(|| anyhow!("extra parcel candidate not found: {extra_id}"))?;

        tx.execute("DELETE FROM extra_parcel_candidates WHERE extra_id = ?1", params![extra_id.0])
            .context("failed to delete extra parcel candidate")?;
        let report = resolve_subject_in(&tx, subject_id)?;
        tx.commit().context("failed to commit extra parcel candidate delete")?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when candidate rows cannot be read.
    pub fn extra_parcel_candidates(&self, subject_id: SubjectId) -> Result<Vec<ExtraParcelCandidate>> {
        load_extras(&self.conn, subject_id)
    }

    /// Record a hand-entered covenant and match it if confirmed.
    ///
    /// # Errors
    /// Returns an error when the workflow is unknown, the deed date is
    /// malformed, or any write fails.
    pub fn add_manual_covenant(
        &mut self,
        workflow_id: WorkflowId,
        covenant: &NewManualCovenant,
    ) -> Result<(ManualCovenantId, MatchReport)> {
        covenant.fields.validate().context("invalid manual covenant")?;
        let tx = self.write_transaction()?;
        ensure_workflow(&tx, workflow_id)?;

        tx.execute(
            "INSERT INTO manual_covenants(
                workflow_id, bool_confirmed, fields_json, doc_num, city, comments, date_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                workflow_id.0,
                bool_to_sql(covenant.bool_confirmed),
                to_json(&covenant.fields, "manual covenant fields")?,
                covenant.doc_num,
                covenant.city,
                covenant.comments,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert manual covenant")?;
        let manual_covenant_id = ManualCovenantId(tx.last_insert_rowid());

        let report = resolve_manual_covenant_in(&tx, manual_covenant_id)?;
        tx.commit().context("failed to commit manual covenant")?;
        Ok((manual_covenant_id, report))
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_manual_covenant(&self, manual_covenant_id: ManualCovenantId) -> Result<Option<ManualCovenant>> {
        load_manual_covenant(&self.conn, manual_covenant_id)
    }

    /// Tie a record to a parcel by PIN and re-resolve the record. A PIN that
    /// names no parcel is kept and reported as a miss.
    ///
    /// # Errors
    /// Returns an error when the target is unknown or belongs to another
    /// workflow, or when any write fails.
    pub fn add_manual_pin_link(
        &mut self,
        workflow_id: WorkflowId,
        target: MatchTarget,
        parcel_pin: &str,
        comments: Option<&str>,
    ) -> Result<(PinLinkId, MatchReport)> {
        let parcel_pin = parcel_pin.trim();
        if parcel_pin.is_empty() {
            return Err(anyhow!("pin link parcel_pin must be non-empty"));
        }

        let tx = self.write_transaction()?;
        let owner = target_workflow(&tx, target)?;
        if owner != workflow_id {
            return Err(anyhow!("{target} belongs to workflow {owner}, not {workflow_id}"));
        }

        let (subject_id, manual_covenant_id) = match target {
            MatchTarget::Subject(id) => (Some(id.0), None),
            MatchTarget::ManualCovenant(id) => (None, Some(id.0)),
        };
        tx.execute(
            "INSERT INTO manual_pin_links(
                workflow_id, subject_id, manual_covenant_id, parcel_pin, comments, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![workflow_id.0, subject_id, manual_covenant_id, parcel_pin, comments, now_rfc3339()?],
        )
        .context("failed to insert manual pin link")?;
        let pin_link_id = PinLinkId(tx.last_insert_rowid());

        let report = resolve_target_in(&tx, target)?;
        tx.commit().context("failed to commit manual pin link")?;
        Ok((pin_link_id, report))
    }

    /// # Errors
    /// Returns an error when the link is unknown or any write fails.
    pub fn delete_manual_pin_link(&mut self, pin_link_id: PinLinkId) -> Result<MatchReport> {
        let tx = self.write_transaction()?;
        let link = load_pin_link(&tx, pin_link_id)?
            .ok_or_else(|| anyhow!("manual pin link not found: {pin_link_id}"))?;

        tx.execute("DELETE FROM manual_pin_links WHERE pin_link_id = ?1", params![pin_link_id.0])
            .context("failed to delete manual pin link")?;
        let report = resolve_target_in(&tx, link.target)?;
        tx.commit().context("failed to commit manual pin link delete")?;
        Ok(report)
    }

    /// # Errors
    /// Returns an error when link rows cannot be read.
    pub fn manual_pin_links(&self, target: MatchTarget) -> Result<Vec<ManualPinLink>> {
        let (column, id) = target_column(target);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT pin_link_id, parcel_pin, comments FROM manual_pin_links
             WHERE {column} = ?1 ORDER BY pin_link_id ASC"
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(ManualPinLink {
                id: PinLinkId(row.get(0)?),
                target,
                parcel_pin: row.get(1)?,
                comments: row.get(2)?,
            })
        })?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }
}

fn target_column(target: MatchTarget) -> (&'static str, i64) {
    match target {
        MatchTarget::Subject(id) => ("subject_id", id.0),
        MatchTarget::ManualCovenant(id) => ("manual_covenant_id", id.0),
    }
}

fn target_workflow(conn: &Connection, target: MatchTarget) -> Result<WorkflowId> {
    let (table, column, id) = match target {
        MatchTarget::Subject(id) => ("subjects", "subject_id", id.0),
        MatchTarget::ManualCovenant(id) => ("manual_covenants", "manual_covenant_id", id.0),
    };
    conn.query_row(
        &format!("SELECT workflow_id FROM {table} WHERE {column} = ?1"),
        params![id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .with_context(|| format!("failed to query {target}"))?
    .map(WorkflowId)
    .ok_or_else(|| anyhow!("{target} not found"))
}

fn ensure_subject(conn: &Connection, subject_id: SubjectId) -> Result<()> {
    target_workflow(conn, MatchTarget::Subject(subject_id)).map(|_| ())
}

pub(crate) fn subject_id_by_zoon(conn: &Connection, workflow_id: WorkflowId, zoon_subject_id: i64) -> Result<SubjectId> {
    conn.query_row(
        "SELECT subject_id FROM subjects WHERE workflow_id = ?1 AND zoon_subject_id = ?2",
        params![workflow_id.0, zoon_subject_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .context("failed to query subject")?
    .map(SubjectId)
    .ok_or_else(|| anyhow!("subject not found: zoon subject {zoon_subject_id} in workflow {workflow_id}"))
}

pub(crate) fn resolve_target_in(conn: &Connection, target: MatchTarget) -> Result<MatchReport> {
    match target {
        MatchTarget::Subject(id) => resolve_subject_in(conn, id),
        MatchTarget::ManualCovenant(id) => resolve_manual_covenant_in(conn, id),
    }
}

/// Recompute final values and matches for one subject and persist both.
pub(crate) fn resolve_subject_in(conn: &Connection, subject_id: SubjectId) -> Result<MatchReport> {
    let mut subject =
        load_subject(conn, subject_id)?.ok_or_else(|| anyhow!("subject not found: {subject_id}"))?;
    let correction = active_correction(conn, subject_id)?;
    let extras = load_extras(conn, subject_id)?;
    let pins = pinned_parcels(conn, subject.workflow_id, MatchTarget::Subject(subject_id))?;

    let report = resolve_and_match(
        &mut subject,
        correction.as_ref(),
        &extras,
        &pins,
        &SqlJoinLookup::new(conn),
        &SqlFootprints::new(conn),
    )
    .with_context(|| format!("failed to resolve subject {subject_id}"))?;

    persist_subject(conn, &subject)?;
    tracing::debug!(
        subject_id = %subject_id,
        parcels = subject.matches.matched_parcels().len(),
        "subject resolved"
    );
    Ok(report)
}

pub(crate) fn resolve_manual_covenant_in(conn: &Connection, manual_covenant_id: ManualCovenantId) -> Result<MatchReport> {
    let mut covenant = load_manual_covenant(conn, manual_covenant_id)?
        .ok_or_else(|| anyhow!("manual covenant not found: {manual_covenant_id}"))?;
    let pins = pinned_parcels(conn, covenant.workflow_id, MatchTarget::ManualCovenant(manual_covenant_id))?;

    let report = match_manual_covenant(
        &mut covenant,
        &pins,
        &SqlJoinLookup::new(conn),
        &SqlFootprints::new(conn),
    )
    .with_context(|| format!("failed to resolve manual covenant {manual_covenant_id}"))?;

    persist_match_set(conn, &MANUAL_COVENANT_TABLES, manual_covenant_id.0, &covenant.matches)?;
    Ok(report)
}

const SUBJECT_COLUMNS: &str = "subject_id, workflow_id, zoon_subject_id, raw_json, scores_json,
    bool_covenant_final, covenant_text_final, addition_final, lot_final, block_final,
    seller_final, buyer_final, deed_date_final, has_manual_correction,
    geometry_union_json, parcel_addresses_json, parcel_cities_json";

struct SubjectRow {
    subject_id: i64,
    workflow_id: i64,
    zoon_subject_id: i64,
    raw_json: String,
    scores_json: String,
    final_values: CovenantFields,
    has_manual_correction: i64,
    stored_match: StoredMatchColumns,
}

struct StoredMatchColumns {
    geometry_union_json: Option<String>,
    parcel_addresses_json: String,
    parcel_cities_json: String,
}

impl StoredMatchColumns {
    fn into_match_set(self, matched: BTreeSet<ParcelId>) -> Result<ParcelMatchSet> {
        let geometry = self
            .geometry_union_json
            .as_deref()
            .map(|raw| from_json::<ParcelGeometry>(raw, "geometry union"))
            .transpose()?;
        Ok(ParcelMatchSet::restore(
            matched,
            geometry,
            from_json(&self.parcel_addresses_json, "parcel addresses")?,
            from_json(&self.parcel_cities_json, "parcel cities")?,
        ))
    }
}

pub(crate) fn load_subject(conn: &Connection, subject_id: SubjectId) -> Result<Option<CrowdSubject>> {
    let row = conn
        .query_row(
            &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE subject_id = ?1"),
            params![subject_id.0],
            |row| {
                Ok(SubjectRow {
                    subject_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    zoon_subject_id: row.get(2)?,
                    raw_json: row.get(3)?,
                    scores_json: row.get(4)?,
                    final_values: CovenantFields {
                        bool_covenant: row.get::<_, Option<i64>>(5)?.map(|value| value == 1),
                        covenant_text: row.get(6)?,
                        addition: row.get(7)?,
                        lot: row.get(8)?,
                        block: row.get(9)?,
                        seller: row.get(10)?,
                        buyer: row.get(11)?,
                        deed_date: row.get(12)?,
                    },
                    has_manual_correction: row.get(13)?,
                    stored_match: StoredMatchColumns {
                        geometry_union_json: row.get(14)?,
                        parcel_addresses_json: row.get(15)?,
                        parcel_cities_json: row.get(16)?,
                    },
                })
            },
        )
        .optional()
        .context("failed to query subject")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let matched = matched_parcels(conn, &SUBJECT_TABLES, row.subject_id)?;
    Ok(Some(CrowdSubject {
        id: SubjectId(row.subject_id),
        workflow_id: WorkflowId(row.workflow_id),
        zoon_subject_id: row.zoon_subject_id,
        raw: from_json(&row.raw_json, "subject raw values")?,
        scores: from_json(&row.scores_json, "subject scores")?,
        final_values: row.final_values,
        has_manual_correction: row.has_manual_correction == 1,
        matches: row.stored_match.into_match_set(matched)?,
    }))
}

pub(crate) fn load_manual_covenant(conn: &Connection, manual_covenant_id: ManualCovenantId) -> Result<Option<ManualCovenant>> {
    let row = conn
        .query_row(
            "SELECT workflow_id, bool_confirmed, fields_json, doc_num, city, comments,
                    geometry_union_json, parcel_addresses_json, parcel_cities_json
             FROM manual_covenants WHERE manual_covenant_id = ?1",
            params![manual_covenant_id.0],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    StoredMatchColumns {
                        geometry_union_json: row.get(6)?,
                        parcel_addresses_json: row.get(7)?,
                        parcel_cities_json: row.get(8)?,
                    },
                ))
            },
        )
        .optional()
        .context("failed to query manual covenant")?;

    let Some((workflow_id, bool_confirmed, fields_json, doc_num, city, comments, stored_match)) = row else {
        return Ok(None);
    };
    let matched = matched_parcels(conn, &MANUAL_COVENANT_TABLES, manual_covenant_id.0)?;
    Ok(Some(ManualCovenant {
        id: manual_covenant_id,
        workflow_id: WorkflowId(workflow_id),
        bool_confirmed: bool_confirmed == 1,
        fields: from_json(&fields_json, "manual covenant fields")?,
        doc_num,
        city,
        comments,
        matches: stored_match.into_match_set(matched)?,
    }))
}

pub(crate) fn active_correction(conn: &Connection, subject_id: SubjectId) -> Result<Option<ManualCorrection>> {
    let row = conn
        .query_row(
            "SELECT correction_id, fields_json, comments FROM manual_corrections
             WHERE subject_id = ?1 ORDER BY correction_id ASC LIMIT 1",
            params![subject_id.0],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?)),
        )
        .optional()
        .context("failed to query manual correction")?;

    row.map(|(id, fields_json, comments)| {
        Ok(ManualCorrection {
            id: CorrectionId(id),
            subject_id,
            fields: from_json(&fields_json, "manual correction")?,
            comments,
        })
    })
    .transpose()
}

pub(crate) fn load_extras(conn: &Connection, subject_id: SubjectId) -> Result<Vec<ExtraParcelCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT extra_id, addition, block, lot, comments FROM extra_parcel_candidates
         WHERE subject_id = ?1 ORDER BY extra_id ASC",
    )?;
    let rows = stmt.query_map(params![subject_id.0], |row| {
        Ok(ExtraParcelCandidate {
            id: ExtraCandidateId(row.get(0)?),
            subject_id,
            legal: LegalDescription { addition: row.get(1)?, block: row.get(2)?, lot: row.get(3)? },
            comments: row.get(4)?,
        })
    })?;

    let mut extras = Vec::new();
    for row in rows {
        extras.push(row?);
    }
    Ok(extras)
}

fn load_pin_link(conn: &Connection, pin_link_id: PinLinkId) -> Result<Option<ManualPinLink>> {
    let row = conn
        .query_row(
            "SELECT subject_id, manual_covenant_id, parcel_pin, comments FROM manual_pin_links
             WHERE pin_link_id = ?1",
            params![pin_link_id.0],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to query manual pin link")?;

    let Some((subject_id, manual_covenant_id, parcel_pin, comments)) = row else {
        return Ok(None);
    };
    let target = match (subject_id, manual_covenant_id) {
        (Some(id), None) => MatchTarget::Subject(SubjectId(id)),
        (None, Some(id)) => MatchTarget::ManualCovenant(ManualCovenantId(id)),
        _ => return Err(anyhow!("manual pin link {pin_link_id} has no single target")),
    };
    Ok(Some(ManualPinLink { id: pin_link_id, target, parcel_pin, comments }))
}

/// PIN links for one record, resolved to parcels in its workflow.
pub(crate) fn pinned_parcels(conn: &Connection, workflow_id: WorkflowId, target: MatchTarget) -> Result<Vec<PinnedParcel>> {
    let (column, id) = target_column(target);
    let mut stmt = conn.prepare(&format!(
        "SELECT parcel_pin FROM manual_pin_links WHERE {column} = ?1 ORDER BY pin_link_id ASC"
    ))?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    let mut pins = Vec::new();
    for row in rows {
        pins.push(row?);
    }
    if pins.is_empty() {
        return Ok(Vec::new());
    }

    let known = parcel_ids_by_pin(conn, workflow_id, &pins.iter().cloned().collect())?;
    Ok(pins
        .into_iter()
        .map(|pin| PinnedParcel { parcel_id: known.get(&pin).copied(), pin })
        .collect())
}

fn matched_parcels(conn: &Connection, tables: &MatchTables, record_id: i64) -> Result<BTreeSet<ParcelId>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT parcel_id FROM {} WHERE {} = ?1",
        tables.match_table, tables.id_column
    ))?;
    let rows = stmt.query_map(params![record_id], |row| row.get::<_, i64>(0))?;
    let mut parcels = BTreeSet::new();
    for row in rows {
        parcels.insert(ParcelId(row?));
    }
    Ok(parcels)
}

fn persist_subject(conn: &Connection, subject: &CrowdSubject) -> Result<()> {
    persist_final_values(conn, subject)?;
    persist_match_set(conn, &SUBJECT_TABLES, subject.id.0, &subject.matches)
}

pub(crate) fn persist_final_values(conn: &Connection, subject: &CrowdSubject) -> Result<()> {
    let values = &subject.final_values;
    conn.execute(
        "UPDATE subjects SET
            bool_covenant_final = ?2,
            covenant_text_final = ?3,
            addition_final = ?4,
            lot_final = ?5,
            block_final = ?6,
            seller_final = ?7,
            buyer_final = ?8,
            deed_date_final = ?9,
            has_manual_correction = ?10
         WHERE subject_id = ?1",
        params![
            subject.id.0,
            values.bool_covenant.map(bool_to_sql),
            values.covenant_text,
            values.addition,
            values.lot,
            values.block,
            values.seller,
            values.buyer,
            values.deed_date,
            bool_to_sql(subject.has_manual_correction),
        ],
    )
    .with_context(|| format!("failed to persist final values for subject {}", subject.id))?;
    Ok(())
}

/// Replace one record's match rows and derived columns, then refresh
/// `has_covenant` on every parcel that gained or lost the record.
fn persist_match_set(conn: &Connection, tables: &MatchTables, record_id: i64, set: &ParcelMatchSet) -> Result<()> {
    let previous = matched_parcels(conn, tables, record_id)?;

    conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", tables.match_table, tables.id_column),
        params![record_id],
    )
    .with_context(|| format!("failed to clear {} rows", tables.match_table))?;
    {
        let mut insert = conn.prepare_cached(&format!(
            "INSERT INTO {}({}, parcel_id) VALUES (?1, ?2)",
            tables.match_table, tables.id_column
        ))?;
        for parcel_id in set.matched_parcels() {
            insert.execute(params![record_id, parcel_id.0])?;
        }
    }

    write_match_columns(conn, tables, record_id, set)?;

    let affected = previous.union(set.matched_parcels()).copied().collect::<Vec<_>>();
    refresh_has_covenant(conn, &affected)
}

pub(crate) fn write_match_columns(conn: &Connection, tables: &MatchTables, record_id: i64, set: &ParcelMatchSet) -> Result<()> {
    let geometry_json = set
        .geometry_union()
        .map(|geometry| to_json(geometry, "geometry union"))
        .transpose()?;
    conn.execute(
        &format!(
            "UPDATE {} SET
                bool_parcel_match = ?2,
                geometry_union_json = ?3,
                parcel_addresses_json = ?4,
                parcel_cities_json = ?5,
                date_updated = ?6
             WHERE {} = ?1",
            tables.record_table, tables.id_column
        ),
        params![
            record_id,
            bool_to_sql(set.has_parcel_match()),
            geometry_json,
            to_json(set.parcel_addresses(), "parcel addresses")?,
            to_json(set.parcel_cities(), "parcel cities")?,
            now_rfc3339()?,
        ],
    )
    .with_context(|| format!("failed to update match columns on {}", tables.record_table))?;
    Ok(())
}

pub(crate) const HAS_COVENANT_EXPR: &str = "(
    EXISTS (SELECT 1 FROM subject_parcel_matches m WHERE m.parcel_id = parcels.parcel_id)
    OR EXISTS (SELECT 1 FROM manual_covenant_parcel_matches m WHERE m.parcel_id = parcels.parcel_id)
)";

fn refresh_has_covenant(conn: &Connection, parcel_ids: &[ParcelId]) -> Result<()> {
    for chunk in parcel_ids.chunks(MAX_BOUND_PARAMETERS) {
        conn.execute(
            &format!(
                "UPDATE parcels SET has_covenant = {HAS_COVENANT_EXPR} WHERE parcel_id IN ({})",
                placeholders(chunk.len())
            ),
            params_from_iter(chunk.iter().map(|id| Value::Integer(id.0))),
        )
        .context("failed to refresh parcel has_covenant")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{covenant, migrated_store, oak_park, parcel};

    fn pins_of(store: &SqliteStore, parcels: &BTreeSet<ParcelId>) -> Result<Vec<String>> {
        parcels
            .iter()
            .map(|id| {
                store
                    .get_parcel(*id)?
                    .map(|record| record.pin_primary)
                    .ok_or_else(|| anyhow!("parcel {id} missing"))
            })
            .collect()
    }

    fn subject(store: &SqliteStore, id: SubjectId) -> Result<CrowdSubject> {
        store.get_subject(id)?.ok_or_else(|| anyhow!("subject {id} missing"))
    }

    fn setup() -> Result<(SqliteStore, WorkflowId)> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;
        store.rebuild_join_index(workflow)?;
        Ok((store, workflow))
    }

    #[test]
    fn upsert_resolves_and_flags_parcels() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "2,3")])?;

        let resolved = subject(&store, ids[0])?;
        assert!(resolved.matches.has_parcel_match());
        assert_eq!(pins_of(&store, resolved.matches.matched_parcels())?, ["P-2", "P-3"]);
        assert_eq!(resolved.matches.parcel_addresses(), ["P-2 Oak St", "P-3 Oak St"]);

        let Some(flagged) = store.parcel_by_pin(workflow, "P-2")? else {
            panic!("parcel P-2 should exist");
        };
        assert!(flagged.has_covenant);
        let Some(unflagged) = store.parcel_by_pin(workflow, "P-5")? else {
            panic!("parcel P-5 should exist");
        };
        assert!(!unflagged.has_covenant);
        Ok(())
    }

    #[test]
    fn correction_then_delete_falls_back_to_crowd_lot() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "8")])?;
        let fields = CovenantFields { lot: Some("7".to_string()), ..CovenantFields::default() };

        let (correction_id, report) = store.add_manual_correction(ids[0], &fields, Some("lot misread"))?;
        assert_eq!(report.matched_count(), 1);
        let corrected = subject(&store, ids[0])?;
        assert_eq!(corrected.final_values.lot.as_deref(), Some("7"));
        assert!(corrected.has_manual_correction);
        assert_eq!(pins_of(&store, corrected.matches.matched_parcels())?, ["P-7"]);

        store.delete_manual_correction(correction_id)?;
        let reverted = subject(&store, ids[0])?;
        assert_eq!(reverted.final_values.lot.as_deref(), Some("8"));
        assert!(!reverted.has_manual_correction);
        assert_eq!(pins_of(&store, reverted.matches.matched_parcels())?, ["P-8"]);

        let Some(old_parcel) = store.parcel_by_pin(workflow, "P-7")? else {
            panic!("parcel P-7 should exist");
        };
        assert!(!old_parcel.has_covenant);
        Ok(())
    }

    #[test]
    fn block_correction_matches_only_the_corrected_block() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = store.create_workflow("Test County")?.workflow_id;
        let parcels = [
            parcel("B7-1", "Elm Grove Addition", "7", "1", 1.0)?,
            parcel("B7-2", "Elm Grove Addition", "7", "2", 2.0)?,
            parcel("B8-1", "Elm Grove Addition", "8", "1", 3.0)?,
            parcel("B8-2", "Elm Grove Addition", "8", "2", 4.0)?,
        ];
        store.insert_parcels(workflow, &parcels)?;
        store.rebuild_join_index(workflow)?;
        let ids = store.upsert_subjects(workflow, &[covenant(300, "Elm Grove", "8", "1-2")])?;
        assert_eq!(pins_of(&store, subject(&store, ids[0])?.matches.matched_parcels())?, ["B8-1", "B8-2"]);

        let fields = CovenantFields { block: Some("7".to_string()), ..CovenantFields::default() };
        let (correction_id, _) = store.add_manual_correction(ids[0], &fields, Some("block misread"))?;
        let corrected = subject(&store, ids[0])?;
        assert_eq!(corrected.final_values.block.as_deref(), Some("7"));
        assert_eq!(pins_of(&store, corrected.matches.matched_parcels())?, ["B7-1", "B7-2"]);
        for (pin, flagged) in [("B7-1", true), ("B7-2", true), ("B8-1", false), ("B8-2", false)] {
            let Some(record) = store.parcel_by_pin(workflow, pin)? else {
                panic!("parcel {pin} should exist");
            };
            assert_eq!(record.has_covenant, flagged, "has_covenant for {pin}");
        }

        store.delete_manual_correction(correction_id)?;
        let reverted = subject(&store, ids[0])?;
        assert_eq!(reverted.final_values.block.as_deref(), Some("8"));
        assert_eq!(pins_of(&store, reverted.matches.matched_parcels())?, ["B8-1", "B8-2"]);
        for (pin, flagged) in [("B7-1", false), ("B7-2", false), ("B8-1", true), ("B8-2", true)] {
            let Some(record) = store.parcel_by_pin(workflow, pin)? else {
                panic!("parcel {pin} should exist");
            };
            assert_eq!(record.has_covenant, flagged, "has_covenant for {pin}");
        }
        Ok(())
    }

    #[test]
    fn oldest_correction_applies_until_deleted() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "8")])?;
        let lot = |value: &str| CovenantFields { lot: Some(value.to_string()), ..CovenantFields::default() };

        let (first, _) = store.add_manual_correction(ids[0], &lot("3"), None)?;
        store.add_manual_correction(ids[0], &lot("5"), None)?;
        let corrected = subject(&store, ids[0])?;
        assert_eq!(corrected.final_values.lot.as_deref(), Some("3"));
        assert_eq!(pins_of(&store, corrected.matches.matched_parcels())?, ["P-3"]);

        store.delete_manual_correction(first)?;
        let next = subject(&store, ids[0])?;
        assert_eq!(next.final_values.lot.as_deref(), Some("5"));
        assert!(next.has_manual_correction);
        assert_eq!(pins_of(&store, next.matches.matched_parcels())?, ["P-5"]);
        Ok(())
    }

    #[test]
    fn blank_or_none_lot_matches_nothing() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(
            workflow,
            &[covenant(100, "Oak Park", "1", ""), covenant(200, "Oak Park", "1", "none")],
        )?;

        for id in &ids {
            let report = store.resolve_subject(*id)?;
            assert_eq!(report.matched_count(), 0);
            let resolved = subject(&store, *id)?;
            assert!(!resolved.matches.has_parcel_match());
            assert!(resolved.matches.matched_parcels().is_empty());
            assert!(resolved.matches.geometry_union().is_none());
        }

        let (_, summary) = store.run_workflow_match(workflow, false)?;
        assert_eq!(summary.join_hits, 0);
        assert_eq!(summary.matched_records, 0);
        for lot in 1..=8 {
            let pin = format!("P-{lot}");
            let Some(record) = store.parcel_by_pin(workflow, &pin)? else {
                panic!("parcel {pin} should exist");
            };
            assert!(!record.has_covenant, "{pin} should carry no covenant");
        }
        Ok(())
    }

    #[test]
    fn correcting_to_not_a_covenant_clears_matches() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "4")])?;
        let fields = CovenantFields { bool_covenant: Some(false), ..CovenantFields::default() };

        store.add_manual_correction(ids[0], &fields, None)?;
        let cleared = subject(&store, ids[0])?;
        assert!(!cleared.matches.has_parcel_match());
        assert!(cleared.matches.geometry_union().is_none());
        let Some(parcel) = store.parcel_by_pin(workflow, "P-4")? else {
            panic!("parcel P-4 should exist");
        };
        assert!(!parcel.has_covenant);
        Ok(())
    }

    #[test]
    fn extra_candidate_add_and_delete_rematch_only_that_subject() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(
            workflow,
            &[covenant(100, "Oak Park", "1", "1"), covenant(200, "Oak Park", "1", "6")],
        )?;
        let other_before = subject(&store, ids[1])?;

        let legal = LegalDescription::new(Some("Oak Park Addition"), Some("1"), Some("2"));
        let (extra_id, _) = store.add_extra_parcel_candidate(ids[0], &legal, None)?;
        assert_eq!(pins_of(&store, subject(&store, ids[0])?.matches.matched_parcels())?, ["P-1", "P-2"]);
        assert_eq!(subject(&store, ids[1])?.matches, other_before.matches);

        store.delete_extra_parcel_candidate(extra_id)?;
        assert_eq!(pins_of(&store, subject(&store, ids[0])?.matches.matched_parcels())?, ["P-1"]);
        Ok(())
    }

    #[test]
    fn pin_links_add_parcels_and_report_unknown_pins() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "1")])?;
        let target = MatchTarget::Subject(ids[0]);

        let (link_id, _) = store.add_manual_pin_link(workflow, target, "P-5", None)?;
        let (_, report) = store.add_manual_pin_link(workflow, target, "NOPE", Some("typo"))?;
        assert!(report
            .entries
            .iter()
            .any(|entry| entry.join_key == "pin:NOPE" && !entry.matched));
        assert_eq!(pins_of(&store, subject(&store, ids[0])?.matches.matched_parcels())?, ["P-1", "P-5"]);
        assert_eq!(store.manual_pin_links(target)?.len(), 2);

        store.delete_manual_pin_link(link_id)?;
        assert_eq!(pins_of(&store, subject(&store, ids[0])?.matches.matched_parcels())?, ["P-1"]);
        Ok(())
    }

    #[test]
    fn pin_link_rejects_targets_in_other_workflows() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let other = store.create_workflow("Other County")?.workflow_id;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "1")])?;

        assert!(store.add_manual_pin_link(other, MatchTarget::Subject(ids[0]), "P-1", None).is_err());
        Ok(())
    }

    #[test]
    fn manual_covenant_matches_once_confirmed() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let mut new_covenant = NewManualCovenant {
            bool_confirmed: false,
            fields: covenant(0, "Oak Park", "1", "3").raw,
            doc_num: Some("D-77".to_string()),
            ..NewManualCovenant::default()
        };

        let (unconfirmed, _) = store.add_manual_covenant(workflow, &new_covenant)?;
        let Some(stored) = store.get_manual_covenant(unconfirmed)? else {
            panic!("manual covenant should exist");
        };
        assert!(!stored.matches.has_parcel_match());

        new_covenant.bool_confirmed = true;
        let (confirmed, report) = store.add_manual_covenant(workflow, &new_covenant)?;
        assert_eq!(report.matched_count(), 1);
        let Some(stored) = store.get_manual_covenant(confirmed)? else {
            panic!("manual covenant should exist");
        };
        assert_eq!(pins_of(&store, stored.matches.matched_parcels())?, ["P-3"]);
        let Some(parcel) = store.parcel_by_pin(workflow, "P-3")? else {
            panic!("parcel P-3 should exist");
        };
        assert!(parcel.has_covenant);
        Ok(())
    }

    #[test]
    fn upsert_rejects_malformed_deed_dates_atomically() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let mut bad = covenant(101, "Oak Park", "1", "1");
        bad.raw.deed_date = Some("1925/04/01".to_string());

        let result = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "1"), bad]);
        assert!(result.is_err());
        assert!(store.subject_id_by_zoon(workflow, 100).is_err());
        Ok(())
    }

    #[test]
    fn upsert_replaces_raw_values_and_keeps_corrections() -> Result<()> {
        let (mut store, workflow) = setup()?;
        let ids = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "1")])?;
        let fields = CovenantFields { seller: Some("Corrected Seller".to_string()), ..CovenantFields::default() };
        store.add_manual_correction(ids[0], &fields, None)?;

        let again = store.upsert_subjects(workflow, &[covenant(100, "Oak Park", "1", "2")])?;
        assert_eq!(again, ids);
        let refreshed = subject(&store, ids[0])?;
        assert_eq!(refreshed.final_values.lot.as_deref(), Some("2"));
        assert_eq!(refreshed.final_values.seller.as_deref(), Some("Corrected Seller"));
        assert_eq!(store.manual_corrections(ids[0])?.len(), 1);
        Ok(())
    }
}

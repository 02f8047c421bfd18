use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use covenant_resolver_core::{
    standardize_addition, FootprintSource, LegalDescription, ParcelFootprint, ParcelGeometry, ParcelId,
    ParcelLegal, ResolverError, WorkflowId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{
    from_json, insert_rows_batched, now_rfc3339, placeholders, to_json, SqliteStore, MAX_BOUND_PARAMETERS,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub created_at: String,
}

/// One parcel row as loaded from NDJSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NewParcel {
    pub pin_primary: String,
    #[serde(default)]
    pub plat_name: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub lot: Option<String>,
    #[serde(default)]
    pub street_address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub geometry: Option<ParcelGeometry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParcelRecord {
    pub parcel_id: ParcelId,
    pub workflow_id: WorkflowId,
    pub pin_primary: String,
    pub plat_name: Option<String>,
    pub plat_standardized: Option<String>,
    pub block: Option<String>,
    pub lot: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub geometry: Option<ParcelGeometry>,
    pub has_covenant: bool,
}

/// Another name a plat is known by, e.g. a misspelling common in deeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewAlternateName {
    pub plat_name: String,
    pub alternate_name: String,
}

/// An extra legal description attached to a parcel by PIN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NewManualParcelCandidate {
    pub parcel_pin: String,
    #[serde(default)]
    pub addition: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
    #[serde(default)]
    pub lot: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

const PARCEL_COLUMNS: &str = "parcel_id, workflow_id, pin_primary, plat_name, plat_standardized, block, lot,
    street_address, city, geometry_json, has_covenant";

struct ParcelRow {
    parcel_id: i64,
    workflow_id: i64,
    pin_primary: String,
    plat_name: Option<String>,
    plat_standardized: Option<String>,
    block: Option<String>,
    lot: Option<String>,
    street_address: Option<String>,
    city: Option<String>,
    geometry_json: Option<String>,
    has_covenant: i64,
}

impl ParcelRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            parcel_id: row.get(0)?,
            workflow_id: row.get(1)?,
            pin_primary: row.get(2)?,
            plat_name: row.get(3)?,
            plat_standardized: row.get(4)?,
            block: row.get(5)?,
            lot: row.get(6)?,
            street_address: row.get(7)?,
            city: row.get(8)?,
            geometry_json: row.get(9)?,
            has_covenant: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<ParcelRecord> {
        let geometry = self
            .geometry_json
            .as_deref()
            .map(|raw| from_json::<ParcelGeometry>(raw, "parcel geometry"))
            .transpose()?;
        Ok(ParcelRecord {
            parcel_id: ParcelId(self.parcel_id),
            workflow_id: WorkflowId(self.workflow_id),
            pin_primary: self.pin_primary,
            plat_name: self.plat_name,
            plat_standardized: self.plat_standardized,
            block: self.block,
            lot: self.lot,
            street_address: self.street_address,
            city: self.city,
            geometry,
            has_covenant: self.has_covenant == 1,
        })
    }
}

impl SqliteStore {
    /// Create a named workflow.
    ///
    /// # Errors
    /// Returns an error when the name is blank or already taken.
    pub fn create_workflow(&mut self, name: &str) -> Result<WorkflowRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("workflow name must be non-empty"));
        }

        let created_at = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO workflows(name, created_at) VALUES (?1, ?2)",
                params![name, created_at],
            )
            .with_context(|| format!("failed to create workflow {name}"))?;

        let workflow_id = WorkflowId(self.conn.last_insert_rowid());
        tracing::info!(workflow_id = %workflow_id, name, "created workflow");
        Ok(WorkflowRecord { workflow_id, name: name.to_string(), created_at })
    }

    /// # Errors
    /// Returns `workflow not found: <name>` when no workflow has this name.
    pub fn workflow_by_name(&self, name: &str) -> Result<WorkflowRecord> {
        self.conn
            .query_row(
                "SELECT workflow_id, name, created_at FROM workflows WHERE name = ?1",
                params![name.trim()],
                |row| {
                    Ok(WorkflowRecord {
                        workflow_id: WorkflowId(row.get(0)?),
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to query workflow")?
            .ok_or_else(|| anyhow!("workflow not found: {}", name.trim()))
    }

    /// # Errors
    /// Returns an error when the workflow table cannot be read.
    pub fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT workflow_id, name, created_at FROM workflows ORDER BY workflow_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkflowRecord {
                workflow_id: WorkflowId(row.get(0)?),
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;

        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row?);
        }
        Ok(workflows)
    }

    /// Insert parcels in batches inside one transaction.
    ///
    /// # Errors
    /// Returns an error when a PIN is blank or already present in the
    /// workflow, or when any insert fails. Nothing is written on error.
    pub fn insert_parcels(&mut self, workflow_id: WorkflowId, parcels: &[NewParcel]) -> Result<usize> {
        let batch_size = self.options.insert_batch_size;
        let mut rows = Vec::with_capacity(parcels.len());
        for parcel in parcels {
            if parcel.pin_primary.trim().is_empty() {
                return Err(anyhow!("parcel pin_primary must be non-empty"));
            }
            let geometry_json = parcel
                .geometry
                .as_ref()
                .map(|geometry| to_json(geometry, "parcel geometry"))
                .transpose()?;
            rows.push(vec![
                Value::Integer(workflow_id.0),
                Value::Text(parcel.pin_primary.trim().to_string()),
                optional_text(parcel.plat_name.as_deref()),
                Value::Text(standardize_addition(parcel.plat_name.as_deref())),
                optional_text(parcel.block.as_deref()),
                optional_text(parcel.lot.as_deref()),
                optional_text(parcel.street_address.as_deref()),
                optional_text(parcel.city.as_deref()),
                geometry_json.map_or(Value::Null, Value::Text),
            ]);
        }

        let tx = self.write_transaction()?;
        let inserted = insert_rows_batched(
            &tx,
            "parcels",
            &[
                "workflow_id",
                "pin_primary",
                "plat_name",
                "plat_standardized",
                "block",
                "lot",
                "street_address",
                "city",
                "geometry_json",
            ],
            &rows,
            batch_size,
        )?;
        tx.commit().context("failed to commit parcel insert")?;

        tracing::info!(workflow_id = %workflow_id, parcels = inserted, "inserted parcels");
        Ok(inserted)
    }

    /// # Errors
    /// Returns an error when the parcel row cannot be read or decoded.
    pub fn get_parcel(&self, parcel_id: ParcelId) -> Result<Option<ParcelRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE parcel_id = ?1"),
                params![parcel_id.0],
                ParcelRow::from_row,
            )
            .optional()
            .context("failed to query parcel")?;
        row.map(ParcelRow::into_record).transpose()
    }

    /// # Errors
    /// Returns an error when the parcel row cannot be read or decoded.
    pub fn parcel_by_pin(&self, workflow_id: WorkflowId, pin: &str) -> Result<Option<ParcelRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE workflow_id = ?1 AND pin_primary = ?2"),
                params![workflow_id.0, pin.trim()],
                ParcelRow::from_row,
            )
            .optional()
            .context("failed to query parcel by pin")?;
        row.map(ParcelRow::into_record).transpose()
    }

    /// Register an alternate plat name. Takes effect at the next index rebuild.
    ///
    /// # Errors
    /// Returns an error when either name standardizes to nothing or the pair
    /// is already registered.
    pub fn add_plat_alternate_name(&mut self, workflow_id: WorkflowId, alternate: &NewAlternateName) -> Result<i64> {
        let plat_standardized = standardize_addition(Some(&alternate.plat_name));
        let alternate_standardized = standardize_addition(Some(&alternate.alternate_name));
        if plat_standardized.is_empty() || alternate_standardized.is_empty() {
            return Err(anyhow!(
                "plat alternate name needs a non-empty plat and alternate: {} / {}",
                alternate.plat_name,
                alternate.alternate_name
            ));
        }

        self.conn
            .execute(
                "INSERT INTO plat_alternate_names(
                    workflow_id, plat_name, plat_standardized, alternate_name, alternate_name_standardized
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    workflow_id.0,
                    alternate.plat_name,
                    plat_standardized,
                    alternate.alternate_name,
                    alternate_standardized,
                ],
            )
            .context("failed to insert plat alternate name")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Attach an extra legal description to a parcel by PIN. Takes effect at
    /// the next index rebuild.
    ///
    /// # Errors
    /// Returns an error when the PIN is blank or the insert fails.
    pub fn add_manual_parcel_candidate(
        &mut self,
        workflow_id: WorkflowId,
        candidate: &NewManualParcelCandidate,
    ) -> Result<i64> {
        if candidate.parcel_pin.trim().is_empty() {
            return Err(anyhow!("manual parcel candidate parcel_pin must be non-empty"));
        }

        let created_at = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO manual_parcel_candidates(
                    workflow_id, parcel_pin, addition, block, lot, comments, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    workflow_id.0,
                    candidate.parcel_pin.trim(),
                    candidate.addition,
                    candidate.block,
                    candidate.lot,
                    candidate.comments,
                    created_at,
                ],
            )
            .context("failed to insert manual parcel candidate")?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Everything the index builder needs for one workflow, in parcel id order.
pub(crate) fn parcel_legals(conn: &Connection, workflow_id: WorkflowId) -> Result<Vec<ParcelLegal>> {
    let mut alternates: BTreeMap<String, Vec<String>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT plat_standardized, alternate_name_standardized
             FROM plat_alternate_names
             WHERE workflow_id = ?1
             ORDER BY alternate_id ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (plat, alternate) = row?;
            alternates.entry(plat).or_default().push(alternate);
        }
    }

    let mut manual: BTreeMap<String, Vec<LegalDescription>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT parcel_pin, addition, block, lot
             FROM manual_parcel_candidates
             WHERE workflow_id = ?1
             ORDER BY candidate_id ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                LegalDescription { addition: row.get(1)?, block: row.get(2)?, lot: row.get(3)? },
            ))
        })?;
        for row in rows {
            let (pin, legal) = row?;
            manual.entry(pin).or_default().push(legal);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT parcel_id, pin_primary, plat_name, block, lot
         FROM parcels
         WHERE workflow_id = ?1
         ORDER BY parcel_id ASC",
    )?;
    let rows = stmt.query_map(params![workflow_id.0], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut legals = Vec::new();
    for row in rows {
        let (parcel_id, pin, plat_name, block, lot) = row?;
        let plat_standardized = standardize_addition(plat_name.as_deref());
        legals.push(ParcelLegal {
            parcel_id: ParcelId(parcel_id),
            alternate_additions: alternates.get(&plat_standardized).cloned().unwrap_or_default(),
            manual_candidates: manual.remove(&pin).unwrap_or_default(),
            plat_name,
            block,
            lot,
        });
    }

    for pin in manual.keys() {
        tracing::warn!(workflow_id = %workflow_id, pin = %pin, "manual parcel candidate names an unknown PIN");
    }

    Ok(legals)
}

/// Map PINs to parcel ids within one workflow. Unknown PINs are absent.
pub(crate) fn parcel_ids_by_pin(
    conn: &Connection,
    workflow_id: WorkflowId,
    pins: &BTreeSet<String>,
) -> Result<BTreeMap<String, ParcelId>> {
    let pins = pins.iter().cloned().collect::<Vec<_>>();
    let mut found = BTreeMap::new();
    for chunk in pins.chunks(MAX_BOUND_PARAMETERS - 1) {
        let sql = format!(
            "SELECT pin_primary, parcel_id FROM parcels WHERE workflow_id = ? AND pin_primary IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let bound = std::iter::once(Value::Integer(workflow_id.0))
            .chain(chunk.iter().map(|pin| Value::Text(pin.clone())));
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            Ok((row.get::<_, String>(0)?, ParcelId(row.get(1)?)))
        })?;
        for row in rows {
            let (pin, parcel_id) = row?;
            found.insert(pin, parcel_id);
        }
    }
    Ok(found)
}

/// Reads parcel footprints straight from a connection or open transaction.
pub struct SqlFootprints<'a> {
    conn: &'a Connection,
}

impl<'a> SqlFootprints<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn load(&self, parcel_ids: &BTreeSet<ParcelId>) -> Result<Vec<ParcelFootprint>> {
        let ids = parcel_ids.iter().copied().collect::<Vec<_>>();
        let mut footprints = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BOUND_PARAMETERS) {
            let sql = format!(
                "SELECT parcel_id, street_address, city, geometry_json
                 FROM parcels WHERE parcel_id IN ({}) ORDER BY parcel_id ASC",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| id.0)), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;
            for row in rows {
                let (parcel_id, street_address, city, geometry_json) = row?;
                let geometry = geometry_json
                    .as_deref()
                    .map(|raw| from_json::<ParcelGeometry>(raw, "parcel geometry"))
                    .transpose()?;
                footprints.push(ParcelFootprint { parcel_id: ParcelId(parcel_id), street_address, city, geometry });
            }
        }

        if footprints.len() != parcel_ids.len() {
            return Err(anyhow!(
                "expected {} parcel footprints, found {}",
                parcel_ids.len(),
                footprints.len()
            ));
        }
        Ok(footprints)
    }
}

impl FootprintSource for SqlFootprints<'_> {
    fn footprints(&self, parcel_ids: &BTreeSet<ParcelId>) -> Result<Vec<ParcelFootprint>, ResolverError> {
        self.load(parcel_ids)
            .map_err(|err| ResolverError::Lookup(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{migrated_store, oak_park, parcel};

    #[test]
    fn workflow_lookup_by_name_reports_missing_workflows() -> Result<()> {
        let mut store = migrated_store()?;
        let created = store.create_workflow("  Hennepin County ")?;
        assert_eq!(created.name, "Hennepin County");

        assert_eq!(store.workflow_by_name("Hennepin County")?.workflow_id, created.workflow_id);
        let missing = store.workflow_by_name("Ramsey County");
        let Err(err) = missing else {
            panic!("missing workflow should be an error");
        };
        assert_eq!(err.to_string(), "workflow not found: Ramsey County");

        assert!(store.create_workflow("Hennepin County").is_err());
        assert!(store.create_workflow("   ").is_err());
        assert_eq!(store.list_workflows()?.len(), 1);
        Ok(())
    }

    #[test]
    fn insert_parcels_standardizes_plat_and_keeps_geometry() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;

        let Some(record) = store.parcel_by_pin(workflow, "P-3")? else {
            panic!("parcel P-3 should exist");
        };
        assert_eq!(record.plat_standardized.as_deref(), Some("oak park"));
        assert_eq!(record.lot.as_deref(), Some("3"));
        assert!(!record.has_covenant);
        assert_eq!(record.geometry.map(|geometry| geometry.polygon_count()), Some(1));

        assert_eq!(store.get_parcel(record.parcel_id)?.map(|found| found.pin_primary), Some("P-3".to_string()));
        Ok(())
    }

    #[test]
    fn duplicate_pin_rolls_back_whole_batch() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = store.create_workflow("Test County")?.workflow_id;
        let parcels = vec![
            parcel("P-1", "Oak Park", "1", "1", 0.0)?,
            parcel("P-1", "Oak Park", "1", "2", 1.0)?,
        ];

        assert!(store.insert_parcels(workflow, &parcels).is_err());
        assert!(store.parcel_by_pin(workflow, "P-1")?.is_none());
        Ok(())
    }

    #[test]
    fn parcel_legals_attach_alternates_and_manual_candidates() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;
        store.add_plat_alternate_name(
            workflow,
            &NewAlternateName { plat_name: "Oak Park Addn".to_string(), alternate_name: "Oak Pk".to_string() },
        )?;
        store.add_manual_parcel_candidate(
            workflow,
            &NewManualParcelCandidate {
                parcel_pin: "P-2".to_string(),
                addition: Some("Lake View".to_string()),
                block: Some("4".to_string()),
                lot: Some("9".to_string()),
                comments: None,
            },
        )?;

        let legals = parcel_legals(&store.conn, workflow)?;
        assert_eq!(legals.len(), 8);
        assert!(legals.iter().all(|legal| legal.alternate_additions == ["oak pk"]));
        assert_eq!(legals[1].manual_candidates.len(), 1);
        assert!(legals[0].manual_candidates.is_empty());
        Ok(())
    }

    #[test]
    fn sql_footprints_error_on_unknown_parcels() -> Result<()> {
        let mut store = migrated_store()?;
        let workflow = oak_park(&mut store, "Test County")?;
        let Some(record) = store.parcel_by_pin(workflow, "P-1")? else {
            panic!("parcel P-1 should exist");
        };

        let source = SqlFootprints::new(&store.conn);
        let found = source.footprints(&BTreeSet::from([record.parcel_id]));
        assert_eq!(found.map(|footprints| footprints.len()), Ok(1));
        assert!(source.footprints(&BTreeSet::from([ParcelId(9_999)])).is_err());
        Ok(())
    }
}

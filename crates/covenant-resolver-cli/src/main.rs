use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use covenant_resolver_core::{
    build_join_keys, get_block, get_lots, standardize_addition, CorrectionId, ExtraCandidateId,
    ManualCovenantId, MatchReport, MatchTarget, PinLinkId, SubjectId, WorkflowId,
};
use covenant_resolver_store_sqlite::{
    read_ndjson_file, write_match_report, NewAlternateName, NewCorrection, NewExtraCandidate,
    NewManualCovenant, NewManualParcelCandidate, NewParcel, NewPinLink, NewSubject, SqliteStore,
};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod config;

use config::{FileConfig, Overrides, Settings};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "covmatch")]
#[command(about = "Normalize deed legal descriptions and match covenants to parcels")]
struct Cli {
    #[arg(long, env = "COVMATCH_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "COVMATCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Tracing filter directive, e.g. `debug` or `covenant_resolver_core=debug`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    Load(LoadArgs),
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
    Match {
        #[command(subcommand)]
        command: MatchCommand,
    },
    Correction {
        #[command(subcommand)]
        command: CorrectionCommand,
    },
    Extra {
        #[command(subcommand)]
        command: ExtraCommand,
    },
    PinLink {
        #[command(subcommand)]
        command: PinLinkCommand,
    },
    Subject {
        #[command(subcommand)]
        command: SubjectCommand,
    },
    Normalize(NormalizeArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum WorkflowCommand {
    Create(WorkflowCreateArgs),
    List,
}

#[derive(Debug, Args)]
struct WorkflowCreateArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct WorkflowArg {
    /// Workflow name.
    #[arg(long)]
    workflow: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoadKind {
    Parcels,
    Subjects,
    Corrections,
    ExtraCandidates,
    AlternateNames,
    ManualParcelCandidates,
    ManualCovenants,
    PinLinks,
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(value_enum)]
    kind: LoadKind,
    #[command(flatten)]
    workflow: WorkflowArg,
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum IndexCommand {
    Rebuild(WorkflowArg),
}

#[derive(Debug, Subcommand)]
enum MatchCommand {
    Run(MatchRunArgs),
    Record(MatchRecordArgs),
}

#[derive(Debug, Args)]
struct MatchRunArgs {
    #[command(flatten)]
    workflow: WorkflowArg,
    #[arg(long, default_value_t = false)]
    rebuild: bool,
    /// Write the match report as NDJSON under the report directory.
    #[arg(long, default_value_t = false)]
    report: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct MatchRecordArgs {
    #[arg(long)]
    subject_id: Option<i64>,
    #[arg(long)]
    manual_covenant_id: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum CorrectionCommand {
    Delete(CorrectionDeleteArgs),
}

#[derive(Debug, Args)]
struct CorrectionDeleteArgs {
    #[arg(long)]
    correction_id: i64,
}

#[derive(Debug, Subcommand)]
enum ExtraCommand {
    Delete(ExtraDeleteArgs),
}

#[derive(Debug, Args)]
struct ExtraDeleteArgs {
    #[arg(long)]
    extra_id: i64,
}

#[derive(Debug, Subcommand)]
enum PinLinkCommand {
    Delete(PinLinkDeleteArgs),
}

#[derive(Debug, Args)]
struct PinLinkDeleteArgs {
    #[arg(long)]
    pin_link_id: i64,
}

#[derive(Debug, Subcommand)]
enum SubjectCommand {
    Show(SubjectShowArgs),
}

#[derive(Debug, Args)]
struct SubjectShowArgs {
    #[command(flatten)]
    workflow: WorkflowArg,
    #[arg(long)]
    zoon_subject_id: i64,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    #[arg(long)]
    addition: Option<String>,
    #[arg(long)]
    block: Option<String>,
    #[arg(long)]
    lot: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn to_value<T: Serialize>(value: &T, what: &str) -> Result<Value> {
    serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level directive: {directive}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    if let Command::Normalize(args) = &cli.command {
        return run_normalize(args);
    }

    let file = cli.config.as_deref().map(FileConfig::load).transpose()?.unwrap_or_default();
    let settings = Settings::resolve(
        Overrides { db: cli.db, report_dir: cli.report_dir, workers: cli.workers },
        file,
    )?;
    tracing::debug!(
        db = %settings.db.display(),
        report_dir = %settings.report_dir.display(),
        workers = settings.store.workers,
        "resolved settings"
    );
    let mut store = SqliteStore::open_with_options(&settings.db, settings.store)?;

    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Workflow { command } => {
            store.migrate()?;
            run_workflow(command, &mut store)
        }
        Command::Load(args) => {
            store.migrate()?;
            run_load(&args, &mut store)
        }
        Command::Index { command } => {
            store.migrate()?;
            run_index(&command, &mut store)
        }
        Command::Match { command } => {
            store.migrate()?;
            run_match(&command, &mut store, &settings)
        }
        Command::Correction { command } => {
            store.migrate()?;
            let CorrectionCommand::Delete(args) = command;
            let report = store.delete_manual_correction(CorrectionId(args.correction_id))?;
            emit_report("correction_id", args.correction_id, &report)
        }
        Command::Extra { command } => {
            store.migrate()?;
            let ExtraCommand::Delete(args) = command;
            let report = store.delete_extra_parcel_candidate(ExtraCandidateId(args.extra_id))?;
            emit_report("extra_id", args.extra_id, &report)
        }
        Command::PinLink { command } => {
            store.migrate()?;
            let PinLinkCommand::Delete(args) = command;
            let report = store.delete_manual_pin_link(PinLinkId(args.pin_link_id))?;
            emit_report("pin_link_id", args.pin_link_id, &report)
        }
        Command::Subject { command } => {
            store.migrate()?;
            let SubjectCommand::Show(args) = command;
            let workflow = store.workflow_by_name(&args.workflow.workflow)?;
            let subject_id = store.subject_id_by_zoon(workflow.workflow_id, args.zoon_subject_id)?;
            let subject = store
                .get_subject(subject_id)?
                .ok_or_else(|| anyhow!("subject not found: {subject_id}"))?;
            emit_json(serde_json::json!({
                "subject": to_value(&subject, "subject")?,
                "manual_corrections": to_value(&store.manual_corrections(subject_id)?, "manual corrections")?,
                "extra_parcel_candidates": to_value(&store.extra_parcel_candidates(subject_id)?, "extra parcel candidates")?,
                "manual_pin_links": to_value(&store.manual_pin_links(MatchTarget::Subject(subject_id))?, "pin links")?
            }))
        }
        Command::Normalize(_) => Ok(()),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_tables": status.inferred_from_tables
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_tables": before.inferred_from_tables
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(to_value(&report, "integrity report")?)
}

fn run_workflow(command: WorkflowCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        WorkflowCommand::Create(args) => {
            let workflow = store.create_workflow(&args.name)?;
            emit_json(to_value(&workflow, "workflow")?)
        }
        WorkflowCommand::List => {
            let workflows = store.list_workflows()?;
            emit_json(serde_json::json!({ "workflows": to_value(&workflows, "workflows")? }))
        }
    }
}

/// Match totals accumulated across the records of one load.
#[derive(Debug, Default, Serialize)]
struct LoadTotals {
    loaded: usize,
    join_attempts: usize,
    join_hits: usize,
}

impl LoadTotals {
    fn add(&mut self, report: &MatchReport) {
        self.loaded += 1;
        self.join_attempts += report.len();
        self.join_hits += report.matched_count();
    }
}

fn run_load(args: &LoadArgs, store: &mut SqliteStore) -> Result<()> {
    let workflow = store.workflow_by_name(&args.workflow.workflow)?;
    let workflow_id = workflow.workflow_id;
    let mut totals = LoadTotals::default();

    match args.kind {
        LoadKind::Parcels => {
            let rows = read_ndjson_file::<NewParcel>(&args.input)?;
            totals.loaded = store.insert_parcels(workflow_id, &rows)?;
        }
        LoadKind::Subjects => {
            let rows = read_ndjson_file::<NewSubject>(&args.input)?;
            let ids = store.upsert_subjects(workflow_id, &rows)?;
            totals.loaded = ids.len();
        }
        LoadKind::Corrections => {
            for row in read_ndjson_file::<NewCorrection>(&args.input)? {
                let subject_id = store.subject_id_by_zoon(workflow_id, row.zoon_subject_id)?;
                let (_, report) = store.add_manual_correction(subject_id, &row.fields, row.comments.as_deref())?;
                totals.add(&report);
            }
        }
        LoadKind::ExtraCandidates => {
            for row in read_ndjson_file::<NewExtraCandidate>(&args.input)? {
                let subject_id = store.subject_id_by_zoon(workflow_id, row.zoon_subject_id)?;
                let (_, report) =
                    store.add_extra_parcel_candidate(subject_id, &row.legal(), row.comments.as_deref())?;
                totals.add(&report);
            }
        }
        LoadKind::AlternateNames => {
            for row in read_ndjson_file::<NewAlternateName>(&args.input)? {
                store.add_plat_alternate_name(workflow_id, &row)?;
                totals.loaded += 1;
            }
        }
        LoadKind::ManualParcelCandidates => {
            for row in read_ndjson_file::<NewManualParcelCandidate>(&args.input)? {
                store.add_manual_parcel_candidate(workflow_id, &row)?;
                totals.loaded += 1;
            }
        }
        LoadKind::ManualCovenants => {
            for row in read_ndjson_file::<NewManualCovenant>(&args.input)? {
                let (_, report) = store.add_manual_covenant(workflow_id, &row)?;
                totals.add(&report);
            }
        }
        LoadKind::PinLinks => {
            for row in read_ndjson_file::<NewPinLink>(&args.input)? {
                let target = pin_link_target(store, workflow_id, &row)?;
                let (_, report) =
                    store.add_manual_pin_link(workflow_id, target, &row.parcel_pin, row.comments.as_deref())?;
                totals.add(&report);
            }
        }
    }

    let kind = args
        .kind
        .to_possible_value()
        .map(|value| value.get_name().to_string())
        .unwrap_or_default();
    emit_json(serde_json::json!({
        "workflow": workflow.name,
        "kind": kind,
        "input": args.input,
        "totals": to_value(&totals, "load totals")?
    }))
}

fn pin_link_target(store: &SqliteStore, workflow_id: WorkflowId, row: &NewPinLink) -> Result<MatchTarget> {
    match (row.zoon_subject_id, row.manual_covenant_id) {
        (Some(zoon_subject_id), None) => {
            Ok(MatchTarget::Subject(store.subject_id_by_zoon(workflow_id, zoon_subject_id)?))
        }
        (None, Some(id)) => Ok(MatchTarget::ManualCovenant(ManualCovenantId(id))),
        _ => Err(anyhow!(
            "pin link for {} needs exactly one of zoon_subject_id and manual_covenant_id",
            row.parcel_pin
        )),
    }
}

fn run_index(command: &IndexCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        IndexCommand::Rebuild(args) => {
            let workflow = store.workflow_by_name(&args.workflow)?;
            let summary = store.rebuild_join_index(workflow.workflow_id)?;
            emit_json(serde_json::json!({
                "workflow": workflow.name,
                "summary": to_value(&summary, "index rebuild summary")?
            }))
        }
    }
}

fn run_match(command: &MatchCommand, store: &mut SqliteStore, settings: &Settings) -> Result<()> {
    match command {
        MatchCommand::Run(args) => {
            let workflow = store.workflow_by_name(&args.workflow.workflow)?;
            let (run, summary) = store.run_workflow_match(workflow.workflow_id, args.rebuild)?;
            let report_file = if args.report {
                Some(write_match_report(&run, &settings.report_dir)?)
            } else {
                None
            };
            emit_json(serde_json::json!({
                "workflow": workflow.name,
                "summary": to_value(&summary, "match run summary")?,
                "report_file": to_value(&report_file, "report file")?
            }))
        }
        MatchCommand::Record(args) => match (args.subject_id, args.manual_covenant_id) {
            (Some(id), None) => {
                let report = store.resolve_subject(SubjectId(id))?;
                emit_report("subject_id", id, &report)
            }
            (None, Some(id)) => {
                let report = store.resolve_manual_covenant(ManualCovenantId(id))?;
                emit_report("manual_covenant_id", id, &report)
            }
            _ => Err(anyhow!("pass exactly one of --subject-id and --manual-covenant-id")),
        },
    }
}

fn emit_report(id_field: &str, id: i64, report: &MatchReport) -> Result<()> {
    let mut payload = serde_json::json!({
        "join_attempts": report.len(),
        "join_hits": report.matched_count(),
        "report": to_value(report, "match report")?
    });
    if let Value::Object(object) = &mut payload {
        object.insert(id_field.to_string(), Value::from(id));
    }
    emit_json(payload)
}

fn run_normalize(args: &NormalizeArgs) -> Result<()> {
    let addition = args.addition.as_deref();
    let block = args.block.as_deref();
    let lot = args.lot.as_deref();
    let join_keys = build_join_keys(addition, block, lot)
        .into_iter()
        .map(|candidate| candidate.join_key)
        .collect::<Vec<_>>();

    emit_json(serde_json::json!({
        "addition": standardize_addition(addition),
        "block": to_value(&get_block(block), "block parse")?,
        "lot": to_value(&get_lots(lot), "lot parse")?,
        "join_keys": join_keys
    }))
}

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metadata_manager_api::{
    CreateRecordRequest, ListRecordsRequest, MetadataManagerApi, UpdateRecordRequest,
};
use metadata_manager_core::{EntityKind, MetadataError, RecordId};
use metadata_manager_store_sqlite::error_kind;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mm")]
#[command(about = "Metadata Manager CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "./metadata_manager.sqlite3")]
    db: PathBuf,

    /// Emit diagnostics on stderr as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Project {
        #[command(subcommand)]
        command: Box<ProjectCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
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
enum RecordCommand {
    Add(RecordAddArgs),
    Update(RecordUpdateArgs),
    Show(IdArgs),
    List(RecordListArgs),
    /// Create or update records of one kind from a CSV file, matched by external id.
    Import(RecordImportArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    /// Field assignment as `name=value`; repeatable.
    #[arg(long = "field", value_parser = parse_assignment)]
    fields: Vec<(String, String)>,
}

#[derive(Debug, Args)]
struct RecordUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "field", value_parser = parse_assignment)]
    fields: Vec<(String, String)>,
    /// Field name to remove; repeatable.
    #[arg(long)]
    unset: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    /// Keyword filter as `key=value`; repeat a key to match any of its values.
    #[arg(long = "keyword", value_parser = parse_assignment)]
    keywords: Vec<(String, String)>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct RecordImportArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    /// CSV file whose header row names the fields.
    #[arg(long)]
    csv: PathBuf,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List(IdArgs),
    Diff(HistoryDiffArgs),
}

#[derive(Debug, Args)]
struct HistoryDiffArgs {
    #[arg(long)]
    id: String,
    /// Diff a record with a single entry against nothing instead of failing.
    #[arg(long, default_value_t = false)]
    initial: bool,
    #[arg(long, value_enum, default_value_t = DiffFormat::Json)]
    format: DiffFormat,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    Show(IdArgs),
    LinkContact(ProjectContactArgs),
    UnlinkContact(ProjectContactArgs),
}

#[derive(Debug, Args)]
struct ProjectContactArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    contact: String,
}

#[derive(Debug, Subcommand)]
enum EventsCommand {
    /// State-change events in commit order.
    List(EventsListArgs),
}

#[derive(Debug, Args)]
struct EventsListArgs {
    /// Only events with a sequence above this cursor.
    #[arg(long)]
    after: Option<i64>,
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Project,
    Contact,
    Subject,
    Library,
    Sample,
    Individual,
}

impl KindArg {
    fn into_kind(self) -> EntityKind {
        match self {
            Self::Project => EntityKind::Project,
            Self::Contact => EntityKind::Contact,
            Self::Subject => EntityKind::Subject,
            Self::Library => EntityKind::Library,
            Self::Sample => EntityKind::Sample,
            Self::Individual => EntityKind::Individual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiffFormat {
    Json,
    Text,
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

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_error(&err),
    }
}

fn run(cli: Cli) -> Result<()> {
    let api = MetadataManagerApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Record { command } => run_record(*command, &api),
        Command::History { command } => run_history(*command, &api),
        Command::Project { command } => run_project(*command, &api),
        Command::Events { command } => run_events(*command, &api),
    }
}

/// `invalid_comparison` (5) is reserved: every diff the CLI runs pairs an entry with its own
/// predecessor, so no command can produce it today.
fn exit_code(err: &MetadataError) -> u8 {
    match err {
        MetadataError::Validation(_) => 3,
        MetadataError::NotFound(_) => 4,
        MetadataError::InvalidComparison(_) => 5,
    }
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    let (kind, detail, code) = match error_kind(err) {
        Some(domain) => (domain.kind(), domain.detail().to_string(), exit_code(domain)),
        None => ("internal", format!("{err:#}"), 1),
    };
    tracing::debug!(kind, code, "command failed: {err:#}");

    let body = with_contract_version(serde_json::json!({
        "error": {
            "kind": kind,
            "detail": detail
        }
    }));
    eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string()));
    ExitCode::from(code)
}

fn run_db(command: DbCommand, api: &MetadataManagerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_record(command: RecordCommand, api: &MetadataManagerApi) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let record = api.create_record(CreateRecordRequest {
                kind: args.kind.into_kind(),
                fields: args.fields,
            })?;
            emit_json(serde_json::json!({ "record": record }))
        }
        RecordCommand::Update(args) => {
            let record = api.update_record(UpdateRecordRequest {
                id: RecordId::parse(&args.id)?,
                set: args.fields,
                unset: args.unset,
            })?;
            emit_json(serde_json::json!({ "record": record }))
        }
        RecordCommand::Show(args) => {
            let record = api.get_record(RecordId::parse(&args.id)?)?;
            emit_json(serde_json::json!({ "record": record }))
        }
        RecordCommand::List(args) => {
            let result = api.list_records(ListRecordsRequest {
                kind: args.kind.into_kind(),
                keywords: args.keywords,
                limit: args.limit,
            })?;
            emit_json(serde_json::json!({
                "kind": result.kind,
                "ignored_keys": result.ignored_keys,
                "scanned": result.scanned,
                "count": result.records.len(),
                "records": result.records
            }))
        }
        RecordCommand::Import(args) => {
            let file = File::open(&args.csv)
                .with_context(|| format!("failed to open CSV file {}", args.csv.display()))?;
            let summary = api.import_csv(args.kind.into_kind(), file)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize import summary")?)
        }
    }
}

fn run_history(command: HistoryCommand, api: &MetadataManagerApi) -> Result<()> {
    match command {
        HistoryCommand::List(args) => {
            let history = api.history(RecordId::parse(&args.id)?)?;
            emit_json(serde_json::to_value(&history).context("failed to serialize history")?)
        }
        HistoryCommand::Diff(args) => {
            let delta = api.diff_latest(RecordId::parse(&args.id)?, args.initial)?;
            let summary = delta.changes.iter().map(ToString::to_string).collect::<Vec<_>>();
            match args.format {
                DiffFormat::Text => {
                    for line in summary {
                        println!("{line}");
                    }
                    Ok(())
                }
                DiffFormat::Json => {
                    let mut value =
                        serde_json::to_value(&delta).context("failed to serialize delta")?;
                    if let Value::Object(object) = &mut value {
                        object.insert("summary".to_string(), serde_json::json!(summary));
                    }
                    emit_json(value)
                }
            }
        }
    }
}

fn run_project(command: ProjectCommand, api: &MetadataManagerApi) -> Result<()> {
    let detail = match command {
        ProjectCommand::Show(args) => api.project_detail(RecordId::parse(&args.id)?)?,
        ProjectCommand::LinkContact(args) => api.link_contact(
            RecordId::parse(&args.project)?,
            RecordId::parse(&args.contact)?,
        )?,
        ProjectCommand::UnlinkContact(args) => api.remove_contact(
            RecordId::parse(&args.project)?,
            RecordId::parse(&args.contact)?,
        )?,
    };
    emit_json(serde_json::to_value(&detail).context("failed to serialize project detail")?)
}

fn run_events(command: EventsCommand, api: &MetadataManagerApi) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let page = api.state_changes(args.after, args.limit)?;
            emit_json(serde_json::json!({
                "count": page.events.len(),
                "cursor": page.cursor,
                "events": page.events
            }))
        }
    }
}

fn parse_assignment(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value (received: {raw})")),
    }
}

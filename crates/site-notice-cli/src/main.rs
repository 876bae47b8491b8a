use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use site_notice_catalog::{
    fetch_catalog, load_catalog_file, CatalogSource, CatalogState, LoadedCatalog,
};
use site_notice_core::{
    message_state, select_current, AppContext, DismissalLedger, DismissalScope, Evaluation,
    MessageId,
};
use site_notice_store_sqlite::{open_durable, open_session, SqliteMarkerStore};
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sn")]
#[command(about = "Site Notice CLI")]
struct Cli {
    #[arg(long, default_value = "./site-notice-state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Show(ShowArgs),
    Status(ShowArgs),
    Dismiss(ActArgs),
    Remind(ActArgs),
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Validate(SourceArgs),
    Fingerprint(SourceArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    url: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[arg(long)]
    now: Option<String>,
    #[arg(long, default_value = "")]
    app_name: String,
    #[arg(long, default_value = "")]
    hostname: String,
    /// Ambient context properties as key=value pairs.
    #[arg(long = "prop")]
    properties: Vec<String>,
    /// Display gate for automated-testing agents: nothing is ever shown.
    #[arg(long, default_value_t = false)]
    automated: bool,
}

#[derive(Debug, Args)]
struct ActArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    New,
    Status,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Catalog { command } => run_catalog(command),
        Command::Show(args) => run_show(&cli.state_dir, &args),
        Command::Status(args) => run_status(&cli.state_dir, &args),
        Command::Dismiss(args) => run_act(&cli.state_dir, &args, DismissalScope::Durable),
        Command::Remind(args) => run_act(&cli.state_dir, &args, DismissalScope::Session),
        Command::Session { command } => run_session(&cli.state_dir, command),
    }
}

fn run_catalog(command: CatalogCommand) -> Result<()> {
    match command {
        CatalogCommand::Validate(args) => {
            let loaded = load_required_catalog(&args)?;
            emit_json(serde_json::json!({
                "origin": loaded.origin,
                "fingerprint": loaded.fingerprint,
                "messages": loaded.catalog.len(),
                "valid": true
            }))
        }
        CatalogCommand::Fingerprint(args) => {
            let loaded = load_required_catalog(&args)?;
            emit_json(serde_json::json!({
                "origin": loaded.origin,
                "fingerprint": loaded.fingerprint,
                "messages": loaded.catalog.len()
            }))
        }
    }
}

fn run_show(state_dir: &Path, args: &ShowArgs) -> Result<()> {
    let eval = build_evaluation(args)?;
    let state = resolve_source(&args.source);
    let ledger = open_ledger(state_dir)?;

    let selected = select_current(state.catalog(), &eval, &ledger);
    match selected {
        Some(message) => emit_json(serde_json::json!({
            "shown": serde_json::to_value(message).context("failed to serialize message")?,
            "fingerprint": state_fingerprint(&state)
        })),
        None => emit_json(serde_json::json!({
            "shown": Value::Null,
            "reason": none_reason(&state, &eval),
            "fingerprint": state_fingerprint(&state)
        })),
    }
}

fn run_status(state_dir: &Path, args: &ShowArgs) -> Result<()> {
    let eval = build_evaluation(args)?;
    let state = resolve_source(&args.source);
    let ledger = open_ledger(state_dir)?;

    let Some(catalog) = state.catalog() else {
        return emit_json(serde_json::json!({
            "catalog": Value::Null,
            "reason": none_reason(&state, &eval)
        }));
    };

    let mut messages = Vec::new();
    for message in &catalog.messages {
        let date_start = match message.date_start {
            Some(value) => Value::String(rfc3339(value)?),
            None => Value::Null,
        };
        messages.push(serde_json::json!({
            "id": message.id.as_str(),
            "state": message_state(message, eval.now, &ledger).as_str(),
            "date_start": date_start,
            "date_end": rfc3339(message.date_end)?,
        }));
    }

    emit_json(serde_json::json!({
        "fingerprint": state_fingerprint(&state),
        "messages": messages
    }))
}

fn run_act(state_dir: &Path, args: &ActArgs, scope: DismissalScope) -> Result<()> {
    let mut ledger = open_ledger(state_dir)?;
    let message_id = MessageId(args.id.clone());

    let already_recorded = ledger.has_been_acted_on(scope, &message_id);
    match scope {
        DismissalScope::Durable => ledger
            .record_dismissal(&message_id)
            .map_err(|err| anyhow!("failed to record dismissal: {err}"))?,
        DismissalScope::Session => ledger
            .record_remind_later(&message_id)
            .map_err(|err| anyhow!("failed to record remind-later: {err}"))?,
    }

    emit_json(serde_json::json!({
        "id": message_id.as_str(),
        "scope": scope.as_str(),
        "newly_recorded": !already_recorded
    }))
}

fn run_session(state_dir: &Path, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::New => {
            let mut session = open_session(state_dir)?;
            let cleared = session.len()?;
            session.clear()?;
            emit_json(serde_json::json!({
                "session": "new",
                "cleared_markers": cleared
            }))
        }
        SessionCommand::Status => {
            let durable = open_durable(state_dir)?;
            let session = open_session(state_dir)?;
            emit_json(serde_json::json!({
                "durable_markers": durable.len()?,
                "durable_keys": durable.list_keys()?,
                "durable_schema_version": durable.schema_status()?.current_version,
                "session_markers": session.len()?,
                "session_keys": session.list_keys()?,
                "session_schema_version": session.schema_status()?.current_version
            }))
        }
    }
}

fn open_ledger(
    state_dir: &Path,
) -> Result<DismissalLedger<SqliteMarkerStore, SqliteMarkerStore>> {
    let durable = open_durable(state_dir)?;
    let session = open_session(state_dir)?;
    Ok(DismissalLedger::new(durable, session))
}

fn resolve_source(args: &SourceArgs) -> CatalogState {
    CatalogSource::new(args.file.clone(), args.url.clone()).resolve()
}

fn load_required_catalog(args: &SourceArgs) -> Result<LoadedCatalog> {
    match (&args.file, &args.url) {
        (Some(path), _) => load_catalog_file(path),
        (None, Some(url)) => fetch_catalog(url),
        (None, None) => Err(anyhow!("no catalog source configured; pass --file or --url")),
    }
}

fn state_fingerprint(state: &CatalogState) -> Value {
    match state {
        CatalogState::Ready(loaded) => Value::String(loaded.fingerprint.clone()),
        CatalogState::Unavailable { .. } => Value::Null,
    }
}

fn none_reason(state: &CatalogState, eval: &Evaluation) -> Value {
    if eval.automated_agent {
        return serde_json::json!({ "kind": "suppressed_by_automation" });
    }
    match state {
        CatalogState::Ready(_) => serde_json::json!({ "kind": "no_eligible_message" }),
        CatalogState::Unavailable { reason } => serde_json::json!({
            "kind": "catalog_unavailable",
            "detail": reason
        }),
    }
}

fn build_evaluation(args: &ShowArgs) -> Result<Evaluation> {
    let now = parse_optional_rfc3339(args.now.as_deref())?;
    let mut context = AppContext {
        app_name: args.app_name.clone(),
        hostname: args.hostname.clone(),
        ..AppContext::default()
    };

    for raw in &args.properties {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(anyhow!("property MUST be key=value (received: {raw})"));
        };
        context.properties.insert(key.to_string(), value.to_string());
    }

    Ok(Evaluation { now, context, automated_agent: args.automated })
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use concord_cli::{Command, Config, DatasetArgs};
use concord_client::RemoteClient;
use concord_core::operation::DEFAULT_EVENT_BUFFER;
use concord_core::{
    load_config, operation_channel, ConcordConfig, Dataset, DeleteRequest, FieldMapping,
    ImportOptions, ImportRequest, OperationEvent, OperationReport, OperationService,
    OperationState, Region, Validator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Logging goes to stderr; stdout carries the event stream
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let Config {
        token,
        region,
        base_url,
        config: config_path,
        command,
    } = Config::parse();

    // Validation is offline and needs neither configuration nor credentials
    let connect = || -> anyhow::Result<OperationService<RemoteClient>> {
        let settings = load_config(config_path.clone()).context("Failed to load configuration")?;
        build_service(token.as_deref(), region, base_url.as_deref(), &settings)
    };

    match command {
        Command::Import {
            dataset,
            mapping,
            update_only,
            clear_empty_fields,
            failed_rows,
        } => {
            let options = ImportOptions {
                update_only,
                clear_empty_fields,
                ..ImportOptions::default()
            };
            import(connect()?, &dataset, &mapping, options, failed_rows).await?;
        }
        Command::Migrate {
            dataset,
            mapping,
            remap_field,
            update_only,
            clear_empty_fields,
            failed_rows,
        } => {
            let options = ImportOptions {
                migration_mode: true,
                remap_field_name: Some(remap_field),
                update_only,
                clear_empty_fields,
            };
            import(connect()?, &dataset, &mapping, options, failed_rows).await?;
        }
        Command::Delete {
            dataset,
            id_column,
            failed_rows,
        } => {
            delete(connect()?, &dataset, id_column, failed_rows).await?;
        }
        Command::Validate {
            dataset,
            mapping,
            migration,
        } => {
            validate(&dataset, &mapping, migration)?;
        }
    }

    Ok(())
}

/// Builds the operation service for the configured remote.
fn build_service(
    token: Option<&str>,
    region: Region,
    base_url: Option<&str>,
    settings: &ConcordConfig,
) -> anyhow::Result<OperationService<RemoteClient>> {
    let token = token.unwrap_or_default();
    let base_url = match base_url {
        Some(url) => url,
        None => settings
            .remote
            .base_url_for(region)
            .map_err(|e| anyhow::anyhow!(e.user_message()))?,
    };

    let reconcile = settings.reconcile_config();
    let mut client = RemoteClient::new(
        base_url,
        token,
        settings.http_config(),
        reconcile.pagination.clone(),
    )
    .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    for (kind, dialect) in &settings.remote.dialects {
        client = client.with_dialect(*kind, *dialect);
    }

    info!(base_url = %client.base_url(), region = %region, "Using remote");
    Ok(OperationService::new(client, reconcile))
}

/// Import (or migrate) a CSV file.
async fn import(
    service: OperationService<RemoteClient>,
    args: &DatasetArgs,
    mapping_path: &Path,
    options: ImportOptions,
    failed_rows: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dataset = read_dataset(&args.csv)?;
    let mapping = read_mapping(mapping_path)?;
    info!(
        kind = %args.kind,
        rows = dataset.rows.len(),
        "Importing {}",
        args.csv.display()
    );

    let source = failed_rows.as_ref().map(|_| dataset.clone());
    let request = ImportRequest {
        kind: args.kind,
        dataset,
        mapping,
        options,
    };

    let (sink, events) = operation_channel(DEFAULT_EVENT_BUFFER);
    let handle = tokio::spawn(async move { service.run_import(request, sink).await });
    let report = stream_events(events, handle).await?;

    finish(report, source.as_ref(), failed_rows.as_deref())
}

/// Delete the records a CSV file names.
async fn delete(
    service: OperationService<RemoteClient>,
    args: &DatasetArgs,
    id_column: String,
    failed_rows: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dataset = read_dataset(&args.csv)?;
    info!(
        kind = %args.kind,
        rows = dataset.rows.len(),
        "Deleting records listed in {}",
        args.csv.display()
    );

    let source = failed_rows.as_ref().map(|_| dataset.clone());
    let request = DeleteRequest {
        kind: args.kind,
        dataset,
        id_column,
    };

    let (sink, events) = operation_channel(DEFAULT_EVENT_BUFFER);
    let handle = tokio::spawn(async move { service.run_delete(request, sink).await });
    let report = stream_events(events, handle).await?;

    finish(report, source.as_ref(), failed_rows.as_deref())
}

/// Prints events as JSON lines until the stream closes.
///
/// Ctrl-C drops the receiver, which stops the operation after the row in
/// flight.
async fn stream_events(
    mut events: mpsc::Receiver<OperationEvent>,
    handle: JoinHandle<OperationReport>,
) -> anyhow::Result<OperationReport> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            Ok(()) = &mut ctrl_c => {
                warn!("Interrupted, stopping after the current row");
                break;
            }
        }
    }
    drop(events);

    handle.await.context("Operation task failed")
}

fn finish(
    report: OperationReport,
    source: Option<&Dataset>,
    failed_rows: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(result) = &report.result {
        info!(
            operation_id = %report.operation_id,
            state = ?report.state,
            total = result.total,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            deleted = result.deleted,
            errors = result.errors,
            "Operation finished in {}ms",
            (report.finished_at - report.started_at).num_milliseconds()
        );
    }

    if let (Some(dataset), Some(path)) = (source, failed_rows) {
        write_failed_rows(dataset, &report.failed_lines, path)?;
    }

    if report.state == OperationState::Failed {
        anyhow::bail!(
            "Operation failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn write_failed_rows(dataset: &Dataset, lines: &[usize], path: &Path) -> anyhow::Result<()> {
    let lines: HashSet<usize> = lines.iter().copied().collect();
    let rows = dataset.rows.iter().filter(|row| lines.contains(&row.line));
    let csv = Dataset::to_csv_string(&dataset.headers, rows)?;
    std::fs::write(path, csv)
        .with_context(|| format!("Failed to write failed rows to {}", path.display()))?;

    info!(count = lines.len(), "Failed rows written to {}", path.display());
    Ok(())
}

/// Offline check of a CSV file against a mapping.
fn validate(args: &DatasetArgs, mapping_path: &Path, migration: bool) -> anyhow::Result<()> {
    let dataset = read_dataset(&args.csv)?;
    let mapping = read_mapping(mapping_path)?;

    let report = Validator::new(args.kind)
        .with_migration_mode(migration)
        .validate(&dataset, &mapping);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.valid {
        anyhow::bail!(
            "{} error(s) in {} row(s)",
            report.errors.len(),
            report.total_rows
        );
    }
    info!(
        rows = report.total_rows,
        warnings = report.warnings.len(),
        "Dataset is valid"
    );
    Ok(())
}

fn read_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Dataset::from_csv_str(&text).with_context(|| format!("Invalid CSV in {}", path.display()))
}

fn read_mapping(path: &Path) -> anyhow::Result<FieldMapping> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid mapping in {}", path.display()))
}

use clap::{Args, Parser, Subcommand};
use concord_core::{EntityKind, Region};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(
    author,
    version,
    about = "Reconcile CSV files against a remote CRM"
)]
#[command(after_help = "Examples:
  concord validate company companies.csv --mapping companies.toml
  concord import company companies.csv --mapping companies.toml > events.jsonl
  concord migrate person people.csv --mapping people.toml --remap-field \"Source ID\"
  concord delete company stale.csv --id-column id")]
pub struct Config {
    /// API token for the remote service
    #[arg(long, env = "CONCORD_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Hosting region of the remote instance (us, eu)
    #[arg(long, env = "CONCORD_REGION", default_value = "us")]
    pub region: Region,

    /// Base URL override; takes precedence over the region endpoint
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Custom path to concord.toml
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Input shared by every command that reads a dataset.
#[derive(Args, Debug)]
pub struct DatasetArgs {
    /// Entity kind the rows describe (company, person)
    pub kind: EntityKind,

    /// CSV file with a header line
    #[arg(value_name = "CSV")]
    pub csv: PathBuf,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or update remote records from a CSV file
    #[command(after_help = "Examples:
  concord import company companies.csv --mapping companies.toml
  concord import person people.csv --mapping people.toml --update-only
  concord import company companies.csv --mapping companies.toml --failed-rows retry.csv")]
    Import {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// TOML file mapping remote attributes to CSV columns
        #[arg(short, long, value_name = "PATH")]
        mapping: PathBuf,

        /// Never create records; rows without a match are skipped
        #[arg(long)]
        update_only: bool,

        /// On update, clear remote attributes whose cell is empty
        #[arg(long)]
        clear_empty_fields: bool,

        /// Write rows that failed to this CSV file
        #[arg(long, value_name = "PATH")]
        failed_rows: Option<PathBuf>,
    },
    /// Import rows exported from another instance, remapping their ids
    #[command(after_help = "Example: concord migrate company companies.csv --mapping companies.toml --remap-field \"Source ID\"")]
    Migrate {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// TOML file mapping remote attributes to CSV columns
        #[arg(short, long, value_name = "PATH")]
        mapping: PathBuf,

        /// Custom field holding the source-instance id on the target
        #[arg(long, value_name = "FIELD")]
        remap_field: String,

        /// Never create records; rows without a match are skipped
        #[arg(long)]
        update_only: bool,

        /// On update, clear remote attributes whose cell is empty
        #[arg(long)]
        clear_empty_fields: bool,

        /// Write rows that failed to this CSV file
        #[arg(long, value_name = "PATH")]
        failed_rows: Option<PathBuf>,
    },
    /// Delete the remote records named in a CSV file
    #[command(after_help = "Example: concord delete person leavers.csv --id-column \"Record ID\"")]
    Delete {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Column holding the remote identifier
        #[arg(long, value_name = "COLUMN", default_value = "id")]
        id_column: String,

        /// Write rows that failed to this CSV file
        #[arg(long, value_name = "PATH")]
        failed_rows: Option<PathBuf>,
    },
    /// Check a CSV file against a mapping without contacting the remote
    Validate {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// TOML file mapping remote attributes to CSV columns
        #[arg(short, long, value_name = "PATH")]
        mapping: PathBuf,

        /// Accept source-instance ids in the identifier column
        #[arg(long)]
        migration: bool,
    },
}

impl Command {
    pub fn dataset(&self) -> &DatasetArgs {
        match self {
            Command::Import { dataset, .. }
            | Command::Migrate { dataset, .. }
            | Command::Delete { dataset, .. }
            | Command::Validate { dataset, .. } => dataset,
        }
    }
}

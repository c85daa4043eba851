//! Command line access to SDTP tables.

mod error;
mod query;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::warn;
use sdtp_core::{
    TableRegistry,
    config::{BlobConfig, EngineConfig},
    loader::load_sources,
    query::{QueryRequest, column_range, column_values, run_query},
    sync::publish_upload,
    upload::check_descriptor,
};
use snafu::{OptionExt, ResultExt};
use tabled::{builder::Builder, settings::Style};

use crate::{
    error::{
        CliResult, ConfigSnafu, JsonSnafu, LookupSnafu, NoBucketSnafu, PublishSnafu, QuerySnafu,
        ReadDescriptorSnafu, UploadSnafu,
    },
    query::{QueryOpts, print_query_result, write_rows_file},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    Csv,
    Jsonl,
}

impl From<OutputFormatArg> for crate::query::OutputFormat {
    fn from(v: OutputFormatArg) -> Self {
        match v {
            OutputFormatArg::Csv => crate::query::OutputFormat::Csv,
            OutputFormatArg::Jsonl => crate::query::OutputFormat::Jsonl,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered tables and their schemas
    Tables,

    /// Print the schema of one table as JSON
    Schema { table: String },

    /// Fetch rows, optionally filtered and projected
    Query {
        table: String,

        /// Filter in JSON or call form, e.g. "IN_LIST('Month', ['Jun'])"
        #[arg(long)]
        filter: Option<String>,

        /// Repeatable column names; default is every column
        #[arg(long = "column")]
        columns: Vec<String>,

        #[arg(long, default_value_t = 10)]
        max_rows: usize,

        /// Print the result as one JSON document instead of a preview
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Also write every matching row to this file
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormatArg::Csv)]
        format: OutputFormatArg,
    },

    /// Sorted distinct values of a column
    Values { table: String, column: String },

    /// Minimum and maximum of a column
    Range { table: String, column: String },

    /// Publish a descriptor file to the bucket
    Upload {
        descriptor: PathBuf,

        /// Owner; the table is published as <user>/<name>
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "sdtp", version)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repeatable directory of descriptor files, added after the config's
    #[arg(long = "path", global = true)]
    paths: Vec<PathBuf>,

    /// Local directory used as the descriptor bucket
    #[arg(long, global = true)]
    bucket_root: Option<PathBuf>,

    #[arg(long, global = true, default_value = "local")]
    bucket_name: String,

    /// Bucket prefix scanned at startup
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Timeout for each remote call
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    cmd: Command,
}

impl Cli {
    async fn engine_config(&self) -> CliResult<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path).await.context(ConfigSnafu {
                path: path.display().to_string(),
            })?,
            None => EngineConfig::default(),
        };

        config.sdtp_path.extend(self.paths.iter().cloned());
        if let Some(root) = &self.bucket_root {
            let prefix = self
                .prefix
                .clone()
                .unwrap_or_else(|| sdtp_core::blob::BLOB_TABLE_PREFIX.to_string());
            config.blob = Some(BlobConfig {
                root: root.clone(),
                bucket: self.bucket_name.clone(),
                prefix,
            });
        } else if let (Some(blob), Some(prefix)) = (config.blob.as_mut(), &self.prefix) {
            blob.prefix = prefix.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.remote.timeout_ms = timeout_ms;
        }
        Ok(config)
    }
}

async fn open_registry(config: &EngineConfig) -> TableRegistry {
    let registry = config.build_registry();
    let report = load_sources(&registry, &config.sources()).await;
    for failure in &report.failures {
        warn!(
            "skipped {} from {}: {}",
            failure.entry, failure.source, failure.reason
        );
    }
    registry
}

fn cmd_tables(registry: &TableRegistry) {
    let mut builder = Builder::default();
    builder.push_record(["name", "columns"]);
    for name in registry.list_table_names() {
        let Ok(table) = registry.get_table(&name) else {
            continue;
        };
        builder.push_record([name, table.schema().to_string()]);
    }
    let mut table = builder.build();
    table.with(Style::rounded());
    println!("{table}");
}

fn cmd_schema(registry: &TableRegistry, name: &str) -> CliResult<()> {
    let table = registry.get_table(name).context(LookupSnafu)?;
    let json = serde_json::to_string_pretty(table.schema()).context(JsonSnafu)?;
    println!("{json}");
    Ok(())
}

async fn cmd_query(
    registry: &TableRegistry,
    request: QueryRequest,
    opts: QueryOpts,
) -> CliResult<()> {
    let res = run_query(registry, &request).await.context(QuerySnafu)?;
    if let Some(path) = &opts.output {
        write_rows_file(path, opts.format, &res.schema, &res.rows).await?;
    }
    print_query_result(&res, &opts)
}

async fn cmd_values(registry: &TableRegistry, table: &str, column: &str) -> CliResult<()> {
    let values = column_values(registry, table, column)
        .await
        .context(QuerySnafu)?;
    let json: Vec<_> = values.iter().map(|v| v.to_json()).collect();
    println!("{}", serde_json::Value::Array(json));
    Ok(())
}

async fn cmd_range(registry: &TableRegistry, table: &str, column: &str) -> CliResult<()> {
    let range = column_range(registry, table, column)
        .await
        .context(QuerySnafu)?;
    println!("{}", range.to_json());
    Ok(())
}

async fn cmd_upload(
    config: &EngineConfig,
    registry: &TableRegistry,
    descriptor: &Path,
    user: Option<&str>,
) -> CliResult<()> {
    let path = descriptor.display().to_string();
    let bucket = config.descriptor_bucket().context(NoBucketSnafu)?;
    let bytes = tokio::fs::read(descriptor)
        .await
        .context(ReadDescriptorSnafu { path: &path })?;
    let descriptor = check_descriptor(&bytes, &registry.factory_types())
        .context(UploadSnafu { path: &path })?;
    let published = publish_upload(registry, &bucket, &descriptor, user)
        .await
        .context(PublishSnafu { path: &path })?;
    println!(
        "Published {} ({}, {})",
        published.name, published.row_blob, published.reference_blob
    );
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config = cli.engine_config().await?;
    let registry = open_registry(&config).await;

    match cli.cmd {
        Command::Tables => {
            cmd_tables(&registry);
            Ok(())
        }
        Command::Schema { table } => cmd_schema(&registry, &table),
        Command::Query {
            table,
            filter,
            columns,
            max_rows,
            json,
            output,
            format,
        } => {
            let request = QueryRequest {
                table,
                filter,
                columns,
                max_rows: None,
            };
            let opts = QueryOpts {
                max_rows,
                output,
                format: format.into(),
                json,
            };
            cmd_query(&registry, request, opts).await
        }
        Command::Values { table, column } => cmd_values(&registry, &table, &column).await,
        Command::Range { table, column } => cmd_range(&registry, &table, &column).await,
        Command::Upload { descriptor, user } => {
            cmd_upload(&config, &registry, &descriptor, user.as_deref()).await
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

mod display;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyscope_core::config::{generate_default_config, load_config};
use keyscope_core::probe::{HttpProbeExecutor, LoggingTransport};
use keyscope_core::redact::redact_secrets_in_text;
use keyscope_core::{catalog, AnalysisOutcome, Analyzer, CancelToken, Credential, RunConfig, ServiceDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "keyscope",
    version,
    about = "keyscope: find out what a credential can actually do",
    long_about = "Probe a service API with a credential and report which permissions it holds \
    and which resources those permissions reach.\n\nOnly read-only or no-op requests are sent."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a credential against a service
    Analyze {
        /// Bundled service name or path to a service definition file
        service: String,

        /// The secret (fills the `key` credential field)
        #[arg(short, long)]
        key: Option<String>,

        /// Additional credential field, e.g. --field domain=acme.cloud.databricks.com
        #[arg(long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Run configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum probes in flight (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Send every probe to this base URL instead
        #[arg(long)]
        base_url: Option<String>,

        /// Print every request made during the run
        #[arg(long)]
        request_log: bool,
    },

    /// Show the scopes a service definition probes
    Scopes {
        /// Bundled service name or path to a service definition file
        service: String,
    },

    /// Validate a service definition file
    Validate {
        /// Path to the service definition file
        path: PathBuf,
    },

    /// List bundled services (and definitions found in a directory)
    List {
        /// Directory containing additional service definitions
        #[arg(long)]
        services_dir: Option<PathBuf>,
    },

    /// Generate a starter run configuration file
    InitConfig {
        /// Where to write the file
        #[arg(default_value = "keyscope.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Analyze {
            service,
            key,
            fields,
            format,
            config,
            concurrency,
            base_url,
            request_log,
        } => {
            let credential = build_credential(key, &fields)?;
            let mut run_config = match config {
                Some(path) => load_config(&path)?,
                None => RunConfig::default(),
            }
            .with_env_overrides()?;
            if let Some(concurrency) = concurrency {
                run_config.concurrency = concurrency;
            }
            if base_url.is_some() {
                run_config.base_url_override = base_url;
            }
            cmd_analyze(&service, credential, run_config, &format, request_log).await
        }
        Commands::Scopes { service } => cmd_scopes(&service),
        Commands::Validate { path } => cmd_validate(&path),
        Commands::List { services_dir } => cmd_list(services_dir.as_deref()),
        Commands::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

/// Resolve a service argument: an existing file is loaded from disk,
/// anything else is looked up among the bundled services.
fn resolve_service(service: &str) -> Result<ServiceDefinition> {
    let path = Path::new(service);
    if path.is_file() {
        return ServiceDefinition::load(path);
    }
    Ok(catalog::load_bundled(service)?)
}

fn build_credential(key: Option<String>, fields: &[String]) -> Result<Credential> {
    let mut credential = key.map(Credential::from_key).unwrap_or_default();
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .with_context(|| format!("Invalid --field '{}': expected NAME=VALUE", field))?;
        credential.insert(name.trim(), value);
    }
    if credential.is_empty() {
        anyhow::bail!("No credential given. Pass --key and/or --field NAME=VALUE.");
    }
    Ok(credential)
}

async fn cmd_analyze(
    service: &str,
    credential: Credential,
    config: RunConfig,
    format: &str,
    request_log: bool,
) -> Result<()> {
    let definition = resolve_service(service)?;
    let executor = HttpProbeExecutor::new(&config)?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight probes");
            on_interrupt.cancel();
        }
    });

    info!(service = %definition.analyzer_type, concurrency = config.concurrency, "starting analysis");

    let (outcome, entries) = if request_log {
        let transport = Arc::new(LoggingTransport::new(executor));
        let analyzer = Analyzer::new(definition, transport.clone(), config)?;
        let outcome = run_analysis(&analyzer, &credential, cancel).await?;
        (outcome, Some(transport.entries()))
    } else {
        let analyzer = Analyzer::new(definition, Arc::new(executor), config)?;
        let outcome = run_analysis(&analyzer, &credential, cancel).await?;
        (outcome, None)
    };
    let outcome = AnalysisOutcome {
        result: outcome.result.sorted(),
        error: outcome.error,
    };

    match format {
        "json" => {
            let mut report = serde_json::Map::new();
            report.insert("result".to_string(), serde_json::to_value(&outcome.result)?);
            report.insert("failures".to_string(), serde_json::to_value(outcome.failures())?);
            if let Some(entries) = &entries {
                report.insert("request_log".to_string(), serde_json::to_value(entries)?);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            display::print_analysis(&outcome);
            if let Some(entries) = &entries {
                display::print_request_log(entries);
            }
        }
    }

    Ok(())
}

async fn run_analysis(
    analyzer: &Analyzer,
    credential: &Credential,
    cancel: CancelToken,
) -> Result<AnalysisOutcome> {
    analyzer
        .analyze_with_cancel(credential, cancel)
        .await
        .map_err(|e| anyhow::anyhow!(redact_secrets_in_text(&e.to_string())))
        .with_context(|| format!("Failed to analyze {} credential", analyzer.definition().analyzer_type))
}

fn cmd_scopes(service: &str) -> Result<()> {
    let definition = resolve_service(service)?;
    let table = definition.table()?;
    display::print_scope_table(&definition, &table);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let definition = ServiceDefinition::load(path)?;
    let table = definition.table()?;
    display::print_validation(&path.to_string_lossy(), &definition, &table);
    Ok(())
}

fn discover_service_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Services directory '{}' does not exist", dir.display());
    }
    let mut files: Vec<PathBuf> = glob::glob(&format!("{}/*.yaml", dir.display()))
        .context("Failed to read glob pattern")?
        .chain(glob::glob(&format!("{}/*.yml", dir.display())).context("Failed to read glob pattern")?)
        .filter_map(|r| r.ok())
        .collect();
    files.sort();
    Ok(files)
}

fn cmd_list(services_dir: Option<&Path>) -> Result<()> {
    let mut services: Vec<(String, Result<ServiceDefinition, String>)> = catalog::bundled_names()
        .into_iter()
        .map(|name| {
            let definition = catalog::load_bundled(name).map_err(|e| e.to_string());
            (format!("bundled:{name}"), definition)
        })
        .collect();

    if let Some(dir) = services_dir {
        for file in discover_service_files(dir)? {
            let definition = ServiceDefinition::load(&file).map_err(|e| format!("{e:#}"));
            services.push((file.display().to_string(), definition));
        }
    }

    display::print_service_list(&services);
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "'{}' already exists. Use --force to overwrite it.",
            path.display()
        );
    }
    std::fs::write(path, generate_default_config())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Config written to {}", path.display());
    Ok(())
}

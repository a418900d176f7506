use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use terra_dm::app::{PathKind, Pipeline};
use terra_dm::ard::{ArdConverter, CommandConverter, ConversionJob, ConversionOutput};
use terra_dm::config::{ConfigLoader, DEFAULT_CONFIG_FILE, ProviderConfig, ResolvedConfig};
use terra_dm::discovery::{Candidate, CatalogQuery, HttpFeedProvider};
use terra_dm::domain::BBox;
use terra_dm::error::TerraError;
use terra_dm::lock::{FileLock, LockOptions};
use terra_dm::output::{JsonOutput, OutputMode, TextOutput};
use terra_dm::plugins::{PipelineContext, PluginRegistry, PluginRunner};
use terra_dm::store::{CatalogStore, ResetScope};
use terra_dm::transport::HttpTransport;
use terra_dm::usage::UsageLog;

#[derive(Parser)]
#[command(name = "terra-dm")]
#[command(about = "Earth-observation scene catalog and processing pipeline")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to terra-dm.json in the current directory).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Restrict the command to these providers; all configured ones otherwise.
    #[arg(long = "provider", short = 'p', global = true)]
    providers: Vec<String>,

    /// Overrides the configured worker count.
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[arg(long, global = true)]
    text: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Query providers for scenes newer than the catalog")]
    Discover(DiscoverArgs),
    #[command(about = "Remove undownloaded scenes outside the configured regions")]
    Purge,
    #[command(about = "Download pending scenes")]
    Download(SceneArgs),
    #[command(about = "Convert downloaded scenes to analysis-ready data")]
    Ard(SceneArgs),
    #[command(about = "Run analysis plugins on ARD-ready scenes")]
    Analyze(SceneArgs),
    #[command(about = "Take scenes through every remaining stage")]
    Process(SceneArgs),
    #[command(about = "Discover, then download, convert and analyse")]
    Run(DiscoverArgs),
    #[command(about = "Scene counts per lifecycle state")]
    Status,
    #[command(about = "Move a scene back in the lifecycle")]
    Reset(ResetArgs),
    #[command(about = "Forget plugin results so they run again")]
    ResetAnalysis(ResetAnalysisArgs),
    #[command(about = "Mark downloaded scenes as archived")]
    Archive(ArchiveArgs),
    #[command(about = "Rewrite stored download or ARD path prefixes")]
    Relocate(RelocateArgs),
    #[command(about = "Export a provider catalog to JSON")]
    Export(ExportArgs),
    #[command(about = "Import a provider catalog from JSON")]
    Import(ImportArgs),
    #[command(about = "Per-plugin run report")]
    Report(ReportArgs),
    #[command(about = "Recent usage log entries")]
    Usage(UsageArgs),
}

#[derive(Args)]
struct DiscoverArgs {
    /// Ignore the catalog watermark and query from the configured start date.
    #[arg(long)]
    from_start: bool,
}

#[derive(Args)]
struct SceneArgs {
    /// Only this scene id.
    #[arg(long)]
    scene: Option<i64>,
}

#[derive(Args)]
struct ResetArgs {
    #[arg(long)]
    scene: i64,
    /// Also forget the download.
    #[arg(long)]
    download: bool,
    /// Also clear the invalid flag.
    #[arg(long)]
    invalid: bool,
}

#[derive(Args)]
struct ResetAnalysisArgs {
    #[arg(long = "plugin")]
    plugins: Vec<String>,
    #[arg(long)]
    scene: Option<i64>,
}

#[derive(Args)]
struct ArchiveArgs {
    /// Re-point stored download paths at this directory.
    #[arg(long)]
    new_root: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PathKindArg {
    Download,
    Ard,
}

#[derive(Args)]
struct RelocateArgs {
    #[arg(long, value_enum)]
    kind: PathKindArg,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long)]
    output: String,
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long)]
    input: String,
    /// Path prefix replacement, FROM=TO. Repeatable.
    #[arg(long = "replace")]
    replace: Vec<String>,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long)]
    plugin: String,
}

#[derive(Args)]
struct UsageArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<TerraError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TerraError) -> u8 {
    match error {
        TerraError::MissingConfig
        | TerraError::ConfigRead(_)
        | TerraError::ConfigParse(_)
        | TerraError::ConfigInvalid(_)
        | TerraError::UnknownProvider(_)
        | TerraError::UnknownPlugin(_) => 2,
        TerraError::ProviderHttp(_)
        | TerraError::ProviderStatus { .. }
        | TerraError::Transfer(_)
        | TerraError::MissingTool(_)
        | TerraError::Conversion(_) => 3,
        TerraError::SceneNotFound { .. } | TerraError::DuplicateScene { .. } => 4,
        TerraError::LockTimeout(_) => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.text {
        OutputMode::Text
    } else {
        OutputMode::Json
    };

    let config_path = PathBuf::from(cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));
    let resolved = {
        let _config_lock = lock_for(&config_path)?;
        ConfigLoader::resolve(cli.config.as_deref())?
    };
    let workers = cli.workers.unwrap_or(resolved.workers);
    let providers = select_providers(&resolved, &cli.providers)?;

    match cli.command {
        Commands::Usage(args) => {
            let usage = UsageLog::open(resolved.database.clone())?;
            JsonOutput::print_usage(&usage.recent(args.limit)?).into_diagnostic()
        }
        Commands::Status => {
            let mut summaries = Vec::new();
            for provider in &providers {
                summaries.push(build_pipeline(&resolved, provider, workers)?.status()?);
            }
            match mode {
                OutputMode::Json => JsonOutput::print_summary(&summaries),
                OutputMode::Text => TextOutput::print_summary(&summaries),
            }
            .into_diagnostic()
        }
        command => {
            for provider in &providers {
                let _stage_lock = lock_for(&provider_lock_target(&resolved, provider))?;
                let pipeline = build_pipeline(&resolved, provider, workers)?;
                info!(provider = %provider.name, "running command");
                run_provider_command(&command, &pipeline, mode)?;
            }
            Ok(())
        }
    }
}

type CliPipeline = Pipeline<ConfiguredFeed, HttpTransport, ConfiguredConverter>;

fn run_provider_command(command: &Commands, pipeline: &CliPipeline, mode: OutputMode) -> miette::Result<()> {
    let print_stages = |reports: &[terra_dm::app::StageReport]| match mode {
        OutputMode::Json => JsonOutput::print_stages(reports),
        OutputMode::Text => TextOutput::print_stages(reports),
    };
    match command {
        Commands::Discover(args) => {
            JsonOutput::print_discovery(&pipeline.discover(args.from_start)?).into_diagnostic()
        }
        Commands::Purge => JsonOutput::print_purge(&pipeline.purge()?).into_diagnostic(),
        Commands::Download(args) => match args.scene {
            Some(id) => JsonOutput::print_value(&pipeline.download_single(id)?).into_diagnostic(),
            None => print_stages(&[pipeline.download_all()?]).into_diagnostic(),
        },
        Commands::Ard(args) => match args.scene {
            Some(id) => JsonOutput::print_value(&pipeline.convert_single(id)?).into_diagnostic(),
            None => print_stages(&[pipeline.convert_all()?]).into_diagnostic(),
        },
        Commands::Analyze(args) => match args.scene {
            Some(id) => JsonOutput::print_value(&pipeline.analyze_single(id)?).into_diagnostic(),
            None => print_stages(&[pipeline.analyze_all()?]).into_diagnostic(),
        },
        Commands::Process(args) => match args.scene {
            Some(id) => JsonOutput::print_scene(&pipeline.process_scene(id)?).into_diagnostic(),
            None => print_stages(&[pipeline.process_all()?]).into_diagnostic(),
        },
        Commands::Run(args) => print_stages(&pipeline.run_all_stages(args.from_start)?).into_diagnostic(),
        Commands::Reset(args) => {
            let scope = ResetScope {
                download: args.download,
                invalid: args.invalid,
            };
            JsonOutput::print_admin(&pipeline.reset_scene(args.scene, scope)?).into_diagnostic()
        }
        Commands::ResetAnalysis(args) => {
            let plugins = (!args.plugins.is_empty()).then_some(args.plugins.as_slice());
            JsonOutput::print_admin(&pipeline.reset_analysis(plugins, args.scene)?).into_diagnostic()
        }
        Commands::Archive(args) => {
            let root = args.new_root.as_deref().map(Utf8PathBuf::from);
            JsonOutput::print_admin(&pipeline.archive(root.as_deref())?).into_diagnostic()
        }
        Commands::Relocate(args) => {
            let kind = match args.kind {
                PathKindArg::Download => PathKind::Download,
                PathKindArg::Ard => PathKind::Ard,
            };
            JsonOutput::print_admin(&pipeline.relocate(kind, &args.from, &args.to)?).into_diagnostic()
        }
        Commands::Export(args) => {
            let path = export_path(&args.output, pipeline.provider());
            JsonOutput::print_admin(&pipeline.export(&path)?).into_diagnostic()
        }
        Commands::Import(args) => {
            let replace = parse_replacements(&args.replace)?;
            let path = Utf8PathBuf::from(&args.input);
            JsonOutput::print_import(&pipeline.import(&path, &replace)?).into_diagnostic()
        }
        Commands::Report(args) => {
            JsonOutput::print_plugin_report(&pipeline.plugin_report(&args.plugin)?).into_diagnostic()
        }
        Commands::Status | Commands::Usage(_) => Ok(()),
    }
}

fn select_providers<'a>(
    resolved: &'a ResolvedConfig,
    wanted: &[String],
) -> Result<Vec<&'a ProviderConfig>, TerraError> {
    if wanted.is_empty() {
        if resolved.providers.is_empty() {
            return Err(TerraError::ConfigInvalid("no providers configured".to_string()));
        }
        return Ok(resolved.providers.iter().collect());
    }
    wanted.iter().map(|name| resolved.provider(name)).collect()
}

fn build_pipeline(
    resolved: &ResolvedConfig,
    provider: &ProviderConfig,
    workers: usize,
) -> Result<CliPipeline, TerraError> {
    let store = CatalogStore::open(resolved.database.clone(), provider.name.clone())?;
    let usage = UsageLog::open(resolved.database.clone())?;
    let feed = match &provider.feed_url {
        Some(url) => Some(HttpFeedProvider::new(url.clone(), provider.transport.timeout)?),
        None => None,
    };
    let transport = HttpTransport::new(provider.transport.clone())?;
    let converter = match provider.ard.as_ref().and_then(|ard| ard.command.as_ref()) {
        Some(command) => Some(CommandConverter::from_path(
            &command.program,
            command.args.clone(),
            command.output_pattern.clone(),
        )?),
        None => None,
    };
    let plugins = PluginRegistry::with_builtin().resolve(&provider.plugins)?;
    let ctx = PipelineContext {
        provider: provider.name.clone(),
        download_root: provider.download_root.clone().into_std_path_buf(),
        ard_root: provider
            .ard
            .as_ref()
            .map(|ard| ard.root.clone().into_std_path_buf())
            .unwrap_or_default(),
    };
    let runner = PluginRunner::new(store.clone(), plugins, ctx);
    Ok(Pipeline::new(
        provider.clone(),
        store,
        usage,
        ConfiguredFeed {
            provider: provider.name.to_string(),
            feed,
        },
        transport,
        ConfiguredConverter(converter),
        runner,
        workers,
    ))
}

/// The provider's feed client, or an error naming the missing setting.
struct ConfiguredFeed {
    provider: String,
    feed: Option<HttpFeedProvider>,
}

impl CatalogQuery for ConfiguredFeed {
    fn query(&self, since: DateTime<Utc>, bounds: Option<&BBox>) -> Result<Vec<Candidate>, TerraError> {
        match &self.feed {
            Some(feed) => feed.query(since, bounds),
            None => Err(TerraError::ConfigInvalid(format!(
                "provider {} has no feed_url",
                self.provider
            ))),
        }
    }
}

struct ConfiguredConverter(Option<CommandConverter>);

impl ArdConverter for ConfiguredConverter {
    fn convert(&self, job: &ConversionJob<'_>) -> Result<ConversionOutput, TerraError> {
        match &self.0 {
            Some(converter) => converter.convert(job),
            None => Err(TerraError::ConfigInvalid(
                "ard.command is required to convert scenes".to_string(),
            )),
        }
    }
}

fn lock_for(target: &Path) -> Result<FileLock, TerraError> {
    FileLock::acquire(target, LockOptions::default())
}

fn provider_lock_target(resolved: &ResolvedConfig, provider: &ProviderConfig) -> PathBuf {
    let db = resolved.database.as_std_path();
    let dir = db.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("terra-dm-{}", provider.name))
}

/// `{provider}` in the output path expands to the provider name, so one
/// invocation can export several catalogs.
fn export_path(output: &str, provider: &ProviderConfig) -> Utf8PathBuf {
    Utf8PathBuf::from(output.replace("{provider}", provider.name.as_str()))
}

fn parse_replacements(values: &[String]) -> Result<BTreeMap<String, String>, TerraError> {
    values
        .iter()
        .map(|value| {
            value
                .split_once('=')
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .ok_or_else(|| TerraError::ConfigInvalid(format!("replacement must be FROM=TO: {value}")))
        })
        .collect()
}

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use savemap_core::config::{ResolvedSettings, load_config, resolve_settings};
use savemap_core::manifest::{find_duplicates, manifest_stats};
use savemap_core::pipeline::{BulkOptions, RunContext, Stores, execute, run_bulk, run_solo};
use savemap_core::runtime::{
    CancelFlag, PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths,
};
use savemap_core::steam::CommandProductInfoFetcher;
use savemap_core::wiki::{MediaWikiClient, MediaWikiClientConfig};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "savemap",
    version,
    about = "Build a game save-path manifest from PCGamingWiki and Steam product info"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the caches and rebuild the whole manifest.
    Bulk(BulkArgs),
    /// Refresh specific games by page title.
    Solo(SoloArgs),
    /// Print manifest and cache counts.
    Stats,
    /// List games whose manifest entries are identical.
    Duplicates,
}

#[derive(Debug, Args)]
struct BulkArgs {
    /// Re-extract every cached page and re-fetch every cached product.
    #[arg(long)]
    full: bool,
    /// Poll the wiki's recent changes before refreshing.
    #[arg(long)]
    recent_changes: bool,
    /// Reconcile the cache against the full category listing.
    #[arg(long)]
    missing_pages: bool,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    /// Skip pages up to and including this title.
    #[arg(long, value_name = "TITLE")]
    skip_until: Option<String>,
}

#[derive(Debug, Args)]
struct SoloArgs {
    /// Rebuild from the local caches without network access.
    #[arg(long)]
    local: bool,
    #[arg(required = true, value_name = "GAME")]
    games: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Bulk(args)) => run_bulk_command(&runtime, args),
        Some(Commands::Solo(args)) => run_solo_command(&runtime, args),
        Some(Commands::Stats) => run_stats(&runtime),
        Some(Commands::Duplicates) => run_duplicates(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "savemap=info",
        1 => "savemap=debug",
        _ => "savemap=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn run_bulk_command(runtime: &RuntimeOptions, args: BulkArgs) -> Result<()> {
    let (paths, settings) = load_runtime(runtime)?;
    let mut wiki = MediaWikiClient::new(MediaWikiClientConfig::from_settings(&settings))?;
    let mut store = CommandProductInfoFetcher::from_settings(&settings, &paths.project_root);
    let context = RunContext::new(&settings, &paths.data_dir).with_cancel(interrupt_flag()?);
    let options = BulkOptions {
        full: args.full,
        recent_changes: args.recent_changes,
        missing_pages: args.missing_pages,
        limit: args.limit,
        skip_until: args.skip_until,
    };

    execute(&paths.data_dir, |stores| {
        run_bulk(stores, &mut wiki, &mut store, &context, &options)
    })
}

fn run_solo_command(runtime: &RuntimeOptions, args: SoloArgs) -> Result<()> {
    let (paths, settings) = load_runtime(runtime)?;
    let mut wiki = MediaWikiClient::new(MediaWikiClientConfig::from_settings(&settings))?;
    let mut store = CommandProductInfoFetcher::from_settings(&settings, &paths.project_root);
    let context = RunContext::new(&settings, &paths.data_dir).with_cancel(interrupt_flag()?);

    execute(&paths.data_dir, |stores| {
        run_solo(
            stores,
            &mut wiki,
            &mut store,
            &context,
            &args.games,
            args.local,
        )
    })
}

fn run_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let stores = Stores::load(&paths.data_dir)?;
    let stats = manifest_stats(&stores.manifest, &stores.wiki);

    println!("manifest stats");
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("games: {}", stats.games);
    println!("with_files_or_registry: {}", stats.with_files_or_registry);
    println!(
        "without_files_or_registry: {}",
        stats.without_files_or_registry
    );
    println!("cached_pages: {}", stats.cached_pages);
    println!("cached_products: {}", stores.steam.apps.len());
    Ok(())
}

fn run_duplicates(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let stores = Stores::load(&paths.data_dir)?;
    let groups = find_duplicates(&stores.manifest, &stores.wiki)?;

    println!("duplicate groups: {}", groups.len());
    for group in &groups {
        println!();
        for entry in group {
            println!("[{}] {}", entry.page_id, entry.title);
        }
    }
    Ok(())
}

/// Ctrl-C stops the current loop at its next iteration; state is still saved.
fn interrupt_flag() -> Result<CancelFlag> {
    let cancel = CancelFlag::new();
    cancel.register_interrupt()?;
    Ok(cancel)
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ResolvedSettings)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let settings = resolve_settings(&config)?;
    debug!(api_url = %settings.api_url, category = %settings.category, "resolved settings");
    Ok((paths, settings))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if !project_env.exists() {
        debug!(paths = %initial.diagnostics(), "resolved runtime paths");
        return Ok(initial);
    }

    let _ = dotenvy::from_path_override(&project_env);
    let paths = resolve_paths(&context, &overrides)?;
    debug!(paths = %paths.diagnostics(), "resolved runtime paths");
    Ok(paths)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

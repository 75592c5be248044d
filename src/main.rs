use std::{
    env,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use anyhow::Context;
use autopilot::{
    config::{AppConfig, EnvSource},
    engine::Engine,
    logger::{LogSettings, init_tracing},
    model::{ModelLoader, OllamaLoader},
    orchestrator::OrchestrationMode,
    plugins::{builtin_catalog, task_planner::CommandsAdvertised},
    prompt::CommandCatalog,
    session::ControlSession,
};
use autopilot_plugin::{Event, event::names};
use clap::{Args, Parser, Subcommand};
use tokio::{io::BufReader, runtime::Handle};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "autopilot",
    about = "Plugin-driven assistant that turns requests into executable plans",
    version
)]
struct Cli {
    /// Configuration file (JSON or YAML). Defaults to config.{yaml,yml,json} in the root dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the interactive engine
    Run(RunArgs),

    /// Plan a single request and optionally execute it
    Plan(PlanArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Also write log lines to stderr
    #[arg(long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// What to do, in plain words
    request: String,

    /// single, multi or cross
    #[arg(long)]
    mode: Option<OrchestrationMode>,

    /// Rounds for cross mode
    #[arg(long)]
    iterations: Option<usize>,

    /// Run the plan once it is made
    #[arg(long)]
    execute: bool,
}

/// Resolve the autopilot root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("AUTOPILOT_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./autopilot")
    }
}

fn load_config(root: &Path, cli: &Cli) -> anyhow::Result<AppConfig> {
    let env = EnvSource::new(root.join(".env"));
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::discover(root)?,
    };
    config.apply_overrides(&env)?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config.resolve_paths(root);
    Ok(config)
}

fn model_loader(config: &AppConfig) -> Arc<dyn ModelLoader> {
    Arc::new(OllamaLoader::new(
        config.ollama_url.clone(),
        config.ollama_api_key.clone(),
        config.ollama_models.clone(),
    ))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("cannot create root directory {}", root.display()))?;
    let config = load_config(&root, &cli)?;

    let verbose = matches!(&cli.command, Some(Commands::Run(args)) if args.verbose);
    init_tracing(
        &root,
        &LogSettings {
            level: config.log_level.clone(),
            console: verbose,
            ..LogSettings::default()
        },
    )?;

    let code = match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(_) => run(config).await,
        Commands::Plan(args) => plan(config, args).await,
    };
    match code {
        Ok(()) => process::exit(0),
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let loader = model_loader(&config);
    let mut engine = Engine::new(config, builtin_catalog(loader, Handle::current()));

    info!("autopilot starting up");
    if let Err(err) = engine.start().await {
        engine.shutdown();
        return Err(err.into());
    }

    let lifecycle = Arc::clone(engine.lifecycle());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            lifecycle.request_shutdown();
        }
    });

    println!("autopilot running; type `help` for commands, `exit` or Ctrl-C to quit");
    let result = engine.run(BufReader::new(tokio::io::stdin())).await;
    engine.shutdown();
    println!("Goodbye!");
    result.context("reading input")
}

async fn plan(mut config: AppConfig, args: PlanArgs) -> anyhow::Result<()> {
    // the session below plans directly, without the planner plugin
    config
        .plugins
        .retain(|name| name != "task_planner" && name != "debug");
    let loader = model_loader(&config);
    let mut engine = Engine::new(
        config.clone(),
        builtin_catalog(Arc::clone(&loader), Handle::current()),
    );

    let catalog = Arc::new(CommandCatalog::new());
    catalog.load_dir(&config.data_dir.join("commands"));
    let advertised = Arc::clone(&catalog);
    engine
        .bus()
        .subscribe_fn(names::PLUGIN_COMMANDS_REGISTERED, move |event: &Event| {
            let ad: CommandsAdvertised = serde_json::from_value(event.payload.clone())?;
            advertised.register(&ad.plugin_name, ad.commands);
            Ok(())
        });
    if let Err(err) = engine.start().await {
        engine.shutdown();
        return Err(err.into());
    }

    let result = plan_and_run(&config, loader, &engine, catalog, args).await;
    engine.shutdown();
    result
}

async fn plan_and_run(
    config: &AppConfig,
    loader: Arc<dyn ModelLoader>,
    engine: &Engine,
    catalog: Arc<CommandCatalog>,
    args: PlanArgs,
) -> anyhow::Result<()> {
    let mut session =
        ControlSession::from_config(config, loader, Arc::clone(engine.bus()), catalog)?;
    if let Some(mode) = args.mode {
        session.set_mode(mode, args.iterations);
    }

    let planned = session.request_plan(&args.request).await?;
    println!("{}", planned.plan.describe(true));
    if !args.execute {
        return Ok(());
    }

    let report = session.execute_current().await?;
    println!("{}", report.summary());
    if report.success_count < report.total {
        anyhow::bail!("{} of {} actions failed", report.total - report.success_count, report.total);
    }
    Ok(())
}

//! Command line driver for the canonical asset pipelines.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use tsumugi::loader::{self, Toolchain};
use tsumugi::{
    Blueprint, ConfigError, Environment, ErrorSink, Handle, Mode, ReloadBus, Report, WatchError,
    Website,
};

#[derive(Parser, Debug)]
#[command(name = "tsumugi", version, about = "Builds a static front-end from a source tree")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Root of the source tree
    #[arg(long, global = true, env = "TSUMUGI_SRC", default_value = "src")]
    src: Utf8PathBuf,

    /// Root of the output tree
    #[arg(long, global = true, env = "TSUMUGI_OUT", default_value = "app")]
    out: Utf8PathBuf,

    /// Port of the development HTTP server
    #[arg(long, global = true, env = "TSUMUGI_PORT", default_value_t = 8080)]
    port: u16,

    /// Port of the reload channel, an ephemeral one is used if it's taken
    #[arg(
        long,
        global = true,
        env = "TSUMUGI_RELOAD_PORT",
        default_value_t = tsumugi::DEFAULT_RELOAD_PORT
    )]
    reload_port: u16,

    /// Settling window for file system events, in milliseconds
    #[arg(long, global = true, env = "TSUMUGI_DEBOUNCE_MS", default_value_t = 250)]
    debounce_ms: u64,

    /// Command converting `font.ttf` into `font.woff2`
    #[arg(long, global = true, env = "TSUMUGI_WOFF2", default_value = "woff2_compress")]
    woff2_encoder: String,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Build once, then watch, serve and reload (default)
    Dev,
    /// Clean production build: minified styles, compressed images
    Build,
    /// Print the production task graph as a Mermaid diagram
    Graph,
}

impl Cli {
    fn environment(&self, mode: Mode) -> Environment {
        let mut env = Environment::new(mode, self.src.clone(), self.out.clone());
        env.port = self.port;
        env.debounce = Duration::from_millis(self.debounce_ms);
        env
    }

    fn toolchain(&self) -> Toolchain {
        Toolchain {
            woff2: self.woff2_encoder.clone(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = tsumugi::init_logging() {
        eprintln!("couldn't initialize logging: {err}");
    }

    let result = match cli.command.unwrap_or(Command::Dev) {
        Command::Dev => dev(&cli),
        Command::Build => build(&cli),
        Command::Graph => graph(&cli),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            exit_code(&err)
        }
    }
}

/// Misconfiguration is reported with 2, everything else with 1.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    let config = err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<WatchError>(), Some(WatchError::Config(_)));

    match config {
        true => ExitCode::from(2),
        false => ExitCode::from(1),
    }
}

fn plan(env: Environment, tools: &Toolchain) -> Result<(Website, Handle), ConfigError> {
    let mut blueprint = Blueprint::new();
    let root = loader::canonical(&mut blueprint, &env, tools)?;
    Ok((blueprint.finish(env)?, root))
}

fn build(cli: &Cli) -> anyhow::Result<ExitCode> {
    let (site, root) = plan(cli.environment(Mode::Build), &cli.toolchain())?;

    let sink = ErrorSink::new();
    let report = site.run(root, &sink);
    print_timings(&report);

    let summary = sink.summarize();
    eprintln!("{summary}");

    Ok(match summary.is_success() {
        true => ExitCode::SUCCESS,
        false => ExitCode::from(1),
    })
}

fn dev(cli: &Cli) -> anyhow::Result<ExitCode> {
    let bus = Arc::new(ReloadBus::bind(cli.reload_port)?);

    let mut env = cli.environment(Mode::Watch);
    env.reload_port = bus.port();

    let (site, root) = plan(env, &cli.toolchain())?;
    let site = Arc::new(site);
    let sink = ErrorSink::new();

    // bound tasks are checked for overlapping outputs before anything is written
    let mut watcher = loader::watcher(site.clone(), sink.clone())?.with_bus(bus);

    tracing::info!("running initial build...");
    let report = site.run(root, &sink);
    print_timings(&report);

    let _http = tsumugi::serve(site.env().dist.clone(), site.env().port);

    watcher.start()?;
    tracing::info!("initial build completed, now watching for changes...");
    watcher.wait();

    Ok(ExitCode::SUCCESS)
}

fn graph(cli: &Cli) -> anyhow::Result<ExitCode> {
    let (site, _) = plan(cli.environment(Mode::Build), &cli.toolchain())?;
    println!("{site}");
    Ok(ExitCode::SUCCESS)
}

fn print_timings(report: &Report) {
    let mut timings = report.timings.clone();
    timings.sort_by(|a, b| b.duration.cmp(&a.duration));

    for exec in &timings {
        tracing::info!(
            "{:<12} {}",
            exec.task,
            style(format!("{:.2?}", exec.duration)).dim()
        );
    }
}

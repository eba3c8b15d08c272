//! Hearth CLI: a line-oriented chat REPL over a local model.
//!
//! # Event Loop
//!
//! ```text
//! stdin lines ──> commands ──> SessionController ──> WorkerRequest ──> worker task
//!                                     ^                                    │
//!                                     └──────────── WorkerEvent ───────────┘
//! ```
//!
//! A periodic tick enforces the generation timeout. Ctrl-C interrupts a
//! running response, or exits when nothing is running.

mod commands;
mod view;

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader, stdin};
use tokio::signal::ctrl_c;
use tokio::time::{MissedTickBehavior, interval};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

use hearth_cache::{BlobCache, DEFAULT_NAMESPACE};
use hearth_config::{HearthConfig, persist_settings};
use hearth_engine::{Banner, ControllerError, SessionController, Settings, SettingsDraft};
use hearth_providers::{BackendConfig, HttpBackend};
use hearth_worker::spawn_worker;

use crate::commands::{Command, HELP};
use crate::view::TerminalView;

const TICK_INTERVAL: Duration = Duration::from_millis(250);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the transcript; without a file, drop logs rather than interleave.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!("Failed to create log dir {}: {e}", parent.display()));
            continue;
        }
        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!("Failed to open log file {}: {e}", candidate.display())),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    // ~/.hearth/logs/hearth.log
    if let Some(dir) = hearth_config::config_dir() {
        candidates.push(dir.join("logs").join("hearth.log"));
    }
    candidates.push(PathBuf::from(".hearth").join("logs").join("hearth.log"));
    candidates
}

#[derive(Debug, Default)]
struct Args {
    html: Option<PathBuf>,
}

const USAGE: &str = "usage: hearth [--html <file>]

  --html <file>   write the transcript as HTML after every response";

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Args>> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--html" => {
                let path = args.next().context("--html needs a file path")?;
                parsed.html = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Ok(None),
            other => bail!("unexpected argument '{other}'\n{USAGE}"),
        }
    }
    Ok(Some(parsed))
}

fn initial_settings(config: &HearthConfig) -> Settings {
    Settings::validate(config.settings_draft()).unwrap_or_else(|err| {
        tracing::warn!("Ignoring invalid settings in config: {err}");
        eprintln!("hearth: invalid settings in config ({err}); using defaults");
        Settings::default()
    })
}

fn build_backend(config: &HearthConfig) -> Result<HttpBackend> {
    let cache_dir = config
        .cache_dir()
        .context("could not determine a cache directory; set [cache] dir in the config")?;
    let cache = BlobCache::open(&cache_dir, DEFAULT_NAMESPACE)
        .with_context(|| format!("failed to open blob cache at {}", cache_dir.display()))?;
    match cache.purge_other_versions() {
        Ok(0) => {}
        Ok(purged) => tracing::info!(purged, "Removed stale cache namespaces"),
        Err(err) => tracing::warn!("Failed to purge stale cache namespaces: {err}"),
    }

    let hub_url = Url::parse(&config.hub_url()).context("invalid model hub URL")?;
    let runtime_url = Url::parse(&config.runtime_url()).context("invalid runtime URL")?;
    Ok(HttpBackend::new(
        BackendConfig::new(hub_url, runtime_url, config.model_files()),
        cache,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Some(args) = parse_args(env::args().skip(1))? else {
        println!("{USAGE}");
        return Ok(());
    };

    let config = match HearthConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            tracing::warn!("Failed to load config: {err}");
            eprintln!("hearth: {err}; using defaults");
            HearthConfig::default()
        }
    };

    let (worker, mut events) = spawn_worker(build_backend(&config)?);
    let mut controller = SessionController::builder(config.model_id())
        .worker(worker)
        .renderer(TerminalView::new(args.html))
        .settings(initial_settings(&config))
        .retention(config.retention())
        .max_new_tokens(config.max_new_tokens())
        .generation_timeout(config.generation_timeout())
        .build()?;

    println!("hearth: {} (type /help for commands)", controller.model_id());
    controller.start()?;

    let mut lines = BufReader::new(stdin()).lines();
    let mut tick = interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shown_banner: Option<Banner> = None;

    loop {
        show_banner(&controller, &mut shown_banner);
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if handle_line(&mut controller, &line) == Flow::Quit {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::error!("Worker stopped unexpectedly");
                    eprintln!("hearth: inference worker stopped");
                    break;
                };
                controller.handle_event(event);
            }
            _ = tick.tick() => {
                controller.check_timeout(Instant::now());
            }
            signal = ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                if !controller.interrupt()? {
                    break;
                }
            }
        }
    }

    if let Err(err) = controller.interrupt() {
        tracing::debug!("Interrupt on exit failed: {err}");
    }
    tracing::info!("Exiting");
    Ok(())
}

fn show_banner(controller: &SessionController, shown: &mut Option<Banner>) {
    let current = controller.banner();
    if current == shown.as_ref() {
        return;
    }
    if let Some(banner) = current {
        let marker = if banner.is_error() { '!' } else { '*' };
        println!("{marker} {}", banner.text());
    }
    *shown = current.cloned();
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn handle_line(controller: &mut SessionController, line: &str) -> Flow {
    let command = match commands::parse(line) {
        Ok(command) => command,
        Err(err) => {
            println!("! {err}");
            return Flow::Continue;
        }
    };

    let outcome = match command {
        Command::Submit(text) => controller.submit(&text).map(drop),
        Command::Stop => controller.interrupt().map(drop),
        Command::Retry => controller.retry(),
        Command::Clear => controller.clear_conversation().map(drop),
        Command::Set { field, value } => {
            match commands::apply(SettingsDraft::from_settings(controller.settings()), field, &value) {
                Ok(draft) => save(controller, draft),
                Err(err) => {
                    println!("! {err}");
                    Ok(())
                }
            }
        }
        Command::Show => {
            show_settings(controller.settings());
            Ok(())
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => return Flow::Quit,
    };
    if let Err(err) = outcome {
        println!("! {err}");
    }
    Flow::Continue
}

fn save(
    controller: &mut SessionController,
    draft: SettingsDraft,
) -> Result<(), ControllerError> {
    let change = controller.save_settings(draft)?;
    tracing::info!(?change, "Settings updated from prompt");
    if let Err(err) = persist_settings(controller.settings()) {
        tracing::warn!("Failed to persist settings: {err}");
        println!("! settings applied but not saved: {err}");
    }
    Ok(())
}

fn show_settings(settings: &Settings) {
    println!("system prompt: {}", settings.system_prompt());
    println!("temperature:   {}", settings.temperature());
    println!("top_k:         {}", settings.top_k());
    println!(
        "access token:  {}",
        if settings.access_token().is_some() { "set" } else { "not set" }
    );
}

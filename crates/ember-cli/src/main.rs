//! `ember` – run an embodied agent from a TOML description.
//!
//! ```text
//! ember [run] [CONFIG]   load, validate, and run the agent loop
//! ember check [CONFIG]   validate and print what would be built
//! ember init [PATH]      write a starter config (simulated robot)
//! ```
//!
//! `CONFIG` defaults to `$EMBER_CONFIG`, then `./ember.toml`.  An invalid
//! configuration is reported and the process exits non-zero before any
//! component starts.  Ctrl-C engages the emergency stop, publishes
//! `EmergencyStop` on the bus, and shuts down after the current tick.

mod config;
mod probe;
mod wiring;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;

use colored::Colorize;
use ember_middleware::{TelemetryServer, Topic};
use ember_runtime::{AgentConfig, init_tracing};
use ember_types::{ControlCommand, EmberError, Event, EventPayload};
use tokio::sync::watch;
use tracing::{error, info, warn};

enum Command<'a> {
    Run(Option<&'a str>),
    Check(Option<&'a str>),
    Init(Option<&'a str>),
    Help,
}

fn parse_args(args: &[String]) -> Command<'_> {
    let arg = |i: usize| args.get(i).map(String::as_str);
    match arg(0) {
        None => Command::Run(None),
        Some("run") => Command::Run(arg(1)),
        Some("check") => Command::Check(arg(1)),
        Some("init") => Command::Init(arg(1)),
        Some("help" | "-h" | "--help") => Command::Help,
        Some(path) => Command::Run(Some(path)),
    }
}

fn main() -> ExitCode {
    let _guard = init_tracing("ember");
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match parse_args(&args) {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Init(path) => cmd_init(Path::new(path.unwrap_or(config::DEFAULT_FILE))),
        Command::Check(path) => load(path).map(|cfg| print_summary(&cfg)),
        Command::Run(path) => load(path).and_then(|cfg| {
            print_banner(&cfg);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| EmberError::Configuration(format!("failed to start runtime: {e}")))?;
            runtime.block_on(run(cfg))
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn load(arg: Option<&str>) -> Result<AgentConfig, EmberError> {
    let path = config::resolve_path(arg);
    let cfg = config::load_from(&path)?;
    info!(path = %path.display(), agent = %cfg.name, "configuration loaded");
    Ok(cfg)
}

fn cmd_init(path: &Path) -> Result<(), EmberError> {
    config::write_starter(path)?;
    println!(
        "  {} Starter config written to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    println!("  Run it with `{}`.", format!("ember {}", path.display()).bold());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: AgentConfig) -> Result<(), EmberError> {
    print!("  Inference endpoint {} … ", cfg.inference.base_url.dimmed());
    io::stdout().flush().ok();
    match probe::list_models(&cfg.inference.base_url, cfg.inference.api_key()).await {
        Ok(models) if probe::serves(&models, &cfg.inference.model) => {
            println!("{} (model {} available)", "online".green(), cfg.inference.model.bold());
        }
        Ok(models) => {
            println!("{}", "online".green());
            println!(
                "  {} model '{}' is not listed ({} served); ticks will abort until it is.",
                "Warning:".yellow(),
                cfg.inference.model,
                models.len()
            );
        }
        Err(e) => {
            println!("{}", "offline".yellow());
            warn!(error = %e, "inference endpoint not reachable; ticks will abort until it is");
        }
    }

    let mut assembly = wiring::assemble(&cfg).await?;

    if let Some(port) = cfg.telemetry.port {
        let server = TelemetryServer::new(assembly.bus.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        println!("  Telemetry stream on {}", format!("ws://{addr}").yellow());
        tokio::spawn(async move {
            if let Err(e) = server.run(addr).await {
                error!(error = %e, "telemetry server stopped");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let halt = assembly.halt.clone();
    let bus = assembly.bus.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C – emergency stop, shutting down …".yellow().bold());
        halt.engage();
        let stop = Event::new("ember-cli", EventPayload::Control(ControlCommand::EmergencyStop));
        let _ = bus.publish_to(Topic::Control, stop);
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    assembly.start_inputs()?;
    println!(
        "  {} {} is {}. Press {} to stop.\n",
        "✓".green().bold(),
        cfg.name.bold(),
        "RUNNING".green().bold(),
        "Ctrl-C".bold()
    );
    let ticks = assembly.agent.run(shutdown_rx).await;
    assembly.stop_inputs().await;
    println!("  {} Stopped after {ticks} tick(s).", "✓".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(cfg: &AgentConfig) {
    println!("{} {}", "✓".green().bold(), format!("'{}' is valid", cfg.name).bold());
    let t = &cfg.timing;
    println!(
        "  timing     tick {}ms, deadline {}ms, inference {}ms, dispatch {}ms",
        t.tick_interval_ms, t.tick_deadline_ms, t.inference_timeout_ms, t.dispatch_timeout_ms
    );
    println!("  model      {} @ {}", cfg.inference.model, cfg.inference.base_url);
    println!("  inputs");
    for input in &cfg.inputs {
        let required = if input.required { " (required)" } else { "" };
        println!("    • {}{}", input.id.bold(), required.dimmed());
    }
    println!("  plugins");
    for plugin in &cfg.plugins {
        println!("    • {}", plugin.id.bold());
    }
    println!("  actions");
    for action in &cfg.actions {
        println!("    • {} → {}", action.signature().cyan(), action.target);
    }
    for limit in &cfg.safety.param_limits {
        println!(
            "  limit      |{}.{}| ≤ {}",
            limit.action, limit.param, limit.max_abs
        );
    }
}

fn print_banner(cfg: &AgentConfig) {
    println!();
    println!("{}", r#"   ___       __          "#.bold().red());
    println!("{}", r#"  / _ \__ _ / /  ___ ____"#.bold().red());
    println!("{}", r#" /  __/  ' \/ _ \/ -_) __/"#.bold().red());
    println!("{}", r#" \___/_/_/_/_.__/\__/_/   "#.bold().red());
    println!();
    println!(
        "  {} {}  agent {}",
        "Ember".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed(),
        cfg.name.bold()
    );
    println!();
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  ember [run] [CONFIG]   run the agent loop");
    println!("  ember check [CONFIG]   validate a config and print a summary");
    println!("  ember init [PATH]      write a starter config");
    println!();
    println!("CONFIG defaults to $EMBER_CONFIG, then ./{}", config::DEFAULT_FILE);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_path_means_run() {
        let a = args(&["robots/lobby.toml"]);
        assert!(matches!(parse_args(&a), Command::Run(Some("robots/lobby.toml"))));
        let none = args(&[]);
        assert!(matches!(parse_args(&none), Command::Run(None)));
    }

    #[test]
    fn subcommands() {
        let a = args(&["check", "x.toml"]);
        assert!(matches!(parse_args(&a), Command::Check(Some("x.toml"))));
        let a = args(&["init"]);
        assert!(matches!(parse_args(&a), Command::Init(None)));
        let a = args(&["--help"]);
        assert!(matches!(parse_args(&a), Command::Help));
    }
}

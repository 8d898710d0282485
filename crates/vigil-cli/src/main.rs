//! `vigil-cli` – Vigil Command Line Interface
//!
//! The operator entry point for a robot safety-patrol fleet.  It:
//!
//! 1. Initialises structured logging (and OTLP span export when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` is set).
//! 2. Loads `~/.vigil/config.toml`, writing a template on first run.
//! 3. Connects every configured robot and the detection broker.
//! 4. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/start`, `/inspect`, `/stop`, `/status`, `/count`, `/help`).
//! 5. Intercepts **Ctrl-C** to stop every patrol before exiting.

mod config;
mod fleet;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::Config;
use crate::fleet::Fleet;

fn main() {
    // The guard flushes exported spans when main returns.
    let _tracing = vigil_runtime::init_tracing("vigil");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_template(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    println!("\n  Connecting {} robot(s) …", cfg.robots.len());
    let fleet = runtime.block_on(Fleet::start(&cfg));
    for robot in &fleet.robots {
        let state = if fleet.is_connected(&robot.id) {
            "online".green()
        } else {
            "offline".yellow()
        };
        println!("    • {} {}", robot.id.bold(), state);
    }
    if let Some(cloud) = &fleet.cloud {
        let state = if cloud.is_connected() { "online".green() } else { "offline".yellow() };
        println!("    • detection broker ({}) {}", cloud.prefix().dimmed(), state);
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let handle = runtime.handle().clone();
    let registry = Arc::clone(&fleet.registry);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping every patrol …".yellow().bold());
        handle.block_on(registry.stop_all());
        println!("{}", "  ✓ All runs stopped.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; patrols will not be stopped on Ctrl-C");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&runtime, &fleet, shutdown);

    runtime.block_on(fleet.shutdown());
    println!("{}", "  ✓ Exiting Vigil.".green());
}

fn write_template() -> Config {
    let cfg = Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  No configuration found; wrote a template to {}.\n  Add [[robots]] and [[routes]] there and restart.",
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#" _   __ (_) ___ _ (_) /"#.bold().cyan());
    println!("{}", r#"| | / // // _ `// // / "#.bold().cyan());
    println!("{}", r#"| |/ // // (_| // // /  "#.bold().cyan());
    println!("{}", r#"|___//_/ \__, //_//_/   "#.bold().cyan());
    println!("{}", r#"         /___/          "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Vigil".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot safety patrol control plane");
    println!();
}

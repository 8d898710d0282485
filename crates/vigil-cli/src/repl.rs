//! REPL – Read-Eval-Print Loop for the Vigil operator shell.
//!
//! Supported slash-commands:
//!   /help                    – show this list
//!   /robots                  – configured robots, connection and run state
//!   /routes                  – configured routes
//!   /start <robot> <route>   – start a patrol
//!   /inspect <robot> <route> – start a pipeline-gated inspection
//!   /stop [robot]            – stop one run, or every run
//!   /pause <robot>           – pause a run
//!   /resume <robot>          – resume a paused run
//!   /speed <robot> <0.1-1.0> – set patrol speed
//!   /status [robot]          – run status
//!   /count                   – latest detection counts
//!   /quit | /exit            – stop every run and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

use vigil_perception::SnapshotSource;
use vigil_runtime::RouteSource;

use crate::fleet::Fleet;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Robots,
    Routes,
    Start { robot: String, route: String },
    Inspect { robot: String, route: String },
    Stop(Option<String>),
    Pause(String),
    Resume(String),
    Speed { robot: String, speed: f64 },
    Status(Option<String>),
    Count,
    Quit,
}

/// Parse one input line.  The error is the message shown to the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let one = |usage: &str| match args.as_slice() {
        [robot] => Ok(robot.to_string()),
        _ => Err(format!("usage: {usage}")),
    };
    let two = |usage: &str| match args.as_slice() {
        [a, b] => Ok((a.to_string(), b.to_string())),
        _ => Err(format!("usage: {usage}")),
    };
    let optional = || args.first().map(|s| s.to_string());

    match cmd {
        "/help" => Ok(Command::Help),
        "/robots" => Ok(Command::Robots),
        "/routes" => Ok(Command::Routes),
        "/start" => {
            two("/start <robot> <route>").map(|(robot, route)| Command::Start { robot, route })
        }
        "/inspect" => {
            two("/inspect <robot> <route>").map(|(robot, route)| Command::Inspect { robot, route })
        }
        "/stop" => Ok(Command::Stop(optional())),
        "/pause" => one("/pause <robot>").map(Command::Pause),
        "/resume" => one("/resume <robot>").map(Command::Resume),
        "/speed" => {
            let (robot, raw) = two("/speed <robot> <0.1-1.0>")?;
            let speed = raw
                .parse::<f64>()
                .map_err(|_| format!("'{raw}' is not a number"))?;
            Ok(Command::Speed { robot, speed })
        }
        "/status" => Ok(Command::Status(optional())),
        "/count" => Ok(Command::Count),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'. Type /help for available commands.")),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(runtime: &Runtime, fleet: &Fleet, shutdown: Arc<AtomicBool>) {
    let config = rustyline::Config::builder().auto_add_history(true).build();
    let mut editor = match DefaultEditor::with_config(config) {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline("vigil> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => execute(runtime, fleet, command),
            Err(message) => println!("{}", message.red()),
        }
    }
}

fn execute(runtime: &Runtime, fleet: &Fleet, command: Command) {
    let registry = &fleet.registry;
    match command {
        Command::Help => cmd_help(),
        Command::Robots => cmd_robots(fleet),
        Command::Routes => cmd_routes(fleet),
        Command::Start { robot, route } | Command::Inspect { robot, route }
            if fleet.routes.route(&route).is_none() =>
        {
            println!("{} '{}' (robot {})", "Unknown route:".red(), route.yellow(), robot);
        }
        Command::Start { robot, route } => {
            let Some(route) = fleet.routes.route(&route) else { return };
            match registry.start_patrol(&robot, route) {
                Ok(run_id) => println!("{} patrol {} on {}", "✓".green(), run_id, robot.bold()),
                Err(e) => println!("{}: {}", "Cannot start patrol".red(), e),
            }
        }
        Command::Inspect { robot, route } => {
            let Some(route) = fleet.routes.route(&route) else { return };
            match registry.start_inspection(&robot, route) {
                Ok(run_id) => println!("{} inspection {} on {}", "✓".green(), run_id, robot.bold()),
                Err(e) => println!("{}: {}", "Cannot start inspection".red(), e),
            }
        }
        Command::Stop(Some(robot)) => {
            if runtime.block_on(registry.stop_patrol(&robot)) {
                println!("{} stopped {}", "✓".green(), robot.bold());
            } else {
                println!("{} has no run to stop", robot.yellow());
            }
        }
        Command::Stop(None) => {
            let count = registry.active_count();
            runtime.block_on(registry.stop_all());
            println!("{} stopped {} run(s)", "✓".green(), count);
        }
        Command::Pause(robot) => report(runtime.block_on(registry.pause_patrol(&robot)), "paused", &robot),
        Command::Resume(robot) => {
            report(runtime.block_on(registry.resume_patrol(&robot)), "resumed", &robot)
        }
        Command::Speed { robot, speed } => match registry.set_speed(&robot, speed) {
            Some(applied) => println!("{} {} speed {:.2}", "✓".green(), robot.bold(), applied),
            None => println!("{} has no active patrol", robot.yellow()),
        },
        Command::Status(Some(robot)) => print_status(fleet, &robot),
        Command::Status(None) => {
            let active = registry.active_robots();
            if active.is_empty() {
                println!("  No active runs.");
            }
            for robot in active {
                print_status(fleet, &robot);
            }
        }
        Command::Count => cmd_count(fleet),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Vigil Commands".bold().underline());
    println!("  {}                    – configured robots", "/robots".bold().cyan());
    println!("  {}                    – configured routes", "/routes".bold().cyan());
    println!("  {}    – start a patrol", "/start <robot> <route>".bold().cyan());
    println!("  {}  – start an inspection", "/inspect <robot> <route>".bold().cyan());
    println!("  {}              – stop one run or all", "/stop [robot]".bold().cyan());
    println!("  {}  – pause / resume", "/pause|/resume <robot>".bold().cyan());
    println!("  {}  – set patrol speed", "/speed <robot> <0.1-1.0>".bold().cyan());
    println!("  {}            – run status", "/status [robot]".bold().cyan());
    println!("  {}                     – latest detection counts", "/count".bold().cyan());
    println!("  {}              – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_robots(fleet: &Fleet) {
    println!("{}", "Robots".bold().underline());
    if fleet.robots.is_empty() {
        println!("  None configured. Add [[robots]] to the config file.");
    }
    for robot in &fleet.robots {
        let link = if fleet.is_connected(&robot.id) {
            "connected".green()
        } else {
            "offline".red()
        };
        let run = if fleet.registry.is_active(&robot.id) { "active".yellow() } else { "idle".dimmed() };
        println!(
            "  {} ({}) {}:{}  {}  {}",
            robot.id.bold(),
            robot.serial.dimmed(),
            robot.host,
            robot.port,
            link,
            run
        );
    }
}

fn cmd_routes(fleet: &Fleet) {
    println!("{}", "Routes".bold().underline());
    let ids = fleet.routes.ids();
    if ids.is_empty() {
        println!("  None configured. Add [[routes]] to the config file.");
    }
    for id in ids {
        let Some(route) = fleet.routes.route(&id) else { continue };
        let loops = if route.is_infinite() {
            "∞".to_string()
        } else {
            route.loop_count.to_string()
        };
        println!(
            "  {} – {} ({} waypoint(s), loops {}, robot {})",
            route.id.bold(),
            route.name,
            route.waypoints.len(),
            loops,
            route.robot_id.dimmed()
        );
    }
}

fn print_status(fleet: &Fleet, robot: &str) {
    if let Some(status) = fleet.registry.status(robot) {
        let battery = status
            .battery_level
            .map_or_else(|| "?".to_string(), |b| format!("{b}%"));
        let total = if status.is_infinite_loop {
            "∞".to_string()
        } else {
            status.total_loops.to_string()
        };
        println!(
            "  {} {:?} at {} ({}/{}), loop {}/{}, battery {}{}, speed {:.2}",
            robot.bold(),
            status.state,
            status.current_waypoint.as_deref().unwrap_or("-"),
            status.current_waypoint_index + 1,
            status.total_waypoints,
            status.current_loop,
            total,
            battery,
            if status.is_low_battery { " (low)" } else { "" },
            status.speed
        );
    } else if let Some(state) = fleet.registry.inspection_state(robot) {
        println!("  {} inspection {:?}", robot.bold(), state);
    } else {
        println!("  {} has no active run", robot.yellow());
    }
}

fn cmd_count(fleet: &Fleet) {
    let snapshot = fleet.router.snapshot_source().snapshot();
    let Some(violations) = snapshot.total_violations else {
        println!("  No counts received from the detection pipeline yet.");
        return;
    };
    let age = snapshot
        .last_message_time
        .map(|t| format!("{}s ago", (chrono::Utc::now() - t).num_seconds().max(0)))
        .unwrap_or_default();
    println!(
        "  {} violation(s) among {} people {}",
        violations.to_string().bold(),
        snapshot.total_people,
        age.dimmed()
    );
    if !snapshot.viewports.is_empty() {
        let viewports = serde_json::to_string(&snapshot.viewports).unwrap_or_default();
        println!("  viewports: {}", viewports.dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn report(done: bool, verb: &str, robot: &str) {
    if done {
        println!("{} {} {}", "✓".green(), verb, robot.bold());
    } else {
        println!("{} could not be {}", robot.yellow(), verb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_commands() {
        assert_eq!(
            parse("/start temi-1 lobby"),
            Ok(Command::Start { robot: "temi-1".into(), route: "lobby".into() })
        );
        assert_eq!(
            parse("  /inspect temi-1   lobby "),
            Ok(Command::Inspect { robot: "temi-1".into(), route: "lobby".into() })
        );
        assert_eq!(parse("/pause temi-1"), Ok(Command::Pause("temi-1".into())));
        assert_eq!(parse("/resume temi-1"), Ok(Command::Resume("temi-1".into())));
    }

    #[test]
    fn optional_robot_arguments() {
        assert_eq!(parse("/stop"), Ok(Command::Stop(None)));
        assert_eq!(parse("/stop temi-1"), Ok(Command::Stop(Some("temi-1".into()))));
        assert_eq!(parse("/status"), Ok(Command::Status(None)));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
    }

    #[test]
    fn speed_must_be_numeric() {
        assert_eq!(
            parse("/speed temi-1 0.7"),
            Ok(Command::Speed { robot: "temi-1".into(), speed: 0.7 })
        );
        assert!(parse("/speed temi-1 fast").is_err());
    }

    #[test]
    fn wrong_arity_reports_usage() {
        assert_eq!(parse("/start temi-1"), Err("usage: /start <robot> <route>".to_string()));
        assert!(parse("/pause").is_err());
        assert!(parse("/launch").unwrap_err().contains("Unknown command"));
    }
}

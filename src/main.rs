//! harel - statechart interpreter
//!
//! Validates machine definitions, resolves single transitions, and runs an
//! interpreter over a sequence of events.

use clap::{Parser, Subcommand};
use harel_core::{Event, Machine, MachineDefinition, StateValue};
use harel_runtime::{ClockKind, Clock, Config, Interpreter, SimulatedClock, TokioClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harel")]
#[command(about = "Hierarchical statechart interpreter")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "HAREL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a machine definition
    Validate {
        /// Definition JSON file
        definition: PathBuf,
    },

    /// Resolve one event from a state value without running any actions
    Transition {
        /// Definition JSON file
        definition: PathBuf,

        /// Source state value (JSON, or a bare state key)
        #[arg(short, long)]
        value: Option<String>,

        /// Event name, optionally with data as NAME=JSON
        event: String,
    },

    /// Start an interpreter and feed it events, printing every snapshot
    Run {
        /// Definition JSON file
        definition: PathBuf,

        /// Events to send, in order (NAME or NAME=JSON)
        events: Vec<String>,

        /// Time to let delayed events fire after the last event
        #[arg(short, long, default_value = "0")]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => Config::from_env(),
    };

    // RUST_LOG wins over the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    match cli.command {
        Commands::Validate { definition } => {
            let definition = load_definition(&definition)?;
            println!(
                "{} ok: {} nodes, events [{}], checksum {}",
                definition.id,
                definition.nodes().len(),
                definition.events().join(", "),
                definition.checksum
            );
        }

        Commands::Transition {
            definition,
            value,
            event,
        } => {
            let machine = Machine::new(load_definition(&definition)?)
                .with_max_microsteps(config.interpreter.max_microsteps);
            let event = parse_event(&event)?;
            let next = match value {
                Some(value) => machine.transition_value(&parse_value(&value), event)?,
                None => machine.transition(&machine.initial_state()?, event)?,
            };
            println!("{}", serde_json::to_string_pretty(&next)?);
        }

        Commands::Run {
            definition,
            events,
            wait_ms,
        } => {
            let machine = Machine::new(load_definition(&definition)?);
            let events = events
                .iter()
                .map(|e| parse_event(e))
                .collect::<Result<Vec<_>, _>>()?;
            run(machine, config, events, Duration::from_millis(wait_ms)).await?;
        }
    }

    Ok(())
}

async fn run(
    machine: Machine,
    config: Config,
    events: Vec<Event>,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let simulated = Arc::new(SimulatedClock::new());
    let clock: Arc<dyn Clock> = match config.interpreter.clock {
        ClockKind::Tokio => Arc::new(TokioClock::new()),
        ClockKind::Simulated => Arc::clone(&simulated) as Arc<dyn Clock>,
    };

    let interpreter = Interpreter::new(machine)
        .with_config(config.clone())
        .with_clock(clock);

    interpreter.subscribe(|state| match serde_json::to_string(state) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to serialize snapshot: {}", e),
    });
    interpreter.on_diagnostic(|diagnostic| {
        eprintln!("[{}] {}", diagnostic.code(), diagnostic);
    });
    interpreter.on_done(|event| {
        eprintln!("done: {}", event.name);
    });

    interpreter.start()?;
    for event in events {
        interpreter.send(event);
    }

    if !wait.is_zero() {
        match config.interpreter.clock {
            ClockKind::Tokio => tokio::time::sleep(wait).await,
            ClockKind::Simulated => simulated.advance(wait),
        }
    }

    interpreter.stop();
    Ok(())
}

fn load_definition(path: &Path) -> Result<MachineDefinition, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(MachineDefinition::from_json(&json)?)
}

/// `NAME` or `NAME=JSON`.
fn parse_event(arg: &str) -> Result<Event, Box<dyn std::error::Error>> {
    match arg.split_once('=') {
        Some((name, data)) => {
            let data = serde_json::from_str(data)
                .map_err(|e| format!("Invalid data for event {}: {}", name, e))?;
            Ok(Event::with_data(name, data))
        }
        None => Ok(Event::new(arg)),
    }
}

fn parse_value(arg: &str) -> StateValue {
    serde_json::from_str(arg).unwrap_or_else(|_| StateValue::from(arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event() {
        assert_eq!(parse_event("GO").unwrap(), Event::new("GO"));
        assert_eq!(
            parse_event(r#"SET={"n":1}"#).unwrap(),
            Event::with_data("SET", json!({"n": 1}))
        );
        assert!(parse_event("SET={bad").is_err());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("idle"), StateValue::from("idle"));
        assert_eq!(
            parse_value(r#"{"player":"paused"}"#),
            serde_json::from_value::<StateValue>(json!({"player": "paused"})).unwrap()
        );
    }
}

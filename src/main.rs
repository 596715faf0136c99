//! Maplab CLI - markers with photos, stored in SQLite

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "maplab")]
#[command(version)]
#[command(about = "Map markers with attached photos, kept in a local SQLite database")]
#[command(long_about = r#"
Maplab keeps map markers and the photos attached to them:
  • Drop markers at a coordinate with a title and description
  • Attach and detach device photos
  • Find markers near a position

Example usage:
  maplab init
  maplab add --lat 58.0048 --lon 56.2082 --title "Home"
  maplab attach <marker-id> file:///photos/a.jpg
  maplab nearby --lat 58.0050 --lon 56.2080
"#)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "maplab.toml")]
    config: PathBuf,

    /// Path to the database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputMode::Text)]
    format: OutputMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    Text,
    Json,
}

impl OutputMode {
    pub fn is_human(&self) -> bool {
        matches!(self, OutputMode::Text)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config and create the database
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Drop a marker at a coordinate
    Add {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// List all markers, newest first
    List,

    /// Show one marker with its images
    Show {
        /// Marker id
        id: String,
    },

    /// Change a marker's title or description
    Edit {
        /// Marker id
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a marker and all of its images
    Remove {
        /// Marker id
        id: String,
    },

    /// Attach a photo to a marker
    Attach {
        /// Marker id
        marker_id: String,

        /// Photo URI (`file://...` or a local path)
        uri: String,

        /// Display name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// MIME type (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,
    },

    /// Detach a photo from a marker
    Detach {
        marker_id: String,
        image_id: String,
    },

    /// Markers within the proximity radius of a position
    Nearby {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Radius in metres (defaults to the configured threshold)
        #[arg(short, long)]
        radius: Option<f64>,
    },

    /// Show database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let result = commands::run(&cli).await;
    if let Err(e) = &result {
        if cli.format.is_human() {
            // Domain failures show their short banner; -v adds the full chain
            let message = if cli.verbose { format!("{:#}", e) } else { e.to_string() };
            maplab::ui::error(&message);
        } else {
            emit_error(&cli.command, e)?;
        }
        std::process::exit(1);
    }
    Ok(())
}

pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init { .. } => "init",
        Commands::Add { .. } => "add",
        Commands::List => "list",
        Commands::Show { .. } => "show",
        Commands::Edit { .. } => "edit",
        Commands::Remove { .. } => "remove",
        Commands::Attach { .. } => "attach",
        Commands::Detach { .. } => "detach",
        Commands::Nearby { .. } => "nearby",
        Commands::Stats => "stats",
    }
}

/// `{"status": "ok", "command": ..., "data": ...}` on stdout
pub fn emit_success(command: &str, data: serde_json::Value) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "status": "ok",
        "command": command,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn emit_error(command: &Commands, error: &anyhow::Error) -> anyhow::Result<()> {
    let payload = serde_json::json!({
        "status": "error",
        "command": command_name(command),
        "error": format!("{:#}", error),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

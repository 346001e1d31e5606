//! Command-line interface for tabledger

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tabledger")]
#[command(about = "An audited staging ledger for tabular data with rollback")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override workspace location
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a ledger workspace
    Init {
        /// Overwrite an existing configuration with the default one
        #[arg(long)]
        force: bool,

        /// Start from this configuration file instead of the default
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Merge source files into staging as one audited run
    Run {
        /// Inputs as ENTITY=PATH pairs
        #[arg(required = true, value_parser = parse_input)]
        inputs: Vec<(String, PathBuf)>,

        /// Classify rows without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Who is running the load
        #[arg(long)]
        actor: Option<String>,

        /// Source label recorded on the event
        #[arg(long)]
        source: Option<String>,

        /// Free-text notes recorded on the event
        #[arg(long)]
        notes: Option<String>,

        /// Skip state image creation for this run
        #[arg(long)]
        no_image: bool,

        /// Also write a compressed archive of the resulting state
        #[arg(long)]
        materialize: bool,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// List change events, newest first
    Events {
        /// Show at most this many events
        #[arg(long)]
        limit: Option<usize>,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Show one change event
    Show {
        /// Event id, id prefix, HEAD~n or @date
        event: String,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Show the row changes of an event
    Diff {
        /// Event id, id prefix, HEAD~n or @date
        event: String,

        /// Only show one column (requires --entity)
        #[arg(long, requires = "entity")]
        column: Option<String>,

        /// Entity the column belongs to
        #[arg(long)]
        entity: Option<String>,

        /// 1-based page to show
        #[arg(long, default_value = "1", value_parser = validate_positive)]
        page: usize,

        /// Records per page (defaults to the configured page size)
        #[arg(long, value_parser = validate_positive)]
        page_size: Option<usize>,

        /// Print every page instead of one
        #[arg(long, conflicts_with = "page")]
        all: bool,

        /// Print per-column counts only
        #[arg(long)]
        summary: bool,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// List conflicts
    Conflicts {
        /// Only conflicts raised by this event
        #[arg(long)]
        event: Option<String>,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Mark a conflict as resolved
    Resolve {
        /// Conflict id
        conflict: String,

        /// How the conflict was settled
        #[arg(long)]
        resolution: String,
    },

    /// Undo the applied changes of one event
    Rollback {
        /// Event id, id prefix, HEAD~n or @date
        event: String,

        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Return staging to the state right after an event
    RollbackTo {
        /// Event id, id prefix, HEAD~n or @date
        event: String,

        /// Show what would be reversed without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Create a state image for an event, or show an existing image
    Image {
        /// Event reference, or image id with --show
        reference: String,

        /// Show an existing image instead of creating one
        #[arg(long)]
        show: bool,

        /// Write a compressed archive of the current state
        #[arg(long)]
        materialize: bool,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Walk the state image chain from HEAD to the root
    History {
        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Show the staged rows of an entity
    Staging {
        entity: String,

        /// Show at most this many rows
        #[arg(long)]
        limit: Option<usize>,

        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Check ledger invariants
    Verify {
        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Show workspace statistics
    Stats {
        /// Output format: "pretty", "json"
        #[arg(long, default_value = "pretty")]
        format: String,
    },
}

/// Parse output format string
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Pretty,
    Json,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {}. Use 'pretty' or 'json'", s)),
        }
    }
}

/// Parse an ENTITY=PATH input pair
fn parse_input(s: &str) -> Result<(String, PathBuf), String> {
    let (entity, path) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid input '{}'. Expected ENTITY=PATH", s))?;
    let entity = entity.trim();
    if entity.is_empty() || path.trim().is_empty() {
        return Err(format!("Invalid input '{}'. Expected ENTITY=PATH", s));
    }
    Ok((entity.to_string(), PathBuf::from(path.trim())))
}

/// Validate that a count is greater than 0
fn validate_positive(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("Invalid value: '{}'. Must be a positive integer.", s))?;

    if n == 0 {
        return Err("Value must be greater than 0".to_string());
    }

    Ok(n)
}

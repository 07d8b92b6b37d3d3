//! # cikeep CLI Module
//!
//! This module implements the CLI interface for cikeep.
//!
//! ## Available Commands
//!
//! - `encode` - Encode a value into its wire triple
//! - `decode` - Decode a wire triple into a value
//! - `traits` - List and validate the configured traits
//! - `init` - Initialize a new database
//! - `create-ci` - Allocate a new CI
//! - `set` - Write an attribute of a CI
//! - `show` - Show the merged attributes of a CI
//! - `check` - Show the traits a CI currently has
//! - `delete` - Remove a trait from a CI
//! - `compact` - Compact the database file

mod commands;

use crate::config::{AppConfig, Overrides};
use clap::{Parser, Subcommand};
use cikeep_core::CmdbError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// cikeep - a layered, versioned CMDB
///
/// CIs carry typed attributes and relations written into ordered layers.
/// Traits describe what a CI must look like to count as an entity.
#[derive(Parser, Debug)]
#[command(name = "cikeep")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the config file (default: ./cikeep.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the database, overriding the config file
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Read layers, highest precedence first (comma-separated)
    #[arg(short = 'L', long, global = true, value_delimiter = ',')]
    pub layers: Option<Vec<String>>,

    /// Layer receiving writes (default: first read layer)
    #[arg(short = 'W', long, global = true)]
    pub write_layer: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encode a value into its text/binary/control triple
    Encode {
        /// Value type (Text, MultilineText, Integer, Double, Boolean,
        /// DateTimeWithOffset, JSON, YAML, Mask)
        #[arg(short = 't', long = "type")]
        value_type: String,

        /// Encode as an array value
        #[arg(short, long)]
        array: bool,

        /// Raw element strings
        #[arg(allow_negative_numbers = true)]
        values: Vec<String>,
    },

    /// Decode a text/binary/control triple
    Decode {
        /// Value type the triple was stored as
        #[arg(short = 't', long = "type")]
        value_type: String,

        /// Text part
        #[arg(long, default_value = "")]
        text: String,

        /// Binary part (base64)
        #[arg(long, default_value = "")]
        binary: String,

        /// Control part (base64)
        #[arg(long)]
        control: String,

        /// Decode images as metadata only
        #[arg(long)]
        metadata_only: bool,
    },

    /// List the configured traits
    Traits {
        /// Show the full definition of one trait
        trait_id: Option<String>,
    },

    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Allocate a new CI
    CreateCi {
        /// CI name, written to the reserved name attribute
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Write one attribute of a CI into the write layer
    Set {
        /// CI id
        ciid: String,

        /// Attribute name
        attribute: String,

        /// Value type
        #[arg(short = 't', long = "type", default_value = "Text")]
        value_type: String,

        /// Write an array value
        #[arg(short, long)]
        array: bool,

        /// Remove the attribute instead of writing a value
        #[arg(short, long, conflicts_with_all = ["values", "array"])]
        remove: bool,

        /// Raw element strings
        #[arg(allow_negative_numbers = true)]
        values: Vec<String>,
    },

    /// Show the merged attributes of a CI
    Show {
        /// CI id
        ciid: String,

        /// Read the state as of this RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
    },

    /// Check which configured traits a CI has
    Check {
        /// CI id
        ciid: String,

        /// Check only this trait
        #[arg(short = 'T', long = "trait")]
        trait_id: Option<String>,

        /// Read the state as of this RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
    },

    /// Remove a trait from a CI
    Delete {
        /// CI id
        ciid: String,

        /// Trait to remove
        #[arg(short = 'T', long = "trait")]
        trait_id: String,
    },

    /// Compact the database file
    Compact,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), CmdbError> {
    let config = AppConfig::load(cli.config.as_deref())?.apply(Overrides {
        database: cli.database,
        read_layers: cli.layers,
        write_layer: cli.write_layer,
    });
    let json_mode = cli.json_mode;
    if cli.verbose {
        tracing::info!(
            database = %config.database.display(),
            layers = ?config.read_layers,
            traits = config.traits.len(),
            "configuration"
        );
    }

    match cli.command {
        Some(Commands::Encode {
            value_type,
            array,
            values,
        }) => cmd_encode(json_mode, &value_type, array, &values),
        Some(Commands::Decode {
            value_type,
            text,
            binary,
            control,
            metadata_only,
        }) => cmd_decode(json_mode, &value_type, &text, &binary, &control, !metadata_only),
        Some(Commands::Traits { trait_id }) => cmd_traits(&config, json_mode, trait_id.as_deref()),
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::CreateCi { name }) => cmd_create_ci(&config, json_mode, name.as_deref()),
        Some(Commands::Set {
            ciid,
            attribute,
            value_type,
            array,
            remove,
            values,
        }) => {
            let write = if remove {
                AttributeWrite::Remove
            } else {
                AttributeWrite::Value {
                    value_type,
                    array,
                    values,
                }
            };
            cmd_set(&config, json_mode, &ciid, &attribute, write)
        }
        Some(Commands::Show { ciid, at }) => cmd_show(&config, json_mode, &ciid, at.as_deref()),
        Some(Commands::Check { ciid, trait_id, at }) => cmd_check(
            &config,
            json_mode,
            &ciid,
            trait_id.as_deref(),
            at.as_deref(),
        ),
        Some(Commands::Delete { ciid, trait_id }) => {
            cmd_delete(&config, json_mode, &ciid, &trait_id)
        }
        Some(Commands::Compact) => cmd_compact(&config),
        None => {
            // No subcommand - list traits by default
            cmd_traits(&config, json_mode, None)
        }
    }
}

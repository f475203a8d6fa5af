//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a [`Cli`] struct that represents the parsed command-line arguments,
//! and a [`Commands`] enum that represents the available subcommands.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use iris_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Init => { /* write default config and template */ }
//!     Commands::Ingest { source } => println!("indexing {}", source.display()),
//!     Commands::Ask { question } => println!("asking {question}"),
//!     Commands::Interactive => { /* start the REPL */ }
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Read the configuration from this file instead of the default location.
    #[arg(long, short = 'c', global = true, env = "IRIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default `config.yaml` and prompt template to the config directory.
    Init,

    /// Build the passage index from a plain-text document and save it.
    ///
    /// Paragraphs are separated by blank lines; near-duplicates are dropped
    /// before embedding.
    #[clap(name = "ingest")]
    Ingest {
        /// The source document (UTF-8 or GBK).
        source: PathBuf,
    },

    /// Ask a single question against the saved index.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to be asked.
        question: String,
    },

    /// Hold a conversation; type `exit`, `quit` or `退出` to leave.
    #[clap(name = "interactive", alias = "i")]
    Interactive,
}

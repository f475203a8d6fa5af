//! Main module for the Iris CLI application (`iris`).
//!
//! Parses the command line, loads the configuration and dispatches to the
//! library.
//!
//! # Examples
//!
//! ```sh
//! iris init
//! iris ingest eye_diseases.txt
//! iris ask "青光眼有哪些早期症状？"
//! iris interactive
//! ```

use std::{env, error::Error, fs, path::PathBuf};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use iris_rag::{
    api,
    commands::{Cli, Commands},
    config::{IrisConfig, load_config},
    config_dir, ingest,
    template::{DEFAULT_TEMPLATE_NAME, PromptTemplate},
};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Resolve which `config.yaml` to read.
///
/// An explicit `--config` wins; with `IN_TEST_ENVIRONMENT` set the file in the
/// current directory is used; otherwise the one in the config directory.
fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if env::var("IN_TEST_ENVIRONMENT").is_ok() {
        return Ok(env::current_dir()?.join("config.yaml"));
    }
    Ok(config_dir()?.join("config.yaml"))
}

/// Main asynchronous function of the Iris CLI application.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        return init();
    }

    let path = config_path(cli.config)?;
    debug!("Loading config from: {}", path.display());
    let config = load_config(&path)?;

    match cli.command {
        Commands::Ingest { source } => {
            let progress = ProgressBar::new(0).with_style(
                ProgressStyle::with_template("{bar:40} [{pos}/{len}] embedding passages")?,
            );
            let (_, report) = ingest::build_index(
                &source,
                &api::OpenAiEmbeddings::new(&config),
                &config,
                &CancellationToken::new(),
                progress,
            )
            .await?;
            println!(
                "Indexed {} of {} paragraphs into {}",
                report.kept,
                report.paragraphs,
                config.index_paths().index.display()
            );
        }
        Commands::Ask { question } => {
            api::ask(&config, question).await?;
        }
        Commands::Interactive => {
            api::interactive_mode(&config).await?;
        }
        Commands::Init => {}
    }

    Ok(())
}

/// Write a default configuration and prompt template to the config directory.
///
/// Existing files are left alone.
fn init() -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates = config_dir.join("templates");
    info!("Creating template directory: {}", templates.display());
    fs::create_dir_all(&templates)?;

    let template_path = templates.join(format!("{DEFAULT_TEMPLATE_NAME}.yaml"));
    if template_path.exists() {
        println!("Keeping existing {}", template_path.display());
    } else {
        fs::write(
            &template_path,
            serde_yaml::to_string(&PromptTemplate::default())?,
        )?;
        println!("Wrote {}", template_path.display());
    }

    let config_path = config_dir.join("config.yaml");
    if config_path.exists() {
        println!("Keeping existing {}", config_path.display());
    } else {
        let mut config = IrisConfig::new("CHANGEME", "https://api.openai.com/v1");
        config.template = Some(DEFAULT_TEMPLATE_NAME.to_string());
        fs::write(&config_path, serde_yaml::to_string(&config)?)?;
        println!("Wrote {}", config_path.display());
    }

    Ok(())
}

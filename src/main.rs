use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod cli;

use crate::cli::{Cli, Commands, QueryFormat};
use drweb::config::{BrowserConfig, EngineConfig};
use drweb::engine::QueryOutcome;
use drweb::logging::{self, LoggingConfig};
use drweb::query::{Query, QueryParser, QueryValidator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging_config = LoggingConfig {
        level: if cli.verbose { "debug".to_string() } else { "info".to_string() },
        ..LoggingConfig::default()
    };
    logging::init_logging(&logging_config)?;

    info!("drweb v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Validate { query_file, format } => {
            let query = load_query(&query_file, format)?;
            QueryValidator::new().validate(&query)?;
            println!("{} is valid", query_file.display());
            Ok(())
        }
        Commands::Run { query_file, format, output, strict, budget_ms } => {
            let query = load_query(&query_file, format)?;
            QueryValidator::new().validate(&query)?;

            let config = EngineConfig {
                strict,
                budget_ms,
                browser: BrowserConfig::from_env(),
                ..EngineConfig::default()
            };
            let outcome = run_query(&query, config).await?;

            let rendered = serde_json::to_string_pretty(&outcome.records)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing results to {}", path.display()))?;
                    info!("results written to {}", path.display());
                }
                None => println!("{rendered}"),
            }

            for diagnostic in &outcome.diagnostics {
                eprintln!(
                    "warning: step {:?}: {} ({})",
                    diagnostic.step_path, diagnostic.message, diagnostic.kind
                );
            }
            if let Some(error) = &outcome.error {
                anyhow::bail!("query aborted at step {:?}: {}", error.step_path, error.message);
            }
            Ok(())
        }
    }
}

fn load_query(path: &std::path::Path, format: Option<QueryFormat>) -> Result<Query> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading query file {}", path.display()))?;
    let query = match format.unwrap_or_else(|| QueryFormat::infer(path)) {
        QueryFormat::Json5 => QueryParser::parse_json5(&source)?,
        QueryFormat::Yaml => QueryParser::parse_yaml(&source)?,
    };
    Ok(query)
}

#[cfg(feature = "browser")]
async fn run_query(query: &Query, config: EngineConfig) -> Result<QueryOutcome> {
    let mut page = drweb::browser::playwright::PlaywrightController::launch(&config.browser).await?;
    let engine = drweb::engine::Engine::new(config);
    Ok(engine.execute(query, &mut page).await)
}

#[cfg(not(feature = "browser"))]
async fn run_query(_query: &Query, _config: EngineConfig) -> Result<QueryOutcome> {
    anyhow::bail!("this build has no browser backend; rebuild with `--features browser`")
}

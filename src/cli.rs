use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "drweb")]
#[command(about = "Declarative web data retrieval engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a query document against a live browser
    Run {
        #[arg(help = "Path to the query document")]
        query_file: PathBuf,

        #[arg(short, long, help = "Query dialect; inferred from the extension by default", value_enum)]
        format: Option<QueryFormat>,

        #[arg(short, long, help = "Output file path; stdout by default")]
        output: Option<PathBuf>,

        #[arg(long, help = "Abort on the first step error instead of soft-failing")]
        strict: bool,

        #[arg(long, help = "Overall wall-clock budget in milliseconds")]
        budget_ms: Option<u64>,
    },

    /// Parse and validate a query document without executing it
    Validate {
        #[arg(help = "Path to the query document")]
        query_file: PathBuf,

        #[arg(short, long, help = "Query dialect; inferred from the extension by default", value_enum)]
        format: Option<QueryFormat>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum QueryFormat {
    Json5,
    Yaml,
}

impl QueryFormat {
    /// Infer the dialect from a file extension, defaulting to JSON5.
    pub fn infer(path: &std::path::Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Json5,
        }
    }
}

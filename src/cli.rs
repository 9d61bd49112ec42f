use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Index your documents and retrieve reranked passages"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the data directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load, chunk and embed a file or directory into a collection
    Index(IndexArgs),
    /// Retrieve passages relevant to a question
    Search(SearchArgs),
    /// Manage collections
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Show index statistics
    Stats(StatsArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// File or directory to index
    pub path: PathBuf,

    /// Target collection (defaults to the file or directory name)
    #[arg(short = 'c', long)]
    pub collection: Option<String>,

    /// Output the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The question to search for
    pub query: String,

    /// Search only within this collection
    #[arg(short = 'c', long)]
    pub collection: Option<String>,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Candidates retrieved before reranking
    #[arg(long)]
    pub initial_k: Option<usize>,

    /// Skip LLM reranking, return nearest neighbors directly
    #[arg(long)]
    pub no_rerank: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum CollectionAction {
    /// List all collections
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a collection and all its indexed items
    Remove {
        /// Name of the collection to remove
        name: String,
    },
    /// Remove every collection
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Debug, Parser)]
pub struct StatsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}

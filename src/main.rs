use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use askcode_core::bootstrap::resolve_config_path;
use askcode_core::{Config, Session};
use askcode_index::context::location;
use askcode_index::loader::CHAT_DIR;
use askcode_index::project::ProjectMarker;
use askcode_index::retriever::Answer;
use askcode_llm::any::AnyProvider;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "askcode")]
#[command(about = "Ask natural-language questions about a codebase")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Project root (default: current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Config file (default: <project>/.chat/config.toml)
    #[arg(long, global = true, env = "ASKCODE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Question to answer; shorthand for `askcode ask`
    question: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question from the indexed code
    Ask {
        #[arg(required = true)]
        question: Vec<String>,
    },
    /// Bring the index up to date with the working tree
    Index,
    /// Describe a file or directory
    Summary { path: PathBuf },
    /// Print the identifier binding this project to its index
    SourceName,
    /// Delete this project's index entries and manifest
    Reset,
    /// Index, then re-index changed files until interrupted
    Watch,
}

impl Command {
    fn default_log_level(&self) -> &'static str {
        match self {
            Self::Index | Self::Watch => "info",
            _ => "warn",
        }
    }
}

fn init_subscriber(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = match cli.command {
        Some(command) => command,
        None if !cli.question.is_empty() => Command::Ask {
            question: cli.question,
        },
        None => {
            eprintln!("error: no question given (see `askcode --help`)");
            return ExitCode::FAILURE;
        }
    };
    init_subscriber(command.default_log_level());

    let root = cli.project.unwrap_or_else(|| PathBuf::from("."));
    match run(&root, cli.config.as_deref(), command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn open_session(
    root: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<Session<AnyProvider>> {
    let config = Config::load(&resolve_config_path(root, config_path))?;
    Session::open(root, config).await
}

async fn run(root: &Path, config_path: Option<&Path>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ask { question } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                bail!("the question is empty");
            }
            let session = open_session(root, config_path).await?;
            print_answer(&session.ask(&question).await?);
        }
        Command::Index => {
            let session = open_session(root, config_path).await?;
            let report = session.index().await?;
            println!("{report}");
            for error in &report.errors {
                eprintln!("  {error}");
            }
        }
        Command::Summary { path } => {
            let path = if path.exists() {
                path.canonicalize()
                    .with_context(|| format!("failed to resolve {}", path.display()))?
            } else {
                path
            };
            let session = open_session(root, config_path).await?;
            println!("{}", session.describe(&path).await?);
        }
        Command::SourceName => {
            let chat_dir = root.join(CHAT_DIR);
            let source_name = ProjectMarker::load_or_create(&chat_dir).with_context(|| {
                format!("failed to load project marker in {}", chat_dir.display())
            })?;
            println!("{source_name}");
        }
        Command::Reset => {
            let session = open_session(root, config_path).await?;
            let removed = session.reset().await?;
            println!(
                "removed {removed} entries from {}",
                session.collection_name()
            );
        }
        Command::Watch => {
            let session = open_session(root, config_path).await?;
            let (report, _watcher) = session.watch().await?;
            println!("{report}");
            eprintln!(
                "watching {} for changes, press Ctrl-C to stop",
                session.root().display()
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    for source in &answer.sources {
        println!();
        println!(
            "{}",
            location(&source.metadata.file_path, source.line_range())
        );
        println!("{}", source.text);
    }
}

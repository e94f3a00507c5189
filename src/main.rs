//! # kb-ledger CLI (`kbl`)
//!
//! ```bash
//! kbl --config ./config/kb.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbl repos list\|show\|add-local\|add-remote` | Manage registered repositories |
//! | `kbl ingest text\|file\|url <repo>` | Store content and generate pages |
//! | `kbl browse ls\|cat <repo> [path]` | Read-only repository access |
//! | `kbl search <repo> "<question>"` | Answer from the knowledge base |
//! | `kbl history <repo>` | Recent changes, most recent first |
//! | `kbl undo <repo> --file\|--change\|--last` | Revert changes |
//! | `kbl reconcile <repo>` | Compare the ledger with revision history |
//! | `kbl tools` | List the capability table |
//! | `kbl serve http\|stdio` | Run a transport |
//!
//! Command output goes to stdout; logs go to stderr (`RUST_LOG` to tune).

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kb_ledger::config::load_config;
use kb_ledger::ingest::{IngestInput, IngestResult};
use kb_ledger::registry::NewRepository;
use kb_ledger::revert::UndoRequest;
use kb_ledger::server::{run_server, run_stdio};
use kb_ledger::service::{BrowseOp, KnowledgeService};
use kb_ledger::tools::ToolRegistry;
use kb_ledger_core::history::HistoryQuery;
use kb_ledger_core::models::{Change, ChangeScope, RepositoryBackend, RevertResult};
use kb_ledger_core::repo::EntryKind;

/// kb-ledger: a git-backed knowledge base with an append-only change
/// timeline and selective undo.
#[derive(Parser)]
#[command(name = "kbl", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered repositories.
    Repos {
        #[command(subcommand)]
        action: ReposAction,
    },
    /// Ingest text, a file, or a web page.
    Ingest {
        #[command(subcommand)]
        input: IngestCommand,
    },
    /// List a directory or print a file.
    Browse {
        #[command(subcommand)]
        action: BrowseAction,
    },
    /// Ask a question of the knowledge base.
    Search { repository: String, query: String },
    /// Show recent changes.
    History {
        repository: String,
        #[arg(long)]
        limit: Option<usize>,
        /// file_upload, knowledge_base_generation or both.
        #[arg(long = "type", default_value = "both")]
        change_type: ChangeScope,
        /// Include changes that were reverted.
        #[arg(long)]
        all: bool,
    },
    /// Revert changes selected by exactly one of --file, --change or --last.
    Undo {
        repository: String,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        change: Option<String>,
        #[arg(long)]
        last: Option<usize>,
        /// file_upload, knowledge_base_generation or both.
        #[arg(long = "type", default_value = "both")]
        revert_type: ChangeScope,
        /// Regenerate pages from sources that survive the revert.
        #[arg(long)]
        regenerate: bool,
        /// Print the plan without reverting.
        #[arg(long)]
        dry_run: bool,
    },
    /// Report ledger entries without commits and commits without entries.
    Reconcile {
        repository: String,
        #[arg(long, default_value_t = 500)]
        depth: usize,
    },
    /// List the tools served by the transports.
    Tools,
    /// Run a transport.
    Serve {
        #[command(subcommand)]
        transport: ServeTransport,
    },
}

#[derive(Subcommand)]
enum ReposAction {
    List,
    Show {
        repository: String,
    },
    /// Register a local directory (initialized as a git repository on first use).
    AddLocal {
        name: String,
        path: PathBuf,
        #[arg(long, default_value = "")]
        kb_root: String,
    },
    /// Register a remote git repository.
    AddRemote {
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Alias resolved to a token through `[credentials]` or the environment.
        #[arg(long)]
        credential: String,
        #[arg(long, default_value = "")]
        kb_root: String,
    },
}

#[derive(Subcommand)]
enum IngestCommand {
    /// Inline text. Reads stdin when --content is omitted.
    Text {
        repository: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: Option<String>,
    },
    /// A local file (text, HTML, PDF or DOCX).
    File {
        repository: String,
        path: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// A web page.
    Url { repository: String, url: String },
}

#[derive(Subcommand)]
enum BrowseAction {
    Ls {
        repository: String,
        #[arg(default_value = "")]
        path: String,
    },
    Cat {
        repository: String,
        path: String,
    },
}

#[derive(Subcommand)]
enum ServeTransport {
    /// HTTP on `[server].bind`.
    Http,
    /// JSON lines on stdin/stdout.
    Stdio,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_warning(warning: &Option<String>) {
    if let Some(w) = warning {
        eprintln!("warning: {}", w);
    }
}

fn print_changes(changes: &[Change]) {
    if changes.is_empty() {
        println!("No changes.");
        return;
    }
    for c in changes {
        let kind = match c.change_type {
            kb_ledger_core::models::ChangeType::FileUpload => "upload",
            kb_ledger_core::models::ChangeType::KnowledgeBaseGeneration => "kb",
        };
        let mark = if c.reverted { " (reverted)" } else { "" };
        println!(
            "{}  {:<14}  {:<6}  {}{}",
            c.id, c.relative_time, kind, c.description, mark
        );
    }
}

fn print_ingest(result: &IngestResult) {
    println!("raw: {}", result.raw_path);
    if result.knowledge_base_updated {
        for p in &result.knowledge_base_paths {
            println!("page: {}", p);
        }
    }
    if let Some(err) = &result.generation_error {
        println!("generation failed: {}", err);
    }
}

fn print_revert(result: &RevertResult) {
    println!("{}", result.message);
    for c in &result.changes_reverted {
        println!("  reverted {}  {}", c.id, c.description);
    }
    for id in &result.skipped {
        println!("  skipped {}", id);
    }
    for p in &result.regenerated_paths {
        println!("  regenerated {}", p);
    }
    for w in &result.warnings {
        eprintln!("warning: {}", w);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    let service = Arc::new(KnowledgeService::from_config(config)?);
    let json = cli.json;

    match cli.command {
        Commands::Repos { action } => match action {
            ReposAction::List => {
                let repos = service.list_repositories().await;
                if json {
                    print_json(&repos)?;
                } else if repos.is_empty() {
                    println!("No repositories registered.");
                } else {
                    for r in repos {
                        println!("{:<20} {:<7} {}", r.name, r.kind(), r.id);
                    }
                }
            }
            ReposAction::Show { repository } => {
                print_json(&service.get_repository_details(&repository).await?)?;
            }
            ReposAction::AddLocal {
                name,
                path,
                kb_root,
            } => {
                let path = std::path::absolute(&path)
                    .with_context(|| format!("resolve {}", path.display()))?;
                let repo = service
                    .register_repository(NewRepository {
                        name,
                        knowledge_base_root: kb_root,
                        backend: RepositoryBackend::Local { path },
                    })
                    .await?;
                println!("{}", repo.id);
            }
            ReposAction::AddRemote {
                name,
                owner,
                repo,
                branch,
                credential,
                kb_root,
            } => {
                let repo = service
                    .register_repository(NewRepository {
                        name,
                        knowledge_base_root: kb_root,
                        backend: RepositoryBackend::Remote {
                            owner,
                            repo_name: repo,
                            branch,
                            credential_alias: credential,
                        },
                    })
                    .await?;
                println!("{}", repo.id);
            }
        },
        Commands::Ingest { input } => {
            let (repository, input) = match input {
                IngestCommand::Text {
                    repository,
                    title,
                    content,
                } => {
                    let content = match content {
                        Some(c) => c,
                        None => {
                            let mut buf = String::new();
                            std::io::stdin()
                                .read_to_string(&mut buf)
                                .context("read content from stdin")?;
                            buf
                        }
                    };
                    (repository, IngestInput::Text { title, content })
                }
                IngestCommand::File {
                    repository,
                    path,
                    content_type,
                } => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("read {}", path.display()))?;
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if filename.is_empty() {
                        bail!("{} has no file name", path.display());
                    }
                    (
                        repository,
                        IngestInput::File {
                            filename,
                            content: None,
                            content_base64: Some(
                                base64::engine::general_purpose::STANDARD.encode(bytes),
                            ),
                            content_type,
                        },
                    )
                }
                IngestCommand::Url { repository, url } => (repository, IngestInput::Url { url }),
            };
            let result = service.ingest_content(&repository, input).await?;
            if json {
                print_json(&result)?;
            } else {
                print_ingest(&result);
            }
        }
        Commands::Browse { action } => {
            let (repository, op, path) = match action {
                BrowseAction::Ls { repository, path } => (repository, BrowseOp::ListDirectory, path),
                BrowseAction::Cat { repository, path } => (repository, BrowseOp::ReadFile, path),
            };
            let result = service.browse(&repository, op, &path).await?;
            print_warning(&result.warning);
            if json {
                print_json(&result)?;
            } else if let Some(content) = &result.content {
                print!("{}", content);
            } else {
                for e in result.entries.unwrap_or_default() {
                    let suffix = if e.kind == EntryKind::Directory { "/" } else { "" };
                    println!("{}{}", e.name, suffix);
                }
            }
        }
        Commands::Search { repository, query } => {
            let result = service.search_knowledge_base(&repository, &query).await?;
            print_warning(&result.warning);
            if json {
                print_json(&result)?;
            } else {
                println!("{}", result.answer);
                for s in &result.sources {
                    println!("  - {}", s);
                }
            }
        }
        Commands::History {
            repository,
            limit,
            change_type,
            all,
        } => {
            let query = HistoryQuery {
                limit,
                change_type,
                include_reverted: all,
            };
            let result = service.list_history(&repository, &query).await?;
            print_warning(&result.warning);
            if json {
                print_json(&result)?;
            } else {
                print_changes(&result.changes);
            }
        }
        Commands::Undo {
            repository,
            file,
            change,
            last,
            revert_type,
            regenerate,
            dry_run,
        } => {
            let request = UndoRequest {
                filename: file,
                change_id: change,
                last_n_changes: last,
                revert_type,
                regenerate_after_revert: regenerate,
            };
            if dry_run {
                print_json(&service.preview_undo(&repository, &request).await?)?;
            } else {
                let result = service.undo_changes(&repository, &request).await?;
                if json {
                    print_json(&result)?;
                } else {
                    print_revert(&result);
                }
                if !result.success {
                    std::process::exit(1);
                }
            }
        }
        Commands::Reconcile { repository, depth } => {
            let report = service.reconcile(&repository, depth).await?;
            if json {
                print_json(&report)?;
            } else if report.is_consistent() {
                println!("Ledger consistent ({} entries).", report.entries);
            } else {
                for (entry, commit) in &report.missing_commits {
                    println!("entry {} references missing commit {}", entry, commit);
                }
                for c in &report.unrecorded_commits {
                    println!("commit {} has no ledger entry: {}", c.id, c.message);
                }
            }
        }
        Commands::Tools => {
            let tools = ToolRegistry::with_builtins()?;
            if json {
                print_json(&tools.list())?;
            } else {
                for t in tools.list() {
                    println!("{:<24} {}", t.name, t.description);
                }
            }
        }
        Commands::Serve { transport } => {
            let tools = Arc::new(ToolRegistry::with_builtins()?);
            match transport {
                ServeTransport::Http => run_server(service, tools).await?,
                ServeTransport::Stdio => run_stdio(service, tools).await?,
            }
        }
    }

    Ok(())
}

//! # ragpipe CLI (`rag`)
//!
//! Command-line surface over the engine: database initialization,
//! ingestion, retrieval, and the six capability paths.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag ingest <path>` | Chunk, embed, and index files (or a bundle) |
//! | `rag chat "<prompt>"` | Streaming chat, `--rag` grounds it in the index |
//! | `rag extract` | Schema-constrained structured extraction |
//! | `rag pdf <file>` | PDF-native analysis |
//! | `rag code "<prompt>"` | Tool-based code execution with self-correction |
//! | `rag urls "<prompt>" --url ...` | URL-grounded analysis |
//! | `rag search "<query>"` | Retrieve a packed context without generation |
//! | `rag store <action>` | Manage file-search stores |

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;

use ragpipe::config::{load_config, Config};
use ragpipe::engine::Engine;
use ragpipe::generate::Turn;
use ragpipe::intake;
use ragpipe::progress::ProgressMode;
use ragpipe::router::{RequestSpec, SchemaChoice};
use ragpipe::{db, migrate};

/// ragpipe CLI — a retrieval-augmented generation engine with
/// multi-capability request routing.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "ragpipe — a retrieval-augmented generation engine with multi-capability request routing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults are used if
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    /// Progress output: auto (TTY-dependent), off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a file or directory into the index.
    ///
    /// Markdown and plain-text files are chunked and embedded. A bundle
    /// file (sections separated by `================` with `FILE:`
    /// headers) is split into one document per section. Outcomes are
    /// printed as JSON lines on stdout.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,

        /// Upload into a file-search store (by id or name) instead of the
        /// primary corpus.
        #[arg(long)]
        store: Option<String>,
    },

    /// Chat with the model, streaming the answer to stdout.
    Chat {
        prompt: String,

        /// Ground the answer in the indexed corpus.
        #[arg(long)]
        rag: bool,
    },

    /// Extract structured data constrained by a schema.
    Extract {
        /// Built-in schema name (recipe, invoice, feedback,
        /// design_pattern, pdf_summary).
        #[arg(long, conflicts_with = "schema_file")]
        schema: Option<String>,

        /// Path to an ad-hoc JSON schema file.
        #[arg(long)]
        schema_file: Option<PathBuf>,

        /// Text to extract from.
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// File whose contents to extract from.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Analyze a PDF document.
    Pdf {
        /// Path to the PDF file.
        file: PathBuf,

        /// Question or instruction; defaults to a summary request.
        #[arg(long)]
        prompt: Option<String>,

        /// Return a structured result using a built-in schema
        /// (e.g. pdf_summary).
        #[arg(long)]
        schema: Option<String>,
    },

    /// Solve a task with model-side code execution.
    Code { prompt: String },

    /// Answer a question grounded in the given URLs.
    Urls {
        prompt: String,

        /// URL to analyze (repeatable).
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
    },

    /// Retrieve a packed context for a query without invoking the model.
    Search { query: String },

    /// Manage file-search stores.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Create a named store.
    Create { name: String },

    /// List all stores.
    List,

    /// Delete a store (by id or name) and everything it owns.
    Delete { store: String },

    /// Upload a file (or bundle) into a store.
    Upload { store: String, path: PathBuf },

    /// Ask a question grounded in one or more stores.
    Query {
        prompt: String,

        /// Store to search (repeatable, by id or name).
        #[arg(long = "store", required = true)]
        stores: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::default()
    };
    let progress = match cli.progress.as_str() {
        "auto" => ProgressMode::default_for_tty(),
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        other => bail!("unknown progress mode: '{}'", other),
    };

    match cli.command {
        Commands::Init => {
            if config.db.backend == "memory" {
                println!("memory backend configured; nothing to initialize");
                return Ok(());
            }
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            println!("initialized {}", config.db.path.display());
            Ok(())
        }
        command => {
            let engine = Engine::from_config(config, progress).await?;
            run(engine, command).await
        }
    }
}

async fn run(engine: Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => unreachable!("handled before engine construction"),

        Commands::Ingest { path, store } => {
            match store {
                Some(store) => {
                    for file in intake::scan_path(&path)? {
                        for document in intake::load_documents(&file)? {
                            let (version, chunks) =
                                engine.upload_to_store(&store, &document).await?;
                            println!(
                                "{}",
                                serde_json::json!({
                                    "document_id": document.id,
                                    "status": "indexed",
                                    "version": version,
                                    "chunks": chunks,
                                })
                            );
                        }
                    }
                }
                None => {
                    let mut outcomes = engine.ingest_path(&path)?;
                    while let Some(outcome) = outcomes.next().await {
                        println!("{}", serde_json::to_string(&outcome)?);
                    }
                }
            }
            Ok(())
        }

        Commands::Chat { prompt, rag } => {
            let mut stream = engine.query_chat(&prompt, rag, Vec::<Turn>::new()).await?;
            let mut stdout = std::io::stdout().lock();
            while let Some(item) = stream.next().await {
                let fragment = item?;
                write!(stdout, "{}", fragment.text)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
            Ok(())
        }

        Commands::Extract {
            schema,
            schema_file,
            text,
            file,
        } => {
            let schema = match (schema, schema_file) {
                (Some(name), None) => SchemaChoice::Named(name),
                (None, Some(path)) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading schema {}", path.display()))?;
                    SchemaChoice::Inline(serde_json::from_str(&raw)?)
                }
                _ => bail!("exactly one of --schema or --schema-file is required"),
            };
            let prompt = match (text, file) {
                (Some(text), None) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                _ => bail!("exactly one of --text or --file is required"),
            };

            let spec = RequestSpec {
                prompt,
                schema: Some(schema),
                ..Default::default()
            };
            print_outcome(&engine.execute(spec).await?)
        }

        Commands::Pdf {
            file,
            prompt,
            schema,
        } => {
            let spec = RequestSpec {
                prompt: prompt.unwrap_or_default(),
                attachments: vec![intake::read_pdf_attachment(&file)?],
                schema: schema.map(SchemaChoice::Named),
                ..Default::default()
            };
            print_outcome(&engine.execute(spec).await?)
        }

        Commands::Code { prompt } => {
            let spec = RequestSpec {
                prompt,
                execute_code: true,
                ..Default::default()
            };
            print_outcome(&engine.execute(spec).await?)
        }

        Commands::Urls { prompt, urls } => {
            let spec = RequestSpec {
                prompt,
                urls,
                ..Default::default()
            };
            print_outcome(&engine.execute(spec).await?)
        }

        Commands::Search { query } => {
            let context = engine.search(&query).await?;
            println!("{}", serde_json::to_string_pretty(&context)?);
            Ok(())
        }

        Commands::Store { action } => match action {
            StoreAction::Create { name } => {
                let store = engine.create_store(&name).await?;
                println!("{}", serde_json::to_string_pretty(&store)?);
                Ok(())
            }
            StoreAction::List => {
                let stores = engine.list_stores().await?;
                println!("{}", serde_json::to_string_pretty(&stores)?);
                Ok(())
            }
            StoreAction::Delete { store } => {
                let removed = engine.delete_store(&store).await?;
                println!("deleted store ({removed} chunks removed)");
                Ok(())
            }
            StoreAction::Upload { store, path } => {
                for file in intake::scan_path(&path)? {
                    for document in intake::load_documents(&file)? {
                        let (version, chunks) = engine.upload_to_store(&store, &document).await?;
                        println!("{} indexed ({} chunks, v{})", document.id, chunks, version);
                    }
                }
                Ok(())
            }
            StoreAction::Query { prompt, stores } => {
                let spec = RequestSpec {
                    prompt,
                    stores,
                    ..Default::default()
                };
                print_outcome(&engine.execute(spec).await?)
            }
        },
    }
}

fn print_outcome(outcome: &ragpipe::router::CapabilityOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

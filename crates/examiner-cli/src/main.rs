//! examiner - AI GCSE paper marking client
//!
//! Checks the remaining allowance, submits a paper with its mark scheme for
//! marking, links anonymous usage to an account, and renders previews.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use examiner_core::{
    Document, DocumentRole, ExaminerApi, ExaminerConfig, FileStore, HttpExaminerApi, Identity,
    ManualIdentityProvider, MarkingResult, PdftoppmRasterizer, PreviewRenderer, RenderOutcome,
    SessionCollaborators, SessionContext, SlotContent, StaticCredential, SubmitOutcome,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// examiner - AI GCSE paper marking client
#[derive(Parser, Debug)]
#[command(name = "examiner")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bearer token of a signed-in account; anonymous when absent
    #[arg(long, env = "EXAMINER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the remaining marking allowance
    Usage,

    /// Mark a student paper against a mark scheme
    Mark(MarkArgs),

    /// Move anonymous usage onto the signed-in account
    Link,

    /// Render the first page of a document to PNG
    Preview {
        /// Document to render
        path: PathBuf,

        /// Output PNG path
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct MarkArgs {
    /// Student paper
    #[arg(long, required_unless_present = "example_paper", conflicts_with = "example_paper")]
    paper: Option<PathBuf>,

    /// Use the bundled example student paper
    #[arg(long)]
    example_paper: bool,

    /// Mark scheme
    #[arg(long, required_unless_present = "example_scheme", conflicts_with = "example_scheme")]
    scheme: Option<PathBuf>,

    /// Use the bundled example mark scheme
    #[arg(long)]
    example_scheme: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let config = load_config(cli.config.as_deref())?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(cli, config))
}

fn load_config(path: Option<&Path>) -> Result<ExaminerConfig> {
    let config = match path {
        Some(path) => ExaminerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ExaminerConfig::new(),
    }
    .with_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn identity(token: Option<&str>) -> Identity {
    match token {
        Some(token) => Identity::authenticated(StaticCredential::new("cli", token)),
        None => Identity::Anonymous,
    }
}

async fn run(cli: Cli, config: ExaminerConfig) -> Result<()> {
    match cli.command {
        Commands::Preview { path, out } => preview(&config, &path, &out).await,
        Commands::Link => link(&config, cli.token.as_deref()).await,
        Commands::Usage => {
            let session = start_session(&config, cli.token.as_deref()).await?;
            let state = session.ledger().state();
            session.shutdown().await;

            if cli.json {
                let value = serde_json::json!({
                    "identity": session.ledger().identity().kind().to_string(),
                    "allowance_max": state.allowance_max,
                    "used": state.used,
                    "remaining": state.remaining(),
                    "source": format!("{:?}", state.source),
                    "last_synced_at": state.last_synced_at,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                match state.remaining() {
                    Some(remaining) => {
                        println!("{remaining} of {} markings remaining", state.allowance_max);
                    }
                    None => println!("Remaining allowance unknown"),
                }
            }
            Ok(())
        }
        Commands::Mark(args) => {
            let session = start_session(&config, cli.token.as_deref()).await?;
            let outcome = mark(&session, args).await;
            session.controller().settle().await;
            let remaining = session.ledger().remaining();
            session.shutdown().await;

            let result = match outcome? {
                SubmitOutcome::Marked(result) => result,
                SubmitOutcome::Ignored => bail!("A submission is already in progress"),
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_breakdown(&result);
                if let Some(remaining) = remaining {
                    println!("\n{remaining} markings remaining");
                }
            }
            Ok(())
        }
    }
}

async fn start_session(config: &ExaminerConfig, token: Option<&str>) -> Result<SessionContext> {
    let api = Arc::new(HttpExaminerApi::new(config)?);
    let store = FileStore::open(config.resolved_store_dir()).context("Failed to open local store")?;

    let collaborators = SessionCollaborators {
        api,
        store: Arc::new(store),
        identity: Arc::new(ManualIdentityProvider::new(identity(token))),
        rasterizer: Arc::new(PdftoppmRasterizer::new()),
    };
    Ok(SessionContext::start(config, collaborators).await?)
}

async fn mark(session: &SessionContext, args: MarkArgs) -> Result<SubmitOutcome> {
    let sources = [
        (DocumentRole::Primary, args.paper, args.example_paper),
        (DocumentRole::Reference, args.scheme, args.example_scheme),
    ];
    for (role, path, example) in sources {
        let document = match path {
            Some(path) if !example => Document::from_path(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
            _ => session
                .controller()
                .load_example(role)
                .await
                .with_context(|| format!("Failed to load example {}", role.label()))?,
        };
        session.controller().select(role, document);
    }

    session.controller().submit().await.map_err(|e| {
        match e.notice() {
            Some(notice) => tracing::error!("{}: {}", notice.title, notice.description),
            None => tracing::error!("{}", e),
        }
        anyhow::Error::new(e)
    })
}

async fn link(config: &ExaminerConfig, token: Option<&str>) -> Result<()> {
    let Some(token) = token else {
        bail!("Linking requires --token or EXAMINER_TOKEN");
    };
    let api = HttpExaminerApi::new(config)?;
    api.link(examiner_core::Credential::bearer(token)).await?;
    println!("Anonymous usage linked");
    Ok(())
}

async fn preview(config: &ExaminerConfig, path: &Path, out: &Path) -> Result<()> {
    let document = Document::from_path(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let renderer = PreviewRenderer::new(Arc::new(PdftoppmRasterizer::new()), config.preview_scale);
    let outcome = renderer.assign(DocumentRole::Primary, document).join().await;

    let SlotContent::Ready(page) = renderer.content(DocumentRole::Primary) else {
        bail!("Could not render a preview of {} ({outcome:?})", path.display());
    };
    debug_assert_eq!(outcome, RenderOutcome::Committed);

    tokio::fs::write(out, &page.png)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("{}x{} preview written to {}", page.width, page.height, out.display());
    Ok(())
}

fn print_breakdown(result: &MarkingResult) {
    for question in &result.questions {
        println!("Question {} ({} marks)", question.question_number, question.max_marks);
        if !question.question_text.is_empty() {
            println!("  {}", question.question_text);
        }
        println!("  Answer:  {}", question.answer_text);
        println!("  Mark:    {}", question.mark);
        println!("  Comment: {}", question.comment);
        println!();
    }
    println!("Total: {}", result.total);
}

mod doctor;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redline_core::config::{
    AppConfig, ModelConfig, RefineConfig, ReviewConfig, SectionsConfig, WorkflowConfig,
};
use redline_workflow::graph::NodeFailure;
use redline_workflow::{ConsolidatedReport, Phase, RefineLoop, ReviewPanel, SectionPipeline};

#[derive(Parser)]
#[command(name = "redline", version, about = "Review, draft, and refine technical design documents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "redline.toml", env = "REDLINE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Review a document with every configured participant and aggregate the results
    Review {
        /// Document to review (.md, .txt, .docx, .pdf)
        file: PathBuf,
        /// Where to write the JSON report (default: <stem>_review_report.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Draft a design document from a project brief and refine it until it passes review
    Draft {
        /// Project brief (reads stdin when empty and no --brief-file is given)
        #[arg(trailing_var_arg = true)]
        brief: Vec<String>,
        /// Read the brief from a file
        #[arg(long)]
        brief_file: Option<PathBuf>,
        /// Where to write the document (default: design_document.md)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override refine.max_iterations
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Refine an existing document until it passes review
    Refine {
        /// Document to refine (.md, .txt, .docx, .pdf)
        file: PathBuf,
        /// Where to write the document (default: <stem>_refined.md)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Override refine.max_iterations
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Generate a document section by section from a markdown template
    Sections {
        /// Markdown template; each header starts a section
        file: PathBuf,
        /// Where to write the document (default: generated_document.md)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
    /// Run configuration health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redline=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "redline", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found. Set ANTHROPIC_API_KEY or create redline.toml",
            cli.config.display()
        );
        create_env_config()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            doctor::run_doctor(&config);
        }
        Commands::Review { file, output } => {
            let document = redline_ingest::load_document(&file)?;
            let llm = redline_llm::build_client(&config);
            let panel = ReviewPanel::from_config(&config, llm);

            let result = panel
                .review(document.text, Some(file.display().to_string()))
                .await?;
            print_errors(&result.state.errors);

            let report = result.state.report.ok_or_else(|| {
                anyhow::anyhow!("review ended without a report (status: {:?})", result.status)
            })?;
            print_report(&report);

            let out = output.unwrap_or_else(|| sibling(&file, "_review_report.json"));
            std::fs::write(&out, serde_json::to_string_pretty(&report)?)?;
            info!(path = %out.display(), "Report saved");
        }
        Commands::Draft {
            brief,
            brief_file,
            output,
            max_iterations,
        } => {
            let brief = match brief_file {
                Some(path) => std::fs::read_to_string(&path)?,
                None if brief.is_empty() => read_stdin(),
                None => brief.join(" "),
            };
            if brief.trim().is_empty() {
                anyhow::bail!("empty project brief");
            }
            if let Some(n) = max_iterations {
                config.refine.max_iterations = n;
            }

            let llm = redline_llm::build_client(&config);
            let result = RefineLoop::from_config(&config, llm).draft(brief).await?;
            let out = output.unwrap_or_else(|| PathBuf::from("design_document.md"));
            finish_refinement(&result.state, &out)?;
        }
        Commands::Refine {
            file,
            output,
            max_iterations,
        } => {
            let document = redline_ingest::load_document(&file)?;
            if let Some(n) = max_iterations {
                config.refine.max_iterations = n;
            }

            let llm = redline_llm::build_client(&config);
            let result = RefineLoop::from_config(&config, llm)
                .refine(document.text)
                .await?;
            let out = output.unwrap_or_else(|| sibling(&file, "_refined.md"));
            finish_refinement(&result.state, &out)?;
        }
        Commands::Sections { file, output } => {
            let template = redline_ingest::load_document(&file)?;
            let llm = redline_llm::build_client(&config);
            let pipeline = SectionPipeline::from_config(&config, llm);

            let (document, result) = pipeline.generate_document(&template.text).await?;
            print_errors(&result.state.errors);
            let done = result
                .state
                .sections
                .iter()
                .filter(|s| s.content.is_some())
                .count();
            println!(
                "Generated {}/{} sections ({:?})",
                done,
                result.state.sections.len(),
                result.status
            );

            let out = output.unwrap_or_else(|| PathBuf::from("generated_document.md"));
            std::fs::write(&out, document)?;
            info!(path = %out.display(), "Document saved");
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn finish_refinement(state: &redline_workflow::DraftState, out: &Path) -> anyhow::Result<()> {
    print_errors(&state.errors);
    match state.phase {
        Phase::Published => {
            println!("Published after {} review round(s)", state.iteration);
        }
        Phase::Exhausted => {
            let failing = state
                .gate
                .as_ref()
                .map(|g| g.failing().join(", "))
                .unwrap_or_default();
            warn!(iterations = state.iteration, "Quality gate not met");
            println!(
                "Warning: quality gate not met after {} round(s) (failing: {}). Saving the last draft.",
                state.iteration, failing
            );
        }
        phase => {
            println!("Warning: refinement stopped while {}. Saving the last draft.", phase);
        }
    }

    if state.document.trim().is_empty() {
        anyhow::bail!("no draft was produced");
    }
    std::fs::write(out, &state.document)?;
    info!(path = %out.display(), "Document saved");
    Ok(())
}

fn print_report(report: &ConsolidatedReport) {
    println!("Overall severity: {} (average {:.2})", report.overall_severity, report.average_score);
    println!();
    println!("Findings:");
    for finding in &report.findings {
        println!("  - {}", finding);
    }
    println!();
    println!("Recommendations:");
    for rec in &report.recommendations {
        println!("  - {}", rec);
    }
    if !report.failed_participants.is_empty() {
        println!();
        println!("Failed participants: {}", report.failed_participants.join(", "));
    }
}

fn print_errors(errors: &[NodeFailure]) {
    for failure in errors {
        eprintln!("  [!!] {}: {}", failure.node, failure.message);
    }
}

/// `<dir>/<stem><suffix>` next to `file`.
fn sibling(file: &Path, suffix: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    file.with_file_name(format!("{}{}", stem, suffix))
}

fn read_stdin() -> String {
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn create_env_config() -> AppConfig {
    let (provider, model_id, api_key, base_url) =
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            ("anthropic", "claude-sonnet-4-20250514", Some(key), None)
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            ("openai", "gpt-4o", Some(key), None)
        } else {
            // Default to Ollama (local)
            (
                "ollama",
                "llama3.2",
                None,
                Some("http://localhost:11434/v1/chat/completions".to_string()),
            )
        };

    AppConfig {
        model: ModelConfig {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            api_key,
            base_url,
            max_tokens: 8192,
            temperature: 0.0,
            retry: None,
        },
        fallback_models: vec![],
        workflow: WorkflowConfig::default(),
        review: ReviewConfig::default(),
        refine: RefineConfig::default(),
        sections: SectionsConfig::default(),
    }
}

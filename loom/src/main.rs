//! Command-line front end for tree-search story planning.
//!
//! ```bash
//! loom --project lighthouse plan "A keeper hides a drowned city" --research "tidal lighthouses"
//! loom --project lighthouse chapter 1
//! loom --project lighthouse scenes "The storm reaches the island" --steps 3
//! loom --project lighthouse export > story.md
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use loom_core::session::{ChapterOutcome, SceneOutcome};
use loom_core::{Durability, SearchReport, StoryConfig, StorySession};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loom", version, about = "Plan and write stories with tree search")]
struct Cli {
    /// Project to work on.
    #[arg(long, short, global = true, default_value = "default")]
    project: String,

    /// Root directory for project data (overrides LOOM_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Rollouts per decision.
    #[arg(long, global = true)]
    iterations: Option<usize>,

    /// Candidates per expansion.
    #[arg(long, global = true)]
    branch: Option<usize>,

    #[arg(long, global = true)]
    language: Option<String>,

    #[arg(long, global = true)]
    genre: Option<String>,

    /// Seed for reproducible searches.
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search for a story plan and commit it.
    Plan {
        premise: String,
        /// Research this topic first and feed the findings into planning.
        #[arg(long)]
        research: Option<String>,
    },
    /// Revise the current plan.
    Refine { feedback: String },
    /// Search scene beats one at a time and write them as prose.
    Scenes {
        instruction: String,
        #[arg(long, default_value_t = 3)]
        steps: usize,
    },
    /// Write (or rewrite) a planned chapter.
    Chapter {
        number: usize,
        /// Rewrite the latest draft with this feedback.
        #[arg(long)]
        rewrite: Option<String>,
    },
    /// Print the context digest.
    Digest,
    /// Print the event log as a manuscript.
    Export,
    /// Clear the project's memory.
    Reset,
}

impl Cli {
    fn config(&self) -> StoryConfig {
        let mut config = StoryConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(iterations) = self.iterations {
            config = config.with_iterations(iterations);
        }
        if let Some(branch) = self.branch {
            config = config.with_branch_factor(branch);
        }
        if let Some(language) = &self.language {
            config = config.with_language(language.as_str());
        }
        if let Some(genre) = &self.genre {
            config = config.with_genre(genre.as_str());
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        bail!("ANTHROPIC_API_KEY is not set. Put it in .env or export it.");
    }

    let session = StorySession::open(cli.config(), &cli.project)
        .await
        .with_context(|| format!("opening project '{}'", cli.project))?;

    let cancel = session.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping the search (press Ctrl-C again to quit)");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted twice; exiting");
            std::process::exit(130);
        }
    });

    match cli.command {
        Command::Plan { premise, research } => {
            let mut premise = premise;
            if let Some(topic) = research {
                match session.research(&topic).await {
                    Ok(findings) => {
                        premise = format!("{premise}\n\nResearch Findings:\n{findings}")
                    }
                    Err(e) => warn!(error = %e, "Research failed; planning without it"),
                }
            }

            let outcome = session.plan(&premise).await?;
            report_search(&outcome.report);
            warn_volatile(&outcome.durability);
            match outcome.label {
                Some(label) => println!("{label}\n"),
                None => println!("No plan was produced."),
            }
            println!("{}", session.digest().await);
        }
        Command::Refine { feedback } => {
            let outcome = session.refine(&feedback).await?;
            warn_volatile(&outcome.durability);
            if outcome.changed {
                println!("{}", session.digest().await);
            } else {
                println!("The plan was left unchanged.");
            }
        }
        Command::Scenes { instruction, steps } => {
            let outcome = session.write_scenes(&instruction, steps).await?;
            print_scenes(&outcome);
        }
        Command::Chapter { number, rewrite } => {
            let outcome = match rewrite {
                Some(feedback) => session.rewrite_chapter(number, &feedback).await?,
                None => session.write_chapter(number).await?,
            };
            print_chapter(&outcome);
        }
        Command::Digest => println!("{}", session.digest().await),
        Command::Export => print!("{}", session.export_log().await),
        Command::Reset => {
            warn_volatile(&session.reset().await);
            info!(project = %cli.project, "Project memory cleared");
        }
    }

    Ok(())
}

fn print_scenes(outcome: &SceneOutcome) {
    report_search(&outcome.report);
    warn_volatile(&outcome.durability);
    if outcome.stopped_early {
        warn!(committed = outcome.labels.len(), "Scene search stopped early");
    }
    for (i, beat) in outcome.labels.iter().enumerate() {
        println!("{}. {beat}", i + 1);
    }
    if let Some(content) = &outcome.content {
        println!("\n{content}");
    }
}

fn print_chapter(outcome: &ChapterOutcome) {
    warn_volatile(&outcome.durability);
    println!("## Chapter {}\n\n{}", outcome.number, outcome.content);
}

fn report_search(report: &SearchReport) {
    if report.cancelled {
        warn!(rollouts = report.rollouts, "Search cancelled");
    }
    if report.is_degraded() {
        warn!(
            failed_expansions = report.failed_expansions,
            defaulted_scores = report.defaulted_scores,
            "Search ran on fallbacks; results may be weaker"
        );
    }
}

fn warn_volatile(durability: &Durability) {
    if let Durability::Volatile { reason } = durability {
        warn!(%reason, "Changes were not saved to disk");
    }
}

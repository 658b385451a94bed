#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use chrono::Utc;

use tailor_harness::arena::Arena;
use tailor_harness::budget::TokenBudget;
use tailor_harness::config::LoopConfig;
use tailor_harness::critic::CriticAgent;
use tailor_harness::judge::PiggybackJudge;
use tailor_harness::oracle::{Oracle, OpenRouterOracle, OracleGateway};
use tailor_harness::scheduler::AgentRegistry;
use tailor_harness::sections::{is_known_key, SectionLibrary};
use tailor_harness::store::{LoopStore, SectionOrigin};
use tailor_harness::surgeon::SurgeonAgent;

#[derive(Parser)]
#[command(name = "tailor", version, about = "Tailor prompt-improvement loop CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite store path (default: TAILOR_STORE or .tailor_loop.sqlite)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full improvement cycle: judge, critic, surgeon, follow-up
    Cycle,
    /// Score recent unevaluated analyses (piggyback judge)
    Judge,
    /// Diagnose weaknesses from recent judge aggregates
    Critic,
    /// Draft, arena-test, and maybe deploy section edits
    Surgeon {
        /// Evening second pass (higher budget tier)
        #[arg(long)]
        evening: bool,
        /// Extra late-night mutations (deepest budget tier)
        #[arg(long)]
        extra: bool,
    },
    /// Weekly examples-section rotation against the weakest style lane
    RotateExamples,
    /// Re-freeze regression baselines against the current active prompt
    Calibrate,
    /// Show active sections, budget spend, and open critiques
    Status,
    /// Seed v1 active sections from a directory of <section_key>.md files
    SeedSections {
        dir: PathBuf,
    },
    /// Record one production analysis for the judge to score
    RecordAnalysis {
        #[arg(long)]
        occasion: String,
        #[arg(long, default_value = "")]
        setting: String,
        #[arg(long, default_value = "")]
        vibe: String,
        #[arg(long)]
        ai_score: f64,
        /// Feedback text, or "-" to read from stdin
        #[arg(long)]
        feedback: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tailor_harness=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = LoopConfig::from_env();
    let store_path = cli.store.unwrap_or(config.store_path.clone());
    let store = Arc::new(LoopStore::new(&store_path)?);

    match cli.command {
        Commands::Cycle => {
            let (budget, oracle) = build_runtime(&store).await?;
            let registry = AgentRegistry::new(store, budget, oracle, config.model);
            let report = registry.run_cycle().await;
            println!(
                "cycle: {} stages completed, {} failed, {} bus entries purged",
                report.completed.len(),
                report.failed.len(),
                report.purged_bus_entries,
            );
            for (stage, error) in &report.failed {
                println!("  FAILED {stage}: {error}");
            }
        }
        Commands::Judge => {
            let (budget, oracle) = build_runtime(&store).await?;
            let judge = PiggybackJudge::new(store, budget, oracle, config.model);
            let outcome = judge.run().await?;
            println!("judge: {outcome:?}");
        }
        Commands::Critic => {
            let (budget, oracle) = build_runtime(&store).await?;
            let critic = CriticAgent::new(store, budget, oracle, config.model);
            let outcome = critic.run().await?;
            println!("critic: {outcome:?}");
        }
        Commands::Surgeon { evening, extra } => {
            let (budget, oracle) = build_runtime(&store).await?;
            let surgeon = SurgeonAgent::new(store, budget, oracle, config.model);
            if extra {
                for outcome in surgeon.run_additional_mutations().await? {
                    println!("surgeon (extra): {outcome:?}");
                }
            } else if evening {
                let outcome = surgeon.run_evening().await?;
                println!("surgeon (evening): {outcome:?}");
            } else {
                for outcome in surgeon.run().await? {
                    println!("surgeon: {outcome:?}");
                }
            }
        }
        Commands::RotateExamples => {
            let (budget, oracle) = build_runtime(&store).await?;
            let surgeon = SurgeonAgent::new(store, budget, oracle, config.model);
            let outcome = surgeon.run_example_rotation().await?;
            println!("rotation: {outcome:?}");
        }
        Commands::Calibrate => {
            let (budget, oracle) = build_runtime(&store).await?;
            let arena = Arena::new(store, budget, oracle, config.model);
            let updated = arena.calibrate_baselines().await?;
            println!("calibrated {updated} regression baselines");
        }
        Commands::Status => {
            let today = Utc::now().date_naive().to_string();
            match store.get_daily_usage(&today).await? {
                Some((spent, breakdown)) => {
                    println!("tokens spent today: {spent} / {}", config.daily_token_budget);
                    println!("breakdown: {breakdown}");
                }
                None => println!(
                    "tokens spent today: 0 / {}",
                    config.daily_token_budget
                ),
            }
            println!();

            let sections = store.active_sections_by_age().await?;
            if sections.is_empty() {
                println!("no active sections (run seed-sections first)");
            } else {
                println!("active sections:");
                for s in &sections {
                    let win = s
                        .arena_win_rate
                        .map(|w| format!("{:.0}%", w * 100.0))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {} v{} ({} failed attempts, arena {})",
                        s.section_key,
                        s.version,
                        s.failed_attempts.len(),
                        win,
                    );
                }
            }
            println!();

            match store.latest_unaddressed_critique().await? {
                Some(report) => {
                    println!("open critique #{}:", report.id);
                    for w in &report.weaknesses {
                        println!(
                            "  {} avg {:.1} severity {} -> {}",
                            w.dimension,
                            w.avg_score,
                            w.severity,
                            w.affected_sections.join(", "),
                        );
                    }
                }
                None => println!("no open critiques"),
            }
        }
        Commands::SeedSections { dir } => {
            let library = SectionLibrary::new(store);
            let mut seeded = 0;
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if !is_known_key(key) {
                    eprintln!("skipping {key}.md: not a known section key");
                    continue;
                }
                let content = std::fs::read_to_string(&path)?;
                let section = library
                    .create_version(key, content.trim(), SectionOrigin::Manual, "initial seed", None)
                    .await?;
                library.activate(key, section.version, None).await?;
                println!("seeded {key} v{}", section.version);
                seeded += 1;
            }
            println!("{seeded} sections seeded from {}", dir.display());
        }
        Commands::RecordAnalysis {
            occasion,
            setting,
            vibe,
            ai_score,
            feedback,
        } => {
            let feedback = if feedback == "-" {
                std::io::read_to_string(std::io::stdin())?
            } else {
                feedback
            };
            let id = uuid::Uuid::new_v4().to_string();
            store
                .insert_analysis(&id, &occasion, &setting, &vibe, ai_score, feedback.trim())
                .await?;
            println!("recorded analysis {id}");
        }
    }

    Ok(())
}

async fn build_runtime(
    store: &Arc<LoopStore>,
) -> Result<(Arc<TokenBudget>, Arc<dyn Oracle>), Box<dyn std::error::Error>> {
    let oracle = OpenRouterOracle::from_env()?;
    let budget = TokenBudget::from_env().with_store(store.clone()).await;
    Ok((Arc::new(budget), Arc::new(OracleGateway::new(oracle))))
}

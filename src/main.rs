use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use query_synth::llm::{ScriptedProvider, ScriptedReply};
use query_synth::{logging, EngineConfig, EngineStats, ProfileRegistry, SynthesisEngine};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "query-synth")]
#[command(about = "Answer natural-language questions about a tabular dataset")]
struct Cli {
    /// Directory holding profile JSON files
    #[arg(long, default_value = "profiles", global = true)]
    profiles_dir: PathBuf,

    /// Log level for this crate when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct EngineArgs {
    /// Profile id
    #[arg(short, long)]
    profile: String,

    /// Replay replies from a JSON file instead of calling the provider
    #[arg(long)]
    offline: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question and print the response as JSON
    Ask {
        #[command(flatten)]
        engine: EngineArgs,

        question: String,
    },
    /// Print dataset statistics for a profile. Method counters live per
    /// process, so a one-shot CLI run has none to report.
    Stats {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// List registered profiles
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    let registry = ProfileRegistry::from_dir(&cli.profiles_dir)
        .with_context(|| format!("reading profiles from {}", cli.profiles_dir.display()))?;

    let output = match &cli.command {
        Command::Ask { engine, question } => {
            let engine = build_engine(&registry, engine)?;
            let context = engine.context_for(question);
            let response = engine.answer(question, &context).await.map_err(|e| {
                error!("Question failed: {}", e);
                e
            })?;
            serde_json::to_value(&response)?
        }
        Command::Stats { engine } => dataset_summary(&build_engine(&registry, engine)?.stats()),
        Command::Profiles => {
            let profiles: Vec<_> = registry
                .ids()
                .into_iter()
                .map(|id| match registry.create(id) {
                    Ok(profile) => json!({
                        "id": id,
                        "rows": profile.dataset().height(),
                        "columns": profile.schema().names(),
                        "provider": profile.provider_config().provider,
                        "model": profile.provider_config().model,
                    }),
                    Err(e) => json!({ "id": id, "error": e.to_string() }),
                })
                .collect();
            json!(profiles)
        }
    };

    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", output);
    }
    Ok(())
}

fn build_engine(registry: &ProfileRegistry, args: &EngineArgs) -> Result<SynthesisEngine> {
    let profile = registry.create(&args.profile)?;
    let config = EngineConfig::from_env()?;
    let engine = match &args.offline {
        Some(path) => {
            info!("Offline mode: replaying replies from {}", path.display());
            let provider = Arc::new(load_replies(path)?);
            SynthesisEngine::with_provider(profile.as_ref(), provider, config)?
        }
        None => SynthesisEngine::from_profile(profile.as_ref(), config)?,
    };
    Ok(engine)
}

fn dataset_summary(stats: &EngineStats) -> serde_json::Value {
    json!({
        "profile": stats.profile,
        "provider": stats.provider,
        "model": stats.model,
        "total_records": stats.total_records,
        "columns": stats.columns,
        "censored_columns": stats.censored_columns,
    })
}

fn load_replies(path: &Path) -> Result<ScriptedProvider> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let replies: Vec<ScriptedReply> =
        serde_json::from_str(&text).with_context(|| format!("parsing replies in {}", path.display()))?;
    Ok(ScriptedProvider::from_replies(replies))
}

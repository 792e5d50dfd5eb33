//! Pivot Admin: create, release, inspect and exercise UCB1 feature
//! experiments stored in Redis.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pivot_core::config::{AppConfig, RewardMode};
use pivot_core::types::{Assignments, FeatureDefinition, VariantValue};
use pivot_rl_engine::BanditEngine;
use pivot_store::RedisStore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pivot-admin")]
#[command(about = "Manage UCB1 bandit feature experiments")]
#[command(version)]
struct Cli {
    /// Optional config file, overridden by PIVOT__* environment variables
    #[arg(short, long, env = "PIVOT_CONFIG")]
    config: Option<PathBuf>,

    /// Application name used to namespace keys (overrides config)
    #[arg(long, env = "PIVOT__APP_NAME")]
    app_name: Option<String>,

    /// Redis connection URL (overrides config)
    #[arg(long, env = "PIVOT__REDIS__URL")]
    redis_url: Option<String>,

    /// Fold rewards with a separate read and write batch
    #[arg(long, default_value_t = false)]
    two_phase: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a feature, or re-create it keeping its statistics
    Create {
        /// Feature name
        #[arg(short, long)]
        name: String,

        /// JSON array of variants, e.g. '[1,2,3]' or '["red","blue"]'
        #[arg(short, long)]
        variants: String,

        /// Mark the feature as work in progress
        #[arg(long, default_value_t = false)]
        wip: bool,
    },

    /// Start (or with --off, stop) handing out a feature's variants
    Release {
        #[arg(short, long)]
        name: String,

        #[arg(long, default_value_t = false)]
        off: bool,
    },

    /// Set or clear the work-in-progress flag
    Wip {
        #[arg(short, long)]
        name: String,

        #[arg(long, default_value_t = false)]
        off: bool,
    },

    /// List features recorded in the store
    List,

    /// Show per-arm counts, means and UCB scores
    Stats {
        #[arg(short, long)]
        name: String,
    },

    /// Assign a variant of a feature to a user
    Assign {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        user: String,

        /// JSON object of existing assignments for the user
        #[arg(long)]
        existing: Option<String>,
    },

    /// Report a reward for a variant a user was assigned
    Reward {
        #[arg(short, long)]
        name: String,

        /// Assigned variant as JSON, e.g. 2 or '"blue"'
        #[arg(short, long)]
        variant: String,

        #[arg(short, long)]
        reward: f64,
    },
}

fn parse_variant(raw: &str) -> VariantValue {
    // Bare words are accepted as strings.
    serde_json::from_str(raw).unwrap_or_else(|_| VariantValue::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pivot_admin=info,pivot_rl_engine=info,pivot_store=info".into()
            }),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(app_name) = cli.app_name {
        config.app_name = app_name;
    }
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }
    if cli.two_phase {
        config.engine.reward_mode = RewardMode::TwoPhase;
    }

    info!(
        prefix = %config.key_prefix(),
        redis = %config.redis.redacted_url(),
        reward_mode = ?config.engine.reward_mode,
        "Configuration loaded"
    );

    let store = RedisStore::connect(&config.redis)
        .await
        .context("Redis connection required")?;
    let engine = BanditEngine::new(Arc::new(store), &config);

    match cli.command {
        Commands::Create {
            name,
            variants,
            wip,
        } => {
            let variants: Vec<VariantValue> =
                serde_json::from_str(&variants).context("variants must be a JSON array")?;
            let definition = FeatureDefinition::new(name, variants).with_wip(wip);
            engine.create(&definition).await?;
            print_json(&definition)?;
        }
        Commands::Release { name, off } => {
            engine.release(&name, !off).await?;
            print_json(&engine.stats(&name).await?)?;
        }
        Commands::Wip { name, off } => {
            engine.set_wip(&name, !off).await?;
            print_json(&engine.stats(&name).await?)?;
        }
        Commands::List => {
            print_json(&engine.features().await?)?;
        }
        Commands::Stats { name } => {
            print_json(&engine.stats(&name).await?)?;
        }
        Commands::Assign {
            name,
            user,
            existing,
        } => {
            let existing: Assignments = match existing {
                Some(raw) => serde_json::from_str(&raw)
                    .context("existing assignments must be a JSON object")?,
                None => Assignments::new(),
            };
            engine.load(&name).await?;
            print_json(&engine.assign(&user, existing).await?)?;
        }
        Commands::Reward {
            name,
            variant,
            reward,
        } => {
            engine.load(&name).await?;
            let assignments = Assignments::from([(name, parse_variant(&variant))]);
            print_json(&engine.reward(&assignments, reward).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_variant() {
        assert_eq!(parse_variant("2"), json!(2));
        assert_eq!(parse_variant("\"blue\""), json!("blue"));
        assert_eq!(parse_variant("blue"), json!("blue"));
    }

    #[test]
    fn test_reward_args() {
        let cli = Cli::try_parse_from([
            "pivot-admin",
            "--two-phase",
            "reward",
            "--name",
            "test1",
            "--variant",
            "1",
            "--reward",
            "0.5",
        ])
        .unwrap();
        assert!(cli.two_phase);
        match cli.command {
            Commands::Reward { name, reward, .. } => {
                assert_eq!(name, "test1");
                assert_eq!(reward, 0.5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

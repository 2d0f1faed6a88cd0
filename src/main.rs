use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use quantrs::config::{set_global_config, Config};
use quantrs::engine::cache::ArtifactCache;
use quantrs::engine::{ModelSelector, PredictionEngine};
use quantrs::errors::{QuantrsError, QuantrsResult};
use quantrs::features::DbFeatureProvider;
use quantrs::init_tracing;
use quantrs::learner::Algorithm;
use quantrs::registry::metadata::ModelStatus;
use quantrs::registry::ModelRegistry;
use quantrs::store::{MetadataStore, ModelFilter, SqliteMetadataStore};
use quantrs::trainer::{ModelTrainer, TrainerSettings};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "quantrs")]
#[command(about = "Model lifecycle manager for per-ticker direction models")]
struct Args {
    /// Config file path (default: config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train one ticker and register the model in staging
    Train {
        ticker: String,
        /// logistic / forest / ensemble (default: config default_algorithm)
        #[arg(short, long)]
        algorithm: Option<String>,
        #[arg(long, default_value = "direction")]
        model_type: String,
        /// Reference date, YYYY-MM-DD (default: today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Promote straight to production after registration
        #[arg(long)]
        promote: bool,
    },
    /// Train several tickers concurrently; failures stay per-ticker
    TrainBatch {
        /// Comma-separated ticker list
        tickers: String,
        #[arg(short, long)]
        algorithm: Option<String>,
        #[arg(long, default_value = "direction")]
        model_type: String,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long)]
        promote: bool,
    },
    /// Promote a staged model to production
    Promote {
        model_id: String,
        /// Keep the currently deployed model in production alongside
        #[arg(long)]
        keep_current: bool,
    },
    /// Re-promote an archived version of a ticker's model
    Rollback { ticker: String, version: String },
    /// List registered models
    List {
        #[arg(long)]
        ticker: Option<String>,
        #[arg(long)]
        model_type: Option<String>,
        /// TRAINING / STAGING / PRODUCTION / ARCHIVED / FAILED
        #[arg(long)]
        status: Option<String>,
    },
    /// Serve one prediction from the production model
    Predict {
        ticker: String,
        #[arg(long, default_value = "direction")]
        model_type: String,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Aggregate predictions across several model types
    PredictEnsemble {
        ticker: String,
        /// Comma-separated model types
        #[arg(long, default_value = "direction")]
        model_types: String,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Permanently delete a non-production model
    Delete {
        model_id: String,
        /// Deletion refuses to run without this flag
        #[arg(long)]
        yes: bool,
    },
    /// Re-mirror the manifest into the relational store
    Reconcile,
}

#[tokio::main]
async fn main() -> QuantrsResult<()> {
    let args = Args::parse();

    init_tracing().map_err(QuantrsError::general)?;

    info!("🚀 quantrs starting");
    info!("📁 config file: {}", args.config);

    let config = Config::load_from_file(&args.config)?;
    set_global_config(config.clone())?;
    info!("✅ config loaded");

    let provider = Arc::new(DbFeatureProvider::open(&config.database.daily_db_path)?);
    let store: Option<Arc<dyn MetadataStore>> =
        match SqliteMetadataStore::open(&config.database.metadata_db_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("metadata store unavailable, running manifest-only: {}", e);
                None
            }
        };
    let registry = Arc::new(ModelRegistry::new(
        &config.registry.root_path,
        store.clone(),
    )?);

    match args.command {
        Command::Train {
            ticker,
            algorithm,
            model_type,
            as_of,
            promote,
        } => {
            let trainer = build_trainer(&config, provider, algorithm, model_type)?;
            let as_of = as_of.unwrap_or_else(today);
            let promote = promote || config.training.promote_on_register;
            let metadata = trainer.train_and_register(&registry, &ticker, as_of, promote)?;
            info!(
                "📦 registered {} v{} ({})",
                metadata.model_id, metadata.version, metadata.status
            );
        }
        Command::TrainBatch {
            tickers,
            algorithm,
            model_type,
            as_of,
            promote,
        } => {
            let trainer = build_trainer(&config, provider, algorithm, model_type)?;
            let as_of = as_of.unwrap_or_else(today);
            let promote = promote || config.training.promote_on_register;
            let tickers = split_list(&tickers);

            // training is CPU-bound; one blocking task per ticker
            let mut handles = Vec::with_capacity(tickers.len());
            for ticker in tickers {
                let trainer = trainer.clone();
                let registry = registry.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    let outcome = trainer.train_and_register(&registry, &ticker, as_of, promote);
                    (ticker, outcome)
                }));
            }

            let mut failed = 0usize;
            for handle in handles {
                let (ticker, outcome) = handle.await?;
                match outcome {
                    Ok(metadata) => {
                        info!("📦 {} -> {} v{}", ticker, metadata.model_id, metadata.version)
                    }
                    Err(e) => {
                        failed += 1;
                        error!("❌ {} failed: {}", ticker, e);
                    }
                }
            }
            if failed > 0 {
                warn!("batch finished with {} failed ticker(s)", failed);
            }
        }
        Command::Promote {
            model_id,
            keep_current,
        } => {
            let metadata = registry.promote_to_production(&model_id, !keep_current)?;
            info!("🏆 {} is now in production", metadata.model_id);
        }
        Command::Rollback { ticker, version } => {
            let metadata = registry.rollback_to_version(&ticker, &version)?;
            info!("🏆 rolled {} back to v{}", ticker, metadata.version);
        }
        Command::List {
            ticker,
            model_type,
            status,
        } => {
            let status = status.map(|s| parse_status(&s)).transpose()?;
            let filter = ModelFilter {
                ticker,
                model_type,
                status,
            };
            let models = registry.list_models(&filter)?;
            for m in &models {
                println!(
                    "{:<40} {:<10} {:<12} {:<10} {}",
                    m.model_id,
                    m.version,
                    m.status,
                    m.algorithm,
                    m.trained_at.format("%Y-%m-%d %H:%M")
                );
            }
            info!("{} model(s)", models.len());
        }
        Command::Predict {
            ticker,
            model_type,
            as_of,
        } => {
            let engine = build_engine(&config, registry, provider, store);
            let selector = ModelSelector::Production { model_type };
            let prediction = engine.predict(&ticker, &selector, as_of.unwrap_or_else(today))?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Command::PredictEnsemble {
            ticker,
            model_types,
            as_of,
        } => {
            let engine = build_engine(&config, registry, provider, store);
            let types = split_list(&model_types);
            let ensemble = engine.predict_ensemble(&ticker, &types, as_of.unwrap_or_else(today))?;
            println!("{}", serde_json::to_string_pretty(&ensemble)?);
        }
        Command::Delete { model_id, yes } => {
            registry.delete_model(&model_id, yes)?;
            info!("🗑️ deleted {}", model_id);
        }
        Command::Reconcile => {
            let mirrored = registry.reconcile()?;
            info!("✅ reconciled {} manifest entr(ies) into the relational store", mirrored);
        }
    }

    info!("🏁 quantrs done");
    Ok(())
}

fn build_trainer(
    config: &Config,
    provider: Arc<DbFeatureProvider>,
    algorithm: Option<String>,
    model_type: String,
) -> QuantrsResult<ModelTrainer> {
    let algorithm =
        Algorithm::parse(algorithm.as_deref().unwrap_or(&config.training.default_algorithm))?;
    let settings = TrainerSettings {
        n_splits: config.training.n_splits,
        test_size: config.training.test_size,
        horizon_days: config.training.horizon_days,
        lookback_days: config.training.lookback_days,
        algorithm,
        model_type,
        ..TrainerSettings::default()
    };
    Ok(ModelTrainer::new(provider, settings))
}

fn build_engine(
    config: &Config,
    registry: Arc<ModelRegistry>,
    provider: Arc<DbFeatureProvider>,
    store: Option<Arc<dyn MetadataStore>>,
) -> PredictionEngine {
    PredictionEngine::new(
        registry,
        provider,
        store,
        ArtifactCache::new(config.prediction.cache_capacity),
        config.training.horizon_days,
        config.prediction.top_n_features,
        config.prediction.feature_version.clone(),
    )
}

fn parse_status(raw: &str) -> QuantrsResult<ModelStatus> {
    match raw.to_uppercase().as_str() {
        "TRAINING" => Ok(ModelStatus::Training),
        "STAGING" => Ok(ModelStatus::Staging),
        "PRODUCTION" => Ok(ModelStatus::Production),
        "ARCHIVED" => Ok(ModelStatus::Archived),
        "FAILED" => Ok(ModelStatus::Failed),
        other => Err(QuantrsError::general(format!("unknown status '{}'", other))),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

use std::sync::Arc;

use clap::{Parser, Subcommand};
use infrared::{InfraredClient, SimulationBackend};
use sim_wrapper::{
    api::Api,
    config::Config,
    job::JobCoordinator,
    maintenance::PoolMaintainer,
    store::{KeyValueStore, RedisStore},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Default)]
enum Commands {
    /// Run the HTTP API and the periodic pool maintenance
    #[default]
    Serve,
    /// Clean used slots, top up the pool once and print every slot's status
    Setup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::new()?;
    info!(?config, "config");

    let backend: Arc<dyn SimulationBackend> = Arc::new(InfraredClient::new(
        config.backend.url.clone(),
        config.backend.username.clone(),
        config.backend.password.expose_secret().clone(),
    ));
    let store: Arc<dyn KeyValueStore> =
        Arc::new(RedisStore::connect(&config.redis_url, config.cache.key_prefix.clone()).await?);
    let pool = Arc::new(PoolMaintainer::new(&config, backend.clone(), store.clone()));

    match cli.command.unwrap_or_default() {
        Commands::Setup => {
            let report = pool.ensure_pool().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Serve => serve(config, backend, store, pool).await,
    }
}

async fn serve(
    config: Config,
    backend: Arc<dyn SimulationBackend>,
    store: Arc<dyn KeyValueStore>,
    pool: Arc<PoolMaintainer>,
) -> anyhow::Result<()> {
    let cancel_token = CancellationToken::new();
    let jobs = Arc::new(JobCoordinator::new(&config, backend, store));
    let mut tasks = tokio::task::JoinSet::new();

    {
        let pool = pool.clone();
        let cancel_token = cancel_token.clone();
        let interval = config.pool.interval;
        tasks.spawn(
            async move {
                pool.run(interval, cancel_token).await;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(info_span!("maintenance").or_current()),
        );
    }

    if let Some(api_config) = config.api {
        let api = Api::new(api_config, jobs.clone(), pool);
        tasks.spawn(
            api.run(cancel_token.clone())
                .instrument(info_span!("api").or_current()),
        );
    }

    {
        let cancel_token = cancel_token.clone();
        tasks.spawn(async move {
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            cancel_token.cancel();
            Ok(())
        });
    }

    while let Some(res) = tasks.join_next().await {
        res??;
    }
    jobs.drain().await;
    Ok(())
}

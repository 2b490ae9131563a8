mod config;
mod engine;
mod error;
mod jobs;
mod languages;
mod normalizer;
mod redis_manager;
mod result;
mod sandbox;
mod security;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::jobs::execute::process_execute_job;
use crate::jobs::WorkerJob;
use crate::languages::LanguageRegistry;
use crate::redis_manager::RedisManager;
use crate::sandbox::{ContainerRuntime, DockerRuntime, ExecutionSandbox};
use crate::security::{SecurityConfig, SecurityGate};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("executor=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env();

    let registry = LanguageRegistry::load(config.languages_path.as_deref())
        .context("Failed to load language profiles")?;
    info!(
        "Loaded {} language profiles from {}: {}",
        registry.profiles().len(),
        source_name(&config.languages_path),
        registry.languages().join(", ")
    );

    let security = SecurityConfig::load(config.security_path.as_deref())
        .context("Failed to load security configuration")?;
    info!(
        "Loaded {} forbidden patterns from {} (violation threshold {})",
        security.patterns.len(),
        source_name(&config.security_path),
        security.violation_threshold
    );
    let gate = SecurityGate::from_config(security);

    info!("Starting Execution Worker...");

    // Fail fast if the container runtime is not there
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(&config.runtime_binary));
    let version = sandbox::ensure_runtime_available(runtime.as_ref())
        .await
        .context("Container runtime is not available")?;
    info!("Confirmed container runtime {} {}", config.runtime_binary, version);

    let sandbox = ExecutionSandbox::new(runtime, &config.staging_root, config.max_output_bytes);
    if config.prepull_images {
        sandbox
            .prepull(&registry.profiles())
            .await
            .context("Failed to pull language images")?;
    }
    info!("Staging runs under {}", sandbox.staging_root().display());

    let engine = Engine::new(registry, gate, sandbox);

    let mut redis = RedisManager::connect(&config.redis_url, &config.queue_name).await?;
    let publisher = redis.publisher(config.result_ttl_secs).await?;
    let permits = Arc::new(Semaphore::new(config.max_concurrent_runs));

    info!(
        "Waiting for jobs on {} (max {} concurrent runs)...",
        config.queue_name, config.max_concurrent_runs
    );

    loop {
        // Take a slot first so we never pop more than we can run
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit.context("Run semaphore closed")?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let job = tokio::select! {
            job = redis.pop_job() => job?,
            _ = tokio::signal::ctrl_c() => break,
        };

        let engine = engine.clone();
        let mut publisher = publisher.clone();
        let margin = config.backstop_margin;

        tokio::spawn(async move {
            let _permit = permit;
            match job {
                WorkerJob::Execute(job) => {
                    info!(
                        "Received execute job: request_id={}, language={}",
                        job.request_id, job.language
                    );

                    let reply = process_execute_job(&engine, &job, margin).await;
                    if let Err(e) = publisher.store_reply(&job.result_key, &reply).await {
                        error!("Failed to deliver reply for {}: {:#}", job.request_id, e);
                    }
                }
            }
        });
    }

    info!("Shutting down, waiting for in-flight runs...");
    let in_flight = u32::try_from(config.max_concurrent_runs).unwrap_or(u32::MAX);
    let _ = permits.acquire_many(in_flight).await;
    info!("Execution Worker stopped");
    Ok(())
}

fn source_name(path: &Option<std::path::PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "embedded defaults".to_string(),
    }
}

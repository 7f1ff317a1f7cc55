// Copyright (c) 2025 superglue contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! superglue CLI: local operator access to the execution runtime in lieu
//! of the (out-of-scope) GraphQL server and dashboard.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use superglue_core::{
    ApiConfig, ExecutionOptions, HttpCaller, Integration, PostgresCaller, SelfHealingCoordinator, StepExecutor,
    Workflow, WorkflowEngine,
};
use superglue_core::oauth;
use superglue_core::retry::RetryPolicy;
use superglue_store::{ConfigKind, Datastore, RunRecord, StoredConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "superglue")]
#[command(version, about = "Self-healing API orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Organization id runs and persisted configs are scoped under
    #[arg(long, global = true, default_value = "default")]
    org_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single ApiConfig
    Call {
        /// Path to an ApiConfig file (JSON or YAML)
        #[arg(value_name = "FILE")]
        config: String,

        /// Payload JSON merged into the variable scope as top-level keys
        #[arg(short, long)]
        payload: Option<String>,

        /// Credentials JSON (flat string map) merged into the variable scope
        #[arg(short, long)]
        credentials: Option<String>,
    },

    /// Execute a multi-step Workflow
    RunWorkflow {
        /// Path to a Workflow file (JSON or YAML)
        #[arg(value_name = "FILE")]
        workflow: String,

        /// Payload JSON passed to the workflow
        #[arg(short, long)]
        payload: Option<String>,

        /// Credentials JSON (flat string map) passed to the workflow
        #[arg(short, long)]
        credentials: Option<String>,
    },

    /// Validate an ApiConfig or Workflow definition without executing it
    Validate {
        /// Path to the definition file (JSON or YAML)
        #[arg(value_name = "FILE")]
        file: String,

        /// Treat the file as a workflow rather than an ApiConfig
        #[arg(long)]
        workflow: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("superglue={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Call {
            config,
            payload,
            credentials,
        } => call(&cli.org_id, &config, payload.as_deref(), credentials.as_deref()).await,
        Commands::RunWorkflow {
            workflow,
            payload,
            credentials,
        } => run_workflow(&cli.org_id, &workflow, payload.as_deref(), credentials.as_deref()).await,
        Commands::Validate { file, workflow } => validate(&file, workflow),
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Reads a JSON or YAML definition file, dispatching on extension
/// (`.yaml`/`.yml` parse as YAML, everything else as JSON).
fn read_definition<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    if matches!(Path::new(path).extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")) {
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse {path} as YAML"))
    } else {
        serde_json::from_str(&content).with_context(|| format!("failed to parse {path} as JSON"))
    }
}

fn parse_json_arg<T: serde::de::DeserializeOwned + Default>(arg: Option<&str>, label: &str) -> Result<T> {
    match arg {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("failed to parse {label} as JSON")),
        None => Ok(T::default()),
    }
}

fn step_executor() -> StepExecutor {
    let http = HttpCaller::new(reqwest::Client::new(), RetryPolicy::default());
    let postgres = PostgresCaller::new();
    StepExecutor::new(http, postgres)
}

/// Builds a self-healing coordinator from `LLM_PROVIDER`/`LLM_MODEL`, if
/// both are set and the provider's API key is available. Absent either,
/// self-healing is skipped rather than erroring out.
fn healing_coordinator_from_env() -> Option<Arc<SelfHealingCoordinator>> {
    let provider_name = std::env::var("LLM_PROVIDER").ok()?;
    let model = std::env::var("LLM_MODEL").ok()?;
    match superglue_providers::provider_from_env(&provider_name) {
        Ok(provider) => {
            info!(provider = %provider_name, model = %model, "self-healing enabled");
            Some(Arc::new(SelfHealingCoordinator::new(Arc::from(provider), model)))
        }
        Err(e) => {
            info!(provider = %provider_name, error = %e, "self-healing provider unavailable, continuing without healing");
            None
        }
    }
}

async fn call(org_id: &str, config_path: &str, payload: Option<&str>, credentials: Option<&str>) -> Result<()> {
    let config: ApiConfig = read_definition(config_path)?;
    info!(config_id = %config.id, "calling config");

    let payload_value: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("failed to parse --payload as JSON")?,
        None => Value::Object(Default::default()),
    };
    let credential_map: HashMap<String, String> = parse_json_arg(credentials, "--credentials")?;

    let mut scope: HashMap<String, Value> = credential_map.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    if let Value::Object(map) = &payload_value {
        for (k, v) in map {
            scope.insert(k.clone(), v.clone());
        }
    }

    let executor = step_executor();
    let run_id = Uuid::new_v4().to_string();
    let snapshot = serde_json::to_value(&config)?;
    let store = superglue_store::datastore_from_env().await.context("failed to initialize datastore")?;
    store
        .create_run(RunRecord::started(run_id.clone(), org_id, Some(config.id.clone()), snapshot.clone()))
        .await
        .context("failed to record run start")?;

    let outcome = executor.execute(&config, &scope).await;

    let mut run = RunRecord::started(run_id, org_id, Some(config.id.clone()), snapshot);
    run.completed_at = Some(chrono::Utc::now());

    match &outcome {
        Ok(call) => {
            run.success = true;
            run.data = Some(call.transformed.clone());
            run.status_code = Some(call.status_code);
            run.headers = call.headers.clone();
        }
        Err(e) => {
            run.success = false;
            run.error = Some(e.to_string());
        }
    }
    store.finalize_run(run).await.ok();
    store.disconnect().await.ok();

    match outcome {
        Ok(call) => {
            println!("{}", "Call succeeded".green().bold());
            println!("{}", serde_json::to_string_pretty(&call.transformed)?);
            Ok(())
        }
        Err(e) => bail!("call failed: {e}"),
    }
}

/// Loads every integration a workflow references and, for any with an
/// expired OAuth token, refreshes and persists it before the workflow runs
/// (spec.md §4.7: "Before each step, if the integration's token is
/// expired, the executor calls refreshOAuthToken and persists").
async fn load_and_refresh_integrations(
    store: &dyn superglue_store::Datastore,
    org_id: &str,
    integration_ids: &[String],
) -> Result<HashMap<String, Integration>> {
    if integration_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let loaded = store
        .get_many_integrations(org_id, integration_ids)
        .await
        .context("failed to load workflow integrations")?;

    let client = reqwest::Client::new();
    let mut integrations = HashMap::new();

    for mut integration in loaded {
        if let Some(oauth_state) = integration.oauth.clone() {
            if oauth::is_token_expired(oauth_state.expires_at) {
                info!(integration_id = %integration.id, "refreshing expired OAuth token");
                match oauth::refresh_oauth_token(&client, &oauth_state, &integration.url_host).await {
                    Ok(refreshed) => {
                        integration.oauth = Some(refreshed);
                        integration = store
                            .upsert_integration(org_id, integration)
                            .await
                            .context("failed to persist refreshed OAuth token")?;
                    }
                    Err(e) => {
                        error!(integration_id = %integration.id, error = %e, "OAuth token refresh failed; continuing with stale token");
                    }
                }
            }
        }
        integrations.insert(integration.id.clone(), integration);
    }

    Ok(integrations)
}

async fn run_workflow(org_id: &str, workflow_path: &str, payload: Option<&str>, credentials: Option<&str>) -> Result<()> {
    let workflow: Workflow = read_definition(workflow_path)?;
    workflow.validate().map_err(|e| anyhow::anyhow!(e.to_string())).context("workflow failed validation")?;
    info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "running workflow");

    let payload_value: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("failed to parse --payload as JSON")?,
        None => Value::Object(Default::default()),
    };
    let credential_map: HashMap<String, String> = parse_json_arg(credentials, "--credentials")?;
    let mut credentials_scope: HashMap<String, Value> =
        credential_map.into_iter().map(|(k, v)| (k, Value::String(v))).collect();

    let store = superglue_store::datastore_from_env().await.context("failed to initialize datastore")?;

    let integrations = load_and_refresh_integrations(store.as_ref(), org_id, &workflow.integration_ids).await?;
    for integration in integrations.values() {
        for (key, value) in integration.credential_scope() {
            credentials_scope.entry(key).or_insert(value);
        }
    }

    let executor = Arc::new(step_executor());
    let mut engine = WorkflowEngine::new(executor, ExecutionOptions::default()).with_integrations(integrations);
    if let Some(healing) = healing_coordinator_from_env() {
        engine = engine.with_healing(healing, Arc::new(superglue_core::NoDocumentationSearch));
    }

    let run_id = Uuid::new_v4().to_string();
    let snapshot = serde_json::to_value(&StoredConfig::Workflow(Box::new(workflow.clone())))?;
    store
        .create_run(RunRecord::started(run_id.clone(), org_id, Some(workflow.id.clone()), snapshot.clone()))
        .await
        .context("failed to record run start")?;

    let outcome = engine.run(&workflow, payload_value, credentials_scope).await;

    let mut run = RunRecord::started(run_id, org_id, Some(workflow.id.clone()), snapshot);
    run.completed_at = Some(outcome.completed_at);
    run.success = outcome.success;
    run.data = outcome.data.clone();
    run.error = outcome.error.clone();
    run.step_results = Some(outcome.step_results.clone());
    store.finalize_run(run).await.ok();
    store.disconnect().await.ok();

    if outcome.success {
        println!("{}", "Workflow completed successfully".green().bold());
        println!("{}", serde_json::to_string_pretty(&outcome.data)?);
        Ok(())
    } else {
        bail!("workflow failed: {}", outcome.error.unwrap_or_else(|| "unknown error".to_string()))
    }
}

fn validate(file_path: &str, as_workflow: bool) -> Result<()> {
    if as_workflow {
        let workflow: Workflow = read_definition(file_path)?;
        workflow.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        println!("{}", "Workflow is valid".green().bold());
        println!("  id: {}", workflow.id);
        println!("  steps: {}", workflow.steps.len());
        println!("  kind: {}", ConfigKind::Workflow.as_str());
    } else {
        let config: ApiConfig = read_definition(file_path)?;
        if let Some(schema) = &config.response_schema {
            jsonschema::validator_for(schema).map_err(|e| anyhow::anyhow!("invalid responseSchema: {e}"))?;
        }
        println!("{}", "ApiConfig is valid".green().bold());
        println!("  id: {}", config.id);
        println!("  method: {:?}", config.method);
        println!("  host: {}", config.url_host);
    }
    Ok(())
}

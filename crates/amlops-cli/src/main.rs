mod args;
mod output;
mod workflows;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use amlops_common::telemetry::init_tracing;
use amlops_common::{
    BatchDeployment, BatchOutputAction, CodeConfiguration, OnlineDeployment,
    OnlineRequestSettings, WorkspaceConfig, WorkspaceError,
};
use amlops_control::{probe, resolve_credential, ArmControlPlane, TokenCredential};

use crate::args::{Args, Command};
use crate::output::{print_batch_endpoint, print_online_endpoint};
use crate::workflows::{DeployPlan, DeploymentFailed};

/// Explicit path first. Jobs derive the workspace from the run context and
/// persist it for later tools; everything else searches upward from the
/// working directory.
fn load_workspace(args: &Args) -> Result<WorkspaceConfig> {
    if let Some(path) = &args.workspace_config {
        return Ok(WorkspaceConfig::load(path)?);
    }
    let cwd = std::env::current_dir().context("cannot read working directory")?;
    if !args.local_mode {
        match WorkspaceConfig::from_run_env() {
            Ok(ws) => {
                let path = ws.write_config(&cwd)?;
                tracing::info!(path = %path.display(), "workspace config written from run context");
                return Ok(ws);
            }
            Err(WorkspaceError::NoRunContext(var)) => {
                tracing::debug!(missing = var, "no run context, searching for config.json");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(WorkspaceConfig::discover(&cwd)?)
}

async fn run(args: Args) -> Result<()> {
    let workspace = load_workspace(&args)?;
    tracing::info!(
        subscription = %workspace.subscription_id,
        resource_group = %workspace.resource_group,
        workspace = %workspace.workspace_name,
        "using workspace"
    );

    let http = reqwest::Client::new();
    let credential: Arc<dyn TokenCredential> =
        resolve_credential(args.local_mode, args.identity_client_id.clone(), http.clone());
    probe(credential.as_ref()).await;

    let cp = ArmControlPlane::new(workspace, credential, http).with_base_url(&args.arm_endpoint);

    match args.command {
        Command::CreateBatchEndpoint {
            endpoint_name,
            auth_mode,
        } => {
            let endpoint = workflows::ensure_batch_endpoint(&cp, &endpoint_name, auth_mode).await?;
            println!("✓ Batch endpoint '{}' ready", endpoint.name);
            print_batch_endpoint(&endpoint);
        }
        Command::CreateOnlineEndpoint {
            endpoint_name,
            auth_mode,
        } => {
            let template = amlops_common::OnlineEndpoint::new(endpoint_name, auth_mode);
            let endpoint = workflows::ensure_online_endpoint(&cp, template).await?;
            println!("✓ Online endpoint '{}' ready", endpoint.name);
            print_online_endpoint(&endpoint);
        }
        Command::CreateBatchDeployment(d) => {
            let deployment = BatchDeployment {
                name: d.deployment_name,
                endpoint_name: d.endpoint_name,
                model: d.model_path,
                compute: d.compute,
                instance_count: d.instance_count,
                max_concurrency_per_instance: d.max_concurrency_per_instance,
                mini_batch_size: d.mini_batch_size,
                output_action: BatchOutputAction::AppendRow,
                output_file_name: d.output_file_name,
            };
            let endpoint = workflows::create_batch_deployment(&cp, &deployment).await?;
            println!(
                "✓ Batch deployment '{}' is the default of '{}'",
                deployment.name, endpoint.name
            );
            print_batch_endpoint(&endpoint);
        }
        Command::CreateOnlineDeployment(d) => {
            let deployment = OnlineDeployment {
                name: d.deployment_name,
                endpoint_name: d.endpoint_name,
                model: d.model_path,
                code_configuration: None,
                environment: None,
                environment_variables: Default::default(),
                instance_type: d.instance_type,
                instance_count: d.instance_count,
                request_settings: None,
            };
            let endpoint = workflows::create_online_deployment(
                &cp,
                &deployment,
                d.auth_mode,
                d.traffic_allocation,
            )
            .await?;
            println!(
                "✓ Online deployment '{}' receives {}% of '{}'",
                deployment.name, d.traffic_allocation, endpoint.name
            );
            print_online_endpoint(&endpoint);
        }
        Command::Deploy(d) => {
            let cp = cp.with_registry(d.registry_name.clone());
            let plan = DeployPlan {
                model_name: d.name_for_registered_model.clone(),
                model_artifact_uri: d.model_artifact_uri.clone(),
                endpoint_name: d.endpoint_name.clone(),
                deployment_name: d.deployment_name.clone(),
                environment: d.deployment_env_name.clone(),
                code: d.code_id.clone().map(|code_id| CodeConfiguration {
                    code_id,
                    scoring_script: d.scoring_script.clone(),
                }),
                instance_type: d.instance_type.clone(),
                instance_count: d.instance_count,
                request_settings: OnlineRequestSettings {
                    max_concurrent_requests_per_instance: d.max_concurrent_requests_per_instance,
                    request_timeout_ms: d.request_timeout_ms,
                    max_queue_wait_ms: d.max_queue_wait_ms,
                },
                config: d.inference.to_config(),
            };
            let endpoint = workflows::deploy(&cp, &plan).await?;
            println!(
                "✓ Deployment '{}' serves 100% of '{}'",
                plan.deployment_name, endpoint.name
            );
            print_online_endpoint(&endpoint);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let otel = init_tracing(
        "amlops-cli",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let outcome = run(args).await;

    if let Some(provider) = otel {
        let _ = provider.shutdown();
    }
    if let Err(e) = outcome {
        if let Some(failed) = e.downcast_ref::<DeploymentFailed>() {
            eprintln!(
                "✗ Deployment '{}' failed{}",
                failed.deployment,
                if failed.logs.is_some() { ", logs above" } else { "" }
            );
        }
        eprintln!("✗ {e:#}");
        std::process::exit(1);
    }
}

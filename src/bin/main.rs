use std::sync::Arc;
use std::time::Duration;

use fleet_deploy_manager::agent_client::{AgentClient, AgentControlClient};
use fleet_deploy_manager::audit::AuditSink;
use fleet_deploy_manager::auth::AgentAuth;
use fleet_deploy_manager::cli::{init_cli, Command};
use fleet_deploy_manager::config::Settings;
use fleet_deploy_manager::crypto::{KeySource, TokenCrypt};
use fleet_deploy_manager::image::ImageResolver;
use fleet_deploy_manager::logging::Logging;
use fleet_deploy_manager::nginx_sidecar::NginxSidecar;
use fleet_deploy_manager::orchestrator::{HealthGateConfig, Orchestrator};
use fleet_deploy_manager::registry::{CompositeKey, Registry};
use fleet_deploy_manager::runtime::{ContainerRuntime, DockerRuntime};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logging::try_init()?;
    let cli = init_cli();
    let settings = Settings::load(cli.config.as_deref())?;

    if cli.print_debug_info {
        println!("{settings:#?}");
        return Ok(());
    }

    let key_source = match &settings.encryption_key_b64 {
        Some(key) => KeySource::Direct { key_b64: key.clone() },
        None => KeySource::Derived {
            secret: settings.secret.clone().unwrap_or_default(),
            salt: settings.salt.clone().unwrap_or_default(),
        },
    };
    let crypt = Arc::new(TokenCrypt::new(key_source)?);
    let registry = Arc::new(Registry::load(settings.registry_metadata_path(), settings.token_backups_dir())?);
    let auth = Arc::new(AgentAuth::new(settings.circuit_breaker_threshold, registry.clone(), crypt.clone()));

    match cli.command {
        Command::Run => {
            let tokio_runtime = tokio::runtime::Runtime::new()?;
            tokio_runtime.block_on(run(settings, registry, auth))
        }
        Command::ResetCircuit { agent_id, occurrence_id, server_id } => {
            let mut key = CompositeKey::new(agent_id).with_server(server_id);
            if let Some(occ) = occurrence_id {
                key = key.with_occurrence(occ);
            }
            let before = auth.get_backoff_status(&key);
            auth.reset_circuit_breaker(&key);
            tracing::info!(
                "reset circuit breaker for {}: was (failures={}, circuit_open={})",
                key.as_string(),
                before.failure_count,
                before.circuit_open
            );
            Ok(())
        }
        Command::Rollback { deployment_id, slot } => {
            let tokio_runtime = tokio::runtime::Runtime::new()?;
            tokio_runtime.block_on(rollback(settings, registry, auth, deployment_id, slot))
        }
    }
}

fn build_orchestrator(settings: &Settings, registry: Arc<Registry>, auth: Arc<AgentAuth>) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let agent_client: Arc<dyn AgentControlClient> = Arc::new(AgentClient::new(settings.shutdown_request_timeout)?);
    let audit = Arc::new(AuditSink::new(settings.audit_log_path()));
    let container_runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
    let image_resolver = Arc::new(ImageResolver::new(settings.registry_request_timeout)?);
    let nginx = Arc::new(NginxSidecar::new(
        container_runtime.clone(),
        settings.version_history_path("nginx"),
        settings.nginx_container_name.clone(),
    ));

    Ok(Orchestrator::new(
        registry,
        auth,
        agent_client,
        container_runtime,
        image_resolver,
        nginx,
        settings.nginx_compose_dir.clone(),
        audit,
        settings.deployment_state_path(),
        settings.rollback_proposals_dir(),
        settings.container_stop_timeout,
        HealthGateConfig {
            wait_for_work: settings.wait_for_work,
            stability_window: settings.stability_window,
            poll_interval: Duration::from_secs(5),
        },
    ))
}

async fn run(settings: Settings, registry: Arc<Registry>, auth: Arc<AgentAuth>) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = build_orchestrator(&settings, registry, auth)?;

    if let Some(state) = orchestrator.recover()? {
        tracing::info!("recovered prior deployment state: {:?}", state.status);
    }

    tracing::info!("fleet deploy manager ready; submit updates via the embedding application");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn rollback(
    settings: Settings,
    registry: Arc<Registry>,
    auth: Arc<AgentAuth>,
    deployment_id: String,
    slot: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = build_orchestrator(&settings, registry, auth)?;
    let status = orchestrator.execute_rollback(&deployment_id, slot).await?;
    tracing::info!("rollback of deployment {deployment_id} finished with status {:?}", status);
    println!("{status:?}");
    Ok(())
}

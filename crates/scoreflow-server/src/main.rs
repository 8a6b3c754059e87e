// Scoreflow orchestrator daemon.
//
// Wires the pieces together: environment config, Postgres store with
// migrations, admin policy, provider loading (off the submission path),
// the queue/executor/reconciler engine, and two-stage signal shutdown:
// the first signal stops submissions and drains in-flight work, a second
// escalates to cancellation.

mod config;

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scoreflow_adapters::{
    ArgoCdClient, GiteaClient, ObjectStoreClient, ObjectStoreConfig, TfeClient, TokioProcessRunner,
};
use scoreflow_core::{AdminPolicy, OrchestratorStore};
use scoreflow_providers::ProviderLoader;
use scoreflow_storage::Database;
use scoreflow_worker::{Orchestrator, StepRuntime, WorkspaceManager};

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("load configuration")?;
    info!(
        db_host = %config.db_host,
        policy = %config.admin_policy_path.display(),
        "starting scoreflow-server"
    );

    let policy_text = fs::read_to_string(&config.admin_policy_path).with_context(|| {
        format!("read admin policy {}", config.admin_policy_path.display())
    })?;
    let policy = AdminPolicy::parse(&policy_text)?;

    let db = Database::from_url(&config.database_url())
        .await
        .context("connect to database")?;
    db.migrate().await.context("run migrations")?;
    let store: Arc<dyn OrchestratorStore> = Arc::new(db);

    let runner = Arc::new(TokioProcessRunner::new());

    // Providers load at start; clone work never sits on the submission path.
    let loader = ProviderLoader::new(runner.clone());
    let report = loader.load_all(&policy.providers).await;
    for warning in &report.warnings {
        warn!(warning = %warning, "provider load");
    }
    info!(providers = report.providers.len(), "providers loaded");

    let mut runtime = StepRuntime::new(
        runner.clone(),
        WorkspaceManager::new(&config.workspace_root),
    );
    // Policy-carried admin credentials win over environment configuration.
    let admin = &policy.admin;
    let gitea = match &admin.gitea_url {
        Some(url) => Some(config::Credentials {
            url: url.clone(),
            username: admin.gitea_username.clone().unwrap_or_else(|| "admin".into()),
            password: admin.gitea_password.clone().unwrap_or_default(),
        }),
        None => config.gitea.clone(),
    };
    if let Some(gitea) = &gitea {
        runtime = runtime.with_gitea(GiteaClient::new(
            &gitea.url,
            &gitea.username,
            &gitea.password,
        )?);
    }
    let argocd = match &admin.argocd_url {
        Some(url) => Some(config::Credentials {
            url: url.clone(),
            username: admin
                .argocd_username
                .clone()
                .unwrap_or_else(|| "admin".into()),
            password: admin.argocd_password.clone().unwrap_or_default(),
        }),
        None => config.argocd.clone(),
    };
    if let Some(argocd) = &argocd {
        runtime = runtime.with_argocd(ArgoCdClient::new(
            &argocd.url,
            &argocd.username,
            &argocd.password,
        )?);
    }
    if let Some(tfe) = &config.tfe {
        runtime = runtime.with_tfe(TfeClient::new(&tfe.address, &tfe.organization, &tfe.token)?);
    }
    if let Some(object_store) = &config.object_store {
        runtime = runtime.with_object_store(ObjectStoreClient::new(
            runner.clone(),
            ObjectStoreConfig {
                alias: "scoreflow".into(),
                endpoint: object_store.endpoint.clone(),
                access_key: object_store.access_key.clone(),
                secret_key: object_store.secret_key.clone(),
            },
        ));
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        policy,
        report.providers,
        runtime,
        loader,
        config.queue_capacity,
    ));

    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        info!(recovered, "recovered tasks from previous run");
    }

    info!("scoreflow-server ready");

    wait_for_signal().await;
    info!("shutdown requested, draining in-flight work (signal again to cancel)");

    // Second signal escalates to cancellation of every in-flight task.
    let escalation = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            orchestrator.cancel_all();
        })
    };

    orchestrator.shutdown().await;
    escalation.abort();

    info!("scoreflow-server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// Environment configuration for the daemon.
//
// Store connection comes from the DB_* variables; adapter credentials from
// their respective prefixes. Optional adapters stay unconfigured when their
// variables are absent, and the corresponding step kinds fail with a clear
// message instead of at startup.

use std::env;
use std::path::PathBuf;

/// Connection settings for one external adapter
#[derive(Debug, Clone)]
pub struct Credentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct TfeSettings {
    pub address: String,
    pub organization: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_sslmode: String,

    pub admin_policy_path: PathBuf,
    pub workspace_root: PathBuf,
    pub queue_capacity: usize,

    pub gitea: Option<Credentials>,
    pub argocd: Option<Credentials>,
    pub tfe: Option<TfeSettings>,
    pub object_store: Option<ObjectStoreSettings>,
}

fn var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn credentials(url_var: &str, user_var: &str, password_var: &str) -> Option<Credentials> {
    let url = env::var(url_var).ok()?;
    Some(Credentials {
        url,
        username: var(user_var, "admin"),
        password: var(password_var, ""),
    })
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_port = var("DB_PORT", "5432")
            .parse()
            .map_err(|e| anyhow::anyhow!("DB_PORT: {e}"))?;
        let queue_capacity = var("QUEUE_CAPACITY", "100")
            .parse()
            .map_err(|e| anyhow::anyhow!("QUEUE_CAPACITY: {e}"))?;

        let tfe = env::var("TFE_TOKEN").ok().map(|token| TfeSettings {
            address: var("TFE_ADDRESS", "https://app.terraform.io"),
            organization: var("TFE_ORGANIZATION", ""),
            token,
        });
        let object_store = env::var("MINIO_ENDPOINT").ok().map(|endpoint| ObjectStoreSettings {
            endpoint,
            access_key: var("MINIO_ACCESS_KEY", ""),
            secret_key: var("MINIO_SECRET_KEY", ""),
        });

        Ok(Self {
            db_host: var("DB_HOST", "localhost"),
            db_port,
            db_user: var("DB_USER", "scoreflow"),
            db_password: var("DB_PASSWORD", ""),
            db_name: var("DB_NAME", "scoreflow"),
            db_sslmode: var("DB_SSLMODE", "disable"),
            admin_policy_path: PathBuf::from(var("ADMIN_POLICY", "admin-policy.yaml")),
            workspace_root: PathBuf::from(var("WORKSPACES_ROOT", "workspaces")),
            queue_capacity,
            gitea: credentials("GITEA_URL", "GITEA_USERNAME", "GITEA_PASSWORD"),
            argocd: credentials("ARGOCD_URL", "ARGOCD_USERNAME", "ARGOCD_PASSWORD"),
            tfe,
            object_store,
        })
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name, self.db_sslmode
        )
    }
}

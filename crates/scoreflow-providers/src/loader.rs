// Provider bundle loader.
//
// For each enabled ProviderSource, produce a Provider by reading a
// provider.yaml manifest plus its workflows directory. Local bundles read
// straight from disk; git bundles shallow-clone the pinned ref into a
// loader-scoped temporary directory, record the resolved commit SHA, and
// retain only the parsed contents in memory.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::{info, warn};

use scoreflow_adapters::{CancelToken, ProcessRequest, ProcessRunner};
use scoreflow_core::{
    Provider, ProviderManifest, ProviderSource, SourceKind, SourceTier, Workflow,
};

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);

/// One workflow document inside a bundle. The top-level `kind` and
/// `resourceType` decide provisioner-vs-golden-path classification; the
/// rest is a plain Workflow.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowFile {
    #[serde(default)]
    kind: Option<String>,

    #[serde(default)]
    resource_type: Option<String>,

    #[serde(flatten)]
    workflow: Workflow,
}

/// Outcome of loading every configured source: the providers that parsed,
/// plus non-fatal warnings surfaced through the status surface
#[derive(Debug, Default)]
pub struct LoadReport {
    pub providers: Vec<Provider>,
    pub warnings: Vec<String>,
}

/// Loads provider bundles from local directories and pinned Git refs
pub struct ProviderLoader {
    runner: Arc<dyn ProcessRunner>,
}

impl ProviderLoader {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Load every enabled source. A source that fails to load is reported
    /// and skipped; server start continues.
    pub async fn load_all(&self, sources: &[ProviderSource]) -> LoadReport {
        let mut report = LoadReport::default();
        for source in sources {
            if !source.enabled {
                continue;
            }
            match self.load_source(source).await {
                Ok((provider, mut warnings)) => {
                    info!(
                        provider = %provider.name,
                        version = %provider.version,
                        provisioners = provider.provisioners.len(),
                        golden_paths = provider.golden_paths.len(),
                        commit = provider.commit.as_deref().unwrap_or("-"),
                        "loaded provider bundle"
                    );
                    report.providers.push(provider);
                    report.warnings.append(&mut warnings);
                }
                Err(err) => {
                    warn!(provider = %source.name, error = %err, "skipping provider bundle");
                    report
                        .warnings
                        .push(format!("provider {} skipped: {err:#}", source.name));
                }
            }
        }
        report
    }

    async fn load_source(
        &self,
        source: &ProviderSource,
    ) -> anyhow::Result<(Provider, Vec<String>)> {
        match source.source {
            SourceKind::Local => load_bundle(Path::new(&source.location), source, None),
            SourceKind::Git => self.load_git(source).await,
        }
    }

    async fn load_git(&self, source: &ProviderSource) -> anyhow::Result<(Provider, Vec<String>)> {
        let git_ref = source
            .git_ref
            .as_deref()
            .context("git source requires a ref")?;

        let checkout = tempfile::TempDir::new().context("create clone directory")?;
        let target = checkout.path().to_string_lossy().into_owned();

        // Shallow clone at the pinned ref; fall back to a full clone +
        // checkout for refs that are not branch or tag names.
        let shallow = ProcessRequest::new(
            "git",
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                git_ref,
                &source.location,
                &target,
            ],
        )
        .timeout(CLONE_TIMEOUT);

        let cloned = self.runner.run(shallow, CancelToken::never()).await?;
        if !cloned.success() {
            let full = ProcessRequest::new("git", &["clone", &source.location, &target])
                .timeout(CLONE_TIMEOUT);
            let output = self.runner.run(full, CancelToken::never()).await?;
            if !output.success() {
                bail!(
                    "git clone of {} failed: {}",
                    source.location,
                    output.stderr.trim()
                );
            }
            let checkout_ref =
                ProcessRequest::new("git", &["-C", &target, "checkout", git_ref])
                    .timeout(CLONE_TIMEOUT);
            let output = self.runner.run(checkout_ref, CancelToken::never()).await?;
            if !output.success() {
                bail!("git checkout {git_ref} failed: {}", output.stderr.trim());
            }
        }

        // Pin the resolved commit SHA for reproducibility when the ref is a
        // moving branch.
        let rev_parse = ProcessRequest::new("git", &["-C", &target, "rev-parse", "HEAD"])
            .timeout(CLONE_TIMEOUT);
        let commit = match self.runner.run(rev_parse, CancelToken::never()).await {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            _ => None,
        };

        // The working tree is discarded with the TempDir; parsed manifest
        // and workflows are retained in memory.
        load_bundle(checkout.path(), source, commit)
    }
}

/// Read provider.yaml plus the sibling workflows directory
fn load_bundle(
    root: &Path,
    source: &ProviderSource,
    commit: Option<String>,
) -> anyhow::Result<(Provider, Vec<String>)> {
    let manifest_path = root.join("provider.yaml");
    let manifest_text = fs::read_to_string(&manifest_path)
        .with_context(|| format!("read {}", manifest_path.display()))?;
    let manifest: ProviderManifest = serde_yaml::from_str(&manifest_text)
        .with_context(|| format!("parse {}", manifest_path.display()))?;

    let mut provider = Provider {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        owner: manifest.owner.clone(),
        description: manifest.description.clone(),
        category: source.category,
        tags: manifest.tags.clone(),
        commit,
        provisioners: Default::default(),
        golden_paths: Default::default(),
    };

    let mut warnings = Vec::new();
    let workflows_dir = root.join(&manifest.workflows_dir);
    let mut entries: Vec<_> = fs::read_dir(&workflows_dir)
        .with_context(|| format!("read {}", workflows_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    for path in entries {
        match load_workflow_file(&path, &manifest, &provider) {
            Ok(Classified::Provisioner(resource_type, workflow)) => {
                if let Some(previous) =
                    provider.provisioners.insert(resource_type.clone(), workflow)
                {
                    warnings.push(format!(
                        "provider {}: provisioner for {resource_type} redefined (was {})",
                        provider.name, previous.name
                    ));
                }
            }
            Ok(Classified::GoldenPath(workflow)) => {
                provider
                    .golden_paths
                    .insert(workflow.name.clone(), workflow);
            }
            Err(err) => {
                warnings.push(format!(
                    "provider {}: workflow {} skipped: {err:#}",
                    provider.name,
                    path.display()
                ));
            }
        }
    }

    Ok((provider, warnings))
}

enum Classified {
    Provisioner(String, Workflow),
    GoldenPath(Workflow),
}

fn load_workflow_file(
    path: &Path,
    manifest: &ProviderManifest,
    provider: &Provider,
) -> anyhow::Result<Classified> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: WorkflowFile =
        serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;

    let mut workflow = file.workflow;
    if workflow.name.is_empty() {
        workflow.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
    }
    if workflow.owner.is_empty() {
        workflow.owner = manifest.owner.clone();
    }
    workflow.source_tier = if provider.is_platform() {
        SourceTier::Platform
    } else {
        SourceTier::Product
    };

    // Platform- and product-tier workflows must carry a real description.
    if workflow.description.trim().is_empty() {
        bail!("missing description");
    }
    if workflow.steps.is_empty() {
        bail!("declares no steps");
    }

    // Classification: an explicit Provisioner kind, or a sole resource-type
    // tag matching a supported_resources entry, registers a provisioner.
    let is_provisioner_kind = file.kind.as_deref() == Some("Provisioner");
    match (&file.resource_type, is_provisioner_kind) {
        (Some(resource_type), _) if is_provisioner_kind
            || manifest.supported_resources.contains(resource_type) =>
        {
            Ok(Classified::Provisioner(resource_type.clone(), workflow))
        }
        (None, true) => bail!("kind Provisioner requires resourceType"),
        _ => Ok(Classified::GoldenPath(workflow)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreflow_adapters::{CannedResponse, FakeProcessRunner};
    use scoreflow_core::{ProviderCategory, StepKind};

    const MANIFEST: &str = r#"
name: database-team
description: Managed PostgreSQL for product teams
version: 1.4.0
owner: database-team@internal
workflowsDir: workflows
supportedResources:
  - postgres
tags:
  - ecommerce
"#;

    const PROVISIONER: &str = r#"
kind: Provisioner
resourceType: postgres
description: Provision a PostgreSQL cluster
phase: pre-deployment
steps:
  - name: provision
    kind: terraform
    config:
      path: terraform/postgres
"#;

    const GOLDEN_PATH: &str = r#"
description: Run a schema migration against the product database
phase: deployment
steps:
  - name: migrate
    kind: database-migration
    config:
      command: ./migrate.sh
"#;

    fn source(location: &str, kind: SourceKind) -> ProviderSource {
        ProviderSource {
            name: "database-team".into(),
            category: ProviderCategory::Data,
            source: kind,
            location: location.into(),
            git_ref: match kind {
                SourceKind::Git => Some("v1.4.0".into()),
                SourceKind::Local => None,
            },
            enabled: true,
        }
    }

    fn write_bundle(root: &Path) {
        fs::create_dir_all(root.join("workflows")).unwrap();
        fs::write(root.join("provider.yaml"), MANIFEST).unwrap();
        fs::write(root.join("workflows/provision-postgres.yaml"), PROVISIONER).unwrap();
        fs::write(root.join("workflows/run-migration.yaml"), GOLDEN_PATH).unwrap();
    }

    #[tokio::test]
    async fn loads_local_bundle_and_classifies_workflows() {
        let dir = tempfile::TempDir::new().unwrap();
        write_bundle(dir.path());

        let loader = ProviderLoader::new(Arc::new(FakeProcessRunner::new()));
        let report = loader
            .load_all(&[source(dir.path().to_str().unwrap(), SourceKind::Local)])
            .await;

        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.providers.len(), 1);
        let provider = &report.providers[0];
        assert_eq!(provider.version, "1.4.0");
        assert!(provider.serves_product("ecommerce"));

        let provisioner = provider.provisioner_for("postgres").unwrap();
        assert_eq!(provisioner.name, "provision-postgres");
        assert_eq!(provisioner.steps[0].kind, StepKind::Terraform);
        assert_eq!(provisioner.source_tier, SourceTier::Product);

        let golden = provider.golden_path("run-migration").unwrap();
        assert_eq!(golden.owner, "database-team@internal");
    }

    #[tokio::test]
    async fn blank_description_is_rejected_with_a_warning() {
        let dir = tempfile::TempDir::new().unwrap();
        write_bundle(dir.path());
        fs::write(
            dir.path().join("workflows/bad.yaml"),
            "description: \"   \"\nsteps:\n  - name: x\n    kind: shell\n",
        )
        .unwrap();

        let loader = ProviderLoader::new(Arc::new(FakeProcessRunner::new()));
        let report = loader
            .load_all(&[source(dir.path().to_str().unwrap(), SourceKind::Local)])
            .await;

        assert_eq!(report.providers[0].golden_paths.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("missing description"));
    }

    #[tokio::test]
    async fn broken_manifest_skips_provider_and_continues() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("provider.yaml"), "name: [broken").unwrap();

        let good = tempfile::TempDir::new().unwrap();
        write_bundle(good.path());

        let loader = ProviderLoader::new(Arc::new(FakeProcessRunner::new()));
        let report = loader
            .load_all(&[
                source(dir.path().to_str().unwrap(), SourceKind::Local),
                source(good.path().to_str().unwrap(), SourceKind::Local),
            ])
            .await;

        assert_eq!(report.providers.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("skipped"));
    }

    #[tokio::test]
    async fn failed_clone_skips_provider_after_both_clone_strategies() {
        let runner = FakeProcessRunner::new();
        runner
            .respond(
                CannedResponse::new("git")
                    .first_arg("clone")
                    .exit_code(128)
                    .stderr("fatal: could not read from remote repository"),
            )
            .await;
        runner
            .respond(
                CannedResponse::new("git")
                    .first_arg("clone")
                    .exit_code(128)
                    .stderr("fatal: could not read from remote repository"),
            )
            .await;

        let loader = ProviderLoader::new(Arc::new(runner.clone()));
        let report = loader
            .load_all(&[source("https://git.internal/x.git", SourceKind::Git)])
            .await;

        assert!(report.providers.is_empty());
        assert_eq!(report.warnings.len(), 1);

        let lines = runner.command_lines("git").await;
        assert!(lines[0].contains("clone --depth 1 --branch v1.4.0"));
        assert!(lines[1].starts_with("git clone https://git.internal/x.git"));
    }
}

//! patchdiff preview: resolve the original and target manifests of an upgrade
//! and compute the patch each live resource would receive, without applying
//! anything.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use patchdiff_chart::{check_kube_version, process_dependencies, Bundle, RenderContext, Renderer};
use patchdiff_core::{Capabilities, Cluster, PatchRecord, Patchset, Result};
use patchdiff_manifest::{decode, manifest_text, match_resources, sort_manifests, MatchedResource};
use patchdiff_patch::compute_patch;
use patchdiff_release::{resolve_baseline, validate_release_name, ReleaseStore};
use patchdiff_schema::{MetadataSource, SchemaRegistry};
use serde_json::Value as Json;
use tracing::{debug, info};

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSource {
    Builtin,
    OpenApi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewConfig {
    /// Max per-resource fetch/compute chains in flight.
    pub concurrency: usize,
    pub schema_source: SchemaSource,
    /// Used when the baseline release records no namespace.
    pub default_namespace: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self { concurrency: DEFAULT_CONCURRENCY, schema_source: SchemaSource::Builtin, default_namespace: "default".into() }
    }
}

impl PreviewConfig {
    /// Read `PATCHDIFF_CONCURRENCY` and `PATCHDIFF_SCHEMA_SOURCE`.
    pub fn from_env(default_namespace: &str) -> Self {
        let concurrency = std::env::var("PATCHDIFF_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY);
        let schema_source = match std::env::var("PATCHDIFF_SCHEMA_SOURCE").as_deref() {
            Ok("openapi") => SchemaSource::OpenApi,
            _ => SchemaSource::Builtin,
        };
        Self { concurrency, schema_source, default_namespace: default_namespace.to_string() }
    }
}

/// What to upgrade: release name, loaded bundle and merged user values.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub release: String,
    pub bundle: Bundle,
    pub values: Json,
}

/// The two manifests of one upgrade, immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSources {
    pub original: String,
    pub target: String,
    pub namespace: String,
    pub revision: i64,
}

/// Collaborators and settings for one preview computation.
pub struct PreviewContext {
    pub cluster: Arc<dyn Cluster>,
    pub releases: Arc<dyn ReleaseStore>,
    pub renderer: Arc<dyn Renderer>,
    pub config: PreviewConfig,
}

impl PreviewContext {
    pub fn new(cluster: Arc<dyn Cluster>, releases: Arc<dyn ReleaseStore>, renderer: Arc<dyn Renderer>, config: PreviewConfig) -> Self {
        Self { cluster, releases, renderer, config }
    }

    /// The full preview: pre-flight, resolution and patch computation.
    pub async fn run(&self, req: &UpgradeRequest) -> Result<Patchset> {
        let started = std::time::Instant::now();
        validate_release_name(&req.release)?;
        self.cluster.check_reachable().await?;
        let caps = self.cluster.capabilities().await?;
        let sources = self.resolve(req, &caps).await?;
        let set = self.create_patchset(&sources, &caps).await?;
        histogram!("preview_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(release = %req.release, patches = set.len(), "preview complete");
        Ok(set)
    }

    /// Original manifest of the baseline release and the freshly rendered target.
    pub async fn resolve(&self, req: &UpgradeRequest, caps: &Capabilities) -> Result<ManifestSources> {
        let baseline = resolve_baseline(self.releases.as_ref(), &req.release).await?;
        let chart = process_dependencies(&req.bundle, &req.values)?;

        let namespace = if baseline.current.namespace.is_empty() {
            self.config.default_namespace.clone()
        } else {
            baseline.current.namespace.clone()
        };
        let revision = baseline.next_revision();
        check_kube_version(&req.bundle.metadata.kube_version, &caps.kube_version)?;

        let ctx = RenderContext {
            release_name: req.release.clone(),
            namespace: namespace.clone(),
            revision,
            is_upgrade: true,
            kube_version: caps.kube_version.clone(),
        };
        let files = self.renderer.render(&chart, &ctx)?;
        let manifests = sort_manifests(&files)?;
        debug!(release = %req.release, revision, documents = manifests.len(), "target rendered");
        Ok(ManifestSources { original: baseline.current.manifest, target: manifest_text(&manifests), namespace, revision })
    }

    async fn registry(&self) -> Result<SchemaRegistry> {
        Ok(match self.config.schema_source {
            SchemaSource::Builtin => SchemaRegistry::builtin(),
            SchemaSource::OpenApi => SchemaRegistry::new(MetadataSource::OpenApiV2(Arc::new(self.cluster.openapi_v2().await?))),
        })
    }

    /// Patch every target resource that exists live, in target order.
    pub async fn create_patchset(&self, sources: &ManifestSources, caps: &Capabilities) -> Result<Patchset> {
        let original = decode(&sources.original, &sources.namespace, Some(caps))?;
        let target = decode(&sources.target, &sources.namespace, Some(caps))?;
        let matched = match_resources(&original, &target);
        let registry = self.registry().await?;
        counter!("preview_resources_total", matched.len() as u64);

        let records: Vec<Option<PatchRecord>> = futures::stream::iter(matched.iter().map(|m| self.visit(m, &registry)))
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;
        let set = Patchset::new(records.into_iter().flatten().collect());
        counter!("preview_patches_total", set.len() as u64);
        Ok(set)
    }

    async fn visit(&self, m: &MatchedResource<'_>, registry: &SchemaRegistry) -> Result<Option<PatchRecord>> {
        let id = &m.target.identity;
        let Some(live) = self.cluster.fetch_live(id).await? else {
            counter!("preview_resources_skipped_total", 1u64);
            debug!(resource = %id, "absent live; no patch");
            return Ok(None);
        };
        let class = registry.classify(id)?;
        let record = compute_patch(id, m.original, &m.target.body, &live, &class)?;
        debug!(resource = %id, content_type = record.kind.content_type(), new = m.original.is_none(), "patch computed");
        Ok(Some(record))
    }
}

//! patchdiff core types: resource identities, patch records and the error taxonomy.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Identity of a single addressable resource. Two resources are the same
/// resource iff all five fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Key in the same shape discovery uses, e.g. `v1/ConfigMap` or `apps/v1/Deployment`.
    pub fn gvk_key(&self) -> String {
        gvk_key(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// Split an `apiVersion` string into `(group, version)`.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    StrategicMerge,
    GenericMerge,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::StrategicMerge => "application/strategic-merge-patch+json",
            PatchKind::GenericMerge => "application/merge-patch+json",
        }
    }
}

/// Patch computed for one target resource that exists live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub identity: ResourceIdentity,
    pub patch: Json,
    pub kind: PatchKind,
}

impl PatchRecord {
    pub fn body(&self) -> Result<String> {
        serde_json::to_string(&self.patch).map_err(|e| PreviewError::SerializationFailed {
            what: "patch".into(),
            resource: self.identity.to_string(),
            message: e.to_string(),
        })
    }
}

/// Ordered patch records in target traversal order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patchset {
    pub records: Vec<PatchRecord>,
}

impl Patchset {
    pub fn new(records: Vec<PatchRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize as `[<patch>,<patch>,...]`. Zero records yield `[]`.
    pub fn assemble(&self) -> Result<String> {
        let mut out = String::from("[");
        for (i, rec) in self.records.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&rec.body()?);
        }
        out.push(']');
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeVersion {
    /// Git version as reported by the server, e.g. `v1.29.3`.
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version)
    }
}

/// Runtime capability metadata negotiated with the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `group/version` and `group/version/Kind` entries (core group without prefix).
    pub api_versions: BTreeSet<String>,
    pub kube_version: KubeVersion,
    /// Scope by gvk key: `true` when namespaced.
    pub scopes: BTreeMap<String, bool>,
}

impl Capabilities {
    pub fn has(&self, api_version: &str) -> bool {
        self.api_versions.contains(api_version)
    }

    pub fn is_namespaced(&self, group: &str, version: &str, kind: &str) -> Option<bool> {
        self.scopes.get(&gvk_key(group, version, kind)).copied()
    }

    /// Register a served kind with its scope.
    pub fn insert_kind(&mut self, group: &str, version: &str, kind: &str, namespaced: bool) {
        let gv = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
        self.api_versions.insert(format!("{}/{}", gv, kind));
        self.api_versions.insert(gv);
        self.scopes.insert(gvk_key(group, version, kind), namespaced);
    }
}

/// Errors surfaced by any stage. Every variant is fatal to the invocation.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("invalid release name: {0}")]
    InvalidReleaseName(String),
    #[error("{name:?} has no deployed releases")]
    NoReleaseFound { name: String },
    #[error("release history lookup for {name:?} failed: {message}")]
    ReleaseLookupFailed { name: String, message: String },
    #[error("chart requires kubeVersion: {required} which is incompatible with Kubernetes {actual}")]
    IncompatiblePlatform { required: String, actual: String },
    #[error("loading chart {path}: {message}")]
    ChartLoadFailed { path: String, message: String },
    #[error("invalid values: {0}")]
    InvalidValues(String),
    #[error("dependency resolution failed: {0}")]
    DependencyResolutionFailed(String),
    #[error("rendering {file}: {message}")]
    RenderFailed { file: String, message: String },
    #[error("malformed resource ({origin}): {message}")]
    MalformedResource { origin: String, message: String },
    #[error("serializing {what} for {resource}: {message}")]
    SerializationFailed { what: String, resource: String, message: String },
    #[error("patch metadata unavailable for {resource}: {message}")]
    SchemaMetadataUnavailable { resource: String, message: String },
    #[error("{resource}: element of list {field:?} has no merge key {key:?}")]
    MergeKeyMissing { resource: String, field: String, key: String },
    #[error("unable to get live object {resource}: {message}")]
    RetrievalFailed { resource: String, message: String },
    #[error("kubernetes cluster unreachable: {0}")]
    ClusterUnreachable(String),
}

pub type Result<T> = std::result::Result<T, PreviewError>;

/// Runtime the preview inspects. Implementations must be read-only.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    async fn check_reachable(&self) -> Result<()>;

    /// Negotiated capabilities; computed at most once per instance.
    async fn capabilities(&self) -> Result<Arc<Capabilities>>;

    /// Live object for `id`, or `None` when the runtime reports not-found.
    async fn fetch_live(&self, id: &ResourceIdentity) -> Result<Option<Json>>;

    /// The runtime's OpenAPI v2 document, for schema metadata derivation.
    async fn openapi_v2(&self) -> Result<Json>;
}

pub mod prelude {
    pub use super::{
        Capabilities, Cluster, KubeVersion, PatchKind, PatchRecord, Patchset, PreviewError,
        ResourceIdentity, Result,
    };
}

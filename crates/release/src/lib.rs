//! patchdiff release history: records, storage drivers and baseline selection.

#![forbid(unsafe_code)]

mod kube_driver;
mod sql;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use metrics::histogram;
use once_cell::sync::Lazy;
use patchdiff_core::{PreviewError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub use kube_driver::{KubeDriver, StorageKind};
pub use sql::SqliteDriver;

pub const MAX_RELEASE_NAME_LEN: usize = 53;

static RELEASE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }
}

impl From<String> for ReleaseStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "uninstalled" => ReleaseStatus::Uninstalled,
            "superseded" => ReleaseStatus::Superseded,
            "failed" => ReleaseStatus::Failed,
            "uninstalling" => ReleaseStatus::Uninstalling,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }
}

impl From<ReleaseStatus> for String {
    fn from(s: ReleaseStatus) -> Self {
        s.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "appVersion", skip_serializing_if = "String::is_empty")]
    pub app_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseChart {
    #[serde(default)]
    pub metadata: ChartMetadata,
}

/// One stored revision of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub version: i64,
    #[serde(default)]
    pub info: ReleaseInfo,
    #[serde(default)]
    pub chart: ReleaseChart,
    #[serde(default)]
    pub config: Json,
    #[serde(default)]
    pub manifest: String,
}

impl Release {
    pub fn status(&self) -> ReleaseStatus {
        self.info.status
    }
}

/// Release-history lookup. Drivers only need to list a release's revisions.
#[async_trait::async_trait]
pub trait ReleaseStore: Send + Sync {
    /// All stored revisions of `name`, in any order.
    async fn history(&self, name: &str) -> Result<Vec<Release>>;

    /// Highest-version revision.
    async fn last(&self, name: &str) -> Result<Option<Release>> {
        let all = self.history(name).await?;
        Ok(all.into_iter().max_by_key(|r| r.version))
    }

    /// Highest-version revision with status `deployed`.
    async fn deployed(&self, name: &str) -> Result<Option<Release>> {
        let all = self.history(name).await?;
        Ok(all.into_iter().filter(|r| r.status() == ReleaseStatus::Deployed).max_by_key(|r| r.version))
    }
}

/// Syntactic check run before any lookup.
pub fn validate_release_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PreviewError::InvalidReleaseName("release name is empty".into()));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(PreviewError::InvalidReleaseName(format!(
            "{:?} is longer than {} characters",
            name, MAX_RELEASE_NAME_LEN
        )));
    }
    if !RELEASE_NAME.is_match(name) {
        return Err(PreviewError::InvalidReleaseName(format!(
            "{:?} must consist of lower case alphanumeric characters, '-' or '.'",
            name
        )));
    }
    Ok(())
}

/// The release an upgrade is computed against.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    /// Supplies the original manifest and the namespace.
    pub current: Release,
    /// Version of the newest revision; the upgrade renders as `last_version + 1`.
    pub last_version: i64,
}

impl Baseline {
    pub fn next_revision(&self) -> i64 {
        self.last_version + 1
    }
}

/// Pick the baseline revision for an upgrade of `name`.
///
/// The newest revision is used when deployed. Otherwise the newest deployed
/// revision is used; if none exists and the newest revision failed or was
/// superseded, the newest revision stands in as the baseline.
pub async fn resolve_baseline(store: &dyn ReleaseStore, name: &str) -> Result<Baseline> {
    let started = std::time::Instant::now();
    let last = store
        .last(name)
        .await?
        .ok_or_else(|| PreviewError::NoReleaseFound { name: name.to_string() })?;

    let current = if last.status() == ReleaseStatus::Deployed {
        last.clone()
    } else {
        match store.deployed(name).await? {
            Some(r) => r,
            None if matches!(last.status(), ReleaseStatus::Failed | ReleaseStatus::Superseded) => {
                debug!(release = %name, status = last.status().as_str(), "no deployed revision; using last revision");
                last.clone()
            }
            None => return Err(PreviewError::NoReleaseFound { name: name.to_string() }),
        }
    };
    histogram!("release_lookup_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(release = %name, version = current.version, namespace = %current.namespace, "baseline resolved");
    Ok(Baseline { last_version: last.version, current })
}

const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Decode a stored payload: base64 text of a JSON record, optionally gzip-compressed.
pub fn decode_payload(text: &[u8]) -> std::result::Result<Release, String> {
    let trimmed: Vec<u8> = text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&trimmed)
        .map_err(|e| format!("base64: {}", e))?;
    let body = if raw.len() > 3 && raw[..3] == GZIP_MAGIC {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| format!("gzip: {}", e))?;
        out
    } else {
        raw
    };
    serde_json::from_slice(&body).map_err(|e| format!("release record: {}", e))
}

/// Encode a record the way drivers store it (gzip, then base64).
pub fn encode_payload(rel: &Release) -> std::result::Result<String, String> {
    let json = serde_json::to_vec(rel).map_err(|e| e.to_string())?;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&json).map_err(|e| e.to_string())?;
    let gz = enc.finish().map_err(|e| e.to_string())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(gz))
}

/// In-process driver (`HELM_DRIVER=memory` and tests).
#[derive(Debug, Default)]
pub struct MemoryStore {
    releases: Mutex<Vec<Release>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rel: Release) {
        let mut g = self.releases.lock().unwrap_or_else(|e| e.into_inner());
        g.retain(|r| !(r.name == rel.name && r.version == rel.version));
        g.push(rel);
    }
}

#[async_trait::async_trait]
impl ReleaseStore for MemoryStore {
    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let g = self.releases.lock().unwrap_or_else(|e| e.into_inner());
        Ok(g.iter().filter(|r| r.name == name).cloned().collect())
    }
}

/// Backend selected through `HELM_DRIVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverKind {
    Kube(StorageKind),
    Memory,
    Sql(String),
}

impl DriverKind {
    pub fn parse(driver: &str, sql_conn: Option<String>) -> Result<Self> {
        match driver {
            "" | "secret" | "secrets" => Ok(DriverKind::Kube(StorageKind::Secrets)),
            "configmap" | "configmaps" => Ok(DriverKind::Kube(StorageKind::ConfigMaps)),
            "memory" => Ok(DriverKind::Memory),
            "sql" => sql_conn
                .filter(|s| !s.is_empty())
                .map(DriverKind::Sql)
                .ok_or_else(|| lookup_err("", "HELM_DRIVER=sql requires HELM_DRIVER_SQL_CONNECTION_STRING")),
            other => Err(lookup_err("", format!("unknown driver {:?}", other))),
        }
    }

    pub fn from_env() -> Result<Self> {
        let driver = std::env::var("HELM_DRIVER").unwrap_or_default();
        Self::parse(driver.trim(), std::env::var("HELM_DRIVER_SQL_CONNECTION_STRING").ok())
    }
}

/// Open the configured driver against `namespace`.
pub fn open_store(kind: &DriverKind, client: &kube::Client, namespace: &str) -> Result<Arc<dyn ReleaseStore>> {
    Ok(match kind {
        DriverKind::Kube(storage) => Arc::new(KubeDriver::new(client.clone(), namespace, *storage)),
        DriverKind::Memory => Arc::new(MemoryStore::new()),
        DriverKind::Sql(path) => Arc::new(SqliteDriver::open(path)?),
    })
}

pub(crate) fn lookup_err(name: &str, message: impl Into<String>) -> PreviewError {
    PreviewError::ReleaseLookupFailed { name: name.to_string(), message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rel(version: i64, status: ReleaseStatus) -> Release {
        Release {
            name: "foo".into(),
            namespace: "prod".into(),
            version,
            info: ReleaseInfo { status, description: String::new() },
            chart: ReleaseChart::default(),
            config: Json::Null,
            manifest: format!("# revision {}\n", version),
        }
    }

    fn store(rels: Vec<Release>) -> MemoryStore {
        let s = MemoryStore::new();
        for r in rels {
            s.insert(r);
        }
        s
    }

    #[test]
    fn release_names() {
        assert!(validate_release_name("foo").is_ok());
        assert!(validate_release_name("my-app.v2").is_ok());
        for bad in ["", "Foo", "-foo", "foo-", "foo_bar", "a..b"] {
            assert!(matches!(validate_release_name(bad), Err(PreviewError::InvalidReleaseName(_))), "{bad}");
        }
        assert!(validate_release_name(&"a".repeat(53)).is_ok());
        assert!(validate_release_name(&"a".repeat(54)).is_err());
    }

    #[test]
    fn status_strings() {
        let r: Release = serde_json::from_str(
            r#"{"name":"foo","version":2,"info":{"status":"pending-upgrade"},"manifest":""}"#,
        )
        .unwrap();
        assert_eq!(r.status(), ReleaseStatus::PendingUpgrade);
        let odd: ReleaseStatus = serde_json::from_str(r#""exotic""#).unwrap();
        assert_eq!(odd, ReleaseStatus::Unknown);
        assert_eq!(serde_json::to_string(&ReleaseStatus::PendingRollback).unwrap(), r#""pending-rollback""#);
    }

    #[test]
    fn payload_round_trips_and_accepts_plain_json() {
        let r = rel(3, ReleaseStatus::Deployed);
        let text = encode_payload(&r).unwrap();
        assert_eq!(decode_payload(text.as_bytes()).unwrap(), r);

        let plain = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&r).unwrap());
        assert_eq!(decode_payload(plain.as_bytes()).unwrap(), r);
        assert!(decode_payload(b"not base64!").is_err());
    }

    #[tokio::test]
    async fn missing_release_is_no_release_found() {
        let s = store(vec![]);
        let err = resolve_baseline(&s, "foo").await.unwrap_err();
        assert!(matches!(err, PreviewError::NoReleaseFound { .. }));
        assert_eq!(err.to_string(), "\"foo\" has no deployed releases");
    }

    #[tokio::test]
    async fn deployed_last_is_the_baseline() {
        let s = store(vec![rel(1, ReleaseStatus::Superseded), rel(2, ReleaseStatus::Deployed)]);
        let b = resolve_baseline(&s, "foo").await.unwrap();
        assert_eq!(b.current.version, 2);
        assert_eq!(b.next_revision(), 3);
    }

    #[tokio::test]
    async fn pending_last_falls_back_to_deployed() {
        let s = store(vec![rel(1, ReleaseStatus::Deployed), rel(2, ReleaseStatus::PendingUpgrade)]);
        let b = resolve_baseline(&s, "foo").await.unwrap();
        assert_eq!(b.current.version, 1);
        assert_eq!(b.next_revision(), 3);
    }

    #[tokio::test]
    async fn failed_or_superseded_last_substitutes_when_nothing_deployed() {
        for st in [ReleaseStatus::Failed, ReleaseStatus::Superseded] {
            let s = store(vec![rel(1, ReleaseStatus::Failed), rel(2, st)]);
            let b = resolve_baseline(&s, "foo").await.unwrap();
            assert_eq!(b.current.version, 2);
        }
    }

    #[tokio::test]
    async fn pending_last_without_deployed_fails() {
        let s = store(vec![rel(1, ReleaseStatus::PendingInstall)]);
        assert!(matches!(resolve_baseline(&s, "foo").await, Err(PreviewError::NoReleaseFound { .. })));
    }

    #[test]
    fn driver_selection() {
        assert_eq!(DriverKind::parse("", None).unwrap(), DriverKind::Kube(StorageKind::Secrets));
        assert_eq!(DriverKind::parse("configmap", None).unwrap(), DriverKind::Kube(StorageKind::ConfigMaps));
        assert_eq!(DriverKind::parse("memory", None).unwrap(), DriverKind::Memory);
        assert_eq!(DriverKind::parse("sql", Some("/tmp/h.db".into())).unwrap(), DriverKind::Sql("/tmp/h.db".into()));
        assert!(DriverKind::parse("sql", None).is_err());
        assert!(DriverKind::parse("etcd", None).is_err());
    }
}

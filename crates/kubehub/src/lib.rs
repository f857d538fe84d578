//! patchdiff kubehub: read-only cluster access. Reachability, discovery into
//! Capabilities (once per instance), scope-aware live fetch and OpenAPI v2.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use patchdiff_core::{split_api_version, Capabilities, Cluster, KubeVersion, PreviewError, ResourceIdentity, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Served kind with its REST mapping.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
    pub resource: ApiResource,
    pub namespaced: bool,
}

#[derive(Debug, Default)]
struct Discovered {
    caps: Arc<Capabilities>,
    resources: FxHashMap<String, DiscoveredResource>,
}

/// Fold discovery responses into capabilities and a gvk-key → resource map.
/// Subresources (`pods/log`) are skipped.
fn index_resources(lists: &[APIResourceList], kube_version: KubeVersion) -> Discovered {
    let mut caps = Capabilities { kube_version, ..Default::default() };
    let mut resources = FxHashMap::default();
    for list in lists {
        let (group, version) = split_api_version(&list.group_version);
        caps.api_versions.insert(list.group_version.clone());
        for r in &list.resources {
            if r.name.contains('/') {
                continue;
            }
            let gvk = GroupVersionKind::gvk(&group, &version, &r.kind);
            caps.insert_kind(&group, &version, &r.kind, r.namespaced);
            resources.insert(
                patchdiff_core::gvk_key(&group, &version, &r.kind),
                DiscoveredResource {
                    resource: ApiResource::from_gvk_with_plural(&gvk, &r.name),
                    namespaced: r.namespaced,
                },
            );
        }
    }
    Discovered { caps: Arc::new(caps), resources }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
}

/// Cluster collaborator over a kube client. Never writes.
pub struct KubeCluster {
    client: Client,
    version: OnceCell<KubeVersion>,
    discovered: OnceCell<Discovered>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, version: OnceCell::new(), discovered: OnceCell::new() }
    }

    /// Client from the ambient kubeconfig or in-cluster config.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| PreviewError::ClusterUnreachable(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `/version`, asked once per instance.
    async fn server_version(&self) -> Result<KubeVersion> {
        let v = self
            .version
            .get_or_try_init(|| async {
                let info = self
                    .client
                    .apiserver_version()
                    .await
                    .map_err(|e| PreviewError::ClusterUnreachable(e.to_string()))?;
                Ok::<_, PreviewError>(KubeVersion { version: info.git_version, major: info.major, minor: info.minor })
            })
            .await?;
        Ok(v.clone())
    }

    async fn discover(&self) -> Result<Discovered> {
        let started = std::time::Instant::now();
        let kube_version = self.server_version().await?;
        let disc_err = |e: kube::Error| PreviewError::ClusterUnreachable(format!("could not get apiVersions from Kubernetes: {}", e));

        let mut group_versions: Vec<String> = Vec::new();
        let core = self.client.list_core_api_versions().await.map_err(disc_err)?;
        group_versions.extend(core.versions);
        let groups = self.client.list_api_groups().await.map_err(disc_err)?;
        for g in groups.groups {
            group_versions.extend(g.versions.into_iter().map(|v| v.group_version));
        }

        let client = &self.client;
        let fetches = group_versions.iter().map(|gv| async move {
            let res = if gv.contains('/') {
                client.list_api_group_resources(gv).await
            } else {
                client.list_core_api_resources(gv).await
            };
            (gv.as_str(), res)
        });
        let mut lists = Vec::new();
        for (gv, res) in futures::future::join_all(fetches).await {
            match res {
                Ok(list) => lists.push(list),
                Err(e) => {
                    // An orphaned APIService still leaves every other group usable.
                    warn!(group_version = %gv, error = %e, "the Kubernetes server has an orphaned API service");
                    warn!("to fix this, kubectl delete apiservice <service-name>");
                    counter!("discovery_group_failures_total", 1u64);
                }
            }
        }
        let out = index_resources(&lists, kube_version);
        histogram!("discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(kinds = out.resources.len(), version = %out.caps.kube_version, "discovery complete");
        Ok(out)
    }

    async fn discovered(&self) -> Result<&Discovered> {
        self.discovered.get_or_try_init(|| self.discover()).await
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn check_reachable(&self) -> Result<()> {
        let v = self.server_version().await?;
        debug!(version = %v, "cluster reachable");
        Ok(())
    }

    async fn capabilities(&self) -> Result<Arc<Capabilities>> {
        Ok(self.discovered().await?.caps.clone())
    }

    async fn fetch_live(&self, id: &ResourceIdentity) -> Result<Option<Json>> {
        let retrieval = |message: String| PreviewError::RetrievalFailed { resource: id.to_string(), message };
        let d = self.discovered().await?;
        let found = d
            .resources
            .get(&id.gvk_key())
            .ok_or_else(|| retrieval(format!("no resource type {} is served", id.gvk_key())))?;

        let api: Api<DynamicObject> = if found.namespaced {
            let ns = id.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), ns, &found.resource)
        } else {
            Api::all_with(self.client.clone(), &found.resource)
        };
        let started = std::time::Instant::now();
        let obj = api.get_opt(&id.name).await.map_err(|e| retrieval(e.to_string()))?;
        histogram!("live_fetch_ms", started.elapsed().as_secs_f64() * 1000.0);
        let Some(obj) = obj else {
            debug!(resource = %id, "not found live");
            return Ok(None);
        };
        let mut raw = serde_json::to_value(&obj).map_err(|e| PreviewError::SerializationFailed {
            what: "live object".into(),
            resource: id.to_string(),
            message: e.to_string(),
        })?;
        strip_managed_fields(&mut raw);
        Ok(Some(raw))
    }

    async fn openapi_v2(&self) -> Result<Json> {
        let unavailable = |message: String| PreviewError::SchemaMetadataUnavailable { resource: "/openapi/v2".into(), message };
        let req = http::Request::get("/openapi/v2")
            .header(http::header::ACCEPT, "application/json")
            .body(Vec::new())
            .map_err(|e| unavailable(e.to_string()))?;
        let text = self.client.request_text(req).await.map_err(|e| unavailable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unavailable(e.to_string()))
    }
}

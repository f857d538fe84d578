//! Release history stored in Secrets or ConfigMaps of the release namespace.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams};
use kube::Client;
use patchdiff_core::Result;
use tracing::{debug, warn};

use crate::{decode_payload, lookup_err, Release, ReleaseStore};

const PAYLOAD_KEY: &str = "release";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Secrets,
    ConfigMaps,
}

/// Read-only driver over the `owner=helm` objects of one namespace.
pub struct KubeDriver {
    client: Client,
    namespace: String,
    kind: StorageKind,
}

impl KubeDriver {
    pub fn new(client: Client, namespace: &str, kind: StorageKind) -> Self {
        Self { client, namespace: namespace.to_string(), kind }
    }

    async fn payloads(&self, name: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let lp = ListParams::default().labels(&format!("owner=helm,name={}", name));
        let out = match self.kind {
            StorageKind::Secrets => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
                let list = api.list(&lp).await.map_err(|e| lookup_err(name, e.to_string()))?;
                list.items
                    .into_iter()
                    .filter_map(|s| {
                        let key = s.metadata.name.clone().unwrap_or_default();
                        s.data.and_then(|mut d| d.remove(PAYLOAD_KEY)).map(|b| (key, b.0))
                    })
                    .collect()
            }
            StorageKind::ConfigMaps => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
                let list = api.list(&lp).await.map_err(|e| lookup_err(name, e.to_string()))?;
                list.items
                    .into_iter()
                    .filter_map(|c| {
                        let key = c.metadata.name.clone().unwrap_or_default();
                        c.data.and_then(|mut d| d.remove(PAYLOAD_KEY)).map(|s| (key, s.into_bytes()))
                    })
                    .collect()
            }
        };
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ReleaseStore for KubeDriver {
    async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let payloads = self.payloads(name).await?;
        debug!(release = %name, ns = %self.namespace, kind = ?self.kind, count = payloads.len(), "listed release objects");
        let mut out = Vec::with_capacity(payloads.len());
        for (key, bytes) in payloads {
            match decode_payload(&bytes) {
                Ok(rel) => out.push(rel),
                Err(e) => {
                    warn!(release = %name, object = %key, error = %e, "undecodable release record");
                    return Err(lookup_err(name, format!("{}: {}", key, e)));
                }
            }
        }
        Ok(out)
    }
}

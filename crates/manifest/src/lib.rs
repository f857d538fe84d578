//! patchdiff manifest handling: split, decode, match and order rendered resources.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use patchdiff_core::{split_api_version, Capabilities, PreviewError, ResourceIdentity, Result};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

/// Kind priority used when installing (and therefore traversing) a release.
pub const INSTALL_ORDER: &[&str] = &[
    "PriorityClass",
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "SecretList",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleList",
    "ClusterRoleBinding",
    "ClusterRoleBindingList",
    "Role",
    "RoleList",
    "RoleBinding",
    "RoleBindingList",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

pub const HOOK_ANNOTATION: &str = "helm.sh/hook";

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^---[ \t]*\r?$").expect("static regex"));

fn max_manifest_bytes() -> usize {
    std::env::var("PATCHDIFF_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8 * 1024 * 1024)
}

fn max_manifest_nodes() -> usize {
    std::env::var("PATCHDIFF_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Split a multi-document manifest on `---` lines. Blank chunks are dropped.
pub fn split_documents(text: &str) -> Vec<&str> {
    SEPARATOR
        .split(text)
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}

fn source_comment(chunk: &str) -> Option<&str> {
    chunk
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# Source:"))
        .map(str::trim)
}

/// A resource decoded from manifest text.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResource {
    pub identity: ResourceIdentity,
    pub body: Json,
    /// Template path (from the `# Source:` marker) or document position.
    pub origin: String,
}

/// Decode manifest text into resources in document order.
///
/// Namespaced resources without `metadata.namespace` land in `default_namespace`;
/// kinds that `caps` reports as cluster-scoped carry no namespace. Kinds unknown
/// to `caps` are treated as namespaced. Any undecodable document fails the
/// whole manifest.
pub fn decode(text: &str, default_namespace: &str, caps: Option<&Capabilities>) -> Result<Vec<DecodedResource>> {
    if text.len() > max_manifest_bytes() {
        return Err(PreviewError::MalformedResource {
            origin: "manifest".into(),
            message: format!("manifest too large (>{} bytes)", max_manifest_bytes()),
        });
    }
    let mut out = Vec::new();
    for (i, chunk) in split_documents(text).into_iter().enumerate() {
        let origin = source_comment(chunk).map(str::to_string).unwrap_or_else(|| format!("document {}", i));
        let val: serde_yaml::Value = serde_yaml::from_str(chunk).map_err(|e| PreviewError::MalformedResource {
            origin: origin.clone(),
            message: format!("parsing YAML: {}", e),
        })?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| PreviewError::MalformedResource {
            origin: origin.clone(),
            message: format!("converting YAML to JSON: {}", e),
        })?;
        if json_node_budget_exceeded(&json, max_manifest_nodes()) {
            return Err(PreviewError::MalformedResource {
                origin,
                message: format!("document too complex (>{} nodes)", max_manifest_nodes()),
            });
        }
        if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
            let items = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
            for (j, item) in items.into_iter().enumerate() {
                let item_origin = format!("{} item {}", origin, j);
                out.push(decode_object(item, &item_origin, default_namespace, caps)?);
            }
            continue;
        }
        out.push(decode_object(json, &origin, default_namespace, caps)?);
    }
    debug!(count = out.len(), "decoded manifest");
    Ok(out)
}

fn decode_object(json: Json, origin: &str, default_namespace: &str, caps: Option<&Capabilities>) -> Result<DecodedResource> {
    let malformed = |message: &str| PreviewError::MalformedResource { origin: origin.to_string(), message: message.to_string() };
    if !json.is_object() {
        return Err(malformed("document is not a mapping"));
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| malformed("missing apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| malformed("missing kind"))?.to_string();
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing metadata.name"))?
        .to_string();
    let (group, version) = split_api_version(api_version);
    let namespaced = caps.and_then(|c| c.is_namespaced(&group, &version, &kind)).unwrap_or(true);
    let namespace = if namespaced {
        let declared = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        Some(declared.unwrap_or(default_namespace).to_string())
    } else {
        None
    };
    Ok(DecodedResource {
        identity: ResourceIdentity { group, version, kind, namespace, name },
        body: json,
        origin: origin.to_string(),
    })
}

/// A target resource paired with its previously declared body, if any.
#[derive(Debug, Clone, Copy)]
pub struct MatchedResource<'a> {
    pub target: &'a DecodedResource,
    /// `None` when the resource is new in the target manifest.
    pub original: Option<&'a Json>,
}

/// Pair every target resource with the original resource of the same identity.
/// Original-only resources are not returned.
pub fn match_resources<'a>(original: &'a [DecodedResource], target: &'a [DecodedResource]) -> Vec<MatchedResource<'a>> {
    let mut index: FxHashMap<&ResourceIdentity, &Json> = FxHashMap::default();
    for r in original {
        index.entry(&r.identity).or_insert(&r.body);
    }
    target
        .iter()
        .map(|t| MatchedResource { target: t, original: index.get(&t.identity).copied() })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct HeadMeta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct SimpleHead {
    #[serde(default, rename = "apiVersion")]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Option<HeadMeta>,
}

/// One rendered resource document with the template path it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub source: String,
    pub content: String,
    pub kind: String,
    pub api_version: String,
    pub name: String,
}

fn kind_rank(kind: &str) -> Option<usize> {
    INSTALL_ORDER.iter().position(|k| *k == kind)
}

/// Order rendered template outputs into install order and drop everything that
/// is not part of a release manifest (notes, empty documents, hooks).
pub fn sort_manifests(files: &BTreeMap<String, String>) -> Result<Vec<Manifest>> {
    let mut out = Vec::new();
    for (path, text) in files {
        if path.ends_with("NOTES.txt") {
            continue;
        }
        for chunk in split_documents(text) {
            let content = chunk.trim().to_string();
            let val: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| PreviewError::MalformedResource {
                origin: path.clone(),
                message: format!("parsing YAML: {}", e),
            })?;
            if val.is_null() {
                continue;
            }
            let head: SimpleHead = serde_yaml::from_value(val).map_err(|e| PreviewError::MalformedResource {
                origin: path.clone(),
                message: format!("reading resource header: {}", e),
            })?;
            let meta = head.metadata.unwrap_or_default();
            if meta.annotations.as_ref().map(|a| a.contains_key(HOOK_ANNOTATION)).unwrap_or(false) {
                debug!(source = %path, name = ?meta.name, "skipping hook");
                continue;
            }
            out.push(Manifest {
                source: path.clone(),
                content,
                kind: head.kind.unwrap_or_default(),
                api_version: head.api_version.unwrap_or_default(),
                name: meta.name.unwrap_or_default(),
            });
        }
    }
    out.sort_by(|a, b| match (kind_rank(&a.kind), kind_rank(&b.kind)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.kind.cmp(&b.kind),
    });
    Ok(out)
}

/// Join ordered manifests into release manifest text.
pub fn manifest_text(manifests: &[Manifest]) -> String {
    let mut out = String::new();
    for m in manifests {
        out.push_str("---\n# Source: ");
        out.push_str(&m.source);
        out.push('\n');
        out.push_str(&m.content);
        out.push('\n');
    }
    out
}

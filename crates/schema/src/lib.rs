//! patchdiff schema: classify kinds by schema awareness and derive per-field
//! strategic-merge metadata (merge keys, list strategies, retainKeys).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::Resource;
use once_cell::sync::Lazy;
use patchdiff_core::{gvk_key, PreviewError, ResourceIdentity, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// How a list-valued field is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListStrategy {
    /// The list is atomic and replaced wholesale.
    Replace,
    /// Elements are maps merged by the value of the named key.
    MergeByKey(String),
    /// Elements are scalars merged as a set.
    MergeValues,
}

/// Patch metadata for one field and its children. Children describe object
/// properties, or the properties of the list items when the field is a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMeta {
    pub list: Option<ListStrategy>,
    pub retain_keys: bool,
    pub fields: BTreeMap<String, PatchMeta>,
}

static EMPTY: Lazy<PatchMeta> = Lazy::new(PatchMeta::default);

impl PatchMeta {
    /// Metadata for a child field; fields without metadata behave like an empty node.
    pub fn field(&self, name: &str) -> &PatchMeta {
        self.fields.get(name).unwrap_or(&EMPTY)
    }

    pub fn list_strategy(&self) -> &ListStrategy {
        static REPLACE: ListStrategy = ListStrategy::Replace;
        self.list.as_ref().unwrap_or(&REPLACE)
    }

    fn is_trivial(&self) -> bool {
        self.list.is_none() && !self.retain_keys && self.fields.is_empty()
    }

    fn node(&mut self, path: &[&str]) -> &mut PatchMeta {
        let mut cur = self;
        for seg in path {
            cur = cur.fields.entry((*seg).to_string()).or_default();
        }
        cur
    }

    fn set_list(mut self, path: &[&str], strategy: ListStrategy) -> Self {
        self.node(path).list = Some(strategy);
        self
    }

    fn set_retain_keys(mut self, path: &[&str]) -> Self {
        self.node(path).retain_keys = true;
        self
    }

    fn graft(mut self, path: &[&str], sub: PatchMeta) -> Self {
        let node = self.node(path);
        for (k, v) in sub.fields {
            node.fields.insert(k, v);
        }
        if sub.list.is_some() {
            node.list = sub.list;
        }
        node.retain_keys |= sub.retain_keys;
        self
    }
}

/// Schema awareness of a kind, resolved once per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaClass {
    SchemaAware(Arc<PatchMeta>),
    Schemaless,
}

fn gvk_of<K: Resource>() -> String {
    gvk_key(K::GROUP, K::VERSION, K::KIND)
}

/// Every kind k8s-openapi compiles in for the enabled Kubernetes version.
/// Everything else decodes as unstructured.
static COMPILED_KINDS: Lazy<FxHashSet<String>> = Lazy::new(|| {
    use k8s_openapi::{api, apiextensions_apiserver, kube_aggregator};

    [
        gvk_of::<api::admissionregistration::v1::MutatingWebhookConfiguration>(),
        gvk_of::<api::admissionregistration::v1::ValidatingWebhookConfiguration>(),
        gvk_of::<api::admissionregistration::v1alpha1::ValidatingAdmissionPolicy>(),
        gvk_of::<api::admissionregistration::v1alpha1::ValidatingAdmissionPolicyBinding>(),
        gvk_of::<api::admissionregistration::v1beta1::ValidatingAdmissionPolicy>(),
        gvk_of::<api::admissionregistration::v1beta1::ValidatingAdmissionPolicyBinding>(),
        gvk_of::<api::apiserverinternal::v1alpha1::StorageVersion>(),
        gvk_of::<api::apps::v1::ControllerRevision>(),
        gvk_of::<api::apps::v1::DaemonSet>(),
        gvk_of::<api::apps::v1::Deployment>(),
        gvk_of::<api::apps::v1::ReplicaSet>(),
        gvk_of::<api::apps::v1::StatefulSet>(),
        gvk_of::<api::authentication::v1::SelfSubjectReview>(),
        gvk_of::<api::authentication::v1::TokenRequest>(),
        gvk_of::<api::authentication::v1::TokenReview>(),
        gvk_of::<api::authentication::v1alpha1::SelfSubjectReview>(),
        gvk_of::<api::authentication::v1beta1::SelfSubjectReview>(),
        gvk_of::<api::authorization::v1::LocalSubjectAccessReview>(),
        gvk_of::<api::authorization::v1::SelfSubjectAccessReview>(),
        gvk_of::<api::authorization::v1::SelfSubjectRulesReview>(),
        gvk_of::<api::authorization::v1::SubjectAccessReview>(),
        gvk_of::<api::autoscaling::v1::HorizontalPodAutoscaler>(),
        gvk_of::<api::autoscaling::v1::Scale>(),
        gvk_of::<api::autoscaling::v2::HorizontalPodAutoscaler>(),
        gvk_of::<api::batch::v1::CronJob>(),
        gvk_of::<api::batch::v1::Job>(),
        gvk_of::<api::certificates::v1::CertificateSigningRequest>(),
        gvk_of::<api::certificates::v1alpha1::ClusterTrustBundle>(),
        gvk_of::<api::coordination::v1::Lease>(),
        gvk_of::<api::core::v1::Binding>(),
        gvk_of::<api::core::v1::ComponentStatus>(),
        gvk_of::<api::core::v1::ConfigMap>(),
        gvk_of::<api::core::v1::Endpoints>(),
        gvk_of::<api::core::v1::Event>(),
        gvk_of::<api::core::v1::LimitRange>(),
        gvk_of::<api::core::v1::Namespace>(),
        gvk_of::<api::core::v1::Node>(),
        gvk_of::<api::core::v1::PersistentVolume>(),
        gvk_of::<api::core::v1::PersistentVolumeClaim>(),
        gvk_of::<api::core::v1::Pod>(),
        gvk_of::<api::core::v1::PodTemplate>(),
        gvk_of::<api::core::v1::ReplicationController>(),
        gvk_of::<api::core::v1::ResourceQuota>(),
        gvk_of::<api::core::v1::Secret>(),
        gvk_of::<api::core::v1::Service>(),
        gvk_of::<api::core::v1::ServiceAccount>(),
        gvk_of::<api::discovery::v1::EndpointSlice>(),
        gvk_of::<api::events::v1::Event>(),
        gvk_of::<api::flowcontrol::v1::FlowSchema>(),
        gvk_of::<api::flowcontrol::v1::PriorityLevelConfiguration>(),
        gvk_of::<api::flowcontrol::v1beta3::FlowSchema>(),
        gvk_of::<api::flowcontrol::v1beta3::PriorityLevelConfiguration>(),
        gvk_of::<api::networking::v1::Ingress>(),
        gvk_of::<api::networking::v1::IngressClass>(),
        gvk_of::<api::networking::v1::NetworkPolicy>(),
        gvk_of::<api::networking::v1alpha1::IPAddress>(),
        gvk_of::<api::networking::v1alpha1::ServiceCIDR>(),
        gvk_of::<api::node::v1::RuntimeClass>(),
        gvk_of::<api::policy::v1::Eviction>(),
        gvk_of::<api::policy::v1::PodDisruptionBudget>(),
        gvk_of::<api::rbac::v1::ClusterRole>(),
        gvk_of::<api::rbac::v1::ClusterRoleBinding>(),
        gvk_of::<api::rbac::v1::Role>(),
        gvk_of::<api::rbac::v1::RoleBinding>(),
        gvk_of::<api::resource::v1alpha2::PodSchedulingContext>(),
        gvk_of::<api::resource::v1alpha2::ResourceClaim>(),
        gvk_of::<api::resource::v1alpha2::ResourceClaimTemplate>(),
        gvk_of::<api::resource::v1alpha2::ResourceClass>(),
        gvk_of::<api::scheduling::v1::PriorityClass>(),
        gvk_of::<api::storage::v1::CSIDriver>(),
        gvk_of::<api::storage::v1::CSINode>(),
        gvk_of::<api::storage::v1::CSIStorageCapacity>(),
        gvk_of::<api::storage::v1::StorageClass>(),
        gvk_of::<api::storage::v1::VolumeAttachment>(),
        gvk_of::<api::storage::v1alpha1::VolumeAttributesClass>(),
        gvk_of::<apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>(),
        gvk_of::<kube_aggregator::pkg::apis::apiregistration::v1::APIService>(),
    ]
    .into_iter()
    .collect()
});

const CRD_KIND: &str = "CustomResourceDefinition";
const CRD_GROUP: &str = "apiextensions.k8s.io";

/// Strategic merge needs compiled merge-key metadata; CRDs and unstructured
/// kinds fall back to a generic merge patch.
pub fn is_schema_aware(group: &str, version: &str, kind: &str) -> bool {
    if group == CRD_GROUP && kind == CRD_KIND {
        return false;
    }
    COMPILED_KINDS.contains(&gvk_key(group, version, kind))
}

fn object_meta() -> PatchMeta {
    PatchMeta::default()
        .set_list(&["finalizers"], ListStrategy::MergeValues)
        .set_list(&["ownerReferences"], ListStrategy::MergeByKey("uid".into()))
}

fn container() -> PatchMeta {
    PatchMeta::default()
        .set_list(&["env"], ListStrategy::MergeByKey("name".into()))
        .set_list(&["ports"], ListStrategy::MergeByKey("containerPort".into()))
        .set_list(&["volumeMounts"], ListStrategy::MergeByKey("mountPath".into()))
        .set_list(&["volumeDevices"], ListStrategy::MergeByKey("devicePath".into()))
}

fn pod_spec() -> PatchMeta {
    let by_name = || ListStrategy::MergeByKey("name".into());
    PatchMeta::default()
        .set_list(&["containers"], by_name())
        .graft(&["containers"], container())
        .set_list(&["initContainers"], by_name())
        .graft(&["initContainers"], container())
        .set_list(&["ephemeralContainers"], by_name())
        .graft(&["ephemeralContainers"], container())
        .set_list(&["volumes"], by_name())
        .set_retain_keys(&["volumes"])
        .set_list(&["imagePullSecrets"], by_name())
        .set_list(&["hostAliases"], ListStrategy::MergeByKey("ip".into()))
        .set_list(&["topologySpreadConstraints"], ListStrategy::MergeByKey("topologyKey".into()))
        .set_list(&["resourceClaims"], by_name())
        .set_list(&["schedulingGates"], by_name())
}

fn pod_template() -> PatchMeta {
    PatchMeta::default().graft(&["metadata"], object_meta()).graft(&["spec"], pod_spec())
}

/// Static metadata for compiled kinds, covering the fields that carry a
/// non-default strategy.
pub fn builtin_meta(kind: &str) -> PatchMeta {
    let base = PatchMeta::default().graft(&["metadata"], object_meta());
    match kind {
        "Pod" => base.graft(&["spec"], pod_spec()),
        "Deployment" => base.graft(&["spec", "template"], pod_template()).set_retain_keys(&["spec", "strategy"]),
        "DaemonSet" | "StatefulSet" | "ReplicaSet" | "ReplicationController" | "Job" => {
            base.graft(&["spec", "template"], pod_template())
        }
        "CronJob" => base.graft(&["spec", "jobTemplate", "spec", "template"], pod_template()),
        "Service" => base.set_list(&["spec", "ports"], ListStrategy::MergeByKey("port".into())),
        _ => base,
    }
}

fn resolve_ref<'a>(defs: &'a serde_json::Map<String, Json>, schema: &'a Json) -> (Option<&'a str>, &'a Json) {
    match schema.get("$ref").and_then(|r| r.as_str()).and_then(|r| r.strip_prefix("#/definitions/")) {
        Some(name) => match defs.get(name) {
            Some(def) => (Some(name), def),
            None => (None, schema),
        },
        None => (None, schema),
    }
}

const MAX_SCHEMA_DEPTH: usize = 24;

fn walk_schema<'a>(defs: &'a serde_json::Map<String, Json>, schema: &'a Json, stack: &mut Vec<&'a str>) -> PatchMeta {
    let mut meta = PatchMeta::default();
    let (def_name, schema) = resolve_ref(defs, schema);
    if let Some(name) = def_name {
        if stack.contains(&name) || stack.len() >= MAX_SCHEMA_DEPTH {
            return meta;
        }
        stack.push(name);
    }
    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, prop) in props {
            let is_array = prop.get("type").and_then(|t| t.as_str()) == Some("array");
            let mut child = match (is_array, prop.get("items")) {
                (true, Some(items)) => walk_schema(defs, items, stack),
                _ => walk_schema(defs, prop, stack),
            };
            let strategy = prop.get("x-kubernetes-patch-strategy").and_then(|s| s.as_str()).unwrap_or("");
            let parts: Vec<&str> = strategy.split(',').map(str::trim).collect();
            if parts.contains(&"merge") && is_array {
                child.list = Some(match prop.get("x-kubernetes-patch-merge-key").and_then(|k| k.as_str()) {
                    Some(key) => ListStrategy::MergeByKey(key.to_string()),
                    None => ListStrategy::MergeValues,
                });
            }
            if parts.contains(&"retainKeys") {
                child.retain_keys = true;
            }
            if !child.is_trivial() {
                meta.fields.insert(field.clone(), child);
            }
        }
    }
    if def_name.is_some() {
        stack.pop();
    }
    meta
}

/// Derive metadata for a kind from an OpenAPI v2 document.
/// Returns `None` when no definition declares the kind.
pub fn meta_from_openapi_v2(doc: &Json, group: &str, version: &str, kind: &str) -> Option<PatchMeta> {
    let defs = doc.get("definitions")?.as_object()?;
    let (_, root) = defs.iter().find(|(_, def)| {
        def.get("x-kubernetes-group-version-kind")
            .and_then(|v| v.as_array())
            .map(|gvks| {
                gvks.iter().any(|g| {
                    g.get("group").and_then(|s| s.as_str()).unwrap_or("") == group
                        && g.get("version").and_then(|s| s.as_str()) == Some(version)
                        && g.get("kind").and_then(|s| s.as_str()) == Some(kind)
                })
            })
            .unwrap_or(false)
    })?;
    let mut stack = Vec::new();
    Some(walk_schema(defs, root, &mut stack))
}

/// Where schema-aware metadata comes from.
#[derive(Debug, Clone)]
pub enum MetadataSource {
    Builtin,
    OpenApiV2(Arc<Json>),
}

/// Per-kind classification table, filled lazily and shared by all resources
/// of one computation.
#[derive(Debug)]
pub struct SchemaRegistry {
    source: MetadataSource,
    table: Mutex<FxHashMap<String, SchemaClass>>,
}

impl SchemaRegistry {
    pub fn new(source: MetadataSource) -> Self {
        Self { source, table: Mutex::new(FxHashMap::default()) }
    }

    pub fn builtin() -> Self {
        Self::new(MetadataSource::Builtin)
    }

    pub fn classify(&self, id: &ResourceIdentity) -> Result<SchemaClass> {
        let key = id.gvk_key();
        if let Some(hit) = self.table.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(hit.clone());
        }
        let class = if !is_schema_aware(&id.group, &id.version, &id.kind) {
            SchemaClass::Schemaless
        } else {
            let meta = match &self.source {
                MetadataSource::Builtin => builtin_meta(&id.kind),
                MetadataSource::OpenApiV2(doc) => meta_from_openapi_v2(doc, &id.group, &id.version, &id.kind)
                    .ok_or_else(|| PreviewError::SchemaMetadataUnavailable {
                        resource: id.to_string(),
                        message: format!("no OpenAPI definition declares {}", key),
                    })?,
            };
            SchemaClass::SchemaAware(Arc::new(meta))
        };
        debug!(gvk = %key, schema_aware = matches!(class, SchemaClass::SchemaAware(_)), "classified kind");
        self.table.lock().unwrap_or_else(|e| e.into_inner()).insert(key, class.clone());
        Ok(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(group: &str, version: &str, kind: &str) -> ResourceIdentity {
        ResourceIdentity { group: group.into(), version: version.into(), kind: kind.into(), namespace: Some("ns".into()), name: "x".into() }
    }

    #[test]
    fn every_builtin_group_is_covered() {
        for (group, version, kind) in [
            ("", "v1", "PodTemplate"),
            ("", "v1", "Event"),
            ("", "v1", "Node"),
            ("apps", "v1", "ControllerRevision"),
            ("node.k8s.io", "v1", "RuntimeClass"),
            ("storage.k8s.io", "v1", "CSIDriver"),
            ("storage.k8s.io", "v1", "CSINode"),
            ("storage.k8s.io", "v1", "CSIStorageCapacity"),
            ("storage.k8s.io", "v1", "VolumeAttachment"),
            ("certificates.k8s.io", "v1", "CertificateSigningRequest"),
            ("events.k8s.io", "v1", "Event"),
            ("flowcontrol.apiserver.k8s.io", "v1", "FlowSchema"),
            ("admissionregistration.k8s.io", "v1beta1", "ValidatingAdmissionPolicy"),
            ("resource.k8s.io", "v1alpha2", "ResourceClaim"),
            ("networking.k8s.io", "v1alpha1", "ServiceCIDR"),
            ("internal.apiserver.k8s.io", "v1alpha1", "StorageVersion"),
            ("apiregistration.k8s.io", "v1", "APIService"),
        ] {
            assert!(is_schema_aware(group, version, kind), "{}", gvk_key(group, version, kind));
        }
        assert_eq!(COMPILED_KINDS.len(), 77);
    }

    #[test]
    fn compiled_kinds_are_schema_aware() {
        assert!(is_schema_aware("apps", "v1", "Deployment"));
        assert!(is_schema_aware("", "v1", "ConfigMap"));
        assert!(!is_schema_aware("apiextensions.k8s.io", "v1", "CustomResourceDefinition"));
        assert!(!is_schema_aware("example.com", "v1", "Widget"));
        assert!(!is_schema_aware("apps", "v1beta9", "Deployment"));
    }

    #[test]
    fn builtin_deployment_meta_has_container_keys() {
        let meta = builtin_meta("Deployment");
        let containers = meta.field("spec").field("template").field("spec").field("containers");
        assert_eq!(containers.list_strategy(), &ListStrategy::MergeByKey("name".into()));
        assert_eq!(containers.field("env").list_strategy(), &ListStrategy::MergeByKey("name".into()));
        assert_eq!(containers.field("args").list_strategy(), &ListStrategy::Replace);
        assert!(meta.field("spec").field("strategy").retain_keys);
        assert_eq!(meta.field("metadata").field("finalizers").list_strategy(), &ListStrategy::MergeValues);
    }

    #[test]
    fn registry_caches_and_falls_back_for_crds() {
        let reg = SchemaRegistry::builtin();
        let crd = id("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
        assert_eq!(reg.classify(&crd).unwrap(), SchemaClass::Schemaless);
        let svc = id("", "v1", "Service");
        match reg.classify(&svc).unwrap() {
            SchemaClass::SchemaAware(meta) => {
                assert_eq!(meta.field("spec").field("ports").list_strategy(), &ListStrategy::MergeByKey("port".into()))
            }
            SchemaClass::Schemaless => panic!("service should be schema aware"),
        }
        assert_eq!(reg.table.lock().unwrap().len(), 2);
    }

    fn openapi_doc() -> Json {
        serde_json::json!({
            "definitions": {
                "io.k8s.api.apps.v1.Deployment": {
                    "x-kubernetes-group-version-kind": [{"group": "apps", "version": "v1", "kind": "Deployment"}],
                    "properties": {
                        "metadata": {"$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"},
                        "spec": {"$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentSpec"}
                    }
                },
                "io.k8s.api.apps.v1.DeploymentSpec": {
                    "properties": {
                        "replicas": {"type": "integer"},
                        "strategy": {"$ref": "#/definitions/io.k8s.api.apps.v1.DeploymentStrategy", "x-kubernetes-patch-strategy": "retainKeys"},
                        "template": {"$ref": "#/definitions/io.k8s.api.core.v1.PodTemplateSpec"}
                    }
                },
                "io.k8s.api.apps.v1.DeploymentStrategy": {"properties": {"type": {"type": "string"}}},
                "io.k8s.api.core.v1.PodTemplateSpec": {
                    "properties": {"spec": {"$ref": "#/definitions/io.k8s.api.core.v1.PodSpec"}}
                },
                "io.k8s.api.core.v1.PodSpec": {
                    "properties": {
                        "containers": {
                            "type": "array",
                            "items": {"$ref": "#/definitions/io.k8s.api.core.v1.Container"},
                            "x-kubernetes-patch-merge-key": "name",
                            "x-kubernetes-patch-strategy": "merge"
                        },
                        "volumes": {
                            "type": "array",
                            "items": {"$ref": "#/definitions/io.k8s.api.core.v1.Volume"},
                            "x-kubernetes-patch-merge-key": "name",
                            "x-kubernetes-patch-strategy": "merge,retainKeys"
                        }
                    }
                },
                "io.k8s.api.core.v1.Container": {"properties": {"args": {"type": "array", "items": {"type": "string"}}}},
                "io.k8s.api.core.v1.Volume": {"properties": {"name": {"type": "string"}}},
                "io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta": {
                    "properties": {
                        "finalizers": {"type": "array", "items": {"type": "string"}, "x-kubernetes-patch-strategy": "merge"},
                        "ownerReferences": {"type": "array", "items": {"$ref": "#/definitions/io.k8s.apimachinery.pkg.apis.meta.v1.ObjectMeta"}}
                    }
                }
            }
        })
    }

    #[test]
    fn openapi_derivation_reads_extensions() {
        let doc = openapi_doc();
        let meta = meta_from_openapi_v2(&doc, "apps", "v1", "Deployment").unwrap();
        let pod = meta.field("spec").field("template").field("spec");
        assert_eq!(pod.field("containers").list_strategy(), &ListStrategy::MergeByKey("name".into()));
        assert_eq!(pod.field("volumes").list_strategy(), &ListStrategy::MergeByKey("name".into()));
        assert!(pod.field("volumes").retain_keys);
        assert!(meta.field("spec").field("strategy").retain_keys);
        assert_eq!(meta.field("metadata").field("finalizers").list_strategy(), &ListStrategy::MergeValues);
        assert!(meta_from_openapi_v2(&doc, "apps", "v1", "StatefulSet").is_none());
    }

    #[test]
    fn openapi_registry_reports_missing_definitions() {
        let reg = SchemaRegistry::new(MetadataSource::OpenApiV2(Arc::new(openapi_doc())));
        let err = reg.classify(&id("apps", "v1", "StatefulSet")).unwrap_err();
        assert!(matches!(err, PreviewError::SchemaMetadataUnavailable { .. }));
        // schemaless kinds never need a definition
        assert_eq!(reg.classify(&id("example.com", "v1", "Widget")).unwrap(), SchemaClass::Schemaless);
    }
}

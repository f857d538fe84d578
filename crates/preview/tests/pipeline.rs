use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchdiff_chart::{process_dependencies, Bundle, ChartMetadata, RenderContext, Renderer, TemplateRenderer};
use patchdiff_core::prelude::*;
use patchdiff_manifest::{decode, manifest_text, sort_manifests};
use patchdiff_preview::{PreviewConfig, PreviewContext, UpgradeRequest};
use patchdiff_release::{MemoryStore, Release, ReleaseChart, ReleaseInfo, ReleaseStatus};
use serde_json::{json, Value as Json};

#[derive(Default)]
struct FakeCluster {
    caps: Capabilities,
    live: Mutex<BTreeMap<ResourceIdentity, Json>>,
    failing: BTreeSet<String>,
    /// Per-name fetch delay, to finish out of order.
    delays: BTreeMap<String, u64>,
    capability_calls: AtomicUsize,
    fetches: AtomicUsize,
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    async fn check_reachable(&self) -> Result<()> {
        Ok(())
    }

    async fn capabilities(&self) -> Result<Arc<Capabilities>> {
        self.capability_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.caps.clone()))
    }

    async fn fetch_live(&self, id: &ResourceIdentity) -> Result<Option<Json>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = self.delays.get(&id.name) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if self.failing.contains(&id.name) {
            return Err(PreviewError::RetrievalFailed { resource: id.to_string(), message: "forbidden".into() });
        }
        Ok(self.live.lock().unwrap().get(id).cloned())
    }

    async fn openapi_v2(&self) -> Result<Json> {
        Ok(json!({}))
    }
}

fn caps() -> Capabilities {
    let mut c = Capabilities::default();
    c.kube_version = KubeVersion { version: "v1.29.3".into(), major: "1".into(), minor: "29".into() };
    c.insert_kind("", "v1", "ConfigMap", true);
    c.insert_kind("", "v1", "Service", true);
    c.insert_kind("apps", "v1", "Deployment", true);
    c.insert_kind("apiextensions.k8s.io", "v1", "CustomResourceDefinition", false);
    c
}

const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ .Release.Name }}-web
  labels:
    app: web
spec:
  replicas: {{ .Values.replicaCount }}
  template:
    spec:
      containers:
      - name: web
        image: "nginx:{{ .Values.tag }}"
"#;

fn bundle() -> Bundle {
    Bundle::new(ChartMetadata { name: "web".into(), version: "1.0.0".into(), ..Default::default() })
        .with_values(json!({"replicaCount": 1, "tag": "1.25"}))
        .with_template("templates/deployment.yaml", DEPLOYMENT)
}

/// Manifest the release recorded when it was installed with `values`.
fn installed_manifest(bundle: &Bundle, values: &Json) -> String {
    let chart = process_dependencies(bundle, values).unwrap();
    let ctx = RenderContext {
        release_name: "foo".into(),
        namespace: "prod".into(),
        revision: 1,
        is_upgrade: false,
        kube_version: caps().kube_version,
    };
    let files = TemplateRenderer.render(&chart, &ctx).unwrap();
    manifest_text(&sort_manifests(&files).unwrap())
}

fn store_with(manifest: &str, status: ReleaseStatus) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert(Release {
        name: "foo".into(),
        namespace: "prod".into(),
        version: 1,
        info: ReleaseInfo { status, description: String::new() },
        chart: ReleaseChart::default(),
        config: json!({}),
        manifest: manifest.to_string(),
    });
    Arc::new(store)
}

/// Live objects as the cluster would hold them after applying `manifest`.
fn live_from(manifest: &str) -> BTreeMap<ResourceIdentity, Json> {
    decode(manifest, "prod", Some(&caps()))
        .unwrap()
        .into_iter()
        .map(|r| {
            let mut body = r.body.clone();
            body["metadata"]["uid"] = json!("0000-1111");
            body["metadata"]["resourceVersion"] = json!("42");
            body["status"] = json!({"observedGeneration": 1});
            (r.identity, body)
        })
        .collect()
}

fn context(cluster: Arc<FakeCluster>, store: Arc<MemoryStore>) -> PreviewContext {
    PreviewContext::new(cluster, store, Arc::new(TemplateRenderer), PreviewConfig::default())
}

fn request(overrides: Json) -> UpgradeRequest {
    UpgradeRequest { release: "foo".into(), bundle: bundle(), values: overrides }
}

#[tokio::test]
async fn replica_override_yields_single_replica_patch() {
    let original = installed_manifest(&bundle(), &json!({}));
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), ..Default::default() });
    let ctx = context(cluster.clone(), store_with(&original, ReleaseStatus::Deployed));

    let set = ctx.run(&request(json!({"replicaCount": 3}))).await.unwrap();
    assert_eq!(set.assemble().unwrap(), r#"[{"spec":{"replicas":3}}]"#);
    assert_eq!(cluster.capability_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unchanged_release_yields_empty_patch_per_live_resource() {
    let original = installed_manifest(&bundle(), &json!({}));
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));

    let set = ctx.run(&request(json!({}))).await.unwrap();
    assert_eq!(set.assemble().unwrap(), "[{}]");
}

#[tokio::test]
async fn live_drift_alone_is_not_a_change() {
    let original = installed_manifest(&bundle(), &json!({}));
    let mut live = live_from(&original);
    for body in live.values_mut() {
        body["spec"]["replicas"] = json!(7);
        body["metadata"]["labels"]["edited"] = json!("by-hand");
    }
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live), ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));
    assert_eq!(ctx.run(&request(json!({}))).await.unwrap().assemble().unwrap(), "[{}]");
}

#[tokio::test]
async fn new_resource_absent_live_contributes_nothing() {
    let original = installed_manifest(&bundle(), &json!({}));
    let next = bundle().with_template(
        "templates/service.yaml",
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ .Release.Name }}-svc\nspec:\n  ports:\n  - port: 80\n",
    );
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), ..Default::default() });
    let ctx = context(cluster.clone(), store_with(&original, ReleaseStatus::Deployed));

    let req = UpgradeRequest { release: "foo".into(), bundle: next, values: json!({"tag": "1.26"}) };
    let set = ctx.run(&req).await.unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.records[0].identity.kind, "Deployment");
    assert_eq!(
        set.assemble().unwrap(),
        r#"[{"spec":{"template":{"spec":{"$setElementOrder/containers":[{"name":"web"}],"containers":[{"image":"nginx:1.26","name":"web"}]}}}}]"#
    );
    assert_eq!(cluster.fetches.load(Ordering::SeqCst), 2);
}

const CRD: &str = r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  scope: {{ .Values.scope }}
  names:
    kind: Widget
    plural: widgets
"#;

#[tokio::test]
async fn crd_gets_generic_patch_ignoring_live_divergence() {
    let crd_bundle = || {
        Bundle::new(ChartMetadata { name: "widgets".into(), version: "0.1.0".into(), ..Default::default() })
            .with_values(json!({"scope": "Namespaced"}))
            .with_template("templates/crd.yaml", CRD)
    };
    let original = installed_manifest(&crd_bundle(), &json!({}));
    let mut live = live_from(&original);
    for body in live.values_mut() {
        body["spec"]["names"]["shortNames"] = json!(["wd"]);
    }
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live), ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));

    let req = UpgradeRequest { release: "foo".into(), bundle: crd_bundle(), values: json!({"scope": "Cluster"}) };
    let set = ctx.run(&req).await.unwrap();
    assert_eq!(set.records[0].kind, patchdiff_core::PatchKind::GenericMerge);
    assert_eq!(set.assemble().unwrap(), r#"[{"spec":{"scope":"Cluster"}}]"#);
}

#[tokio::test]
async fn output_follows_target_order_not_completion_order() {
    let many = Bundle::new(ChartMetadata { name: "web".into(), version: "1.0.0".into(), ..Default::default() })
        .with_values(json!({"v": "1"}))
        .with_template(
            "templates/cms.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  v: \"{{ .Values.v }}\"\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\ndata:\n  v: \"{{ .Values.v }}-b\"\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  v: \"{{ .Values.v }}-c\"\n",
        );
    let original = installed_manifest(&many, &json!({}));
    let delays = BTreeMap::from([("a".to_string(), 30), ("b".to_string(), 15), ("c".to_string(), 0)]);
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), delays, ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));

    let req = UpgradeRequest { release: "foo".into(), bundle: many, values: json!({"v": "2"}) };
    let first = ctx.run(&req).await.unwrap().assemble().unwrap();
    assert_eq!(first, r#"[{"data":{"v":"2"}},{"data":{"v":"2-b"}},{"data":{"v":"2-c"}}]"#);
    let second = ctx.run(&req).await.unwrap().assemble().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn retrieval_failure_aborts_the_whole_computation() {
    let original = installed_manifest(&bundle(), &json!({}));
    let cluster = Arc::new(FakeCluster {
        caps: caps(),
        live: Mutex::new(live_from(&original)),
        failing: BTreeSet::from(["foo-web".to_string()]),
        ..Default::default()
    });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));
    let err = ctx.run(&request(json!({"replicaCount": 3}))).await.unwrap_err();
    assert!(matches!(err, PreviewError::RetrievalFailed { .. }));
}

#[tokio::test]
async fn missing_release_and_bad_names_fail_early() {
    let cluster = Arc::new(FakeCluster { caps: caps(), ..Default::default() });
    let ctx = context(cluster.clone(), Arc::new(MemoryStore::new()));
    let err = ctx.run(&request(json!({}))).await.unwrap_err();
    assert_eq!(err.to_string(), "\"foo\" has no deployed releases");

    let bad = UpgradeRequest { release: "Not_Valid".into(), bundle: bundle(), values: json!({}) };
    assert!(matches!(ctx.run(&bad).await, Err(PreviewError::InvalidReleaseName(_))));
    assert_eq!(cluster.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn incompatible_platform_is_reported() {
    let original = installed_manifest(&bundle(), &json!({}));
    let mut strict = bundle();
    strict.metadata.kube_version = ">=1.30.0".into();
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Deployed));
    let req = UpgradeRequest { release: "foo".into(), bundle: strict, values: json!({}) };
    assert!(matches!(ctx.run(&req).await, Err(PreviewError::IncompatiblePlatform { .. })));
}

#[tokio::test]
async fn failed_only_history_still_upgrades_from_last_revision() {
    let original = installed_manifest(&bundle(), &json!({}));
    let cluster = Arc::new(FakeCluster { caps: caps(), live: Mutex::new(live_from(&original)), ..Default::default() });
    let ctx = context(cluster, store_with(&original, ReleaseStatus::Failed));
    let set = ctx.run(&request(json!({"replicaCount": 2}))).await.unwrap();
    assert_eq!(set.assemble().unwrap(), r#"[{"spec":{"replicas":2}}]"#);
}

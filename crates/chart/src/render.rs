//! Rendering collaborator: chart + values + context → file path → text.

use std::collections::BTreeMap;

use patchdiff_core::{KubeVersion, PreviewError, Result};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::deps::ResolvedChart;
use crate::template;

/// Release-side inputs to rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderContext {
    pub release_name: String,
    pub namespace: String,
    pub revision: i64,
    pub is_upgrade: bool,
    pub kube_version: KubeVersion,
}

pub trait Renderer: Send + Sync {
    /// Rendered text of every non-partial template, keyed
    /// `<chart>/templates/<file>` (subcharts under `<chart>/charts/<sub>/`).
    fn render(&self, chart: &ResolvedChart, ctx: &RenderContext) -> Result<BTreeMap<String, String>>;
}

/// Built-in renderer for the supported template dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

fn is_partial(name: &str) -> bool {
    name.rsplit('/').next().map_or(false, |base| base.starts_with('_'))
}

fn top_level(chart: &ResolvedChart, ctx: &RenderContext, template_name: &str, base_path: &str) -> Json {
    let meta = &chart.bundle.metadata;
    json!({
        "Values": chart.values,
        "Release": {
            "Name": ctx.release_name,
            "Namespace": ctx.namespace,
            "Revision": ctx.revision,
            "IsUpgrade": ctx.is_upgrade,
            "IsInstall": !ctx.is_upgrade,
            "Service": "Helm",
        },
        "Chart": {
            "Name": meta.name,
            "Version": meta.version,
            "AppVersion": meta.app_version,
        },
        "Capabilities": {
            "KubeVersion": {
                "Version": ctx.kube_version.version,
                "Major": ctx.kube_version.major,
                "Minor": ctx.kube_version.minor,
            },
        },
        "Template": {"Name": template_name, "BasePath": base_path},
    })
}

impl TemplateRenderer {
    fn render_into(
        &self,
        chart: &ResolvedChart,
        prefix: &str,
        ctx: &RenderContext,
        out: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let base_path = format!("{}/templates", prefix);
        for t in chart.bundle.templates.iter().filter(|t| !is_partial(&t.name)) {
            let name = format!("{}/{}", prefix, t.name);
            let data = top_level(chart, ctx, &name, &base_path);
            let text = template::render(&t.data, &data)
                .map_err(|message| PreviewError::RenderFailed { file: name.clone(), message })?;
            out.insert(name, text);
        }
        for sub in &chart.subcharts {
            let sub_prefix = format!("{}/charts/{}", prefix, sub.bundle.name());
            self.render_into(sub, &sub_prefix, ctx, out)?;
        }
        Ok(())
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, chart: &ResolvedChart, ctx: &RenderContext) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        self.render_into(chart, chart.bundle.name(), ctx, &mut out)?;
        debug!(chart = %chart.bundle.name(), files = out.len(), "rendered templates");
        Ok(out)
    }
}

//! patchdiff chart: bundle model and loading, values merging, dependency
//! processing, platform constraint and the built-in template renderer.

#![forbid(unsafe_code)]

pub mod deps;
pub mod platform;
pub mod render;
mod template;
pub mod values;

use std::path::Path;

use patchdiff_core::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

pub use deps::{process_dependencies, ResolvedChart};
pub use platform::check_kube_version;
pub use render::{RenderContext, Renderer, TemplateRenderer};
pub use values::{coalesce, merge_values, parse_set, ValueOptions};

/// Entry of `dependencies` in Chart.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Dependency {
    /// Name the subchart renders and reads values under.
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().filter(|a| !a.is_empty()).unwrap_or(&self.name)
    }
}

/// Chart.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "appVersion", skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(default, rename = "kubeVersion", skip_serializing_if = "String::is_empty")]
    pub kube_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

/// A template file, named relative to the chart root (`templates/web.yaml`).
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub data: String,
}

/// A loaded bundle with its vendored subcharts.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub metadata: ChartMetadata,
    /// Defaults from values.yaml; always an object.
    pub values: Json,
    pub templates: Vec<Template>,
    pub subcharts: Vec<Bundle>,
}

impl Bundle {
    pub fn new(metadata: ChartMetadata) -> Self {
        Self { metadata, values: Json::Object(Default::default()), templates: Vec::new(), subcharts: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn with_values(mut self, values: Json) -> Self {
        self.values = values;
        self
    }

    pub fn with_template(mut self, name: &str, data: &str) -> Self {
        self.templates.push(Template { name: name.to_string(), data: data.to_string() });
        self
    }

    pub fn with_subchart(mut self, sub: Bundle) -> Self {
        self.subcharts.push(sub);
        self
    }
}

fn load_err(path: &Path, message: impl std::fmt::Display) -> PreviewError {
    PreviewError::ChartLoadFailed { path: path.display().to_string(), message: message.to_string() }
}

/// Parse YAML text into a values object. Empty documents yield `{}`.
pub fn parse_values_yaml(text: &str) -> std::result::Result<Json, String> {
    if text.trim().is_empty() {
        return Ok(Json::Object(Default::default()));
    }
    let v: Json = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    match v {
        Json::Null => Ok(Json::Object(Default::default())),
        Json::Object(_) => Ok(v),
        other => Err(format!("values must be a map, got {}", other)),
    }
}

/// Load an unpacked bundle directory.
pub fn load_bundle(dir: &Path) -> Result<Bundle> {
    if !dir.is_dir() {
        return Err(load_err(dir, "not a chart directory"));
    }
    let chart_yaml = dir.join("Chart.yaml");
    let text = std::fs::read_to_string(&chart_yaml).map_err(|e| load_err(&chart_yaml, e))?;
    let metadata: ChartMetadata = serde_yaml::from_str(&text).map_err(|e| load_err(&chart_yaml, e))?;
    if metadata.name.is_empty() {
        return Err(load_err(&chart_yaml, "chart name is required"));
    }

    let values_yaml = dir.join("values.yaml");
    let values = if values_yaml.is_file() {
        let text = std::fs::read_to_string(&values_yaml).map_err(|e| load_err(&values_yaml, e))?;
        parse_values_yaml(&text).map_err(|e| load_err(&values_yaml, e))?
    } else {
        Json::Object(Default::default())
    };

    let mut templates = Vec::new();
    let tdir = dir.join("templates");
    if tdir.is_dir() {
        collect_templates(&tdir, "templates", &mut templates)?;
    }
    templates.sort_by(|a, b| a.name.cmp(&b.name));

    let mut subcharts = Vec::new();
    let cdir = dir.join("charts");
    if cdir.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(&cdir)
            .map_err(|e| load_err(&cdir, e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for p in entries {
            if p.is_dir() {
                subcharts.push(load_bundle(&p)?);
            } else {
                warn!(path = %p.display(), "skipping packaged subchart; only unpacked directories are loaded");
            }
        }
    }
    debug!(chart = %metadata.name, templates = templates.len(), subcharts = subcharts.len(), "bundle loaded");
    Ok(Bundle { metadata, values, templates, subcharts })
}

fn collect_templates(dir: &Path, prefix: &str, out: &mut Vec<Template>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| load_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| load_err(dir, e))?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        let name = format!("{}/{}", prefix, file_name);
        if path.is_dir() {
            collect_templates(&path, &name, out)?;
        } else {
            let data = std::fs::read_to_string(&path).map_err(|e| load_err(&path, e))?;
            out.push(Template { name, data });
        }
    }
    Ok(())
}

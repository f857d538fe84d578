//! Dependency processing: vendored subchart lookup, condition/tag evaluation,
//! aliasing and values scoping.

use patchdiff_core::{PreviewError, Result};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::values::coalesce;
use crate::Bundle;

/// A chart ready to render: disabled dependencies removed, aliases applied and
/// values fully coalesced. Subcharts carry their own scoped values.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChart {
    pub bundle: Bundle,
    pub values: Json,
    pub subcharts: Vec<ResolvedChart>,
}

fn lookup<'a>(values: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(values, |cur, seg| cur.get(seg))
}

/// `Some(enabled)` when the condition or the tags decide, `None` otherwise.
fn enabled_by(dep: &crate::Dependency, values: &Json) -> Option<bool> {
    for cond in dep.condition.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        match lookup(values, cond) {
            Some(Json::Bool(b)) => return Some(*b),
            Some(Json::Null) | None => {}
            Some(other) => debug!(condition = %cond, value = %other, "condition is not a bool; ignoring"),
        }
    }
    if dep.tags.is_empty() {
        return None;
    }
    let tags = values.get("tags");
    let mut saw_false = false;
    for tag in &dep.tags {
        match tags.and_then(|t| t.get(tag)) {
            Some(Json::Bool(true)) => return Some(true),
            Some(Json::Bool(false)) => saw_false = true,
            _ => {}
        }
    }
    saw_false.then_some(false)
}

/// Resolve `bundle`'s dependency tree against the user-supplied values.
pub fn process_dependencies(bundle: &Bundle, user_values: &Json) -> Result<ResolvedChart> {
    let values = coalesce(user_values, &bundle.values);
    resolve(bundle, values)
}

fn resolve(bundle: &Bundle, mut values: Json) -> Result<ResolvedChart> {
    let mut subcharts = Vec::new();
    let mut handled = Vec::new();
    for dep in &bundle.metadata.dependencies {
        let sub = bundle.subcharts.iter().find(|s| s.name() == dep.name).ok_or_else(|| {
            PreviewError::DependencyResolutionFailed(format!(
                "chart {:?} declares dependency {:?} which is missing from charts/",
                bundle.name(),
                dep.name
            ))
        })?;
        handled.push(dep.name.as_str());
        let scope = dep.effective_name().to_string();
        if enabled_by(dep, &values) == Some(false) {
            debug!(chart = %bundle.name(), dependency = %scope, "dependency disabled");
            if let Json::Object(m) = &mut values {
                m.remove(&scope);
            }
            continue;
        }
        let mut sub = sub.clone();
        sub.metadata.name = scope.clone();
        subcharts.push(scoped_child(&sub, &scope, &mut values)?);
    }
    // Vendored charts without a Chart.yaml entry render unconditionally.
    for sub in bundle.subcharts.iter().filter(|s| !handled.contains(&s.name())) {
        let scope = sub.name().to_string();
        subcharts.push(scoped_child(sub, &scope, &mut values)?);
    }
    Ok(ResolvedChart { bundle: bundle.clone(), values, subcharts })
}

fn scoped_child(sub: &Bundle, scope: &str, parent: &mut Json) -> Result<ResolvedChart> {
    let parent_globals = parent.get("global").cloned().unwrap_or(Json::Object(Map::new()));
    let given = parent.get(scope).cloned().unwrap_or(Json::Object(Map::new()));
    let mut child = coalesce(&given, &sub.values);
    let child_globals = child.get("global").cloned().unwrap_or(Json::Object(Map::new()));
    if let Json::Object(m) = &mut child {
        m.insert("global".into(), coalesce(&parent_globals, &child_globals));
    }
    let resolved = resolve(sub, child)?;
    if let Json::Object(m) = parent {
        m.insert(scope.to_string(), resolved.values.clone());
    }
    Ok(resolved)
}

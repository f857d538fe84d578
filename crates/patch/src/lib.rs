//! patchdiff patch engine: per-resource patch computation.
//!
//! Schema-aware kinds get a three-way strategic merge patch over the
//! previously declared, newly declared and live documents. Schemaless kinds
//! (custom resources, CRDs) get a two-document JSON merge patch that never
//! looks at live state.

#![forbid(unsafe_code)]

pub mod merge;
pub mod strategic;

use metrics::counter;
use patchdiff_core::{PatchKind, PatchRecord, PreviewError, ResourceIdentity, Result};
use patchdiff_schema::SchemaClass;
use serde_json::Value as Json;
use tracing::debug;

pub use merge::create_merge_patch;
pub use strategic::create_three_way_merge_patch;

/// Round-trip a document through its canonical byte form.
fn canonical(doc: &Json, what: &str, id: &ResourceIdentity) -> Result<Json> {
    let fail = |e: serde_json::Error| PreviewError::SerializationFailed {
        what: format!("{} configuration", what),
        resource: id.to_string(),
        message: e.to_string(),
    };
    let bytes = serde_json::to_vec(doc).map_err(fail)?;
    serde_json::from_slice(&bytes).map_err(fail)
}

/// Compute the patch for one resource that exists live.
///
/// `original` is the previously declared body, or `None` for a resource that is
/// new in the target manifest (diffed against an empty document).
pub fn compute_patch(
    id: &ResourceIdentity,
    original: Option<&Json>,
    target: &Json,
    live: &Json,
    class: &SchemaClass,
) -> Result<PatchRecord> {
    let zero = Json::Object(serde_json::Map::new());
    let old = canonical(original.unwrap_or(&zero), "current", id)?;
    let new = canonical(target, "target", id)?;
    let current = canonical(live, "live", id)?;

    let (patch, kind) = match class {
        SchemaClass::Schemaless => (create_merge_patch(&old, &new), PatchKind::GenericMerge),
        SchemaClass::SchemaAware(meta) => (
            create_three_way_merge_patch(&old, &new, &current, meta, &id.to_string())?,
            PatchKind::StrategicMerge,
        ),
    };
    match kind {
        PatchKind::GenericMerge => counter!("patch_generic_total", 1u64),
        PatchKind::StrategicMerge => counter!("patch_strategic_total", 1u64),
    }
    debug!(resource = %id, kind = ?kind, "computed patch");
    Ok(PatchRecord { identity: id.clone(), patch, kind })
}

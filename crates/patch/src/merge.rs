//! Generic JSON merge patch (RFC 7386) between two documents.

use serde_json::{Map, Value as Json};

/// Patch that turns `old` into `new` under merge-patch semantics: changed and
/// added keys carry the new value, removed keys are `null`, arrays are replaced
/// wholesale. A non-object document on either side yields `new` itself.
pub fn create_merge_patch(old: &Json, new: &Json) -> Json {
    match (old, new) {
        (Json::Object(o), Json::Object(n)) => Json::Object(diff_objects(o, n)),
        _ => new.clone(),
    }
}

fn diff_objects(old: &Map<String, Json>, new: &Map<String, Json>) -> Map<String, Json> {
    let mut patch = Map::new();
    for (k, nv) in new {
        match old.get(k) {
            None => {
                patch.insert(k.clone(), nv.clone());
            }
            Some(ov) if ov == nv => {}
            Some(Json::Object(oo)) if nv.is_object() => {
                if let Json::Object(no) = nv {
                    let sub = diff_objects(oo, no);
                    if !sub.is_empty() {
                        patch.insert(k.clone(), Json::Object(sub));
                    }
                }
            }
            Some(_) => {
                patch.insert(k.clone(), nv.clone());
            }
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            patch.insert(k.clone(), Json::Null);
        }
    }
    patch
}

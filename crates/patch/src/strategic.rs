//! Three-way strategic merge patch.
//!
//! The patch is derived from the declared delta (`old` → `new`) and then
//! pruned against the live document (`current`): entries the live object
//! already satisfies are dropped, fields only present live are never touched,
//! and deletions between `old` and `new` are always emitted.

use once_cell::sync::Lazy;
use patchdiff_core::{PreviewError, Result};
use patchdiff_schema::{ListStrategy, PatchMeta};
use serde_json::{Map, Value as Json};

const RETAIN_KEYS: &str = "$retainKeys";
const PATCH_DIRECTIVE: &str = "$patch";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

type Obj = Map<String, Json>;

struct Ctx<'a> {
    resource: &'a str,
}

static EMPTY_OBJ: Lazy<Obj> = Lazy::new(Map::new);

fn as_object(v: &Json) -> &Obj {
    match v {
        Json::Object(m) => m,
        _ => &EMPTY_OBJ,
    }
}

/// Compute the patch that moves `current` along the `old` → `new` delta.
/// Pure: none of the three documents is modified.
pub fn create_three_way_merge_patch(old: &Json, new: &Json, current: &Json, meta: &PatchMeta, resource: &str) -> Result<Json> {
    let ctx = Ctx { resource };
    let delta = diff_maps(as_object(old), as_object(new), meta, &ctx)?;
    Ok(Json::Object(prune_map(delta, as_object(current), meta)))
}

fn diff_maps(old: &Obj, new: &Obj, meta: &PatchMeta, ctx: &Ctx<'_>) -> Result<Obj> {
    let mut patch = Obj::new();
    for (k, nv) in new {
        let fmeta = meta.field(k);
        match old.get(k) {
            None => {
                patch.insert(k.clone(), nv.clone());
            }
            Some(ov) if ov == nv => {}
            Some(ov) => match (ov, nv) {
                (Json::Object(oo), Json::Object(no)) => {
                    let sub = diff_maps(oo, no, fmeta, ctx)?;
                    if !sub.is_empty() {
                        patch.insert(k.clone(), Json::Object(sub));
                    }
                }
                (Json::Array(oa), Json::Array(na)) => diff_lists(k, oa, na, fmeta, ctx, &mut patch)?,
                _ => {
                    patch.insert(k.clone(), nv.clone());
                }
            },
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            patch.insert(k.clone(), Json::Null);
        }
    }
    if meta.retain_keys && !patch.is_empty() {
        let keys = new.keys().filter(|k| !k.starts_with('$')).map(|k| Json::String(k.clone())).collect();
        patch.insert(RETAIN_KEYS.to_string(), Json::Array(keys));
    }
    Ok(patch)
}

fn merge_key<'v>(elem: &'v Json, field: &str, key: &str, ctx: &Ctx<'_>) -> Result<&'v Json> {
    elem.get(key).ok_or_else(|| PreviewError::MergeKeyMissing {
        resource: ctx.resource.to_string(),
        field: field.to_string(),
        key: key.to_string(),
    })
}

fn diff_lists(field: &str, old: &[Json], new: &[Json], meta: &PatchMeta, ctx: &Ctx<'_>, patch: &mut Obj) -> Result<()> {
    match meta.list_strategy() {
        ListStrategy::MergeByKey(key) if old.iter().chain(new).all(Json::is_object) => {
            let mut items = Vec::new();
            for ne in new {
                let nk = merge_key(ne, field, key, ctx)?;
                let mut found = None;
                for oe in old {
                    if merge_key(oe, field, key, ctx)? == nk {
                        found = Some(oe);
                        break;
                    }
                }
                match found {
                    Some(oe) if oe == ne => {}
                    Some(oe) => {
                        let mut sub = diff_maps(as_object(oe), as_object(ne), meta, ctx)?;
                        if !sub.is_empty() {
                            sub.insert(key.clone(), nk.clone());
                            items.push(Json::Object(sub));
                        }
                    }
                    None => items.push(ne.clone()),
                }
            }
            for oe in old {
                let ok = merge_key(oe, field, key, ctx)?;
                let mut kept = false;
                for ne in new {
                    if merge_key(ne, field, key, ctx)? == ok {
                        kept = true;
                        break;
                    }
                }
                if !kept {
                    let mut del = Obj::new();
                    del.insert(key.clone(), ok.clone());
                    del.insert(PATCH_DIRECTIVE.to_string(), Json::String("delete".into()));
                    items.push(Json::Object(del));
                }
            }
            let order = new
                .iter()
                .map(|e| {
                    let mut m = Obj::new();
                    m.insert(key.clone(), e.get(key).cloned().unwrap_or(Json::Null));
                    Json::Object(m)
                })
                .collect();
            if !items.is_empty() {
                patch.insert(field.to_string(), Json::Array(items));
            }
            patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Json::Array(order));
        }
        ListStrategy::MergeValues => {
            let added: Vec<Json> = new.iter().filter(|v| !old.contains(v)).cloned().collect();
            let removed: Vec<Json> = old.iter().filter(|v| !new.contains(v)).cloned().collect();
            if !added.is_empty() {
                patch.insert(field.to_string(), Json::Array(added));
            }
            if !removed.is_empty() {
                patch.insert(format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, field), Json::Array(removed));
            }
            patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Json::Array(new.to_vec()));
        }
        _ => {
            patch.insert(field.to_string(), Json::Array(new.to_vec()));
        }
    }
    Ok(())
}

fn prune_map(patch: Obj, current: &Obj, meta: &PatchMeta) -> Obj {
    let mut out = Obj::new();
    let mut directives = Vec::new();
    for (k, pv) in patch {
        if k.starts_with('$') {
            directives.push((k, pv));
            continue;
        }
        let fmeta = meta.field(&k);
        let kept = match (pv, current.get(&k)) {
            (Json::Null, _) => Some(Json::Null),
            (pv, None) => Some(pv),
            (Json::Object(pm), Some(Json::Object(cm))) => {
                let sub = prune_map(pm, cm, fmeta);
                (!sub.is_empty()).then_some(Json::Object(sub))
            }
            (Json::Array(pa), Some(Json::Array(ca))) => prune_list(pa, ca, fmeta),
            (pv, Some(cv)) => (&pv != cv).then_some(pv),
        };
        if let Some(v) = kept {
            out.insert(k, v);
        }
    }
    let has_fields = !out.is_empty();
    let deleted_from: Vec<String> = directives
        .iter()
        .filter_map(|(k, _)| k.strip_prefix(DELETE_FROM_PRIMITIVE_LIST).map(str::to_string))
        .collect();
    for (k, v) in directives {
        let keep = if let Some(field) = k.strip_prefix(SET_ELEMENT_ORDER) {
            out.contains_key(field)
                || deleted_from.iter().any(|d| d == field)
                || order_differs(&v, current.get(field), meta.field(field))
        } else if k == RETAIN_KEYS {
            has_fields
        } else {
            true
        };
        if keep {
            out.insert(k, v);
        }
    }
    out
}

/// Whether the live list orders the elements named by an order directive
/// differently. Live-only elements are ignored.
fn order_differs(order: &Json, current: Option<&Json>, meta: &PatchMeta) -> bool {
    let (Some(order), Some(Json::Array(live))) = (order.as_array(), current) else {
        return false;
    };
    match meta.list_strategy() {
        ListStrategy::MergeByKey(key) => {
            let want: Vec<&Json> = order.iter().filter_map(|e| e.get(key)).collect();
            let have: Vec<&Json> = live.iter().filter_map(|e| e.get(key)).filter(|k| want.contains(k)).collect();
            want != have
        }
        ListStrategy::MergeValues => {
            let want: Vec<&Json> = order.iter().collect();
            let have: Vec<&Json> = live.iter().filter(|v| order.contains(*v)).collect();
            want != have
        }
        ListStrategy::Replace => false,
    }
}

fn prune_list(patch: Vec<Json>, current: &[Json], meta: &PatchMeta) -> Option<Json> {
    let kept: Vec<Json> = match meta.list_strategy() {
        ListStrategy::MergeByKey(key) if patch.iter().chain(current).all(Json::is_object) => patch
            .into_iter()
            .filter_map(|pe| {
                if pe.get(PATCH_DIRECTIVE).is_some() {
                    return Some(pe);
                }
                let pk = pe.get(key).cloned();
                let ce = pk.as_ref().and_then(|k| current.iter().find(|c| c.get(key) == Some(k)));
                match (pk, ce) {
                    (Some(pk), Some(ce)) => {
                        let mut body = as_object(&pe).clone();
                        body.remove(key);
                        let mut sub = prune_map(body, as_object(ce), meta);
                        if sub.is_empty() {
                            None
                        } else {
                            sub.insert(key.clone(), pk);
                            Some(Json::Object(sub))
                        }
                    }
                    _ => Some(pe),
                }
            })
            .collect(),
        ListStrategy::MergeValues => patch.into_iter().filter(|v| !current.contains(v)).collect(),
        _ => {
            if patch.as_slice() == current {
                return None;
            }
            patch
        }
    };
    (!kept.is_empty()).then_some(Json::Array(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchdiff_schema::builtin_meta;
    use serde_json::json;

    fn deployment(replicas: i64, image: &str) -> Json {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {
                "replicas": replicas,
                "template": {"spec": {"containers": [
                    {"name": "app", "image": image, "env": [{"name": "MODE", "value": "a"}]},
                    {"name": "sidecar", "image": "proxy:1"}
                ]}}
            }
        })
    }

    fn three_way(old: &Json, new: &Json, current: &Json) -> Json {
        create_three_way_merge_patch(old, new, current, &builtin_meta("Deployment"), "apps/v1/Deployment ns/web").unwrap()
    }

    #[test]
    fn declared_scalar_change_wins() {
        let old = deployment(1, "app:1");
        let new = deployment(3, "app:1");
        let mut live = deployment(1, "app:1");
        live["status"] = json!({"readyReplicas": 1});
        live["metadata"]["uid"] = json!("abc");
        assert_eq!(three_way(&old, &new, &live), json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn live_drift_alone_produces_no_patch() {
        let old = deployment(1, "app:1");
        let live = deployment(7, "app:9");
        assert_eq!(three_way(&old, &old, &live), json!({}));
    }

    #[test]
    fn untouched_live_changes_are_preserved() {
        let old = deployment(1, "app:1");
        let new = deployment(1, "app:2");
        let live = deployment(5, "app:1");
        let patch = three_way(&old, &new, &live);
        assert_eq!(
            patch,
            json!({"spec": {"template": {"spec": {
                "containers": [{"name": "app", "image": "app:2"}],
                "$setElementOrder/containers": [{"name": "app"}, {"name": "sidecar"}]
            }}}})
        );
    }

    #[test]
    fn satisfied_changes_are_pruned() {
        let old = deployment(1, "app:1");
        let new = deployment(3, "app:2");
        let live = deployment(3, "app:2");
        assert_eq!(three_way(&old, &new, &live), json!({}));
    }

    #[test]
    fn deletions_apply_even_when_live_diverged() {
        let mut old = deployment(1, "app:1");
        old["metadata"]["labels"] = json!({"tier": "web", "legacy": "yes"});
        let mut new = deployment(1, "app:1");
        new["metadata"]["labels"] = json!({"tier": "web"});
        let mut live = deployment(1, "app:1");
        live["metadata"]["labels"] = json!({"tier": "web", "legacy": "edited-live"});
        assert_eq!(three_way(&old, &new, &live), json!({"metadata": {"labels": {"legacy": null}}}));
    }

    #[test]
    fn removed_keyed_element_is_deleted() {
        let old = deployment(1, "app:1");
        let mut new = deployment(1, "app:1");
        new["spec"]["template"]["spec"]["containers"].as_array_mut().unwrap().pop();
        let patch = three_way(&old, &new, &old);
        assert_eq!(
            patch["spec"]["template"]["spec"],
            json!({
                "containers": [{"name": "sidecar", "$patch": "delete"}],
                "$setElementOrder/containers": [{"name": "app"}]
            })
        );
    }

    #[test]
    fn nested_keyed_lists_merge_by_key() {
        let old = deployment(1, "app:1");
        let mut new = deployment(1, "app:1");
        new["spec"]["template"]["spec"]["containers"][0]["env"] = json!([{"name": "MODE", "value": "b"}, {"name": "EXTRA", "value": "1"}]);
        let patch = three_way(&old, &new, &old);
        let containers = &patch["spec"]["template"]["spec"]["containers"];
        assert_eq!(
            containers,
            &json!([{
                "name": "app",
                "env": [{"name": "MODE", "value": "b"}, {"name": "EXTRA", "value": "1"}],
                "$setElementOrder/env": [{"name": "MODE"}, {"name": "EXTRA"}]
            }])
        );
    }

    #[test]
    fn replace_lists_carry_whole_list() {
        let mut old = deployment(1, "app:1");
        old["spec"]["template"]["spec"]["containers"][1]["args"] = json!(["--a", "--b"]);
        let mut new = old.clone();
        new["spec"]["template"]["spec"]["containers"][1]["args"] = json!(["--a"]);
        let patch = three_way(&old, &new, &old);
        assert_eq!(patch["spec"]["template"]["spec"]["containers"], json!([{"name": "sidecar", "args": ["--a"]}]));
    }

    #[test]
    fn primitive_sets_use_directives() {
        let mut old = deployment(1, "app:1");
        old["metadata"]["finalizers"] = json!(["a", "b"]);
        let mut new = deployment(1, "app:1");
        new["metadata"]["finalizers"] = json!(["a", "c"]);
        let patch = three_way(&old, &new, &old);
        assert_eq!(
            patch,
            json!({"metadata": {
                "finalizers": ["c"],
                "$deleteFromPrimitiveList/finalizers": ["b"],
                "$setElementOrder/finalizers": ["a", "c"]
            }})
        );
    }

    #[test]
    fn retain_keys_lists_desired_keys() {
        let mut old = deployment(1, "app:1");
        old["spec"]["strategy"] = json!({"type": "RollingUpdate", "rollingUpdate": {"maxSurge": 1}});
        let mut new = deployment(1, "app:1");
        new["spec"]["strategy"] = json!({"type": "Recreate"});
        let patch = three_way(&old, &new, &old);
        assert_eq!(
            patch,
            json!({"spec": {"strategy": {"type": "Recreate", "rollingUpdate": null, "$retainKeys": ["type"]}}})
        );
    }

    #[test]
    fn missing_merge_key_is_an_error() {
        let old = deployment(1, "app:1");
        let mut new = deployment(1, "app:1");
        new["spec"]["template"]["spec"]["containers"][0].as_object_mut().unwrap().remove("name");
        let err = create_three_way_merge_patch(&old, &new, &old, &builtin_meta("Deployment"), "web").unwrap_err();
        assert!(matches!(err, PreviewError::MergeKeyMissing { ref key, .. } if key == "name"));
    }

    #[test]
    fn reordered_keyed_list_keeps_order_directive() {
        let old = deployment(1, "app:1");
        let mut new = deployment(1, "app:1");
        new["spec"]["template"]["spec"]["containers"].as_array_mut().unwrap().reverse();
        assert_eq!(
            three_way(&old, &new, &old),
            json!({"spec": {"template": {"spec": {
                "$setElementOrder/containers": [{"name": "sidecar"}, {"name": "app"}]
            }}}})
        );
        // live already in the new order, with an extra live-only container
        let mut live = new.clone();
        live["spec"]["template"]["spec"]["containers"].as_array_mut().unwrap().push(json!({"name": "istio", "image": "istio:1"}));
        assert_eq!(three_way(&old, &new, &live), json!({}));
    }

    #[test]
    fn reordered_primitive_set_keeps_order_directive() {
        let mut old = deployment(1, "app:1");
        old["metadata"]["finalizers"] = json!(["a", "b"]);
        let mut new = deployment(1, "app:1");
        new["metadata"]["finalizers"] = json!(["b", "a"]);
        assert_eq!(
            three_way(&old, &new, &old),
            json!({"metadata": {"$setElementOrder/finalizers": ["b", "a"]}})
        );
        assert_eq!(three_way(&old, &new, &new), json!({}));
    }

    #[test]
    fn brand_new_resource_patch_is_pruned_against_live() {
        let new = deployment(2, "app:1");
        let live = deployment(1, "app:1");
        assert_eq!(three_way(&json!({}), &new, &live), json!({"spec": {"replicas": 2}}));
    }
}

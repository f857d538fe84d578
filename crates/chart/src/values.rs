//! User values: `--values` files, `--set` expressions and coalescing over
//! bundle defaults.

use std::path::PathBuf;

use patchdiff_core::{PreviewError, Result};
use serde_json::{Map, Value as Json};

use crate::parse_values_yaml;

/// Largest list index `--set` may address.
const MAX_INDEX: usize = 65_536;

/// Override flags, each group in command-line order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueOptions {
    pub value_files: Vec<PathBuf>,
    pub values: Vec<String>,
    pub string_values: Vec<String>,
    pub file_values: Vec<String>,
}

fn invalid(message: impl Into<String>) -> PreviewError {
    PreviewError::InvalidValues(message.into())
}

/// Merge files, then `--set`, then `--set-string`, then `--set-file`.
pub fn merge_values(opts: &ValueOptions) -> Result<Json> {
    let mut base = Json::Object(Map::new());
    for path in &opts.value_files {
        let text = std::fs::read_to_string(path).map_err(|e| invalid(format!("reading {}: {}", path.display(), e)))?;
        let current = parse_values_yaml(&text).map_err(|e| invalid(format!("parsing {}: {}", path.display(), e)))?;
        merge_maps(&mut base, current);
    }
    for line in &opts.values {
        parse_set(line, &mut base, true)?;
    }
    for line in &opts.string_values {
        parse_set(line, &mut base, false)?;
    }
    for line in &opts.file_values {
        parse_set_file(line, &mut base)?;
    }
    Ok(base)
}

/// Deep merge `src` into `dst`: maps merge, anything else replaces.
pub fn merge_maps(dst: &mut Json, src: Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, v) in s {
                let nested = v.is_object() && d.get(&k).map_or(false, Json::is_object);
                match d.get_mut(&k) {
                    Some(existing) if nested => merge_maps(existing, v),
                    _ => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

/// Coalesce user values over defaults. User maps merge recursively, user
/// scalars and lists win, and a user `null` removes the default key.
pub fn coalesce(user: &Json, defaults: &Json) -> Json {
    match (user, defaults) {
        (Json::Object(u), Json::Object(d)) => {
            let mut out = u.clone();
            for (k, dv) in d {
                match u.get(k) {
                    None => {
                        out.insert(k.clone(), dv.clone());
                    }
                    Some(Json::Null) => {
                        out.remove(k);
                    }
                    Some(uv) if uv.is_object() && dv.is_object() => {
                        out.insert(k.clone(), coalesce(uv, dv));
                    }
                    Some(_) => {}
                }
            }
            Json::Object(out)
        }
        (Json::Null, d) => d.clone(),
        (u, _) => u.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Key(String),
    Index(usize),
}

/// Split on `sep` outside of braces, honoring backslash escapes (kept in the output).
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                cur.push(c);
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            '{' => {
                depth += 1;
                cur.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            c if c == sep && depth == 0 => parts.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    parts.push(cur);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_key(key: &str) -> Result<Vec<Seg>> {
    let mut segs = Vec::new();
    for part in split_unescaped(key, '.') {
        if part.is_empty() {
            return Err(invalid(format!("key {:?} has an empty segment", key)));
        }
        let (name, mut rest) = match part.find('[') {
            Some(i) if !part[..i].ends_with('\\') => (&part[..i], &part[i..]),
            _ => (part.as_str(), ""),
        };
        if name.is_empty() {
            return Err(invalid(format!("key {:?} indexes an unnamed list", key)));
        }
        segs.push(Seg::Key(unescape(name)));
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .filter(|_| rest.starts_with('['))
                .ok_or_else(|| invalid(format!("key {:?} has a malformed index", key)))?;
            let idx: usize = rest[1..close]
                .parse()
                .map_err(|_| invalid(format!("key {:?} has a non-numeric index", key)))?;
            if idx > MAX_INDEX {
                return Err(invalid(format!("index of {:?} exceeds {}", key, MAX_INDEX)));
            }
            segs.push(Seg::Index(idx));
            rest = &rest[close + 1..];
        }
    }
    Ok(segs)
}

fn typed_value(raw: &str) -> Json {
    if raw.eq_ignore_ascii_case("true") {
        return Json::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Json::Bool(false);
    }
    if raw.eq_ignore_ascii_case("null") {
        return Json::Null;
    }
    let leading_zero = raw.len() > 1 && (raw.starts_with('0') || raw.starts_with("-0"));
    if !leading_zero {
        if let Ok(n) = raw.parse::<i64>() {
            return Json::from(n);
        }
    }
    Json::String(raw.to_string())
}

fn parse_value(raw: &str, typed: bool) -> Json {
    if let Some(inner) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        if inner.is_empty() {
            return Json::Array(Vec::new());
        }
        return Json::Array(
            split_unescaped(inner, ',')
                .iter()
                .map(|item| {
                    let v = unescape(item);
                    if typed { typed_value(&v) } else { Json::String(v) }
                })
                .collect(),
        );
    }
    let v = unescape(raw);
    if typed { typed_value(&v) } else { Json::String(v) }
}

fn set_path(dest: &mut Json, segs: &[Seg], value: Json) {
    let Some((head, tail)) = segs.split_first() else {
        *dest = value;
        return;
    };
    match head {
        Seg::Key(k) => {
            if !dest.is_object() {
                *dest = Json::Object(Map::new());
            }
            if let Json::Object(m) = dest {
                let slot = m.entry(k.clone()).or_insert(Json::Null);
                set_path(slot, tail, value);
            }
        }
        Seg::Index(i) => {
            if !dest.is_array() {
                *dest = Json::Array(Vec::new());
            }
            if let Json::Array(list) = dest {
                if list.len() <= *i {
                    list.resize(*i + 1, Json::Null);
                }
                set_path(&mut list[*i], tail, value);
            }
        }
    }
}

/// Apply one `--set`/`--set-string` line (`a.b=1,c[0]=x`) onto `dest`.
pub fn parse_set(line: &str, dest: &mut Json, typed: bool) -> Result<()> {
    for pair in split_unescaped(line, ',') {
        if pair.is_empty() {
            continue;
        }
        let eq = find_unescaped(&pair, '=').ok_or_else(|| invalid(format!("key {:?} has no value", pair)))?;
        let segs = parse_key(&pair[..eq])?;
        set_path(dest, &segs, parse_value(&pair[eq + 1..], typed));
    }
    Ok(())
}

/// Apply one `--set-file` line (`key=path`): the value is the file's content.
pub fn parse_set_file(line: &str, dest: &mut Json) -> Result<()> {
    for pair in split_unescaped(line, ',') {
        if pair.is_empty() {
            continue;
        }
        let eq = find_unescaped(&pair, '=').ok_or_else(|| invalid(format!("key {:?} has no value", pair)))?;
        let segs = parse_key(&pair[..eq])?;
        let path = unescape(&pair[eq + 1..]);
        let content = std::fs::read_to_string(&path).map_err(|e| invalid(format!("reading {}: {}", path, e)))?;
        set_path(dest, &segs, Json::String(content));
    }
    Ok(())
}

fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == needle {
            return Some(i);
        }
    }
    None
}

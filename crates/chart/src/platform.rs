//! `kubeVersion` constraint evaluation.

use patchdiff_core::{KubeVersion, PreviewError, Result};
use semver::{Prerelease, Version, VersionReq};

const OPERATORS: &[&str] = &[">=", "<=", "!=", ">", "<", "=", "~", "^"];

fn strip_v(s: &str) -> &str {
    s.strip_prefix('v').or_else(|| s.strip_prefix('V')).unwrap_or(s)
}

/// Server git versions like `v1.29` or `v1.29.3-gke.100` into a semver version.
fn parse_server_version(raw: &str) -> Option<Version> {
    let s = strip_v(raw.trim());
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let (core, rest) = match s.find(['-', '+']) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Turn one alternative (`>= 1.20, < 1.30` or `>=v1.20 <1.30`) into semver syntax.
fn normalize_alternative(alt: &str) -> String {
    let tokens: Vec<&str> = alt.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty()).collect();
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];
        if OPERATORS.contains(&tok) {
            pending_op = Some(tok);
            i += 1;
            continue;
        }
        // hyphen range `a - b`
        if tokens.get(i + 1) == Some(&"-") {
            if let Some(hi) = tokens.get(i + 2) {
                comparators.push(format!(">={}", strip_v(tok)));
                comparators.push(format!("<={}", strip_v(hi)));
                i += 3;
                continue;
            }
        }
        let (op, ver) = match pending_op.take() {
            Some(op) => (op, tok),
            None => match OPERATORS.iter().find(|o| tok.starts_with(**o)) {
                Some(o) => (*o, &tok[o.len()..]),
                None => ("=", tok),
            },
        };
        let ver = strip_v(ver);
        if ver == "*" || ver.eq_ignore_ascii_case("x") {
            comparators.push("*".to_string());
        } else {
            comparators.push(format!("{}{}", op, ver));
        }
        i += 1;
    }
    comparators.join(", ")
}

fn matches_alternative(alt: &str, version: &Version) -> std::result::Result<bool, String> {
    let normalized = normalize_alternative(alt);
    if normalized.is_empty() {
        return Ok(true);
    }
    let mut ok = true;
    // `!=` is not semver syntax; evaluate it by hand.
    let mut rest = Vec::new();
    for c in normalized.split(", ") {
        if let Some(v) = c.strip_prefix("!=") {
            let req = VersionReq::parse(&format!("={}", v)).map_err(|e| e.to_string())?;
            ok &= !req.matches(version);
        } else {
            rest.push(c);
        }
    }
    if !rest.is_empty() {
        let req = VersionReq::parse(&rest.join(", ")).map_err(|e| e.to_string())?;
        // A pre-release bound opts every pre-release server version in.
        let opted_in = rest.iter().any(|c| c.contains('-'));
        if opted_in && !version.pre.is_empty() {
            let mut release = version.clone();
            release.pre = Prerelease::EMPTY;
            ok &= req.matches(&release);
        } else {
            ok &= req.matches(version);
        }
    }
    Ok(ok)
}

/// True when `actual` satisfies `constraint`. Unparsable input is incompatible.
pub fn is_compatible_range(constraint: &str, actual: &str) -> bool {
    let Some(version) = parse_server_version(actual) else {
        return false;
    };
    constraint
        .split("||")
        .any(|alt| matches_alternative(alt, &version).unwrap_or(false))
}

/// Fail with `IncompatiblePlatform` unless the server satisfies the chart's `kubeVersion`.
pub fn check_kube_version(constraint: &str, actual: &KubeVersion) -> Result<()> {
    if constraint.trim().is_empty() || is_compatible_range(constraint, &actual.version) {
        return Ok(());
    }
    Err(PreviewError::IncompatiblePlatform { required: constraint.to_string(), actual: actual.version.clone() })
}

//! A small text/template dialect: `{{ }}` actions with trim markers, comments,
//! field references, literals, pipelines over a fixed function set and
//! `if`/`else if`/`else`/`end` blocks.

use base64::Engine as _;
use serde_json::Value as Json;

type TResult<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq)]
enum Term {
    /// `.a.b`; empty for `.` itself.
    Field(Vec<String>),
    Str(String),
    Num(Json),
    Bool(bool),
    Nil,
    Sub(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
struct Command {
    func: Option<String>,
    args: Vec<Term>,
}

type Pipeline = Vec<Command>;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output(Pipeline),
    If { branches: Vec<(Pipeline, Vec<Node>)>, otherwise: Vec<Node> },
}

#[derive(Debug)]
enum Piece<'a> {
    Text(&'a str),
    Action(&'a str),
}

/// Byte offset of the closing `}}` of an action body, skipping quoted strings
/// and comments.
fn find_close(body: &str) -> Option<usize> {
    let trimmed = body.trim_start_matches(|c: char| c == '-' || c.is_whitespace());
    if trimmed.starts_with("/*") {
        let start = body.len() - trimmed.len();
        let end = trimmed.find("*/")? + start + 2;
        return body[end..].find("}}").map(|i| i + end);
    }
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn lex(src: &str) -> TResult<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = src;
    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        let mut after = &rest[open + 2..];
        if after.starts_with('-') && after[1..].starts_with(char::is_whitespace) {
            text = text.trim_end();
            after = &after[1..];
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }
        let close = find_close(after).ok_or_else(|| "unclosed action".to_string())?;
        let mut inner = &after[..close];
        let trim_right = inner.ends_with('-') && inner[..inner.len() - 1].ends_with(char::is_whitespace);
        if trim_right {
            inner = &inner[..inner.len() - 1];
        }
        let inner = inner.trim();
        if !(inner.starts_with("/*") && inner.ends_with("*/")) {
            pieces.push(Piece::Action(inner));
        }
        rest = &after[close + 2..];
        if trim_right {
            rest = rest.trim_start();
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Num(Json),
    Pipe,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> TResult<Vec<Tok>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                out.push(Tok::Pipe);
                i += 1;
            }
            '(' => {
                out.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                out.push(Tok::RParen);
                i += 1;
            }
            '.' => {
                let mut path = Vec::new();
                while i < chars.len() && chars[i] == '.' {
                    i += 1;
                    let start = i;
                    while i < chars.len() && is_ident(chars[i]) {
                        i += 1;
                    }
                    if start == i {
                        if path.is_empty() && (i >= chars.len() || !chars[i].is_alphanumeric()) {
                            break;
                        }
                        return Err(format!("bad field reference in {:?}", expr));
                    }
                    path.push(chars[start..i].iter().collect());
                }
                out.push(Tok::Field(path));
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("unterminated quoted string".into());
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            let esc = chars.get(i).copied().ok_or_else(|| "unterminated quoted string".to_string())?;
                            i += 1;
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                        }
                        c => s.push(c),
                    }
                }
                out.push(Tok::Str(s));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '`')
                    .ok_or_else(|| "unterminated raw string".to_string())?;
                out.push(Tok::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let num = match lit.parse::<i64>() {
                    Ok(n) => Json::from(n),
                    Err(_) => lit
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Json::Number)
                        .ok_or_else(|| format!("bad number syntax: {:?}", lit))?,
                };
                out.push(Tok::Num(num));
            }
            c if is_ident(c) => {
                let start = i;
                while i < chars.len() && is_ident(chars[i]) {
                    i += 1;
                }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            '$' => return Err("variables are not supported".into()),
            other => return Err(format!("unexpected {:?} in action", other)),
        }
    }
    Ok(out)
}

fn parse_pipeline(toks: &[Tok]) -> TResult<Pipeline> {
    if toks.is_empty() {
        return Err("missing value for command".into());
    }
    let mut cmds = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, t) in toks.iter().enumerate() {
        match t {
            Tok::LParen => depth += 1,
            Tok::RParen => depth -= 1,
            Tok::Pipe if depth == 0 => {
                cmds.push(parse_command(&toks[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return Err("unexpected right paren".into());
        }
    }
    if depth != 0 {
        return Err("unclosed left paren".into());
    }
    cmds.push(parse_command(&toks[start..])?);
    Ok(cmds)
}

fn parse_command(toks: &[Tok]) -> TResult<Command> {
    let mut args = Vec::new();
    let mut func = None;
    let mut i = 0;
    while i < toks.len() {
        let term = match &toks[i] {
            Tok::Field(p) => Term::Field(p.clone()),
            Tok::Str(s) => Term::Str(s.clone()),
            Tok::Num(n) => Term::Num(n.clone()),
            Tok::Ident(id) => match id.as_str() {
                "true" => Term::Bool(true),
                "false" => Term::Bool(false),
                "nil" => Term::Nil,
                name if i == 0 => {
                    func = Some(name.to_string());
                    i += 1;
                    continue;
                }
                name => return Err(format!("function {:?} used as an argument", name)),
            },
            Tok::LParen => {
                let mut depth = 0;
                let mut j = i;
                loop {
                    match toks.get(j) {
                        Some(Tok::LParen) => depth += 1,
                        Some(Tok::RParen) => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => return Err("unclosed left paren".into()),
                    }
                    j += 1;
                }
                let sub = parse_pipeline(&toks[i + 1..j])?;
                i = j;
                Term::Sub(sub)
            }
            Tok::RParen => return Err("unexpected right paren".into()),
            Tok::Pipe => return Err("missing command".into()),
        };
        args.push(term);
        i += 1;
    }
    if func.is_none() && args.len() != 1 {
        return Err(if args.is_empty() { "empty command".into() } else { "can't give argument to non-function".into() });
    }
    Ok(Command { func, args })
}

enum Stop {
    Else,
    ElseIf(Pipeline),
    End,
}

fn parse_nodes<'a, I: Iterator<Item = Piece<'a>>>(pieces: &mut I) -> TResult<(Vec<Node>, Option<Stop>)> {
    let mut nodes = Vec::new();
    while let Some(piece) = pieces.next() {
        let action = match piece {
            Piece::Text(t) => {
                nodes.push(Node::Text(t.to_string()));
                continue;
            }
            Piece::Action(a) => a,
        };
        let (word, rest) = match action.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (action, ""),
        };
        match word {
            "end" => return Ok((nodes, Some(Stop::End))),
            "else" if rest.is_empty() => return Ok((nodes, Some(Stop::Else))),
            "else" => {
                let cond = rest.strip_prefix("if").filter(|r| r.starts_with(char::is_whitespace));
                let cond = cond.ok_or_else(|| format!("unexpected {:?} in else", rest))?;
                return Ok((nodes, Some(Stop::ElseIf(parse_pipeline(&tokenize(cond)?)?))));
            }
            "if" => {
                let mut branches = Vec::new();
                let mut cond = parse_pipeline(&tokenize(rest)?)?;
                let otherwise = loop {
                    let (body, stop) = parse_nodes(pieces)?;
                    branches.push((cond, body));
                    match stop {
                        Some(Stop::End) => break Vec::new(),
                        Some(Stop::ElseIf(c)) => cond = c,
                        Some(Stop::Else) => {
                            let (body, stop) = parse_nodes(pieces)?;
                            match stop {
                                Some(Stop::End) => break body,
                                _ => return Err("expected end after else".into()),
                            }
                        }
                        None => return Err("unexpected EOF in if".into()),
                    }
                };
                nodes.push(Node::If { branches, otherwise });
            }
            "range" | "with" | "define" | "template" | "block" | "include" | "tpl" => {
                return Err(format!("{:?} is not supported", word));
            }
            _ => nodes.push(Node::Output(parse_pipeline(&tokenize(action)?)?)),
        }
    }
    Ok((nodes, None))
}

fn parse(src: &str) -> TResult<Vec<Node>> {
    let pieces = lex(src)?;
    let (nodes, stop) = parse_nodes(&mut pieces.into_iter())?;
    match stop {
        None => Ok(nodes),
        Some(Stop::End) => Err("unexpected {{end}}".into()),
        Some(_) => Err("unexpected {{else}}".into()),
    }
}

pub(crate) fn truthy(v: &Json) -> bool {
    match v {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(m) => !m.is_empty(),
    }
}

/// Text form of a value as it lands in the output.
pub(crate) fn to_text(v: &Json) -> String {
    match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        Json::Array(items) => format!("[{}]", items.iter().map(to_text).collect::<Vec<_>>().join(" ")),
        Json::Object(m) => {
            let mut keys: Vec<_> = m.keys().collect();
            keys.sort();
            let body: Vec<String> = keys.into_iter().map(|k| format!("{}:{}", k, to_text(&m[k]))).collect();
            format!("map[{}]", body.join(" "))
        }
    }
}

fn lookup(data: &Json, path: &[String]) -> TResult<Json> {
    static NIL: Json = Json::Null;
    let mut cur = data;
    for (i, seg) in path.iter().enumerate() {
        cur = match cur {
            Json::Object(m) => m.get(seg).unwrap_or(&NIL),
            Json::Null => {
                let parent = if i == 0 { String::new() } else { format!(".{}", path[..i].join(".")) };
                return Err(format!("nil pointer evaluating {}.{}", parent, seg));
            }
            other => return Err(format!("can't evaluate field {} in {}", seg, to_text(other))),
        };
    }
    Ok(cur.clone())
}

fn eval_term(t: &Term, data: &Json) -> TResult<Json> {
    match t {
        Term::Field(p) => lookup(data, p),
        Term::Str(s) => Ok(Json::String(s.clone())),
        Term::Num(n) => Ok(n.clone()),
        Term::Bool(b) => Ok(Json::Bool(*b)),
        Term::Nil => Ok(Json::Null),
        Term::Sub(p) => eval_pipeline(p, data),
    }
}

fn eval_pipeline(p: &Pipeline, data: &Json) -> TResult<Json> {
    let mut piped: Option<Json> = None;
    for cmd in p {
        let mut args = cmd.args.iter().map(|a| eval_term(a, data)).collect::<TResult<Vec<_>>>()?;
        if let Some(v) = piped.take() {
            if cmd.func.is_none() {
                return Err("can't pipe into a non-function".into());
            }
            args.push(v);
        }
        piped = Some(match &cmd.func {
            None => args.pop().unwrap_or(Json::Null),
            Some(f) => call(f, args)?,
        });
    }
    Ok(piped.unwrap_or(Json::Null))
}

fn one(name: &str, mut args: Vec<Json>) -> TResult<Json> {
    if args.len() != 1 {
        return Err(format!("wrong number of args for {}: want 1 got {}", name, args.len()));
    }
    Ok(args.remove(0))
}

fn width(name: &str, v: &Json) -> TResult<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| format!("{}: width must be a non-negative integer, got {}", name, to_text(v)))
}

fn indent(n: usize, s: &str) -> String {
    let pad = " ".repeat(n);
    format!("{}{}", pad, s.replace('\n', &format!("\n{}", pad)))
}

fn call(name: &str, args: Vec<Json>) -> TResult<Json> {
    Ok(match name {
        "quote" | "squote" => {
            let quoted: Vec<String> = args
                .iter()
                .filter(|a| !a.is_null())
                .map(|a| {
                    let s = to_text(a);
                    if name == "quote" {
                        Json::String(s).to_string()
                    } else {
                        format!("'{}'", s)
                    }
                })
                .collect();
            Json::String(quoted.join(" "))
        }
        "default" => {
            let mut args = args.into_iter();
            let fallback = args.next().ok_or("wrong number of args for default: want 1 or 2 got 0")?;
            let given = args.next().unwrap_or(Json::Null);
            if args.next().is_some() {
                return Err("wrong number of args for default: want 1 or 2".into());
            }
            if truthy(&given) { given } else { fallback }
        }
        "upper" => Json::String(to_text(&one(name, args)?).to_uppercase()),
        "lower" => Json::String(to_text(&one(name, args)?).to_lowercase()),
        "trim" => Json::String(to_text(&one(name, args)?).trim().to_string()),
        "toYaml" => {
            let v = one(name, args)?;
            let y = serde_yaml::to_string(&v).map_err(|e| format!("toYaml: {}", e))?;
            Json::String(y.trim_end_matches('\n').to_string())
        }
        "toJson" => {
            let v = one(name, args)?;
            Json::String(serde_json::to_string(&v).map_err(|e| format!("toJson: {}", e))?)
        }
        "indent" | "nindent" => {
            if args.len() != 2 {
                return Err(format!("wrong number of args for {}: want 2 got {}", name, args.len()));
            }
            let n = width(name, &args[0])?;
            let body = indent(n, &to_text(&args[1]));
            Json::String(if name == "nindent" { format!("\n{}", body) } else { body })
        }
        "b64enc" => {
            let v = to_text(&one(name, args)?);
            Json::String(base64::engine::general_purpose::STANDARD.encode(v))
        }
        "not" => Json::Bool(!truthy(&one(name, args)?)),
        other => return Err(format!("function {:?} not defined", other)),
    })
}

fn exec(nodes: &[Node], data: &Json, out: &mut String) -> TResult<()> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Output(p) => out.push_str(&to_text(&eval_pipeline(p, data)?)),
            Node::If { branches, otherwise } => {
                let mut taken = false;
                for (cond, body) in branches {
                    if truthy(&eval_pipeline(cond, data)?) {
                        exec(body, data, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    exec(otherwise, data, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Render `src` against `data`.
pub(crate) fn render(src: &str, data: &Json) -> TResult<String> {
    let nodes = parse(src)?;
    let mut out = String::with_capacity(src.len());
    exec(&nodes, data, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Json {
        json!({
            "Values": {"replicaCount": 3, "name": "web", "enabled": true, "empty": "", "labels": {"app": "web", "tier": "fe"}, "ports": [80, 443]},
            "Release": {"Name": "foo", "Namespace": "prod"}
        })
    }

    fn r(src: &str) -> String {
        render(src, &data()).unwrap()
    }

    #[test]
    fn fields_and_literals() {
        assert_eq!(r("replicas: {{ .Values.replicaCount }}"), "replicas: 3");
        assert_eq!(r("{{ .Release.Name }}-{{ .Values.name }}"), "foo-web");
        assert_eq!(r("{{ .Values.missing }}|"), "|");
        assert_eq!(r(r#"{{ "a\"b" }} {{ `raw\n` }} {{ 42 }} {{ true }}"#), "a\"b raw\\n 42 true");
        assert_eq!(r("{{ .Values.ports }}"), "[80 443]");
    }

    #[test]
    fn pipes_and_functions() {
        assert_eq!(r("{{ .Values.name | quote }}"), "\"web\"");
        assert_eq!(r("{{ .Values.name | squote }}"), "'web'");
        assert_eq!(r("{{ .Values.missing | quote }}"), "");
        assert_eq!(r(r#"{{ .Values.empty | default "x" }}"#), "x");
        assert_eq!(r(r#"{{ default "x" .Values.name }}"#), "web");
        assert_eq!(r("{{ .Values.name | upper }}{{ \"  A \" | trim | lower }}"), "WEBa");
        assert_eq!(r("{{ .Values.labels | toJson }}"), r#"{"app":"web","tier":"fe"}"#);
        assert_eq!(r("{{ .Values.name | b64enc }}"), "d2Vi");
        assert_eq!(r("{{ not .Values.enabled }}"), "false");
        assert_eq!(r("{{ (.Values.name | upper) | quote }}"), "\"WEB\"");
    }

    #[test]
    fn to_yaml_with_nindent() {
        let src = "metadata:\n  labels:\n    {{- .Values.labels | toYaml | nindent 4 }}\n";
        assert_eq!(r(src), "metadata:\n  labels:\n    app: web\n    tier: fe\n");
        assert_eq!(r("{{ \"a\nb\" | indent 2 }}"), "  a\n  b");
    }

    #[test]
    fn conditionals_and_trimming() {
        let src = "a:\n{{- if .Values.enabled }}\n  on: true\n{{- else }}\n  on: false\n{{- end }}\n";
        assert_eq!(r(src), "a:\n  on: true\n");
        let src = "{{ if not .Values.enabled }}x{{ else if .Values.name }}y{{ else }}z{{ end }}";
        assert_eq!(r(src), "y");
        assert_eq!(r("{{- /* a comment }} */ -}}\nkind: X"), "kind: X");
    }

    #[test]
    fn nil_parent_is_an_error() {
        let err = render("{{ .Values.nope.deeper }}", &data()).unwrap_err();
        assert!(err.contains("nil pointer evaluating .Values.nope.deeper"), "{err}");
    }

    #[test]
    fn unsupported_constructs_fail() {
        for src in [
            "{{ range .Values.ports }}{{ . }}{{ end }}",
            "{{ include \"x\" . }}",
            "{{ $x := 1 }}",
            "{{ .Values.name | sha256sum }}",
            "{{ if .Values.enabled }}never closed",
            "{{ end }}",
            "{{ .Values.name ",
        ] {
            assert!(render(src, &data()).is_err(), "{src}");
        }
    }
}

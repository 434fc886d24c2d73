//! Turns raw evidence into typed values for a single test item source.

use crate::collectors::RawEvidence;
use crate::config::ComponentType;
use crate::model::{EvidenceValue, Scalar};
use crate::rules::EvidenceSource;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Collect every match instead of the first.
    pub multiple: bool,
    pub component: ComponentType,
}

pub fn extract(raw: RawEvidence<'_>, source: &EvidenceSource, opts: ExtractOptions) -> EvidenceValue {
    match (source, raw) {
        (EvidenceSource::Flag(flag), RawEvidence::Output(output)) => {
            let value = extract_flag(output, flag, opts.multiple);
            if value.is_present() {
                value
            } else if opts.component == ComponentType::Policies {
                extract_policy_value(output, flag, opts.multiple)
            } else {
                extract_stat_value(output, flag, opts.multiple)
            }
        }
        (EvidenceSource::Path(path), RawEvidence::Document(doc)) => extract_path(doc, path, opts.multiple),
        (EvidenceSource::Env(name), RawEvidence::Environment(vars)) => match vars.get(name) {
            Some(value) => EvidenceValue::Found(Scalar::text(value.trim())),
            None => EvidenceValue::Absent,
        },
        _ => EvidenceValue::Absent,
    }
}

/// Find `flag` in command-line output. A bare `flag` token means presence
/// (`"true"`); `flag=value` carries a value. When both forms appear the
/// valued form wins.
pub fn extract_flag(output: &str, flag: &str, multiple: bool) -> EvidenceValue {
    let mut valued = Vec::new();
    let mut present = 0usize;
    for line in output.lines() {
        if !line.contains(flag) { continue; }
        for token in tokenize(line) {
            if token == flag {
                present += 1;
            } else if let Some(value) = token.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
                valued.push(unquote(value).to_string());
            }
        }
    }
    let values: Vec<Scalar> = if !valued.is_empty() {
        valued.into_iter().map(Scalar::Text).collect()
    } else {
        (0..present).map(|_| Scalar::text("true")).collect()
    };
    collapse(values, multiple)
}

/// kubectl-style `name: value` pairs, possibly several per line separated by
/// commas. `yes`/`no` are read as booleans.
pub fn extract_policy_value(output: &str, flag: &str, multiple: bool) -> EvidenceValue {
    let pattern = format!(r"(?:^|[\s,*{{]){}:\s*([^,\s}}]+)", regex::escape(flag));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return EvidenceValue::Absent,
    };
    let values: Vec<Scalar> = output
        .lines()
        .flat_map(|line| re.captures_iter(line).filter_map(|c| c.get(1)).map(|m| m.as_str().to_string()).collect::<Vec<_>>())
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "yes" => Scalar::text("true"),
            "no" => Scalar::text("false"),
            _ => Scalar::Text(unquote(&v).to_string()),
        })
        .collect();
    collapse(values, multiple)
}

/// Plain `stat` output. `permissions` reads the octal mode from
/// `Access: (0644/-rw-r--r--)`, `ownership` reads `user:group` from the
/// `Uid:`/`Gid:` pair, and an `owner:group` flag is present when a file's
/// ownership equals it.
pub fn extract_stat_value(output: &str, flag: &str, multiple: bool) -> EvidenceValue {
    let values: Vec<Scalar> = if flag == "permissions" {
        captures(output, r"Access:\s*\((\d{3,4})/").into_iter().filter_map(|c| c.into_iter().next()).map(Scalar::Text).collect()
    } else {
        let owners = captures(output, r"Uid:\s*\(\s*\d+/\s*([^)\s]+)\s*\)\s*Gid:\s*\(\s*\d+/\s*([^)\s]+)\s*\)")
            .into_iter()
            .map(|c| c.join(":"));
        if flag == "ownership" {
            owners.map(Scalar::Text).collect()
        } else if flag.split(':').count() == 2 {
            owners.filter(|o| o == flag).map(|_| Scalar::text("true")).collect()
        } else {
            Vec::new()
        }
    };
    collapse(values, multiple)
}

/// Capture groups of every match, in output order.
fn captures(output: &str, pattern: &str) -> Vec<Vec<String>> {
    let Ok(re) = Regex::new(pattern) else { return Vec::new() };
    re.captures_iter(output)
        .map(|c| c.iter().skip(1).flatten().map(|m| m.as_str().to_string()).collect())
        .collect()
}

fn collapse(mut values: Vec<Scalar>, multiple: bool) -> EvidenceValue {
    if values.is_empty() {
        EvidenceValue::Absent
    } else if multiple {
        EvidenceValue::Multiple(values)
    } else {
        EvidenceValue::Found(values.swap_remove(0))
    }
}

/// Whitespace split that keeps quoted runs together.
fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                start.get_or_insert(i);
            }
            None if c.is_whitespace() => {
                if let Some(s) = start.take() { tokens.push(&line[s..i]); }
            }
            None => { start.get_or_insert(i); }
        }
    }
    if let Some(s) = start { tokens.push(&line[s..]); }
    tokens
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `{.a.b[0]['c.d']}` style paths. Braces and the leading dot are optional.
fn parse_path(expr: &str) -> Option<Vec<Segment>> {
    let expr = expr.trim();
    let expr = expr.strip_prefix('{').and_then(|e| e.strip_suffix('}')).unwrap_or(expr).trim();
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !key.is_empty() { segments.push(Segment::Key(std::mem::take(&mut key))); }
            }
            '[' => {
                if !key.is_empty() { segments.push(Segment::Key(std::mem::take(&mut key))); }
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => inner.push(ch),
                        None => return None,
                    }
                }
                let inner = inner.trim();
                match inner.parse::<usize>() {
                    Ok(i) => segments.push(Segment::Index(i)),
                    Err(_) => segments.push(Segment::Key(unquote(inner).to_string())),
                }
            }
            other => key.push(other),
        }
    }
    if !key.is_empty() { segments.push(Segment::Key(key)); }
    if segments.is_empty() { None } else { Some(segments) }
}

/// Walk a config document. A missing path or a null leaf is absence.
pub fn extract_path(doc: &Value, path: &str, multiple: bool) -> EvidenceValue {
    let Some(segments) = parse_path(path) else { return EvidenceValue::Absent };
    let mut current = doc;
    for segment in &segments {
        let next = match (segment, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k),
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return EvidenceValue::Absent,
        }
    }
    match current {
        Value::Null => EvidenceValue::Absent,
        Value::Array(items) if multiple => EvidenceValue::Multiple(items.iter().filter_map(leaf_scalar).collect()),
        other => leaf_scalar(other).map(EvidenceValue::Found).unwrap_or(EvidenceValue::Absent),
    }
}

fn leaf_scalar(value: &Value) -> Option<Scalar> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        Value::Number(n) => n.as_f64().map(Scalar::Number),
        Value::String(s) => Some(Scalar::Text(s.clone())),
        Value::Array(items) if items.iter().all(|i| !i.is_array() && !i.is_object()) => {
            Some(Scalar::Text(items.iter().filter_map(leaf_scalar).map(|s| s.to_string()).collect::<Vec<_>>().join(",")))
        }
        other => Some(Scalar::Text(other.to_string())),
    }
}

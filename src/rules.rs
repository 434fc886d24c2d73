//! Benchmark rule documents.
//!
//! Rule files are YAML in the kube-bench layout (`controls` → `groups` →
//! `checks` → `tests.test_items`). They are parsed into loosely typed raw
//! structs and then validated once into the strongly typed model the engine
//! evaluates. A file that fails validation is rejected as a whole.

use crate::compare::{CompareOp, Comparison, Expected};
use crate::config::ComponentType;
use crate::model::{AutoRemediation, CheckType};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Benchmark {
    pub id: String,
    pub text: String,
    pub version: Option<String>,
    pub component: ComponentType,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub text: String,
    pub checks: Vec<CheckDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub id: String,
    pub text: String,
    /// `Automated`, `Manual` or `Skip`; never `Error`.
    pub check_type: CheckType,
    pub scored: bool,
    pub audit: AuditSources,
    pub tests: TestGroup,
    pub use_multiple_values: bool,
    pub remediation: String,
    pub auto_remediation: Option<AutoRemediation>,
}

/// Check-level commands whose output feeds the test items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSources {
    /// Output is scanned for command-line flags.
    pub flags: Option<String>,
    /// Output is a YAML/JSON document walked by `path` items.
    pub config: Option<String>,
    /// Output is `NAME=value` lines read by `env` items.
    pub env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestGroup {
    pub op: BinOp,
    pub items: Vec<TestItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceSource {
    Flag(String),
    Path(String),
    Env(String),
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceSource::Flag(name) => write!(f, "flag {}", name),
            EvidenceSource::Path(path) => write!(f, "path {}", path),
            EvidenceSource::Env(name) => write!(f, "env {}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestItem {
    pub source: EvidenceSource,
    /// Tried in order when `source` yields nothing (flag, then path, then env).
    pub alternates: Vec<EvidenceSource>,
    /// `Some(true)`: value must be present. `Some(false)`: value must be absent.
    pub set: Option<bool>,
    pub compare: Option<Comparison>,
}

impl TestItem {
    pub fn sources(&self) -> impl Iterator<Item = &EvidenceSource> { std::iter::once(&self.source).chain(self.alternates.iter()) }
}

impl Benchmark {
    pub fn checks(&self) -> impl Iterator<Item = &CheckDefinition> { self.groups.iter().flat_map(|g| g.checks.iter()) }

    pub fn count_by_type(&self, check_type: CheckType) -> usize { self.checks().filter(|c| c.check_type == check_type).count() }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{location}: {message}")]
pub struct ValidationError {
    pub location: String,
    pub message: String,
}

impl ValidationError {
    fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self { location: location.into(), message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("cannot read rule file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("invalid YAML in {path}: {source}")]
    Yaml { path: PathBuf, #[source] source: serde_yaml::Error },
    #[error("invalid rule file {path}: {source}")]
    Invalid { path: PathBuf, #[source] source: ValidationError },
}

#[derive(Debug, Deserialize)]
struct RawControls {
    id: Option<Value>,
    text: Option<String>,
    #[serde(rename = "type")]
    component: Option<String>,
    version: Option<String>,
    groups: Option<Vec<RawGroup>>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    id: Option<Value>,
    text: Option<String>,
    #[serde(rename = "type")]
    group_type: Option<String>,
    checks: Option<Vec<RawCheck>>,
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    id: Option<Value>,
    text: Option<String>,
    audit: Option<String>,
    audit_config: Option<String>,
    audit_env: Option<String>,
    #[serde(rename = "type")]
    check_type: Option<String>,
    tests: Option<RawTests>,
    remediation: Option<String>,
    scored: Option<bool>,
    #[serde(default)]
    use_multiple_values: bool,
    auto_remediation: Option<AutoRemediation>,
}

#[derive(Debug, Deserialize)]
struct RawTests {
    bin_op: Option<String>,
    test_items: Option<Vec<RawTestItem>>,
}

#[derive(Debug, Deserialize)]
struct RawTestItem {
    flag: Option<String>,
    path: Option<String>,
    env: Option<String>,
    set: Option<bool>,
    compare: Option<RawCompare>,
}

#[derive(Debug, Deserialize)]
struct RawCompare {
    op: Option<String>,
    value: Option<Value>,
}

pub fn load_file(path: &Path) -> Result<Benchmark, RuleError> {
    let content = fs::read_to_string(path).map_err(|source| RuleError::Io { path: path.to_path_buf(), source })?;
    parse_str(&content, path)
}

/// `origin` is only used in error messages.
pub fn parse_str(content: &str, origin: &Path) -> Result<Benchmark, RuleError> {
    let raw: RawControls = serde_yaml::from_str(content).map_err(|source| RuleError::Yaml { path: origin.to_path_buf(), source })?;
    let benchmark = validate(raw).map_err(|source| RuleError::Invalid { path: origin.to_path_buf(), source })?;
    debug!(
        file = %origin.display(),
        groups = benchmark.groups.len(),
        automated = benchmark.count_by_type(CheckType::Automated),
        manual = benchmark.count_by_type(CheckType::Manual),
        "loaded rule file"
    );
    Ok(benchmark)
}

fn id_text(value: Option<&Value>, location: &str) -> Result<String, ValidationError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if n.is_f64() => Err(ValidationError::new(
            location,
            format!("numeric id `{}` must be quoted (e.g. \"5.10\") so trailing zeros are kept", n),
        )),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ValidationError::new(location, "`id` must be a string or number")),
        None => Err(ValidationError::new(location, "missing required field `id`")),
    }
}

fn required_text(value: Option<String>, field: &str, location: &str) -> Result<String, ValidationError> {
    value.ok_or_else(|| ValidationError::new(location, format!("missing required field `{}`", field)))
}

fn validate(raw: RawControls) -> Result<Benchmark, ValidationError> {
    let id = id_text(raw.id.as_ref(), "root")?;
    let text = required_text(raw.text, "text", "root")?;
    let component_name = required_text(raw.component, "type", "root")?;
    let component = ComponentType::ALL
        .into_iter()
        .find(|c| c.as_str() == component_name.trim())
        .ok_or_else(|| ValidationError::new("root", format!("unknown component type `{}`", component_name)))?;
    let raw_groups = raw.groups.unwrap_or_default();
    if raw_groups.is_empty() {
        return Err(ValidationError::new("root", "`groups` must be a non-empty list"));
    }
    let check_id = Regex::new(r"^[0-9][0-9.]*$").map_err(|e| ValidationError::new("root", e.to_string()))?;
    let mut groups = Vec::with_capacity(raw_groups.len());
    for (idx, raw_group) in raw_groups.into_iter().enumerate() {
        groups.push(validate_group(raw_group, idx, &check_id)?);
    }
    Ok(Benchmark { id, text, version: raw.version, component, groups })
}

fn validate_group(raw: RawGroup, idx: usize, check_id: &Regex) -> Result<Group, ValidationError> {
    let location = format!("group #{}", idx);
    let id = id_text(raw.id.as_ref(), &location)?;
    let location = format!("group {}", id);
    let text = required_text(raw.text, "text", &location)?;
    let skip_all = match raw.group_type.as_deref() {
        None | Some("automated") | Some("manual") => false,
        Some("skip") => true,
        Some(other) => return Err(ValidationError::new(location, format!("invalid group type `{}`", other))),
    };
    let raw_checks = raw.checks.ok_or_else(|| ValidationError::new(&location, "missing required field `checks`"))?;
    let mut checks = Vec::with_capacity(raw_checks.len());
    for (cidx, raw_check) in raw_checks.into_iter().enumerate() {
        let mut check = validate_check(raw_check, &id, cidx, check_id)?;
        if skip_all { check.check_type = CheckType::Skip; }
        checks.push(check);
    }
    Ok(Group { id, text, checks })
}

fn validate_check(raw: RawCheck, group_id: &str, idx: usize, id_format: &Regex) -> Result<CheckDefinition, ValidationError> {
    let id = id_text(raw.id.as_ref(), &format!("group {} check #{}", group_id, idx))?;
    let location = format!("check {}", id);
    if !id_format.is_match(&id) {
        return Err(ValidationError::new(location, "check id must be dotted numeric, e.g. 1.2.9"));
    }
    let text = required_text(raw.text, "text", &location)?;
    let check_type = match raw.check_type.as_deref().map(str::trim) {
        None | Some("automated") | Some("") => CheckType::Automated,
        Some("manual") => CheckType::Manual,
        Some("skip") => CheckType::Skip,
        Some(other) => return Err(ValidationError::new(location, format!("invalid check type `{}`", other))),
    };
    // manual checks are advisory by definition
    let scored = if check_type == CheckType::Manual { false } else { raw.scored.unwrap_or(true) };
    let audit = AuditSources {
        flags: raw.audit.filter(|s| !s.trim().is_empty()),
        config: raw.audit_config.filter(|s| !s.trim().is_empty()),
        env: raw.audit_env.filter(|s| !s.trim().is_empty()),
    };

    let (op, raw_items) = match raw.tests {
        Some(tests) => {
            let op = match tests.bin_op.as_deref().map(str::trim) {
                None | Some("") | Some("and") => BinOp::And,
                Some("or") => BinOp::Or,
                Some(other) => return Err(ValidationError::new(location, format!("invalid bin_op `{}`", other))),
            };
            (op, tests.test_items.unwrap_or_default())
        }
        None => (BinOp::And, Vec::new()),
    };
    let mut items = Vec::with_capacity(raw_items.len());
    for (iidx, raw_item) in raw_items.into_iter().enumerate() {
        items.push(validate_item(raw_item, &format!("{} test item #{}", location, iidx))?);
    }

    if check_type == CheckType::Automated {
        if items.is_empty() {
            return Err(ValidationError::new(location, "automated check has no test items"));
        }
        let needs_flags = items.iter().any(|i| matches!(i.source, EvidenceSource::Flag(_)));
        if needs_flags && audit.flags.is_none() {
            return Err(ValidationError::new(location, "flag test items require an `audit` command"));
        }
    }

    Ok(CheckDefinition {
        id,
        text,
        check_type,
        scored,
        audit,
        tests: TestGroup { op, items },
        use_multiple_values: raw.use_multiple_values,
        remediation: raw.remediation.unwrap_or_default(),
        auto_remediation: raw.auto_remediation.filter(|a| !a.command.trim().is_empty()),
    })
}

fn validate_item(raw: RawTestItem, location: &str) -> Result<TestItem, ValidationError> {
    let mut sources = Vec::new();
    if let Some(flag) = raw.flag.filter(|s| !s.trim().is_empty()) { sources.push(EvidenceSource::Flag(flag.trim().to_string())); }
    if let Some(path) = raw.path.filter(|s| !s.trim().is_empty()) { sources.push(EvidenceSource::Path(path.trim().to_string())); }
    if let Some(env) = raw.env.filter(|s| !s.trim().is_empty()) { sources.push(EvidenceSource::Env(env.trim().to_string())); }
    if sources.is_empty() {
        return Err(ValidationError::new(location, "test item must name one of `flag`, `path`, `env`"));
    }
    let source = sources.remove(0);

    let compare = match raw.compare {
        Some(c) => Some(validate_compare(c, location)?),
        None => None,
    };
    if raw.set == Some(false) && compare.is_some() {
        warn!(location, "`set: false` item also has `compare`; the comparison is ignored");
    }
    Ok(TestItem { source, alternates: sources, set: raw.set, compare })
}

fn validate_compare(raw: RawCompare, location: &str) -> Result<Comparison, ValidationError> {
    let op_name = raw.op.ok_or_else(|| ValidationError::new(location, "`compare` requires `op`"))?;
    let op: CompareOp = op_name.trim().parse().map_err(|e: String| ValidationError::new(location, e))?;
    let value = match raw.value {
        Some(Value::Bool(b)) => Expected::Bool(b),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) => Expected::Number(f),
            None => return Err(ValidationError::new(location, "numeric compare value out of range")),
        },
        Some(Value::String(s)) => Expected::Text(s),
        Some(Value::Sequence(items)) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => list.push(s),
                    Value::Number(n) => list.push(n.to_string()),
                    Value::Bool(b) => list.push(b.to_string()),
                    _ => return Err(ValidationError::new(location, "compare value lists may only hold scalars")),
                }
            }
            Expected::List(list)
        }
        Some(_) => return Err(ValidationError::new(location, "compare value must be a scalar or a list")),
        None => return Err(ValidationError::new(location, "`compare` requires `value`")),
    };
    let comparison = Comparison::new(op, value);
    check_operand(&comparison).map_err(|msg| ValidationError::new(location, msg))?;
    Ok(comparison)
}

/// Reject operands the operator can never accept, so typos surface at load
/// time instead of as silent failures.
fn check_operand(comparison: &Comparison) -> Result<(), String> {
    let text = comparison.value.to_string();
    match comparison.op {
        op if op.is_numeric() => {
            if matches!(comparison.value, Expected::Number(_)) || text.trim().parse::<f64>().is_ok() {
                Ok(())
            } else {
                Err(format!("`{}` needs a numeric value, got `{}`", op, text))
            }
        }
        CompareOp::Bitmask => match crate::compare::parse_octal(&text) {
            Some(_) => Ok(()),
            None => Err(format!("`bitmask` needs octal permission bits, got `{}`", text)),
        },
        CompareOp::Regex => Regex::new(&text).map(|_| ()).map_err(|e| format!("invalid regex: {}", e)),
        _ => Ok(()),
    }
}

/// Expand rule file arguments (literal paths or glob patterns) and, when
/// given, every `*.yaml`/`*.yml` under `dir`. Settings files named
/// `config.yaml` are not rule files and are skipped during the directory
/// walk. Order: arguments first, then the walk in sorted order; duplicates
/// are dropped.
pub fn discover(patterns: &[String], dir: Option<&Path>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    let push = |p: PathBuf, files: &mut Vec<PathBuf>| {
        if !files.contains(&p) { files.push(p); }
    };
    for pattern in patterns {
        let matched: Vec<PathBuf> = match glob::glob(pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid glob pattern; using it as a literal path");
                Vec::new()
            }
        };
        if matched.is_empty() {
            // let loading report the missing file
            push(PathBuf::from(pattern), &mut files);
        } else {
            for p in matched { push(p, &mut files); }
        }
    }
    if let Some(dir) = dir {
        let mut walked: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")))
            .filter(|p| !matches!(p.file_stem().and_then(|s| s.to_str()), Some("config")))
            .collect();
        walked.sort();
        for p in walked { push(p, &mut files); }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = r#"
controls:
version: "cis-1.10"
id: 1
text: "Control Plane Security Configuration"
type: "master"
groups:
  - id: "1.2"
    text: "API Server"
    checks:
      - id: 1.2.9
        text: "Ensure that the --kubelet-certificate-authority argument is set as appropriate"
        audit: "/bin/ps -ef | grep $apiserverbin | grep -v grep"
        tests:
          test_items:
            - flag: "--kubelet-certificate-authority"
              compare:
                op: eq
                value: "false"
        remediation: "Edit $apiserverconf and set --kubelet-certificate-authority."
        scored: true
      - id: "1.2.10"
        text: "Ensure that the admission control plugin EventRateLimit is set"
        type: manual
        remediation: "Follow the documentation."
        scored: true
      - id: 1.2.11
        text: "Kubelet anonymous auth"
        audit: "/bin/ps -fC $kubeletbin"
        audit_config: "/bin/cat $kubeletconf"
        tests:
          bin_op: or
          test_items:
            - flag: "--anonymous-auth"
              path: "{.authentication.anonymous.enabled}"
              set: true
              compare:
                op: eq
                value: false
            - env: "KUBELET_ANON"
        auto_remediation:
          command: "sed -i 's/--anonymous-auth=true/--anonymous-auth=false/' $apiserverconf"
          requires_sudo: true
"#;

    fn parse(yaml: &str) -> Result<Benchmark, RuleError> { parse_str(yaml, Path::new("test.yaml")) }

    fn invalid_message(yaml: &str) -> String {
        match parse(yaml) {
            Err(RuleError::Invalid { source, .. }) => source.to_string(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn parses_a_kube_bench_style_document() {
        let b = parse(MASTER).unwrap();
        assert_eq!(b.id, "1");
        assert_eq!(b.component, ComponentType::Master);
        assert_eq!(b.version.as_deref(), Some("cis-1.10"));
        let group = &b.groups[0];
        assert_eq!(group.id, "1.2");
        assert_eq!(group.checks.len(), 3);

        let first = &group.checks[0];
        assert_eq!(first.id, "1.2.9");
        assert_eq!(first.check_type, CheckType::Automated);
        assert_eq!(first.tests.op, BinOp::And);
        assert_eq!(first.tests.items[0].source, EvidenceSource::Flag("--kubelet-certificate-authority".into()));
        assert_eq!(first.tests.items[0].compare, Some(Comparison::new(CompareOp::Eq, Expected::Text("false".into()))));

        let manual = &group.checks[1];
        assert_eq!(manual.check_type, CheckType::Manual);
        assert!(!manual.scored);

        let third = &group.checks[2];
        assert_eq!(third.tests.op, BinOp::Or);
        assert_eq!(third.tests.items[0].alternates, vec![EvidenceSource::Path("{.authentication.anonymous.enabled}".into())]);
        assert_eq!(third.tests.items[0].compare.as_ref().map(|c| c.value.clone()), Some(Expected::Bool(false)));
        assert_eq!(third.audit.config.as_deref(), Some("/bin/cat $kubeletconf"));
        let auto = third.auto_remediation.as_ref().unwrap();
        assert!(auto.requires_sudo);
        assert!(auto.dry_run_safe);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let yaml = MASTER.replace("op: eq\n                value: \"false\"", "op: equals\n                value: \"false\"");
        assert!(invalid_message(&yaml).contains("unknown comparison operator `equals`"));
    }

    #[test]
    fn invalid_bin_op_and_type_are_rejected() {
        assert!(invalid_message(&MASTER.replace("bin_op: or", "bin_op: xor")).contains("invalid bin_op"));
        assert!(invalid_message(&MASTER.replace("type: manual", "type: sometimes")).contains("invalid check type"));
    }

    #[test]
    fn check_ids_must_be_dotted_numbers() {
        let yaml = MASTER.replace("id: 1.2.9", "id: one-two-nine");
        assert!(invalid_message(&yaml).contains("dotted numeric"));
    }

    #[test]
    fn decimal_ids_must_be_quoted() {
        let message = invalid_message(&MASTER.replace("  - id: \"1.2\"", "  - id: 5.10"));
        assert!(message.contains("`5.1` must be quoted"), "{}", message);
        let b = parse(&MASTER.replace("  - id: \"1.2\"", "  - id: \"5.10\"")).unwrap();
        assert_eq!(b.groups[0].id, "5.10");
        // integer ids stay accepted unquoted
        assert_eq!(b.id, "1");
    }

    #[test]
    fn missing_root_fields_are_reported() {
        let msg = invalid_message("id: 1\ntext: x\ngroups: []\n");
        assert!(msg.contains("`type`"), "{}", msg);
        let msg = invalid_message("id: 1\ntext: x\ntype: node\ngroups: []\n");
        assert!(msg.contains("non-empty"), "{}", msg);
    }

    #[test]
    fn operands_are_checked_at_load_time() {
        let bad_regex = MASTER.replace("op: eq\n                value: \"false\"", "op: regex\n                value: \"(oops\"");
        assert!(invalid_message(&bad_regex).contains("invalid regex"));
        let bad_mask = MASTER.replace("op: eq\n                value: \"false\"", "op: bitmask\n                value: \"rw\"");
        assert!(invalid_message(&bad_mask).contains("octal"));
        let bad_num = MASTER.replace("op: eq\n                value: \"false\"", "op: gte\n                value: \"lots\"");
        assert!(invalid_message(&bad_num).contains("numeric"));
    }

    #[test]
    fn automated_flag_checks_need_an_audit_command() {
        let yaml = MASTER.replace("        audit: \"/bin/ps -ef | grep $apiserverbin | grep -v grep\"\n", "");
        assert!(invalid_message(&yaml).contains("require an `audit` command"));
    }

    #[test]
    fn test_items_need_an_evidence_source() {
        let yaml = MASTER.replace("            - env: \"KUBELET_ANON\"", "            - set: true");
        assert!(invalid_message(&yaml).contains("must name one of"));
    }

    #[test]
    fn skip_groups_mark_every_check_skipped() {
        let yaml = MASTER.replace("    text: \"API Server\"", "    text: \"API Server\"\n    type: skip");
        let b = parse(&yaml).unwrap();
        assert!(b.checks().all(|c| c.check_type == CheckType::Skip));
    }

    #[test]
    fn malformed_yaml_is_a_yaml_error() {
        assert!(matches!(parse("groups: [unterminated"), Err(RuleError::Yaml { .. })));
    }

    #[test]
    fn discover_walks_directories_and_skips_settings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("node.yaml"), "x").unwrap();
        std::fs::write(dir.path().join("master.yml"), "x").unwrap();
        std::fs::write(dir.path().join("config.yaml"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let found = discover(&[], Some(dir.path()));
        let names: Vec<_> = found.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["master.yml", "node.yaml"]);

        let pattern = format!("{}/*.yaml", dir.path().display());
        let globbed = discover(&[pattern], Some(dir.path()));
        assert_eq!(globbed.len(), 3, "glob hits config.yaml explicitly, walk adds master.yml");
    }

    #[test]
    fn shipped_benchmarks_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("cfg");
        let files = discover(&[], Some(&dir));
        assert_eq!(files.len(), 4);
        for file in files {
            let b = load_file(&file).unwrap_or_else(|e| panic!("{}", e));
            assert!(b.checks().count() > 0, "{} has no checks", file.display());
        }
    }
}

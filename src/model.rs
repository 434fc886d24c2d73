use crate::config::ComponentType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Warn,
    Fail,
    Info,
}

impl Status {
    pub fn is_fail(&self) -> bool { matches!(self, Status::Fail) }
    pub fn is_warn(&self) -> bool { matches!(self, Status::Warn) }
    pub fn needs_attention(&self) -> bool { matches!(self, Status::Fail | Status::Warn) }

    pub fn as_str(&self) -> &'static str {
        match self { Status::Pass => "PASS", Status::Warn => "WARN", Status::Fail => "FAIL", Status::Info => "INFO" }
    }

    /// Status table for a finished check. Unscored failures are advisory and
    /// come out as WARN; an indeterminate verdict is always WARN.
    pub fn derive(check_type: CheckType, scored: bool, passed: Option<bool>) -> Status {
        match (check_type, scored, passed) {
            (CheckType::Manual, _, _) => Status::Warn,
            (CheckType::Error, _, _) => Status::Fail,
            (CheckType::Skip, _, _) => Status::Info,
            (CheckType::Automated, _, Some(true)) => Status::Pass,
            (CheckType::Automated, true, Some(false)) => Status::Fail,
            (CheckType::Automated, false, Some(false)) => Status::Warn,
            (CheckType::Automated, _, None) => Status::Warn,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Verdict category of a result. `Error` never appears in a rule file; it
/// marks a check whose evidence could not be gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Automated,
    Manual,
    Skip,
    Error,
}

/// A typed leaf pulled out of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self { Scalar::Text(value.into()) }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Result of extracting one test item's evidence. Built fresh for every
/// evaluation; live state may change between runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceValue {
    Absent,
    Found(Scalar),
    Multiple(Vec<Scalar>),
}

impl EvidenceValue {
    pub fn is_present(&self) -> bool {
        match self {
            EvidenceValue::Absent => false,
            EvidenceValue::Found(_) => true,
            EvidenceValue::Multiple(values) => !values.is_empty(),
        }
    }

    pub fn render(&self) -> Option<String> {
        match self {
            EvidenceValue::Absent => None,
            EvidenceValue::Found(v) => Some(v.to_string()),
            EvidenceValue::Multiple(values) if values.is_empty() => None,
            EvidenceValue::Multiple(values) => Some(values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Which source produced the value, e.g. `flag --anonymous-auth`.
    pub source: String,
    pub found: bool,
    pub value: Option<String>,
    pub passed: bool,
    pub message: String,
}

/// Structured, executable fix attached to a check, distinct from the free
/// text remediation advice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRemediation {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requires_sudo: bool,
    #[serde(default = "default_true")]
    pub dry_run_safe: bool,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub text: String,
    pub group_id: String,
    pub component: ComponentType,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub scored: bool,
    pub passed: Option<bool>,
    pub status: Status,
    pub items: Vec<ItemOutcome>,
    pub error: Option<String>,
    pub remediation: String,
    pub auto_remediation: Option<AutoRemediation>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationState {
    Previewed,
    Declined,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub check_id: String,
    /// Exactly what ran (or would run), placeholders already resolved.
    pub command: String,
    pub description: Option<String>,
    pub state: RemediationState,
    pub executed: bool,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Interrupted,
}

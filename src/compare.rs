//! Comparison operators applied to extracted evidence.
//!
//! Every operator fails closed: malformed operands make the comparison false,
//! never an error.

use crate::model::{EvidenceValue, Scalar};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Noteq,
    Has,
    Nothave,
    Gte,
    Lte,
    Gt,
    Lt,
    Bitmask,
    Regex,
    ValidElements,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Noteq => "noteq",
            CompareOp::Has => "has",
            CompareOp::Nothave => "nothave",
            CompareOp::Gte => "gte",
            CompareOp::Lte => "lte",
            CompareOp::Gt => "gt",
            CompareOp::Lt => "lt",
            CompareOp::Bitmask => "bitmask",
            CompareOp::Regex => "regex",
            CompareOp::ValidElements => "valid_elements",
        }
    }

    pub fn is_numeric(&self) -> bool { matches!(self, CompareOp::Gte | CompareOp::Lte | CompareOp::Gt | CompareOp::Lt) }
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" => CompareOp::Eq,
            "noteq" => CompareOp::Noteq,
            "has" => CompareOp::Has,
            "nothave" => CompareOp::Nothave,
            "gte" => CompareOp::Gte,
            "lte" => CompareOp::Lte,
            "gt" => CompareOp::Gt,
            "lt" => CompareOp::Lt,
            "bitmask" => CompareOp::Bitmask,
            "regex" => CompareOp::Regex,
            "valid_elements" => CompareOp::ValidElements,
            other => return Err(format!("unknown comparison operator `{}`", other)),
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Right-hand side of a comparison as written in the rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl Expected {
    fn as_text(&self) -> String {
        match self {
            Expected::Bool(b) => b.to_string(),
            Expected::Number(n) => Scalar::Number(*n).to_string(),
            Expected::Text(s) => s.clone(),
            Expected::List(items) => items.join(","),
        }
    }

    fn allow_list(&self) -> Vec<String> {
        match self {
            Expected::List(items) => items.iter().map(|s| s.trim().to_string()).collect(),
            other => other.as_text().split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        }
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.as_text()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub op: CompareOp,
    pub value: Expected,
}

impl Comparison {
    pub fn new(op: CompareOp, value: Expected) -> Self { Self { op, value } }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.op, self.value) }
}

/// Apply `comparison` to extracted evidence. Absence fails everything except
/// `nothave`; a value list passes only when every element passes.
pub fn compare(value: &EvidenceValue, comparison: &Comparison) -> bool {
    match value {
        EvidenceValue::Absent => comparison.op == CompareOp::Nothave,
        EvidenceValue::Multiple(values) if values.is_empty() => comparison.op == CompareOp::Nothave,
        EvidenceValue::Multiple(values) => values.iter().all(|v| compare_scalar(v, comparison)),
        EvidenceValue::Found(v) => compare_scalar(v, comparison),
    }
}

pub fn compare_scalar(actual: &Scalar, comparison: &Comparison) -> bool {
    let actual_text = actual.to_string();
    let actual_text = actual_text.trim();
    let expected = &comparison.value;
    match comparison.op {
        CompareOp::Eq => values_equal(actual, actual_text, expected),
        CompareOp::Noteq => !values_equal(actual, actual_text, expected),
        CompareOp::Has => actual_text.contains(expected.as_text().as_str()),
        CompareOp::Nothave => !actual_text.contains(expected.as_text().as_str()),
        CompareOp::Gte => numeric(actual, expected, |a, e| a >= e),
        CompareOp::Lte => numeric(actual, expected, |a, e| a <= e),
        CompareOp::Gt => numeric(actual, expected, |a, e| a > e),
        CompareOp::Lt => numeric(actual, expected, |a, e| a < e),
        CompareOp::Bitmask => bitmask(actual_text, &expected.as_text()),
        CompareOp::Regex => match Regex::new(&expected.as_text()) {
            Ok(re) => re.is_match(actual_text),
            Err(_) => false,
        },
        CompareOp::ValidElements => {
            let allowed = expected.allow_list();
            actual_text.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|t| allowed.iter().any(|a| a == t))
        }
    }
}

fn as_number(scalar: &Scalar) -> Option<f64> {
    match scalar {
        Scalar::Number(n) => Some(*n),
        Scalar::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        Scalar::Bool(_) => None,
    }
}

fn expected_number(expected: &Expected) -> Option<f64> {
    match expected {
        Expected::Number(n) => Some(*n),
        Expected::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Case-sensitive text equality, except that two numeric-looking sides are
/// compared as numbers so `1.30` equals `1.3`.
fn values_equal(actual: &Scalar, actual_text: &str, expected: &Expected) -> bool {
    if let (Some(a), Some(e)) = (as_number(actual), expected_number(expected)) {
        return a == e;
    }
    actual_text == expected.as_text().trim()
}

fn numeric(actual: &Scalar, expected: &Expected, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), expected_number(expected)) {
        (Some(a), Some(e)) => op(a, e),
        _ => false,
    }
}

pub fn parse_octal(text: &str) -> Option<u32> {
    let digits = text.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() || digits.len() > 6 { return None; }
    u32::from_str_radix(digits, 8).ok()
}

/// Passes when the actual permission bits are no broader than the mask.
fn bitmask(actual: &str, expected: &str) -> bool {
    match (parse_octal(actual), parse_octal(expected)) {
        (Some(a), Some(mask)) => a & !mask == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(v: &str) -> EvidenceValue { EvidenceValue::Found(Scalar::text(v)) }
    fn cmp(op: CompareOp, v: &str) -> Comparison { Comparison::new(op, Expected::Text(v.into())) }

    #[test]
    fn only_nothave_succeeds_on_absence() {
        let ops = [
            CompareOp::Eq, CompareOp::Noteq, CompareOp::Has, CompareOp::Gte, CompareOp::Lte,
            CompareOp::Gt, CompareOp::Lt, CompareOp::Bitmask, CompareOp::Regex, CompareOp::ValidElements,
        ];
        for op in ops {
            assert!(!compare(&EvidenceValue::Absent, &cmp(op, "x")), "{} passed on absence", op);
        }
        assert!(compare(&EvidenceValue::Absent, &cmp(CompareOp::Nothave, "x")));
        assert!(compare(&EvidenceValue::Multiple(vec![]), &cmp(CompareOp::Nothave, "x")));
    }

    #[test]
    fn eq_is_case_sensitive_but_numeric_aware() {
        assert!(compare(&text("false"), &cmp(CompareOp::Eq, "false")));
        assert!(!compare(&text("False"), &cmp(CompareOp::Eq, "false")));
        assert!(compare(&text("1.30"), &Comparison::new(CompareOp::Eq, Expected::Number(1.3))));
        assert!(compare(&EvidenceValue::Found(Scalar::Bool(true)), &Comparison::new(CompareOp::Eq, Expected::Bool(true))));
        assert!(compare(&text("true"), &cmp(CompareOp::Noteq, "false")));
    }

    #[test]
    fn has_and_nothave_are_substring_tests() {
        let v = text("NodeRestriction,AlwaysPullImages");
        assert!(compare(&v, &cmp(CompareOp::Has, "NodeRestriction")));
        assert!(!compare(&v, &cmp(CompareOp::Nothave, "AlwaysPull")));
        assert!(compare(&v, &cmp(CompareOp::Nothave, "AlwaysAdmit")));
    }

    #[test]
    fn numeric_ops_fail_closed_on_garbage() {
        assert!(compare(&text("10"), &cmp(CompareOp::Gte, "10")));
        assert!(compare(&text("100"), &Comparison::new(CompareOp::Gt, Expected::Number(99.5))));
        assert!(compare(&text("3"), &cmp(CompareOp::Lt, "5")));
        assert!(!compare(&text("abc"), &cmp(CompareOp::Gte, "1")));
        assert!(!compare(&text("5"), &cmp(CompareOp::Lte, "many")));
    }

    #[test]
    fn bitmask_is_a_subset_test() {
        assert!(compare(&text("600"), &cmp(CompareOp::Bitmask, "644")));
        assert!(compare(&text("0600"), &cmp(CompareOp::Bitmask, "0644")));
        assert!(compare(&text("644"), &Comparison::new(CompareOp::Bitmask, Expected::Number(644.0))));
        assert!(!compare(&text("0777"), &cmp(CompareOp::Bitmask, "0644")));
        assert!(!compare(&text("rw-r--r--"), &cmp(CompareOp::Bitmask, "644")));
        assert!(!compare(&text("689"), &cmp(CompareOp::Bitmask, "777")));
    }

    #[test]
    fn regex_matches_anywhere_and_fails_closed_on_bad_pattern() {
        assert!(compare(&text("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"), &cmp(CompareOp::Regex, "AES_(128|256)_GCM")));
        assert!(!compare(&text("RC4"), &cmp(CompareOp::Regex, "^AES")));
        assert!(!compare(&text("anything"), &cmp(CompareOp::Regex, "(unclosed")));
    }

    #[test]
    fn valid_elements_requires_every_token_allowed() {
        let allow = cmp(CompareOp::ValidElements, "NodeRestriction, PodSecurity,EventRateLimit");
        assert!(compare(&text("NodeRestriction,PodSecurity"), &allow));
        assert!(!compare(&text("NodeRestriction,AlwaysAdmit"), &allow));
        let list = Comparison::new(CompareOp::ValidElements, Expected::List(vec!["a".into(), "b".into()]));
        assert!(compare(&text("b, a"), &list));
        assert!(compare(&text(""), &list));
    }

    #[test]
    fn multiple_values_must_all_pass() {
        let many = EvidenceValue::Multiple(vec![Scalar::text("600"), Scalar::text("644")]);
        assert!(compare(&many, &cmp(CompareOp::Bitmask, "644")));
        assert!(!compare(&many, &cmp(CompareOp::Bitmask, "600")));
    }

    #[test]
    fn parses_known_operators_only() {
        assert_eq!("valid_elements".parse::<CompareOp>(), Ok(CompareOp::ValidElements));
        assert!("contains".parse::<CompareOp>().is_err());
    }
}

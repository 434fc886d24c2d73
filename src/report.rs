use crate::collectors::HostInfo;
use crate::engine::RunSession;
use crate::model::{CheckResult, CheckType, RemediationState, RunStatus, Status};
use crate::remediate::RemediationSummary;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat { Text, Json }

#[derive(Clone, Copy, Debug)]
pub struct ReportOptions {
    /// Also list PASS and INFO results.
    pub verbose: bool,
    pub show_manual: bool,
    pub show_remediations: bool,
}

impl Default for ReportOptions {
    fn default() -> Self { Self { verbose: false, show_manual: true, show_remediations: true } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub pass: usize,
    pub fail: usize,
    pub warn: usize,
    pub info: usize,
}

impl Totals {
    pub fn of(results: &[CheckResult]) -> Self {
        let count = |s: Status| results.iter().filter(|r| r.status == s).count();
        Self { pass: count(Status::Pass), fail: count(Status::Fail), warn: count(Status::Warn), info: count(Status::Info) }
    }
}

pub struct RunReport<'a> {
    pub session: &'a RunSession,
    pub host: &'a HostInfo,
    pub remediation: Option<&'a RemediationSummary>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    started_at: String,
    duration: String,
    status: RunStatus,
    host: &'a HostInfo,
    totals: Totals,
    results: Vec<&'a CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<&'a RemediationSummary>,
}

pub struct Reporter {
    options: ReportOptions,
    format: OutputFormat,
}

impl Reporter {
    pub fn new(options: ReportOptions, format: OutputFormat) -> Self { Self { options, format } }

    pub fn render(&self, report: &RunReport<'_>) -> Result<String, serde_json::Error> {
        match self.format {
            OutputFormat::Text => Ok(self.render_text(report)),
            OutputFormat::Json => self.render_json(report),
        }
    }

    fn listed(&self, r: &CheckResult) -> bool {
        if !self.options.show_manual && r.check_type == CheckType::Manual { return false; }
        self.options.verbose || !matches!(r.status, Status::Pass | Status::Info)
    }

    fn render_text(&self, report: &RunReport<'_>) -> String {
        let session = report.session;
        let results = session.results();
        let mut out = String::new();
        let mut benchmark: Option<&str> = None;
        for group in session.groups() {
            if benchmark != Some(group.benchmark.as_str()) {
                let _ = writeln!(out, "[INFO] {} ({})", group.benchmark, group.component.section_title());
                benchmark = Some(group.benchmark.as_str());
            }
            let _ = writeln!(out, "[INFO] {} {}", group.id, group.text);
            for r in session.group_results(group) {
                if !self.listed(r) { continue; }
                let _ = writeln!(out, "[{}] {} {}", r.status, r.id, r.text);
                if let Some(error) = &r.error {
                    let _ = writeln!(out, "       error: {}", error);
                }
                if self.options.verbose {
                    for item in &r.items {
                        let _ = writeln!(out, "       {} {}", if item.passed { "ok:  " } else { "bad: " }, item.message);
                    }
                }
            }
        }

        if self.options.show_remediations {
            let pending: Vec<&CheckResult> = results
                .iter()
                .filter(|r| r.status.needs_attention())
                .filter(|r| self.options.show_manual || r.check_type != CheckType::Manual)
                .collect();
            if !pending.is_empty() {
                let _ = writeln!(out, "\n== Remediations ==");
                for r in pending {
                    let advice = if r.remediation.trim().is_empty() { "No remediation available." } else { r.remediation.trim() };
                    let _ = writeln!(out, "{} {}", r.id, advice);
                    if let Some(action) = &r.auto_remediation {
                        let _ = writeln!(out, "    auto-remediation: {}", action.command);
                    }
                    out.push('\n');
                }
            }
        }

        if let Some(summary) = report.remediation {
            let _ = writeln!(out, "\n== Auto-remediation ==");
            for o in &summary.outcomes {
                let state = match o.state {
                    RemediationState::Previewed => "DRY RUN",
                    RemediationState::Declined => "SKIPPED",
                    RemediationState::Succeeded => "FIXED",
                    RemediationState::Failed => "FAILED",
                };
                let _ = writeln!(out, "[{}] {} {}", state, o.check_id, o.command);
                if let Some(error) = &o.error {
                    let _ = writeln!(out, "       error: {}", error);
                }
            }
            let _ = writeln!(
                out,
                "{} available, {} executed, {} successful, {} failed",
                summary.available, summary.executed, summary.successful, summary.failed
            );
        }

        let totals = Totals::of(results);
        let _ = writeln!(out, "\n== Summary ==");
        let _ = writeln!(out, "{} checks PASS", totals.pass);
        let _ = writeln!(out, "{} checks FAIL", totals.fail);
        let _ = writeln!(out, "{} checks WARN", totals.warn);
        let _ = writeln!(out, "{} checks INFO", totals.info);
        let host = report.host;
        let _ = writeln!(
            out,
            "host: {} ({}, kernel {})",
            host.hostname.as_deref().unwrap_or("unknown"),
            host.os_pretty_name.as_deref().unwrap_or("unknown OS"),
            host.kernel_version.as_deref().unwrap_or("unknown")
        );
        let _ = writeln!(out, "started {}, took {}", started_at(session), elapsed(session));
        if session.status() == RunStatus::Interrupted {
            let _ = writeln!(out, "run interrupted: results are partial");
        }
        out
    }

    fn render_json(&self, report: &RunReport<'_>) -> Result<String, serde_json::Error> {
        let session = report.session;
        let doc = JsonReport {
            started_at: started_at(session),
            duration: elapsed(session),
            status: session.status(),
            host: report.host,
            totals: Totals::of(session.results()),
            results: session.results().iter().filter(|r| self.listed(r)).collect(),
            remediation: report.remediation,
        };
        serde_json::to_string_pretty(&doc)
    }
}

fn started_at(session: &RunSession) -> String { humantime::format_rfc3339_seconds(session.started_at).to_string() }

fn elapsed(session: &RunSession) -> String {
    let ms = session.elapsed().as_millis() as u64;
    humantime::format_duration(Duration::from_millis(ms)).to_string()
}

use crate::collectors::{CollectionError, CollectorSettings, CommandRunner, EvidenceCollector};
use crate::compare::compare;
use crate::config::{ComponentType, Settings};
use crate::extract::{extract, ExtractOptions};
use crate::model::{CheckResult, CheckType, EvidenceValue, ItemOutcome, RunStatus, Status};
use crate::rules::{Benchmark, BinOp, CheckDefinition, TestItem};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Cooperative interruption flag. Tripped from a signal handler, polled by
/// the run loop between groups and checks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// Restricts a run to some components, groups or check ids. Empty lists
/// allow everything.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub targets: Vec<ComponentType>,
    pub groups: Vec<String>,
    pub checks: Vec<String>,
}

impl Filters {
    fn allows_component(&self, component: ComponentType) -> bool { self.targets.is_empty() || self.targets.contains(&component) }
    fn allows_group(&self, id: &str) -> bool { self.groups.is_empty() || self.groups.iter().any(|g| g == id) }
    fn allows_check(&self, id: &str) -> bool { self.checks.is_empty() || self.checks.iter().any(|c| c == id) }
}

/// Group heading as it appeared in the run, for report sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub component: ComponentType,
    pub benchmark: String,
    pub id: String,
    pub text: String,
    /// Indices of this group's results in the session.
    pub results: Range<usize>,
}

/// Everything one invocation owns: start time, interruption flag and the
/// append-only result list.
#[derive(Debug)]
pub struct RunSession {
    pub started_at: SystemTime,
    started: Instant,
    cancel: CancelToken,
    results: Vec<CheckResult>,
    groups: Vec<GroupInfo>,
    status: RunStatus,
}

impl RunSession {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
            cancel,
            results: Vec::new(),
            groups: Vec::new(),
            status: RunStatus::Completed,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken { &self.cancel }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }
    pub fn results(&self) -> &[CheckResult] { &self.results }
    pub fn groups(&self) -> &[GroupInfo] { &self.groups }
    pub fn group_results(&self, group: &GroupInfo) -> &[CheckResult] { self.results.get(group.results.clone()).unwrap_or(&[]) }
    pub fn status(&self) -> RunStatus { self.status }
    pub fn elapsed(&self) -> Duration { self.started.elapsed() }
}

pub struct Engine<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    filters: Filters,
}

impl<'a> Engine<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self { Self { runner, settings, filters: Filters::default() } }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Evaluate every selected check in declaration order, appending to the
    /// session. Stops early, keeping what was produced, once the session is
    /// cancelled.
    pub fn run(&self, benchmarks: &[Benchmark], session: &mut RunSession) -> RunStatus {
        let status = self.run_inner(benchmarks, session);
        session.status = status;
        status
    }

    fn run_inner(&self, benchmarks: &[Benchmark], session: &mut RunSession) -> RunStatus {
        for benchmark in benchmarks.iter().filter(|b| self.filters.allows_component(b.component)) {
            for group in benchmark.groups.iter().filter(|g| self.filters.allows_group(&g.id)) {
                if session.is_cancelled() {
                    warn!(completed = session.results.len(), "run interrupted");
                    return RunStatus::Interrupted;
                }
                let mut slot: Option<usize> = None;
                for check in group.checks.iter().filter(|c| self.filters.allows_check(&c.id)) {
                    if session.is_cancelled() {
                        warn!(completed = session.results.len(), "run interrupted");
                        return RunStatus::Interrupted;
                    }
                    let idx = *slot.get_or_insert_with(|| {
                        let first = session.results.len();
                        session.groups.push(GroupInfo {
                            component: benchmark.component,
                            benchmark: benchmark.text.clone(),
                            id: group.id.clone(),
                            text: group.text.clone(),
                            results: first..first,
                        });
                        session.groups.len() - 1
                    });
                    let result = self.evaluate_isolated(check, &group.id, benchmark.component);
                    session.results.push(result);
                    session.groups[idx].results.end = session.results.len();
                }
            }
        }
        info!(checks = session.results.len(), "run completed");
        RunStatus::Completed
    }

    /// `evaluate`, with a panic turned into an error-typed result so one bad
    /// check never stops the run.
    pub fn evaluate_isolated(&self, check: &CheckDefinition, group_id: &str, component: ComponentType) -> CheckResult {
        let started = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(check, group_id, component))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(check_id = %check.id, %message, "check evaluation panicked");
                let mut result = self.base_result(check, group_id, component);
                self.finish_error(&mut result, format!("internal error: {}", message), started);
                result
            }
        }
    }

    pub fn evaluate(&self, check: &CheckDefinition, group_id: &str, component: ComponentType) -> CheckResult {
        let started = Instant::now();
        let mut result = self.base_result(check, group_id, component);
        match check.check_type {
            CheckType::Manual | CheckType::Skip | CheckType::Error => {
                debug!(check_id = %check.id, check_type = ?check.check_type, "not evaluated");
            }
            CheckType::Automated => match self.evaluate_items(check, component) {
                Ok((passed, items)) => {
                    result.passed = Some(passed);
                    result.items = items;
                }
                Err(e) => {
                    warn!(check_id = %check.id, error = %e, "evidence collection failed");
                    self.finish_error(&mut result, e.to_string(), started);
                    return result;
                }
            },
        }
        result.status = Status::derive(result.check_type, result.scored, result.passed);
        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(check_id = %check.id, status = %result.status, "check evaluated");
        result
    }

    fn base_result(&self, check: &CheckDefinition, group_id: &str, component: ComponentType) -> CheckResult {
        let remediation = self.settings.components.get(component).substitute(&check.remediation).text;
        CheckResult {
            id: check.id.clone(),
            text: check.text.clone(),
            group_id: group_id.to_string(),
            component,
            check_type: check.check_type,
            scored: check.scored,
            passed: None,
            status: Status::derive(check.check_type, check.scored, None),
            items: Vec::new(),
            error: None,
            remediation,
            auto_remediation: check.auto_remediation.clone(),
            duration_ms: 0,
        }
    }

    fn finish_error(&self, result: &mut CheckResult, message: String, started: Instant) {
        result.check_type = CheckType::Error;
        result.passed = Some(false);
        result.error = Some(message);
        result.status = Status::derive(CheckType::Error, result.scored, result.passed);
        result.duration_ms = started.elapsed().as_millis() as u64;
    }

    /// Evaluate all items against one fresh collector, then combine with the
    /// group operator. Any collection error aborts the check.
    fn evaluate_items(&self, check: &CheckDefinition, component: ComponentType) -> Result<(bool, Vec<ItemOutcome>), CollectionError> {
        let collector_settings = CollectorSettings { timeout: self.settings.audit_timeout, strict_placeholders: self.settings.strict_placeholders };
        let mut collector = EvidenceCollector::new(self.runner, component, self.settings.components.get(component), collector_settings);
        let opts = ExtractOptions { multiple: check.use_multiple_values, component };
        let mut outcomes = Vec::with_capacity(check.tests.items.len());
        for item in &check.tests.items {
            outcomes.push(evaluate_item(&mut collector, check, item, opts)?);
        }
        let passed = match check.tests.op {
            BinOp::And => outcomes.iter().all(|o| o.passed),
            BinOp::Or => outcomes.iter().any(|o| o.passed),
        };
        debug!(check_id = %check.id, commands = collector.commands_run(), passed, "items combined");
        Ok((passed, outcomes))
    }
}

/// Try the item's sources in order until one yields a value, then judge it.
/// Only the primary source may fail the check; an alternate that cannot be
/// read counts as absent.
fn evaluate_item(collector: &mut EvidenceCollector<'_>, check: &CheckDefinition, item: &TestItem, opts: ExtractOptions) -> Result<ItemOutcome, CollectionError> {
    let mut chosen = &item.source;
    let mut value = EvidenceValue::Absent;
    for (idx, source) in item.sources().enumerate() {
        let found = match collector.collect(source, &check.audit) {
            Ok(raw) => extract(raw, source, opts),
            Err(e) if idx == 0 => return Err(e),
            Err(e) => {
                debug!(check_id = %check.id, source = %source, error = %e, "alternate source unavailable");
                EvidenceValue::Absent
            }
        };
        if found.is_present() {
            chosen = source;
            value = found;
            break;
        }
    }

    let present = value.is_present();
    let passed = match (item.set, &item.compare) {
        (Some(false), _) => !present,
        (Some(true), Some(c)) => present && compare(&value, c),
        (None, Some(c)) => compare(&value, c),
        (_, None) => present,
    };
    let rendered = value.render();
    let message = match (item.set, &item.compare, &rendered) {
        (Some(false), _, None) => format!("{} is not set", chosen),
        (Some(false), _, Some(v)) => format!("{} is set to '{}' but must be unset", chosen, v),
        (_, Some(c), Some(v)) => format!("{} is '{}', expected {}", chosen, v, c),
        (_, Some(c), None) => format!("{} not found, expected {}", chosen, c),
        (_, None, Some(v)) => format!("{} is set to '{}'", chosen, v),
        (_, None, None) => format!("{} not found", chosen),
    };
    Ok(ItemOutcome { source: chosen.to_string(), found: present, value: rendered, passed, message })
}

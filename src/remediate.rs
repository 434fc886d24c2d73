//! Executes structured auto-remediation commands for failing checks.
//!
//! A remediation moves through `eligible → previewed | declined | executing
//! → succeeded | failed`. Commands run one at a time in result order and
//! are never retried.

use crate::collectors::{truncate, CommandRunner};
use crate::config::ComponentTable;
use crate::engine::CancelToken;
use crate::model::{CheckResult, RemediationOutcome, RemediationState};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

const OUTPUT_LIMIT: usize = 2048;

/// Operator approval for a single remediation.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Interactive yes/no prompt on the terminal. Defaults to "no"; a prompt
/// that cannot be shown counts as a refusal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        match dialoguer::Confirm::new().with_prompt(prompt).default(false).interact() {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "confirmation prompt failed; treating as declined");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemediationOptions {
    pub dry_run: bool,
    pub require_confirmation: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemediationSummary {
    pub available: usize,
    pub executed: usize,
    pub successful: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub outcomes: Vec<RemediationOutcome>,
}

impl RemediationSummary {
    fn record(&mut self, outcome: RemediationOutcome) {
        if outcome.executed {
            self.executed += 1;
            if outcome.success { self.successful += 1; } else { self.failed += 1; }
        }
        self.outcomes.push(outcome);
    }
}

/// FAIL or WARN with a structured command attached.
pub fn is_eligible(result: &CheckResult) -> bool { result.status.needs_attention() && result.auto_remediation.is_some() }

fn shell_quote(text: &str) -> String { format!("'{}'", text.replace('\'', r"'\''")) }

pub struct Remediator<'a> {
    runner: &'a dyn CommandRunner,
    components: &'a ComponentTable,
    timeout: Duration,
}

impl<'a> Remediator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, components: &'a ComponentTable, timeout: Duration) -> Self { Self { runner, components, timeout } }

    /// The command line that would run for `result`, placeholders resolved
    /// and wrapped in `sudo -n` when the action asks for it.
    pub fn command_for(&self, result: &CheckResult) -> Option<String> {
        let action = result.auto_remediation.as_ref()?;
        let command = self.components.get(result.component).substitute(&action.command).text;
        Some(if action.requires_sudo { format!("sudo -n sh -c {}", shell_quote(&command)) } else { command })
    }

    /// Returns `None` when the result is not eligible for remediation.
    pub fn remediate(&self, result: &CheckResult, opts: RemediationOptions, confirm: &dyn Confirm) -> Option<RemediationOutcome> {
        if !is_eligible(result) { return None; }
        let action = result.auto_remediation.as_ref()?;
        let command = self.command_for(result)?;
        let mut outcome = RemediationOutcome {
            check_id: result.id.clone(),
            command: command.clone(),
            description: action.description.clone(),
            state: RemediationState::Previewed,
            executed: false,
            success: false,
            exit_code: None,
            stdout: None,
            error: None,
        };

        if opts.dry_run {
            if !action.dry_run_safe {
                outcome.error = Some("remediation is not marked safe to preview".into());
            }
            info!(check_id = %result.id, %command, "dry run: remediation not executed");
            return Some(outcome);
        }

        if opts.require_confirmation {
            let label = action.description.as_deref().unwrap_or(&result.text);
            let prompt = format!("[{}] {}\n  run: {}\nApply this remediation?", result.id, label, command);
            if !confirm.confirm(&prompt) {
                info!(check_id = %result.id, "remediation declined");
                outcome.state = RemediationState::Declined;
                return Some(outcome);
            }
        }

        info!(check_id = %result.id, %command, "executing remediation");
        outcome.executed = true;
        match self.runner.run(&command, self.timeout) {
            Ok(output) => {
                outcome.exit_code = output.code;
                outcome.stdout = Some(truncate(output.stdout.trim_end(), OUTPUT_LIMIT));
                if output.success() {
                    outcome.state = RemediationState::Succeeded;
                    outcome.success = true;
                } else {
                    outcome.state = RemediationState::Failed;
                    let stderr = truncate(output.stderr.trim(), OUTPUT_LIMIT);
                    outcome.error = Some(match output.code {
                        Some(code) if stderr.is_empty() => format!("exited with status {}", code),
                        Some(code) => format!("exited with status {}: {}", code, stderr),
                        None => "terminated by signal".to_string(),
                    });
                }
            }
            Err(e) => {
                outcome.state = RemediationState::Failed;
                outcome.error = Some(e.to_string());
            }
        }
        if !outcome.success {
            warn!(check_id = %result.id, error = outcome.error.as_deref().unwrap_or_default(), "remediation failed");
        }
        Some(outcome)
    }

    /// Remediate every eligible result in order, one command at a time.
    /// Stops before the next command once `cancel` is tripped.
    pub fn remediate_all(&self, results: &[CheckResult], opts: RemediationOptions, confirm: &dyn Confirm, cancel: &CancelToken) -> RemediationSummary {
        let mut summary = RemediationSummary { available: results.iter().filter(|r| is_eligible(r)).count(), ..Default::default() };
        for result in results.iter().filter(|r| is_eligible(r)) {
            if cancel.is_cancelled() {
                warn!(done = summary.outcomes.len(), "remediation interrupted");
                summary.interrupted = true;
                break;
            }
            if let Some(outcome) = self.remediate(result, opts, confirm) {
                summary.record(outcome);
            }
        }
        info!(
            available = summary.available,
            executed = summary.executed,
            successful = summary.successful,
            failed = summary.failed,
            "remediation finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::FakeRunner;
    use crate::collectors::ShellRunner;
    use crate::config::ComponentType;
    use crate::model::{AutoRemediation, CheckType, Status};

    struct Answer(bool);

    impl Confirm for Answer {
        fn confirm(&self, _prompt: &str) -> bool { self.0 }
    }

    fn failing(id: &str, command: &str, sudo: bool) -> CheckResult {
        CheckResult {
            id: id.into(),
            text: "Ensure that the API server pod specification file permissions are set to 600".into(),
            group_id: "1.1".into(),
            component: ComponentType::Master,
            check_type: CheckType::Automated,
            scored: true,
            passed: Some(false),
            status: Status::Fail,
            items: Vec::new(),
            error: None,
            remediation: String::new(),
            auto_remediation: Some(AutoRemediation { command: command.into(), description: None, requires_sudo: sudo, dry_run_safe: true }),
            duration_ms: 0,
        }
    }

    fn live() -> RemediationOptions { RemediationOptions { dry_run: false, require_confirmation: false } }

    #[test]
    fn dry_run_is_repeatable_and_runs_nothing() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new();
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let check = failing("1.1.1", "chmod 600 $apiserverconf", false);
        let opts = RemediationOptions { dry_run: true, require_confirmation: true };
        let first = r.remediate(&check, opts, &Answer(true)).unwrap();
        let second = r.remediate(&check, opts, &Answer(true)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.state, RemediationState::Previewed);
        assert!(!first.executed);
        assert_eq!(first.command, "chmod 600 /etc/kubernetes/manifests/kube-apiserver.yaml");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn declining_is_not_an_error() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new();
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let opts = RemediationOptions { dry_run: false, require_confirmation: true };
        let outcome = r.remediate(&failing("1.1.1", "chmod 600 /x", false), opts, &Answer(false)).unwrap();
        assert_eq!(outcome.state, RemediationState::Declined);
        assert!(!outcome.executed);
        assert!(outcome.error.is_none());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn exit_status_decides_success() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_stdout("fix-ok", "done\n").with_exit("fix-bad", 3, "permission denied");
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let ok = r.remediate(&failing("1.1.1", "fix-ok", false), live(), &Answer(false)).unwrap();
        assert_eq!(ok.state, RemediationState::Succeeded);
        assert!(ok.executed && ok.success);
        assert_eq!(ok.stdout.as_deref(), Some("done"));
        let bad = r.remediate(&failing("1.1.2", "fix-bad", false), live(), &Answer(false)).unwrap();
        assert_eq!(bad.state, RemediationState::Failed);
        assert!(bad.executed && !bad.success);
        assert_eq!(bad.exit_code, Some(3));
        assert_eq!(bad.error.as_deref(), Some("exited with status 3: permission denied"));
    }

    #[test]
    fn timeout_is_a_failed_execution() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_timeout("systemctl restart kubelet");
        let r = Remediator::new(&runner, &table, Duration::from_secs(1));
        let outcome = r.remediate(&failing("4.2.1", "systemctl restart kubelet", false), live(), &Answer(true)).unwrap();
        assert!(outcome.executed);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap_or_default().contains("timed out"));
    }

    #[test]
    fn sudo_wraps_the_resolved_command() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new();
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let check = failing("1.1.1", "sed -i 's/a/b/' $apiserverconf", true);
        assert_eq!(
            r.command_for(&check).as_deref(),
            Some(r#"sudo -n sh -c 'sed -i '\''s/a/b/'\'' /etc/kubernetes/manifests/kube-apiserver.yaml'"#)
        );
    }

    #[test]
    fn passing_or_plain_checks_are_not_eligible() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new();
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let mut passed = failing("1.1.1", "true", false);
        passed.status = Status::Pass;
        assert!(r.remediate(&passed, live(), &Answer(true)).is_none());
        let mut advice_only = failing("1.1.2", "true", false);
        advice_only.auto_remediation = None;
        assert!(r.remediate(&advice_only, live(), &Answer(true)).is_none());
    }

    #[test]
    fn batch_runs_in_order_and_tallies() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_exit("second", 1, "nope");
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let mut pass = failing("1.1.3", "third", false);
        pass.status = Status::Pass;
        let results = vec![failing("1.1.1", "first", false), failing("1.1.2", "second", false), pass];
        let summary = r.remediate_all(&results, live(), &Answer(true), &CancelToken::new());
        assert_eq!(runner.calls(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!((summary.available, summary.executed, summary.successful, summary.failed), (2, 2, 1, 1));
        assert!(!summary.interrupted);
    }

    #[test]
    fn batch_stops_once_cancelled() {
        let table = ComponentTable::builtin();
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        let runner = FakeRunner::new().after_run(move |_| trip.cancel());
        let r = Remediator::new(&runner, &table, Duration::from_secs(5));
        let results = vec![failing("1.1.1", "first", false), failing("1.1.2", "second", false)];
        let summary = r.remediate_all(&results, live(), &Answer(true), &cancel);
        assert_eq!(summary.outcomes.len(), 1);
        assert!(summary.interrupted);
    }

    #[test]
    fn shell_runner_reports_real_exit_codes() {
        let table = ComponentTable::builtin();
        let r = Remediator::new(&ShellRunner, &table, Duration::from_secs(5));
        let ok = r.remediate(&failing("1.1.1", "echo fixed", false), live(), &Answer(true)).unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.as_deref(), Some("fixed"));
        let bad = r.remediate(&failing("1.1.2", "exit 4", false), live(), &Answer(true)).unwrap();
        assert_eq!(bad.exit_code, Some(4));
        assert!(!bad.success);
    }
}

use crate::config::{ComponentConfig, ComponentType};
use crate::rules::{AuditSources, EvidenceSource};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, warn};

const STDERR_LIMIT: usize = 512;
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, #[source] source: std::io::Error },
    #[error("error waiting for `{command}`: {source}")]
    Wait { command: String, #[source] source: std::io::Error },
    #[error("`{command}` timed out after {}", humantime::format_duration(*.timeout))]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with status {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    Exit { command: String, code: Option<i32>, stderr: String },
    #[error("cannot read config {origin}: {message}")]
    Config { origin: String, message: String },
    #[error("unresolved placeholders in `{text}`: {}", .names.iter().map(|n| format!("${}", n)).collect::<Vec<_>>().join(", "))]
    Unresolved { text: String, names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool { self.code == Some(0) }
}

/// Runs shell command strings. Spawn failures and timeouts are errors; a
/// non-zero exit is returned as output so callers can apply their own policy.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, CollectionError>;
}

/// Runs commands through `/bin/sh -c` (or bash for multi-line scripts) in a
/// process group of their own. The deadline covers the whole run, including
/// draining the pipes, and on expiry the entire group is killed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream { Stdout, Stderr }

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, CollectionError> {
        let shell = if command.contains('\n') && Path::new("/bin/bash").exists() { "/bin/bash" } else { "/bin/sh" };
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|source| CollectionError::Spawn { command: command.to_string(), source })?;
        let deadline = Instant::now() + timeout;
        let timed_out = || CollectionError::Timeout { command: command.to_string(), timeout };

        // Drain pipes on their own threads so a chatty child cannot fill the
        // pipe buffer and stall before we see it exit.
        let (tx, rx) = mpsc::channel();
        let mut pending = 0;
        if let Some(pipe) = child.stdout.take() { drain(pipe, Stream::Stdout, tx.clone()); pending += 1; }
        if let Some(pipe) = child.stderr.take() { drain(pipe, Stream::Stderr, tx.clone()); pending += 1; }
        drop(tx);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        kill_group(&mut child);
                        return Err(timed_out());
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    kill_group(&mut child);
                    return Err(CollectionError::Wait { command: command.to_string(), source });
                }
            }
        };

        // The shell is gone, but a background job may still hold the pipes open.
        let (mut stdout, mut stderr) = (String::new(), String::new());
        while pending > 0 {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok((Stream::Stdout, text)) => stdout = text,
                Ok((Stream::Stderr, text)) => stderr = text,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(command, "pipes still open after the shell exited");
                    kill_group(&mut child);
                    return Err(timed_out());
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            pending -= 1;
        }
        Ok(CommandOutput { code: status.code(), stdout, stderr })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// Kill the child's whole process group, then reap the shell.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        // process_group(0) made the shell's pid the group id
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn truncate(text: &str, limit: usize) -> String {
    let text = text.trim();
    if text.len() <= limit { return text.to_string(); }
    let mut end = limit;
    while !text.is_char_boundary(end) { end -= 1; }
    format!("{}...", &text[..end])
}

/// Raw evidence handed to the extractor, borrowed from the collector's cache.
#[derive(Debug, Clone, Copy)]
pub enum RawEvidence<'a> {
    /// Standard output of an audit command.
    Output(&'a str),
    /// A parsed configuration document.
    Document(&'a serde_json::Value),
    /// Environment of the target process.
    Environment(&'a BTreeMap<String, String>),
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub timeout: Duration,
    pub strict_placeholders: bool,
}

/// Gathers evidence for a single check. Each distinct command runs at most
/// once per collector; nothing is shared between checks.
pub struct EvidenceCollector<'a> {
    runner: &'a dyn CommandRunner,
    component_type: ComponentType,
    component: &'a ComponentConfig,
    settings: CollectorSettings,
    outputs: HashMap<String, String>,
    documents: HashMap<String, serde_json::Value>,
    environments: HashMap<String, BTreeMap<String, String>>,
}

impl<'a> EvidenceCollector<'a> {
    pub fn new(runner: &'a dyn CommandRunner, component_type: ComponentType, component: &'a ComponentConfig, settings: CollectorSettings) -> Self {
        Self {
            runner,
            component_type,
            component,
            settings,
            outputs: HashMap::new(),
            documents: HashMap::new(),
            environments: HashMap::new(),
        }
    }

    /// Number of distinct commands actually spawned so far.
    pub fn commands_run(&self) -> usize { self.outputs.len() }

    pub fn substitute(&self, text: &str) -> Result<String, CollectionError> {
        let out = self.component.substitute(text);
        if !out.unresolved.is_empty() {
            if self.settings.strict_placeholders {
                return Err(CollectionError::Unresolved { text: text.to_string(), names: out.unresolved });
            }
            debug!(unresolved = ?out.unresolved, "leaving unresolved placeholders literal");
        }
        Ok(out.text)
    }

    /// Gather the raw evidence a test item source reads from.
    pub fn collect(&mut self, source: &EvidenceSource, audit: &AuditSources) -> Result<RawEvidence<'_>, CollectionError> {
        match source {
            EvidenceSource::Flag(_) => {
                let command = audit.flags.as_deref().ok_or_else(|| CollectionError::Config {
                    origin: "audit".into(),
                    message: "no audit command for flag evidence".into(),
                })?;
                let key = self.audit_output(command)?;
                Ok(RawEvidence::Output(&self.outputs[&key]))
            }
            EvidenceSource::Path(_) => {
                let key = self.config_document(audit.config.as_deref())?;
                Ok(RawEvidence::Document(&self.documents[&key]))
            }
            EvidenceSource::Env(_) => {
                let key = self.environment(audit.env.as_deref())?;
                Ok(RawEvidence::Environment(&self.environments[&key]))
            }
        }
    }

    /// Run an audit command (once) and return its cache key.
    fn audit_output(&mut self, command: &str) -> Result<String, CollectionError> {
        let resolved = self.substitute(command)?;
        if self.outputs.contains_key(&resolved) {
            return Ok(resolved);
        }
        debug!(command = %resolved, component = %self.component_type, "running audit command");
        let output = self.runner.run(&resolved, self.settings.timeout)?;
        let accepted = match output.code {
            Some(0) => true,
            // grep-style "no match": exit 1 without complaint on stderr
            Some(1) => output.stderr.trim().is_empty(),
            _ => false,
        };
        if !accepted {
            return Err(CollectionError::Exit { command: resolved, code: output.code, stderr: truncate(&output.stderr, STDERR_LIMIT) });
        }
        self.outputs.insert(resolved.clone(), output.stdout);
        Ok(resolved)
    }

    fn config_document(&mut self, audit_config: Option<&str>) -> Result<String, CollectionError> {
        let (key, content, origin) = match audit_config {
            Some(command) => {
                let key = self.audit_output(command)?;
                let key = format!("cmd:{}", key);
                if self.documents.contains_key(&key) { return Ok(key); }
                let content = self.outputs[&key[4..]].clone();
                (key, content, command.to_string())
            }
            None => {
                let path = self.component.default_conf().ok_or_else(|| CollectionError::Config {
                    origin: self.component_type.to_string(),
                    message: "component has no default config file".into(),
                })?;
                let key = format!("file:{}", path);
                if self.documents.contains_key(&key) { return Ok(key); }
                let content = fs::read_to_string(path).map_err(|e| CollectionError::Config { origin: path.to_string(), message: e.to_string() })?;
                (key, content, path.to_string())
            }
        };
        let document = parse_document(&content).map_err(|message| CollectionError::Config { origin, message })?;
        self.documents.insert(key.clone(), document);
        Ok(key)
    }

    fn environment(&mut self, audit_env: Option<&str>) -> Result<String, CollectionError> {
        match audit_env {
            Some(command) => {
                let key = self.audit_output(command)?;
                let key = format!("cmd:{}", key);
                if !self.environments.contains_key(&key) {
                    let vars = parse_environment(&self.outputs[&key[4..]]);
                    self.environments.insert(key.clone(), vars);
                }
                Ok(key)
            }
            None => {
                let binary = self.component.default_bin().unwrap_or_default().to_string();
                let key = format!("proc:{}", binary);
                if !self.environments.contains_key(&key) {
                    let vars = match process_environment(&binary) {
                        Some(vars) => vars,
                        None => {
                            debug!(binary = %binary, "target process not running; reading own environment");
                            std::env::vars().collect()
                        }
                    };
                    self.environments.insert(key.clone(), vars);
                }
                Ok(key)
            }
        }
    }
}

/// Parse YAML or JSON. Blank input is an empty document, not an error.
pub fn parse_document(content: &str) -> Result<serde_json::Value, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Ok(value);
        }
    }
    serde_yaml::from_str::<serde_json::Value>(trimmed).map_err(|e| e.to_string())
}

/// `NAME=value` pairs separated by newlines or NULs (`/proc/<pid>/environ`).
pub fn parse_environment(content: &str) -> BTreeMap<String, String> {
    content
        .split(|c| c == '\n' || c == '\0')
        .filter_map(|entry| {
            let entry = entry.trim_end_matches('\r');
            let (name, value) = entry.split_once('=')?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) { return None; }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn process_environment(binary: &str) -> Option<BTreeMap<String, String>> {
    if binary.is_empty() { return None; }
    let mut system = System::new();
    system.refresh_processes();
    let process = system.processes().values().find(|p| {
        p.name() == binary
            || p.cmd().first().and_then(|c| Path::new(c).file_name()).map(|n| n == OsStr::new(binary)).unwrap_or(false)
    })?;
    if process.environ().is_empty() {
        warn!(binary, pid = %process.pid(), "target process environment is not readable");
    }
    Some(process.environ().iter().filter_map(|e| e.split_once('=')).map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub os_pretty_name: Option<String>,
    pub kernel_version: Option<String>,
}

impl HostInfo {
    pub fn collect() -> Self {
        let os_pretty_name = fs::read_to_string("/etc/os-release").ok().and_then(|content| {
            content
                .lines()
                .find_map(|line| line.trim().strip_prefix("PRETTY_NAME=").map(|v| v.trim().trim_matches('"').to_string()))
        });
        Self { hostname: System::host_name(), os_pretty_name, kernel_version: System::kernel_version() }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use crate::config::ComponentTable;

    fn settings() -> CollectorSettings { CollectorSettings { timeout: Duration::from_secs(5), strict_placeholders: false } }

    fn flags(cmd: &str) -> AuditSources { AuditSources { flags: Some(cmd.into()), ..Default::default() } }

    #[test]
    fn identical_commands_run_once_per_check() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_stdout("ps -ef | grep kube-apiserver", "kube-apiserver --a=1");
        let mut c = EvidenceCollector::new(&runner, ComponentType::Master, table.get(ComponentType::Master), settings());
        let audit = flags("ps -ef | grep $apiserverbin");
        for name in ["--a", "--b", "--c"] {
            assert!(matches!(c.collect(&EvidenceSource::Flag(name.into()), &audit).unwrap(), RawEvidence::Output(s) if s.contains("--a=1")));
        }
        assert_eq!(runner.calls(), vec!["ps -ef | grep kube-apiserver".to_string()]);
        assert_eq!(c.commands_run(), 1);
    }

    #[test]
    fn non_zero_exit_is_a_collection_error_with_truncated_stderr() {
        let table = ComponentTable::builtin();
        let long = "x".repeat(2000);
        let runner = FakeRunner::new().with_exit("false", 2, &long);
        let mut c = EvidenceCollector::new(&runner, ComponentType::Node, table.get(ComponentType::Node), settings());
        match c.collect(&EvidenceSource::Flag("--x".into()), &flags("false")) {
            Err(CollectionError::Exit { code: Some(2), stderr, .. }) => assert!(stderr.len() <= STDERR_LIMIT + 3),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn grep_no_match_is_empty_evidence() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_exit("ps | grep nothing", 1, "");
        let mut c = EvidenceCollector::new(&runner, ComponentType::Node, table.get(ComponentType::Node), settings());
        assert!(matches!(c.collect(&EvidenceSource::Flag("--x".into()), &flags("ps | grep nothing")), Ok(RawEvidence::Output(""))));
    }

    #[test]
    fn strict_placeholders_reject_unknown_names() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new();
        let strict = CollectorSettings { strict_placeholders: true, ..settings() };
        let mut c = EvidenceCollector::new(&runner, ComponentType::Etcd, table.get(ComponentType::Etcd), strict);
        let err = c.collect(&EvidenceSource::Flag("--x".into()), &flags("cat $nosuchvar")).err().unwrap();
        assert!(matches!(err, CollectionError::Unresolved { ref names, .. } if names == &vec!["nosuchvar".to_string()]));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn config_document_comes_from_audit_config_or_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "authentication:\n  anonymous:\n    enabled: false\n").unwrap();
        let mut table = ComponentTable::builtin();
        table.set(ComponentType::Node, "defaultconf", file.to_string_lossy().to_string());
        let runner = FakeRunner::new().with_stdout("cat /x.json", r#"{"readOnlyPort": 0}"#);
        let mut c = EvidenceCollector::new(&runner, ComponentType::Node, table.get(ComponentType::Node), settings());

        let path = EvidenceSource::Path("{.authentication.anonymous.enabled}".into());
        match c.collect(&path, &AuditSources::default()).unwrap() {
            RawEvidence::Document(doc) => assert_eq!(doc["authentication"]["anonymous"]["enabled"], serde_json::json!(false)),
            other => panic!("unexpected {:?}", other),
        }
        let with_cmd = AuditSources { config: Some("cat /x.json".into()), ..Default::default() };
        match c.collect(&path, &with_cmd).unwrap() {
            RawEvidence::Document(doc) => assert_eq!(doc["readOnlyPort"], serde_json::json!(0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let mut table = ComponentTable::builtin();
        table.set(ComponentType::Node, "defaultconf", "/nonexistent/kubelet/config.yaml");
        let runner = FakeRunner::new();
        let mut c = EvidenceCollector::new(&runner, ComponentType::Node, table.get(ComponentType::Node), settings());
        let err = c.collect(&EvidenceSource::Path("{.a}".into()), &AuditSources::default()).err().unwrap();
        assert!(matches!(err, CollectionError::Config { .. }));
    }

    #[test]
    fn audit_env_output_is_parsed_into_variables() {
        let table = ComponentTable::builtin();
        let runner = FakeRunner::new().with_stdout("cat /proc/1/environ", "ETCD_CERT_FILE=/etc/etcd/server.crt\0HOME=/root\0");
        let mut c = EvidenceCollector::new(&runner, ComponentType::Etcd, table.get(ComponentType::Etcd), settings());
        let audit = AuditSources { env: Some("cat /proc/1/environ".into()), ..Default::default() };
        match c.collect(&EvidenceSource::Env("ETCD_CERT_FILE".into()), &audit).unwrap() {
            RawEvidence::Environment(vars) => assert_eq!(vars.get("ETCD_CERT_FILE").map(String::as_str), Some("/etc/etcd/server.crt")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_json_and_yaml_documents() {
        assert_eq!(parse_document("").unwrap(), serde_json::Value::Null);
        assert_eq!(parse_document("{\"a\": 1}").unwrap()["a"], serde_json::json!(1));
        assert_eq!(parse_document("a:\n  b: [x, y]\n").unwrap()["a"]["b"][1], serde_json::json!("y"));
        assert!(parse_document("a: [unterminated").is_err());
    }

    #[test]
    fn shell_runner_captures_output_and_exit_code() {
        let out = ShellRunner.run("echo hello; echo oops >&2; exit 3", Duration::from_secs(5)).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[test]
    fn shell_runner_enforces_the_deadline() {
        let start = Instant::now();
        let err = ShellRunner.run("sleep 5", Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CollectionError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn background_job_holding_the_pipes_cannot_outlive_the_deadline() {
        let start = Instant::now();
        let err = ShellRunner.run("sleep 4 & echo hi", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, CollectionError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("(sleep 1; echo late > '{}') & sleep 5", marker.display());
        let err = ShellRunner.run(&command, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CollectionError::Timeout { .. }));
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("  short  ", 10), "short");
        assert_eq!(truncate("ééééé", 3), "é...");
    }
}

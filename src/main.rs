mod model;
mod config;
mod rules;
mod collectors;
mod extract;
mod compare;
mod engine;
mod remediate;
mod report;
mod logging;

use crate::collectors::{HostInfo, ShellRunner};
use crate::config::{ComponentType, Settings};
use crate::engine::{CancelToken, Engine, Filters, RunSession};
use crate::model::RunStatus;
use crate::remediate::{RemediationOptions, RemediationSummary, Remediator, TerminalConfirm};
use crate::report::{OutputFormat, ReportOptions, Reporter, RunReport};
use crate::rules::Benchmark;
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};

const EXIT_INTERRUPTED: i32 = 130;
const EXIT_FAIL: i32 = 2;
const EXIT_WARN: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "kube-audit", version, about = "Evaluate a Kubernetes node against CIS-style benchmark rules")]
struct Cli {
    /// Rule files or glob patterns
    #[arg(value_name = "RULE FILES|GLOBS")]
    rules: Vec<String>,

    /// Also load every *.yaml / *.yml rule file under this directory
    #[arg(long)]
    benchmark_dir: Option<PathBuf>,

    /// Settings file with timeouts and component variable overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only run rule files for these component types (comma separated)
    #[arg(long, value_enum, value_delimiter = ',')]
    targets: Vec<ComponentType>,

    /// Only run these check ids (comma separated), e.g. 1.2.9,1.2.10
    #[arg(long, value_delimiter = ',')]
    check: Vec<String>,

    /// Only run these group ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    group: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = FormatArg::Text)]
    format: FormatArg,

    /// Show PASS and INFO results too
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Do not print the remediation section
    #[arg(long, default_value_t = false)]
    no_remediation: bool,

    /// Do not print manual checks
    #[arg(long, default_value_t = false)]
    no_manual: bool,

    /// Exit with code 1 when any check WARNs
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Run auto-remediation commands for FAIL/WARN checks
    #[arg(long, default_value_t = false)]
    auto_remediate: bool,

    /// Show the remediation commands that would run without running them
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Do not ask before each remediation command
    #[arg(long, default_value_t = false)]
    yes: bool,

    /// Timeout for each audit command, e.g. 30s
    #[arg(long, value_parser = humantime::parse_duration)]
    audit_timeout: Option<Duration>,

    /// Timeout for each remediation command, e.g. 2m
    #[arg(long, value_parser = humantime::parse_duration)]
    remediation_timeout: Option<Duration>,

    /// Treat unresolved $placeholders in audit commands as errors
    #[arg(long, default_value_t = false)]
    strict_placeholders: bool,

    /// Log verbosity (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json, cli.log_level.into());
    let code = run(cli).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(t) = cli.audit_timeout { settings.audit_timeout = t; }
    if let Some(t) = cli.remediation_timeout { settings.remediation_timeout = t; }
    if cli.strict_placeholders { settings.strict_placeholders = true; }

    let benchmarks = load_benchmarks(&cli)?;
    let filters = Filters { targets: cli.targets.clone(), groups: cli.group.clone(), checks: cli.check.clone() };
    let remediation = (cli.auto_remediate || cli.dry_run).then_some(RemediationOptions { dry_run: cli.dry_run, require_confirmation: !cli.yes });

    let cancel = CancelToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("interrupt received; stopping after the current check");
        trip.cancel();
    });

    let (session, summary) = tokio::task::spawn_blocking(move || evaluate(&settings, &benchmarks, filters, cancel, remediation))
        .await
        .context("evaluation task failed")?;

    let host = HostInfo::collect();
    let options = ReportOptions { verbose: cli.verbose, show_manual: !cli.no_manual, show_remediations: !cli.no_remediation };
    let report = RunReport { session: &session, host: &host, remediation: summary.as_ref() };
    let rendered = Reporter::new(options, cli.format.into()).render(&report).context("rendering report")?;
    println!("{}", rendered);

    Ok(exit_code(&session, summary.as_ref(), cli.strict))
}

fn load_benchmarks(cli: &Cli) -> Result<Vec<Benchmark>> {
    let files = rules::discover(&cli.rules, cli.benchmark_dir.as_deref());
    if files.is_empty() {
        bail!("no rule files given; pass rule files or --benchmark-dir");
    }
    let mut benchmarks = Vec::with_capacity(files.len());
    for file in &files {
        match rules::load_file(file) {
            Ok(b) => benchmarks.push(b),
            // one bad file never stops the others
            Err(e) => error!(file = %file.display(), error = %e, "skipping rule file"),
        }
    }
    if benchmarks.is_empty() {
        bail!("none of the {} rule file(s) could be loaded", files.len());
    }
    info!(loaded = benchmarks.len(), "rule files loaded");
    Ok(benchmarks)
}

fn evaluate(
    settings: &Settings,
    benchmarks: &[Benchmark],
    filters: Filters,
    cancel: CancelToken,
    remediation: Option<RemediationOptions>,
) -> (RunSession, Option<RemediationSummary>) {
    let runner = ShellRunner;
    let mut session = RunSession::new(cancel);
    Engine::new(&runner, settings).with_filters(filters).run(benchmarks, &mut session);
    let summary = remediation.map(|opts| {
        Remediator::new(&runner, &settings.components, settings.remediation_timeout).remediate_all(
            session.results(),
            opts,
            &TerminalConfirm,
            session.cancel_token(),
        )
    });
    (session, summary)
}

fn exit_code(session: &RunSession, summary: Option<&RemediationSummary>, strict: bool) -> i32 {
    let results = session.results();
    if session.status() == RunStatus::Interrupted || summary.map(|s| s.interrupted).unwrap_or(false) {
        EXIT_INTERRUPTED
    } else if results.iter().any(|r| r.status.is_fail()) {
        EXIT_FAIL
    } else if summary.map(|s| s.failed > 0).unwrap_or(false) || (strict && results.iter().any(|r| r.status.is_warn())) {
        EXIT_WARN
    } else {
        0
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

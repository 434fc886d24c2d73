//! Component substitution tables and engine settings.
//!
//! Audit commands and remediation text refer to binaries and files through
//! `$name` placeholders (`$apiserverconf`, `$kubeletbin`, ...). Each component
//! type owns a table resolving those names for a kubeadm-style layout; a
//! settings file can override or extend any entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_AUDIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REMEDIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Config document read by `path` items when a check has no `audit_config`.
pub const DEFAULT_CONF_KEY: &str = "defaultconf";
/// Process whose environment `env` items read when a check has no `audit_env`.
pub const DEFAULT_BIN_KEY: &str = "defaultbin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Master,
    Etcd,
    Controlplane,
    Node,
    Policies,
}

impl ComponentType {
    pub const ALL: [ComponentType; 5] = [
        ComponentType::Master,
        ComponentType::Etcd,
        ComponentType::Controlplane,
        ComponentType::Node,
        ComponentType::Policies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Master => "master",
            ComponentType::Etcd => "etcd",
            ComponentType::Controlplane => "controlplane",
            ComponentType::Node => "node",
            ComponentType::Policies => "policies",
        }
    }

    pub fn section_title(&self) -> &'static str {
        match self {
            ComponentType::Master => "1 Control Plane Security Configuration",
            ComponentType::Etcd => "2 Etcd Node Configuration",
            ComponentType::Controlplane => "3 Control Plane Configuration",
            ComponentType::Node => "4 Worker Node Security Configuration",
            ComponentType::Policies => "5 Kubernetes Policies",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Placeholder values for one component type. Names are stored without the
/// leading `$`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentConfig {
    vars: BTreeMap<String, String>,
}

/// Text after placeholder substitution, plus the names nothing resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substituted {
    pub text: String,
    pub unresolved: Vec<String>,
}

impl ComponentConfig {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut cfg = Self::default();
        for (k, v) in pairs { cfg.set(k, v); }
        cfg
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.trim_start_matches('$').to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name.trim_start_matches('$')).map(String::as_str)
    }

    pub fn default_conf(&self) -> Option<&str> { self.get(DEFAULT_CONF_KEY) }
    pub fn default_bin(&self) -> Option<&str> { self.get(DEFAULT_BIN_KEY) }

    /// Replace every `$name` whose name is known. Unknown names are left in
    /// place as literal text and reported back to the caller.
    pub fn substitute(&self, text: &str) -> Substituted {
        let mut out = String::with_capacity(text.len());
        let mut unresolved = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let len = after
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit()))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            let name = &after[..len];
            match self.vars.get(name) {
                Some(value) if !name.is_empty() => out.push_str(value),
                _ => {
                    if !name.is_empty() && !unresolved.iter().any(|u| u == name) {
                        unresolved.push(name.to_string());
                    }
                    out.push('$');
                    out.push_str(name);
                }
            }
            rest = &after[len..];
        }
        out.push_str(rest);
        Substituted { text: out, unresolved }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentTable {
    components: BTreeMap<ComponentType, ComponentConfig>,
}

impl Default for ComponentTable {
    fn default() -> Self { Self::builtin() }
}

impl ComponentTable {
    /// kubeadm defaults.
    pub fn builtin() -> Self {
        let etcd = ComponentConfig::from_pairs([
            ("etcdbin", "etcd"),
            ("etcdconf", "/etc/kubernetes/manifests/etcd.yaml"),
            ("etcddatadir", "/var/lib/etcd"),
            (DEFAULT_CONF_KEY, "/etc/kubernetes/manifests/etcd.yaml"),
            (DEFAULT_BIN_KEY, "etcd"),
        ]);
        let controlplane = ComponentConfig::from_pairs([
            ("apiserverbin", "kube-apiserver"),
            ("apiserverconf", "/etc/kubernetes/manifests/kube-apiserver.yaml"),
            (DEFAULT_CONF_KEY, "/etc/kubernetes/manifests/kube-apiserver.yaml"),
            (DEFAULT_BIN_KEY, "kube-apiserver"),
        ]);
        let master = ComponentConfig::from_pairs([
            ("apiserverbin", "kube-apiserver"),
            ("apiserverconf", "/etc/kubernetes/manifests/kube-apiserver.yaml"),
            ("controllermanagerbin", "kube-controller-manager"),
            ("controllermanagerconf", "/etc/kubernetes/manifests/kube-controller-manager.yaml"),
            ("controllermanagerkubeconfig", "/etc/kubernetes/controller-manager.conf"),
            ("schedulerbin", "kube-scheduler"),
            ("schedulerconf", "/etc/kubernetes/manifests/kube-scheduler.yaml"),
            ("schedulerkubeconfig", "/etc/kubernetes/scheduler.conf"),
            ("etcdbin", "etcd"),
            ("etcdconf", "/etc/kubernetes/manifests/etcd.yaml"),
            ("etcddatadir", "/var/lib/etcd"),
            ("kubeletbin", "kubelet"),
            (DEFAULT_CONF_KEY, "/etc/kubernetes/manifests/kube-apiserver.yaml"),
            (DEFAULT_BIN_KEY, "kube-apiserver"),
        ]);
        let node = ComponentConfig::from_pairs([
            ("kubeletbin", "kubelet"),
            ("kubeletsvc", "/usr/lib/systemd/system/kubelet.service.d/10-kubeadm.conf"),
            ("kubeletkubeconfig", "/etc/kubernetes/kubelet.conf"),
            ("kubeletconf", "/var/lib/kubelet/config.yaml"),
            ("kubeletcafile", "/etc/kubernetes/pki/ca.crt"),
            ("proxybin", "kube-proxy"),
            ("proxykubeconfig", "/var/lib/kube-proxy/kubeconfig.conf"),
            ("proxyconf", "/var/lib/kube-proxy/config.conf"),
            (DEFAULT_CONF_KEY, "/var/lib/kubelet/config.yaml"),
            (DEFAULT_BIN_KEY, "kubelet"),
        ]);
        let mut components = BTreeMap::new();
        components.insert(ComponentType::Etcd, etcd);
        components.insert(ComponentType::Controlplane, controlplane);
        components.insert(ComponentType::Master, master);
        components.insert(ComponentType::Node, node);
        // policies checks talk to kubectl directly
        components.insert(ComponentType::Policies, ComponentConfig::default());
        Self { components }
    }

    pub fn get(&self, component: ComponentType) -> &ComponentConfig {
        static EMPTY: std::sync::OnceLock<ComponentConfig> = std::sync::OnceLock::new();
        self.components.get(&component).unwrap_or_else(|| EMPTY.get_or_init(ComponentConfig::default))
    }

    pub fn set(&mut self, component: ComponentType, name: &str, value: impl Into<String>) {
        self.components.entry(component).or_default().set(name, value);
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("invalid settings file {path}: {source}")]
    Yaml { path: PathBuf, #[source] source: serde_yaml::Error },
    #[error("invalid duration for `{field}`: {value:?} ({source})")]
    Duration { field: &'static str, value: String, #[source] source: humantime::DurationError },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    audit_timeout: Option<String>,
    remediation_timeout: Option<String>,
    strict_placeholders: Option<bool>,
    #[serde(default)]
    components: BTreeMap<ComponentType, BTreeMap<String, String>>,
}

/// Engine-wide knobs. CLI flags are applied on top of these by the caller.
#[derive(Debug, Clone)]
pub struct Settings {
    pub audit_timeout: Duration,
    pub remediation_timeout: Duration,
    /// Treat an unresolved `$name` as a collection error instead of literal text.
    pub strict_placeholders: bool,
    pub components: ComponentTable,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audit_timeout: DEFAULT_AUDIT_TIMEOUT,
            remediation_timeout: DEFAULT_REMEDIATION_TIMEOUT,
            strict_placeholders: false,
            components: ComponentTable::builtin(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml { path: path.to_path_buf(), source },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = if content.trim().is_empty() {
            SettingsFile::default()
        } else {
            serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml { path: PathBuf::new(), source })?
        };
        let mut settings = Settings::default();
        if let Some(v) = file.audit_timeout { settings.audit_timeout = parse_duration("audit_timeout", v)?; }
        if let Some(v) = file.remediation_timeout { settings.remediation_timeout = parse_duration("remediation_timeout", v)?; }
        if let Some(strict) = file.strict_placeholders { settings.strict_placeholders = strict; }
        for (component, vars) in file.components {
            for (name, value) in vars {
                settings.components.set(component, &name, value);
            }
        }
        Ok(settings)
    }
}

fn parse_duration(field: &'static str, value: String) -> Result<Duration, ConfigError> {
    humantime::parse_duration(&value).map_err(|source| ConfigError::Duration { field, value, source })
}

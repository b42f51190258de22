use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};
use tracing::info;

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
pub const CONTROLLER_NAMESPACE_ENV: &str = "CONTROLLER_NAMESPACE";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    /// Namespace names or glob patterns whose workloads are never backed up
    #[serde(default)]
    pub ignore_namespaces: Vec<String>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub requeue: RequeueConfig,
    /// Reconciles running at once per workload kind. Each one may be streaming a layer.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: u16,
}

fn default_max_concurrent_reconciles() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry hosts that are spoken to over plain HTTP
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

/// Delays used by the controller's error policy
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequeueConfig {
    pub transient_seconds: u64,
    pub conflict_seconds: u64,
    pub permanent_seconds: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            transient_seconds: 30,
            conflict_seconds: 5,
            permanent_seconds: 300,
        }
    }
}

impl Config {
    /// kube-runtime treats a concurrency of 0 as unbounded, so it is raised to 1
    pub fn reconcile_concurrency(&self) -> u16 {
        self.max_concurrent_reconciles.max(1)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let missing: Vec<&str> = re
        .captures_iter(input)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| env::var(name).is_err())
        .collect();
    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}

/// Splits, trims and de-duplicates the configured namespaces, then appends `kube-system`
/// and the controller's own namespace. First occurrence wins.
pub fn parse_ignore_namespaces(
    namespaces: &[String],
    controller_namespace: Option<&str>,
) -> Vec<String> {
    let mut ignored: Vec<String> = Vec::new();
    let candidates = namespaces
        .iter()
        .flat_map(|entry| entry.split(','))
        .chain(controller_namespace)
        .chain([KUBE_SYSTEM_NAMESPACE]);

    for namespace in candidates.map(str::trim) {
        if !namespace.is_empty() && !ignored.iter().any(|n| n == namespace) {
            ignored.push(namespace.to_string());
        }
    }
    ignored
}

/// Ignored namespaces split into exact names, which are filtered by the API server
/// through a field selector, and glob patterns, which are matched client-side.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    exact: Vec<String>,
    patterns: GlobSet,
}

impl NamespaceFilter {
    pub fn new(namespaces: &[String]) -> Result<Self> {
        let mut exact = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for namespace in namespaces {
            if namespace.contains(['*', '?', '[']) {
                builder.add(
                    Glob::new(namespace)
                        .with_context(|| format!("Invalid namespace pattern {}", namespace))?,
                );
            } else {
                exact.push(namespace.clone());
            }
        }
        let patterns = builder
            .build()
            .context("Failed to build namespace pattern set")?;
        Ok(Self { exact, patterns })
    }

    /// Field selector excluding the exact namespaces, e.g. `metadata.namespace!=kube-system`
    pub fn field_selector(&self) -> Option<String> {
        if self.exact.is_empty() {
            return None;
        }
        Some(
            self.exact
                .iter()
                .map(|ns| format!("metadata.namespace!={}", ns))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn is_ignored(&self, namespace: &str) -> bool {
        self.exact.iter().any(|ns| ns == namespace) || self.patterns.is_match(namespace)
    }
}

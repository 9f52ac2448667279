use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat { #[default] Compact, Json }

impl FromStr for LogFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" | "auto" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => bail!("unknown log format {other:?} (expected compact|json)"),
        }
    }
}

/// Knobs of a single convergence pass.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Delay before retrying after a transient failure.
    pub requeue_transient: Duration,
    /// Delay between init job status checks.
    pub requeue_job_poll: Duration,
    /// Skip the workload and services while the init job has not finished.
    pub gate_workload_on_init_job: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_transient: Duration::from_secs(15),
            requeue_job_poll: Duration::from_secs(30),
            gate_workload_on_init_job: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Watch a single namespace; `None` watches all of them.
    pub namespace: Option<String>,
    pub concurrency: u16,
    pub resync: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
    pub reconcile: ReconcileConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 2,
            resync: Duration::from_secs(300),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `ODOO_OPERATOR_*` variables supplied by `lookup`.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();
        if let Some(ns) = var("ODOO_OPERATOR_NAMESPACE") { cfg.namespace = Some(ns.trim().to_string()); }
        if let Some(v) = var("ODOO_OPERATOR_CONCURRENCY") {
            cfg.concurrency = v.trim().parse().with_context(|| format!("parse ODOO_OPERATOR_CONCURRENCY={v:?}"))?;
        }
        if let Some(v) = var("ODOO_OPERATOR_REQUEUE_SECS") { cfg.reconcile.requeue_transient = secs("ODOO_OPERATOR_REQUEUE_SECS", &v)?; }
        if let Some(v) = var("ODOO_OPERATOR_JOB_POLL_SECS") { cfg.reconcile.requeue_job_poll = secs("ODOO_OPERATOR_JOB_POLL_SECS", &v)?; }
        if let Some(v) = var("ODOO_OPERATOR_RESYNC_SECS") { cfg.resync = secs("ODOO_OPERATOR_RESYNC_SECS", &v)?; }
        if let Some(v) = var("ODOO_OPERATOR_GATE_WORKLOAD") {
            cfg.reconcile.gate_workload_on_init_job = v.trim().parse().with_context(|| format!("parse ODOO_OPERATOR_GATE_WORKLOAD={v:?}"))?;
        }
        if let Some(v) = var("ODOO_OPERATOR_LOG_LEVEL") { cfg.log_level = v.trim().to_string(); }
        if let Some(v) = var("ODOO_OPERATOR_LOG_FORMAT") { cfg.log_format = v.parse()?; }
        debug!(?cfg, "config.loaded");
        Ok(cfg)
    }
}

fn secs(key: &str, raw: &str) -> Result<Duration> {
    let n: u64 = raw.trim().parse().with_context(|| format!("parse {key}={raw:?}"))?;
    Ok(Duration::from_secs(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<OperatorConfig> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        OperatorConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.namespace, None);
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.resync, Duration::from_secs(300));
        assert_eq!(cfg.reconcile.requeue_transient, Duration::from_secs(15));
        assert_eq!(cfg.reconcile.requeue_job_poll, Duration::from_secs(30));
        assert!(cfg.reconcile.gate_workload_on_init_job);
        assert_eq!(cfg.log_format, LogFormat::Compact);
    }

    #[test]
    fn env_overrides() {
        let cfg = load(&[
            ("ODOO_OPERATOR_NAMESPACE", "erp"),
            ("ODOO_OPERATOR_CONCURRENCY", "4"),
            ("ODOO_OPERATOR_JOB_POLL_SECS", " 10 "),
            ("ODOO_OPERATOR_GATE_WORKLOAD", "false"),
            ("ODOO_OPERATOR_LOG_FORMAT", "JSON"),
            ("ODOO_OPERATOR_REQUEUE_SECS", ""),
        ])
        .unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("erp"));
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.reconcile.requeue_job_poll, Duration::from_secs(10));
        assert_eq!(cfg.reconcile.requeue_transient, Duration::from_secs(15));
        assert!(!cfg.reconcile.gate_workload_on_init_job);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = load(&[("ODOO_OPERATOR_RESYNC_SECS", "soon")]).unwrap_err();
        assert!(format!("{err:#}").contains("ODOO_OPERATOR_RESYNC_SECS"));
        assert!(load(&[("ODOO_OPERATOR_LOG_FORMAT", "xml")]).is_err());
    }
}

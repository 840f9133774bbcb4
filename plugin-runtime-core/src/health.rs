//! Periodic plugin health checking
//!
//! A checker calls one plugin's `health_check` on an interval, each check
//! running in its own task bounded by a timeout. Failures, panics included,
//! are logged and counted and never stop the cycle. After
//! `failure_threshold` consecutive failures the report turns unhealthy; any
//! successful check resets the count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::{HealthLevel, Plugin};
use crate::task::{AbortOnDrop, BackgroundTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub message: String,
    pub consecutive_failures: u32,
    pub checks_run: u64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            level: HealthLevel::Unknown,
            message: "no check has run yet".to_string(),
            consecutive_failures: 0,
            checks_run: 0,
            last_checked: None,
        }
    }
}

pub struct HealthChecker {
    plugin_id: String,
    plugin: Arc<dyn Plugin>,
    config: HealthConfig,
    report: Arc<parking_lot::RwLock<HealthReport>>,
    task: parking_lot::Mutex<Option<BackgroundTask>>,
}

impl HealthChecker {
    pub fn new(plugin_id: impl Into<String>, plugin: Arc<dyn Plugin>, config: HealthConfig) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin,
            config,
            report: Arc::new(parking_lot::RwLock::new(HealthReport::default())),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn report(&self) -> HealthReport {
        self.report.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run a single check immediately.
    pub async fn check_now(&self) -> HealthReport {
        run_check(&self.plugin_id, &self.plugin, &self.config, &self.report).await;
        self.report()
    }

    /// Start the periodic check. No-op when already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let plugin_id = self.plugin_id.clone();
        let plugin = Arc::clone(&self.plugin);
        let config = self.config.clone();
        let report = Arc::clone(&self.report);

        *task = Some(BackgroundTask::spawn_interval(
            format!("health:{}", self.plugin_id),
            self.config.interval(),
            move || {
                let plugin_id = plugin_id.clone();
                let plugin = Arc::clone(&plugin);
                let config = config.clone();
                let report = Arc::clone(&report);
                async move {
                    run_check(&plugin_id, &plugin, &config, &report).await;
                }
            },
        ));
        debug!(plugin_id = %self.plugin_id, interval_ms = self.config.interval_ms, "Health checker started");
    }

    /// Stop the periodic check and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            debug!(plugin_id = %self.plugin_id, "Health checker stopped");
        }
    }
}

async fn run_check(
    plugin_id: &str,
    plugin: &Arc<dyn Plugin>,
    config: &HealthConfig,
    report: &parking_lot::RwLock<HealthReport>,
) {
    let target = Arc::clone(plugin);
    let mut task = AbortOnDrop(tokio::spawn(async move { target.health_check().await }));
    let outcome = tokio::time::timeout(config.timeout(), &mut task.0).await;

    let failure = match outcome {
        Ok(Ok(Ok(status))) if status.status != HealthLevel::Unhealthy => {
            let mut report = report.write();
            report.level = status.status;
            report.message = status.message;
            report.consecutive_failures = 0;
            report.checks_run += 1;
            report.last_checked = Some(Utc::now());
            return;
        }
        Ok(Ok(Ok(status))) => status.message,
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(join_error)) => format!("health check panicked: {join_error}"),
        Err(_) => format!("health check timed out after {}ms", config.timeout_ms),
    };

    let mut report = report.write();
    report.consecutive_failures = report.consecutive_failures.saturating_add(1);
    report.checks_run += 1;
    report.last_checked = Some(Utc::now());
    report.level = if report.consecutive_failures >= config.failure_threshold {
        HealthLevel::Unhealthy
    } else {
        HealthLevel::Warning
    };
    report.message = failure;

    warn!(
        plugin_id = %plugin_id,
        consecutive_failures = report.consecutive_failures,
        level = ?report.level,
        reason = %report.message,
        "Health check failed"
    );
}

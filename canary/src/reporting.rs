//! Error tracking
//!
//! Errors worth a human's attention are captured through an [`ErrorReporter`]
//! together with the trail of breadcrumbs recorded before them. The
//! [`TracingReporter`] emits captures as structured `error_tracking` events,
//! which the log pipeline forwards to the tracking service.

use crate::error::CanaryError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{error, info};

/// Breadcrumbs kept before the oldest is dropped
pub const MAX_BREADCRUMBS: usize = 100;

pub trait ErrorReporter: Send + Sync {
    /// Records a trail entry attached to later captures
    fn breadcrumb(&self, message: &str, data: serde_json::Value);

    fn capture(&self, error: &CanaryError);
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SentrySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub data: serde_json::Value,
}

pub struct TracingReporter {
    enabled: bool,
    breadcrumbs: Mutex<VecDeque<Breadcrumb>>,
    captured: AtomicU64,
}

impl TracingReporter {
    pub fn new(settings: &SentrySettings) -> Self {
        if settings.enabled {
            info!(
                destination = settings.dsn.as_deref().unwrap_or("<unset>"),
                "Error tracking enabled"
            );
        }
        Self {
            enabled: settings.enabled,
            breadcrumbs: Mutex::new(VecDeque::with_capacity(MAX_BREADCRUMBS)),
            captured: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&SentrySettings::default())
    }

    /// Number of errors captured so far
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.breadcrumbs
            .lock()
            .map(|trail| trail.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl ErrorReporter for TracingReporter {
    fn breadcrumb(&self, message: &str, data: serde_json::Value) {
        if !self.enabled {
            return;
        }
        if let Ok(mut trail) = self.breadcrumbs.lock() {
            if trail.len() == MAX_BREADCRUMBS {
                trail.pop_front();
            }
            trail.push_back(Breadcrumb {
                timestamp: Utc::now(),
                message: message.to_string(),
                data,
            });
        }
    }

    fn capture(&self, error: &CanaryError) {
        if !self.enabled {
            return;
        }
        self.captured.fetch_add(1, Ordering::Relaxed);
        let trail: Vec<serde_json::Value> = self
            .breadcrumbs()
            .into_iter()
            .map(|crumb| {
                serde_json::json!({
                    "timestamp": crumb.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "message": crumb.message,
                    "data": crumb.data,
                })
            })
            .collect();
        error!(
            target: "error_tracking",
            kind = error.kind(),
            error = %error,
            breadcrumbs = %serde_json::Value::Array(trail),
            "Captured error"
        );
    }
}

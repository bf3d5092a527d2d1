// src/telemetry.rs

//! Deployment status reporting
//!
//! Builds the status reports a deployment backend consumes: update success,
//! binary-version activation, and rollback. Reports are deduplicated
//! against the last successfully delivered one, keyed by
//! `deploymentKey:label` (or the bare binary version), and a report that
//! could not be delivered is buffered so the next startup can retry it.
//! Rollback reports are never recorded as delivered: a later launch of the
//! same binary or update must still report its own outcome.

use crate::error::Result;
use crate::package::Package;
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Settings key remembering the identifier of the last delivered report
pub const LAST_DEPLOYMENT_REPORT_KEY: &str = "last_deployment_report";
/// Settings key buffering an undelivered report for retry
pub const RETRY_DEPLOYMENT_REPORT_KEY: &str = "retry_deployment_report";

/// Outcome carried by a deployment status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    #[serde(rename = "DeploymentSucceeded")]
    Succeeded,
    #[serde(rename = "DeploymentFailed")]
    Failed,
}

/// One deployment status report. Binary-version reports carry only
/// `app_version`; update and rollback reports carry the package and a
/// status. The `previous_*` fields tell the backend what this device was
/// running before.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_deployment_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_label_or_app_version: Option<String>,
}

/// Report that `current_package` is running, or `None` when that exact
/// deployment was already reported.
pub fn update_report(
    settings: &Settings,
    current_package: &Package,
) -> Result<Option<StatusReport>> {
    let Some(current_identifier) = current_package.status_report_identifier() else {
        return Ok(None);
    };

    match last_reported_identifier(settings)? {
        Some(previous) if previous == current_identifier => Ok(None),
        previous => {
            clear_retry(settings)?;
            let mut report = StatusReport {
                package: Some(current_package.clone()),
                status: Some(DeploymentStatus::Succeeded),
                ..Default::default()
            };
            if let Some(previous) = previous {
                set_previous_fields(&mut report, &previous);
            }
            Ok(Some(report))
        }
    }
}

/// Report that the plain application binary is running, or `None` when the
/// same binary version was already reported.
pub fn binary_update_report(
    settings: &Settings,
    app_version: &str,
) -> Result<Option<StatusReport>> {
    match last_reported_identifier(settings)? {
        Some(previous) if previous == app_version => Ok(None),
        previous => {
            clear_retry(settings)?;
            let mut report = StatusReport {
                app_version: Some(app_version.to_string()),
                ..Default::default()
            };
            if let Some(previous) = previous {
                set_previous_fields(&mut report, &previous);
            }
            Ok(Some(report))
        }
    }
}

/// Report that `failed_package` was rolled back.
pub fn rollback_report(failed_package: &Package) -> StatusReport {
    StatusReport {
        package: Some(failed_package.clone()),
        status: Some(DeploymentStatus::Failed),
        ..Default::default()
    }
}

/// Take the buffered retry report, if one exists. Reading consumes it; an
/// unparseable buffer is dropped.
pub fn retry_report(settings: &Settings) -> Result<Option<StatusReport>> {
    let Some(raw) = settings.get(RETRY_DEPLOYMENT_REPORT_KEY)? else {
        return Ok(None);
    };
    settings.remove(RETRY_DEPLOYMENT_REPORT_KEY)?;
    match serde_json::from_str(&raw) {
        Ok(report) => Ok(Some(report)),
        Err(e) => {
            warn!("Unable to parse retry status report, dropping it: {}", e);
            Ok(None)
        }
    }
}

/// Remember a delivered report's identifier for deduplication. Rollback
/// reports are not recorded: the replacement package must still report.
pub fn record_sent(settings: &Settings, report: &StatusReport) -> Result<()> {
    if report.status == Some(DeploymentStatus::Failed) {
        return Ok(());
    }

    if let Some(app_version) = report.app_version.as_ref().filter(|v| !v.is_empty()) {
        settings.set(LAST_DEPLOYMENT_REPORT_KEY, app_version)?;
    } else if let Some(package) = &report.package {
        if let Some(identifier) = package.status_report_identifier() {
            settings.set(LAST_DEPLOYMENT_REPORT_KEY, &identifier)?;
        }
    }
    Ok(())
}

/// Buffer an undelivered report so the next startup can retry it.
pub fn save_for_retry(settings: &Settings, report: &StatusReport) -> Result<()> {
    settings.set_json(RETRY_DEPLOYMENT_REPORT_KEY, report)
}

pub fn last_reported_identifier(settings: &Settings) -> Result<Option<String>> {
    settings.get(LAST_DEPLOYMENT_REPORT_KEY)
}

fn clear_retry(settings: &Settings) -> Result<()> {
    settings.remove(RETRY_DEPLOYMENT_REPORT_KEY)
}

/// Fill the `previous_*` fields from the last reported identifier. An
/// identifier with a `:` names a deployment key and label; a bare one is a
/// binary app version.
fn set_previous_fields(report: &mut StatusReport, previous_identifier: &str) {
    if previous_identifier.contains(':') {
        let mut parts = previous_identifier.split(':');
        report.previous_deployment_key = parts.next().map(str::to_string);
        report.previous_label_or_app_version = parts.next().map(str::to_string);
    } else {
        report.previous_label_or_app_version = Some(previous_identifier.to_string());
    }
}

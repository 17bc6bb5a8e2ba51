use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("childPolicy: name is required")]
    MissingChildPolicyName,
    #[error("{field}: {value} is not a percentage in [0, 100]")]
    PercentOutOfRange { field: &'static str, value: u32 },
}

/// Outlier-detection configuration as delivered by the service config. The
/// value arrives already parsed; `finalize` applies defaults and validates
/// ranges so the policy core never has to re-check them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlierDetectionConfig {
    /// Sampling interval between evaluation passes. `None` is the infinity
    /// sentinel: the evaluator never runs.
    pub interval: Option<Duration>,
    /// Base duration an endpoint stays ejected.
    pub base_ejection_time: Duration,
    /// Upper bound on the ejection duration. Filled by `finalize` with
    /// `max(base_ejection_time, 300s)` when unset.
    pub max_ejection_time: Option<Duration>,
    /// Cap (percent, 0-100) on the fraction of endpoints ejected at once.
    pub max_ejection_percent: u32,
    pub success_rate_ejection: Option<SuccessRateEjection>,
    pub failure_percentage_ejection: Option<FailurePercentageEjection>,
    /// Opaque configuration for the wrapped child policy. Required.
    pub child_policy: ChildPolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuccessRateEjection {
    /// Factor, in thousandths, applied to the standard deviation when
    /// computing the ejection threshold.
    pub stdev_factor: u32,
    /// Probability (percent) that a host judged an outlier is actually ejected.
    pub enforcement_percentage: u32,
    /// Minimum number of hosts with enough volume before the algorithm runs.
    pub minimum_hosts: u32,
    /// Minimum calls in the window for a host to be considered.
    pub request_volume: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailurePercentageEjection {
    /// Failure percentage above which a host is an outlier.
    pub threshold: u32,
    /// Probability (percent) that a host judged an outlier is actually ejected.
    pub enforcement_percentage: u32,
    /// Minimum number of hosts with enough volume before the algorithm runs.
    pub minimum_hosts: u32,
    /// Minimum calls in the window for a host to be considered.
    pub request_volume: u32,
}

/// Opaque nested child-policy configuration; forwarded verbatim.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChildPolicyConfig {
    pub name: String,
    pub config: serde_json::Value,
}

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_BASE_EJECTION_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_EJECTION_TIME: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_EJECTION_PERCENT: u32 = 10;

pub const DEFAULT_STDEV_FACTOR: u32 = 1900;
pub const DEFAULT_SUCCESS_RATE_ENFORCEMENT: u32 = 100;
pub const DEFAULT_FAILURE_PERCENTAGE_THRESHOLD: u32 = 85;
pub const DEFAULT_FAILURE_PERCENTAGE_ENFORCEMENT: u32 = 0;
pub const DEFAULT_MINIMUM_HOSTS: u32 = 5;
pub const DEFAULT_SUCCESS_RATE_REQUEST_VOLUME: u32 = 100;
pub const DEFAULT_FAILURE_PERCENTAGE_REQUEST_VOLUME: u32 = 50;

impl Default for OutlierDetectionConfig {
    fn default() -> Self {
        Self {
            interval: Some(DEFAULT_INTERVAL),
            base_ejection_time: DEFAULT_BASE_EJECTION_TIME,
            max_ejection_time: None,
            max_ejection_percent: DEFAULT_MAX_EJECTION_PERCENT,
            success_rate_ejection: None,
            failure_percentage_ejection: None,
            child_policy: ChildPolicyConfig::default(),
        }
    }
}

impl Default for SuccessRateEjection {
    fn default() -> Self {
        Self {
            stdev_factor: DEFAULT_STDEV_FACTOR,
            enforcement_percentage: DEFAULT_SUCCESS_RATE_ENFORCEMENT,
            minimum_hosts: DEFAULT_MINIMUM_HOSTS,
            request_volume: DEFAULT_SUCCESS_RATE_REQUEST_VOLUME,
        }
    }
}

impl Default for FailurePercentageEjection {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_PERCENTAGE_THRESHOLD,
            enforcement_percentage: DEFAULT_FAILURE_PERCENTAGE_ENFORCEMENT,
            minimum_hosts: DEFAULT_MINIMUM_HOSTS,
            request_volume: DEFAULT_FAILURE_PERCENTAGE_REQUEST_VOLUME,
        }
    }
}

impl OutlierDetectionConfig {
    /// Applies defaults and validates the configuration so that every value
    /// the policy reads is present and within range.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.child_policy.name.is_empty() {
            return Err(ConfigError::MissingChildPolicyName);
        }

        check_percent("maxEjectionPercent", self.max_ejection_percent)?;
        if let Some(sr) = &self.success_rate_ejection {
            check_percent("successRateEjection.enforcementPercentage", sr.enforcement_percentage)?;
        }
        if let Some(fp) = &self.failure_percentage_ejection {
            check_percent("failurePercentageEjection.threshold", fp.threshold)?;
            check_percent(
                "failurePercentageEjection.enforcementPercentage",
                fp.enforcement_percentage,
            )?;
        }

        self.max_ejection_time = Some(
            self.max_ejection_time
                .unwrap_or_else(|| self.base_ejection_time.max(DEFAULT_MAX_EJECTION_TIME)),
        );

        Ok(self)
    }

    /// Counting (and thus the evaluator) runs only when there is a finite
    /// interval and at least one ejection algorithm configured.
    pub fn counting_enabled(&self) -> bool {
        self.interval.is_some()
            && (self.success_rate_ejection.is_some() || self.failure_percentage_ejection.is_some())
    }

    /// Effective ejection-duration cap.
    pub fn max_ejection_time(&self) -> Duration {
        self.max_ejection_time
            .unwrap_or_else(|| self.base_ejection_time.max(DEFAULT_MAX_EJECTION_TIME))
    }
}

fn check_percent(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value > 100 {
        return Err(ConfigError::PercentOutOfRange { field, value });
    }
    Ok(())
}

/// Environment variable gating registration of the policy.
pub const ENABLE_ENV_VAR: &str = "OUTLIER_DETECTION_ENABLED";

/// Whether the embedding framework should register this policy. Registration
/// is opt-in while the feature rolls out.
pub fn enabled_from_env() -> bool {
    match std::env::var(ENABLE_ENV_VAR) {
        Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

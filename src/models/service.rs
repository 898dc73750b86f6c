//! Service-level data models.

use serde::{Deserialize, Serialize};

/// CORS rule for a storage service.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CorsRule {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age_in_seconds: u32,
}

/// Retention policy for logs and metrics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub days: Option<u32>,
}

/// Logging configuration for a storage service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub version: String,
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub retention_policy: RetentionPolicy,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            read: false,
            write: false,
            delete: false,
            retention_policy: RetentionPolicy::default(),
        }
    }
}

/// Metrics configuration for a storage service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub version: String,
    pub enabled: bool,
    #[serde(default)]
    pub include_apis: Option<bool>,
    pub retention_policy: RetentionPolicy,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            enabled: false,
            include_apis: None,
            retention_policy: RetentionPolicy::default(),
        }
    }
}

/// Static website configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticWebsite {
    pub enabled: bool,
    #[serde(default)]
    pub index_document: Option<String>,
    #[serde(default)]
    pub error_document_404_path: Option<String>,
    #[serde(default)]
    pub default_index_document_path: Option<String>,
}

/// Delete retention policy for soft-delete.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRetentionPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub days: Option<u32>,
}

/// Service properties for an account. One row per account; every section is
/// optional and absent sections survive partial updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProperties {
    pub account_name: String,
    #[serde(default)]
    pub default_service_version: Option<String>,
    #[serde(default)]
    pub cors: Option<Vec<CorsRule>>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub minute_metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub hour_metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub static_website: Option<StaticWebsite>,
    #[serde(default)]
    pub delete_retention_policy: Option<DeleteRetentionPolicy>,
}

impl ServiceProperties {
    pub fn new(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            ..Self::default()
        }
    }

    /// Merges an update into the stored value: sections absent from
    /// `update` keep their stored contents.
    pub fn merged_with(&self, update: ServiceProperties) -> ServiceProperties {
        ServiceProperties {
            account_name: self.account_name.clone(),
            default_service_version: update
                .default_service_version
                .or_else(|| self.default_service_version.clone()),
            cors: update.cors.or_else(|| self.cors.clone()),
            logging: update.logging.or_else(|| self.logging.clone()),
            minute_metrics: update.minute_metrics.or_else(|| self.minute_metrics.clone()),
            hour_metrics: update.hour_metrics.or_else(|| self.hour_metrics.clone()),
            static_website: update.static_website.or_else(|| self.static_website.clone()),
            delete_retention_policy: update
                .delete_retention_policy
                .or_else(|| self.delete_retention_policy.clone()),
        }
    }
}

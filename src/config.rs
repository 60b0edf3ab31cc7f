use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

pub const DEFAULT_CONFIDENCE_THRESHOLD: u8 = 70;
pub const DEFAULT_LABEL_NAME: &str = "Pago";

const DEFAULT_SHORT_LINK_HOSTS: &[&str] = &[
    "fb.me",
    "fb.watch",
    "bit.ly",
    "instagr.am",
    "ig.me",
    "l.facebook.com",
    "l.instagram.com",
];

/// Tenant-level switches, threaded through one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub accept_images: bool,
    pub accept_documents: bool,
    pub confidence_threshold: u8,
    pub label_name: String,
    pub currency: String,
    pub value_extraction_followup: bool,
    pub fallback_purchase_value: Option<f64>,
    pub charge: ChargeConfig,
    pub notifications: NotificationPreferences,
    pub automation: AutomationPolicy,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            accept_images: true,
            accept_documents: true,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            label_name: DEFAULT_LABEL_NAME.to_string(),
            currency: "BRL".to_string(),
            value_extraction_followup: true,
            fallback_purchase_value: None,
            charge: ChargeConfig::default(),
            notifications: NotificationPreferences::default(),
            automation: AutomationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeConfig {
    pub enabled: bool,
    /// Fixed amount to request; the classified amount is used when absent.
    pub amount: Option<f64>,
    pub pix_key: Option<String>,
    pub receiver_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub enabled: bool,
    pub hide_values: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            hide_values: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationPolicy {
    pub enabled: bool,
    pub pause_competing_sessions: bool,
}

impl Default for AutomationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            pause_competing_sessions: true,
        }
    }
}

/// Process-wide knobs read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stage_timeout: Duration,
    pub deadline: Duration,
    pub dispatch_concurrency: usize,
    pub attribution: AttributionSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(20),
            deadline: Duration::from_secs(90),
            dispatch_concurrency: 4,
            attribution: AttributionSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stage_timeout: Duration::from_secs(env_u64(
                "STAGE_TIMEOUT_SECS",
                defaults.stage_timeout.as_secs(),
            )),
            deadline: Duration::from_secs(env_u64(
                "PIPELINE_DEADLINE_SECS",
                defaults.deadline.as_secs(),
            )),
            dispatch_concurrency: env_u64(
                "DISPATCH_CONCURRENCY",
                defaults.dispatch_concurrency as u64,
            ) as usize,
            attribution: AttributionSettings::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttributionSettings {
    pub short_link_hosts: Vec<String>,
    pub max_redirects: usize,
    pub correlation_prefix_len: usize,
}

impl Default for AttributionSettings {
    fn default() -> Self {
        Self {
            short_link_hosts: DEFAULT_SHORT_LINK_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            max_redirects: 5,
            correlation_prefix_len: 20,
        }
    }
}

impl AttributionSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(raw) = env::var("SHORT_LINK_HOSTS") {
            let hosts = raw
                .split([',', ' ', '\n'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();
            if !hosts.is_empty() {
                settings.short_link_hosts = hosts;
            }
        }
        settings
    }
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

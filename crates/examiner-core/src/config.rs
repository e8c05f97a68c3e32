//! Client configuration
//!
//! Loaded from a TOML file, overlaid by environment variables, and validated
//! before a session starts.

use crate::error::{ExaminerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the API base URL
pub const ENV_API_URL: &str = "EXAMINER_API_URL";
/// Environment variable overriding the store directory
pub const ENV_STORE_DIR: &str = "EXAMINER_STORE_DIR";

/// Examiner client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExaminerConfig {
    /// Base URL of the marking service
    pub api_base_url: String,
    /// Allowance granted to anonymous identities
    pub anonymous_allowance: u32,
    /// Allowance granted to authenticated identities
    pub authenticated_allowance: u32,
    /// Whether the backend tracks anonymous usage
    pub anonymous_server_tracking: bool,
    /// Gate behaviour while an authenticated allowance is unresolved
    pub unresolved_gate_policy: UnresolvedGatePolicy,
    /// Per-request timeout in seconds; `None` waits indefinitely
    pub request_timeout_secs: Option<u64>,
    /// Preview rasterization scale
    pub preview_scale: f32,
    /// Directory of the durable local store
    pub store_dir: Option<PathBuf>,
    /// Locations of the example document pair
    pub examples: ExampleConfig,
}

impl ExaminerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// - `ExaminerError::Storage` if the file cannot be read
    /// - `ExaminerError::Config` if it does not parse or validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| ExaminerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Ok(dir) = std::env::var(ENV_STORE_DIR) {
            self.store_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// With API base URL
    #[inline]
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// With anonymous allowance
    #[inline]
    #[must_use]
    pub fn with_anonymous_allowance(mut self, allowance: u32) -> Self {
        self.anonymous_allowance = allowance;
        self
    }

    /// With authenticated allowance
    #[inline]
    #[must_use]
    pub fn with_authenticated_allowance(mut self, allowance: u32) -> Self {
        self.authenticated_allowance = allowance;
        self
    }

    /// With anonymous server tracking
    #[inline]
    #[must_use]
    pub fn with_anonymous_server_tracking(mut self, enabled: bool) -> Self {
        self.anonymous_server_tracking = enabled;
        self
    }

    /// With unresolved gate policy
    #[inline]
    #[must_use]
    pub fn with_unresolved_gate_policy(mut self, policy: UnresolvedGatePolicy) -> Self {
        self.unresolved_gate_policy = policy;
        self
    }

    /// With store directory
    #[inline]
    #[must_use]
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Check invariants
    ///
    /// # Errors
    /// `ExaminerError::Config` naming the first violated constraint
    pub fn validate(&self) -> Result<()> {
        if self.anonymous_allowance == 0 || self.authenticated_allowance == 0 {
            return Err(ExaminerError::Config(
                "allowances must be greater than zero".to_string(),
            ));
        }
        if !self.preview_scale.is_finite() || self.preview_scale <= 0.0 {
            return Err(ExaminerError::Config(format!(
                "preview_scale must be positive, got {}",
                self.preview_scale
            )));
        }
        self.api_base()?;
        Ok(())
    }

    /// Parsed API base URL
    ///
    /// # Errors
    /// `ExaminerError::Config` if the URL does not parse
    pub fn api_base(&self) -> Result<url::Url> {
        url::Url::parse(&self.api_base_url)
            .map_err(|e| ExaminerError::Config(format!("invalid api_base_url: {e}")))
    }

    /// Request timeout, if any
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Resolved store directory
    ///
    /// Falls back to the platform data directory, then the working directory.
    #[must_use]
    pub fn resolved_store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ai-examiner")
        })
    }
}

impl Default for ExaminerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            anonymous_allowance: 3,
            authenticated_allowance: 10,
            anonymous_server_tracking: false,
            unresolved_gate_policy: UnresolvedGatePolicy::default(),
            request_timeout_secs: Some(120),
            preview_scale: 1.5,
            store_dir: None,
            examples: ExampleConfig::default(),
        }
    }
}

/// Gate behaviour while an authenticated identity's remaining allowance is unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedGatePolicy {
    /// Allow every submission until the remote count resolves
    ///
    /// Default instead of `AllowOnce` so an authenticated user is never denied
    /// while the remote count is unknown.
    #[default]
    Allow,
    /// Allow a single submission until the remote count resolves
    AllowOnce,
    /// Deny until the remote count resolves
    Deny,
}

/// Example document locations (path, URL, or path relative to the API base)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExampleConfig {
    /// Example student paper
    pub primary: String,
    /// Example mark scheme
    pub reference: String,
}

impl Default for ExampleConfig {
    fn default() -> Self {
        Self {
            primary: "example-student-paper.pdf".to_string(),
            reference: "example-mark-scheme.pdf".to_string(),
        }
    }
}

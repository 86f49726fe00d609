//! Segmentation engine configuration.
//!
//! `VarySettings` is plain serde data so a host can embed it as a section of
//! its own configuration file:
//!
//! ```toml
//! [vary_cache]
//! cookie_name = "segvary-state"
//! cookie_max_age_secs = 2592000
//!
//! [vary_cache.encryption]
//! key = "..."
//! iv = "..."
//! ```
//!
//! Presence of the `encryption` table enables payload encryption; secrets
//! that are present but empty are rejected when the engine state is built.

use serde::Deserialize;

const DEFAULT_COOKIE_NAME: &str = "segvary-state";
const DEFAULT_COOKIE_PATH: &str = "/";
const DEFAULT_COOKIE_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_SEGMENTATION_VARY_TOKEN: &str = "X-Segvary-Segmentation";
const DEFAULT_AUTH_VARY_TOKEN: &str = "X-Segvary-Auth";

/// SameSite policy applied to the segmentation cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Strict,
    Lax,
    None,
}

/// Secrets enabling encryption of the cookie payload.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionSettings {
    /// Key material; hashed into the AES-256 key.
    pub key: String,
    /// Initialization-vector material; hashed into the GCM nonce.
    pub iv: String,
}

/// Settings for the segmentation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VarySettings {
    /// Name of the segmentation cookie.
    pub cookie_name: String,
    /// Path attribute of the issued cookie.
    pub cookie_path: String,
    /// Max-Age attribute of the issued cookie, in seconds.
    pub cookie_max_age_secs: i64,
    /// Set the Secure attribute on the issued cookie.
    pub cookie_secure: bool,
    /// Set the HttpOnly attribute on the issued cookie.
    pub cookie_http_only: bool,
    /// SameSite attribute of the issued cookie.
    pub cookie_same_site: SameSitePolicy,
    /// `Vary` token emitted when segmentation groups are present.
    pub segmentation_vary_token: String,
    /// `Vary` token emitted instead when encryption is enabled.
    pub auth_vary_token: String,
    /// Present (with both secrets) to enable payload encryption.
    pub encryption: Option<EncryptionSettings>,
}

impl Default for VarySettings {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_path: DEFAULT_COOKIE_PATH.to_string(),
            cookie_max_age_secs: DEFAULT_COOKIE_MAX_AGE_SECS,
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: SameSitePolicy::Lax,
            segmentation_vary_token: DEFAULT_SEGMENTATION_VARY_TOKEN.to_string(),
            auth_vary_token: DEFAULT_AUTH_VARY_TOKEN.to_string(),
            encryption: None,
        }
    }
}

impl VarySettings {
    /// Returns true when the encryption table is configured.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption.is_some()
    }
}

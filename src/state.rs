//! Shared engine state.
//!
//! `VaryState` is the immutable per-process bundle — validated settings plus
//! the optional cookie cipher — cloned into the middleware layer and shared
//! by every request. Per-request state lives in
//! [`VaryContext`](crate::context::VaryContext), built here from the inbound
//! cookie.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum_extra::extract::cookie::Cookie;
use metrics::counter;
use tracing::debug;

use crate::codec;
use crate::config::VarySettings;
use crate::context::VaryContext;
use crate::crypto::CookieCipher;
use crate::telemetry::METRIC_COOKIE_DECRYPT_FAILURE;

/// Immutable engine state shared across requests.
#[derive(Clone)]
pub struct VaryState {
    inner: Arc<StateInner>,
}

struct StateInner {
    settings: VarySettings,
    cipher: Option<CookieCipher>,
    segmentation_vary: HeaderValue,
    auth_vary: HeaderValue,
}

impl VaryState {
    /// Validate settings and build the engine state.
    ///
    /// # Panics
    ///
    /// Panics when a configured `Vary` token is not a valid header value,
    /// when the cookie name is not a valid cookie token, or when the
    /// encryption table is present with an empty secret. These are
    /// deployment mistakes that must surface at startup, not at request
    /// time.
    pub fn new(settings: VarySettings) -> Self {
        crate::telemetry::describe_metrics();

        assert!(
            is_cookie_token(&settings.cookie_name),
            "cookie name {:?} is not a valid cookie token",
            settings.cookie_name
        );
        let segmentation_vary = vary_token(&settings.segmentation_vary_token);
        let auth_vary = vary_token(&settings.auth_vary_token);
        let cipher = settings
            .encryption
            .as_ref()
            .map(|secrets| CookieCipher::from_secrets(&secrets.key, &secrets.iv));

        Self {
            inner: Arc::new(StateInner {
                settings,
                cipher,
                segmentation_vary,
                auth_vary,
            }),
        }
    }

    pub fn settings(&self) -> &VarySettings {
        &self.inner.settings
    }

    /// True when cookie payload encryption is active.
    pub fn encryption_enabled(&self) -> bool {
        self.inner.cipher.is_some()
    }

    pub(crate) fn cipher(&self) -> Option<&CookieCipher> {
        self.inner.cipher.as_ref()
    }

    pub(crate) fn segmentation_vary(&self) -> &HeaderValue {
        &self.inner.segmentation_vary
    }

    pub(crate) fn auth_vary(&self) -> &HeaderValue {
        &self.inner.auth_vary
    }

    /// Build a request context from the raw `Cookie` header value.
    pub fn context_from_cookie_header(&self, header: Option<&str>) -> VaryContext {
        let raw = header.and_then(|header| {
            Cookie::split_parse(header)
                .filter_map(Result::ok)
                .find(|cookie| cookie.name() == self.settings().cookie_name)
                .map(|cookie| cookie.value().to_string())
        });
        self.context_from_raw_cookie(raw.as_deref())
    }

    /// Build a request context from the segmentation cookie's raw value.
    ///
    /// With encryption enabled the payload is opened first; a payload that
    /// fails authentication degrades to an empty context, never an error.
    pub fn context_from_raw_cookie(&self, raw: Option<&str>) -> VaryContext {
        let decoded = match (raw, self.cipher()) {
            (None, _) => String::new(),
            (Some(raw), None) => raw.to_string(),
            (Some(raw), Some(cipher)) => match cipher.open(raw) {
                Some(plaintext) => plaintext,
                None => {
                    counter!(METRIC_COOKIE_DECRYPT_FAILURE).increment(1);
                    debug!("inbound segmentation cookie failed authentication; treating as absent");
                    String::new()
                }
            },
        };
        VaryContext::from_state(codec::parse(&decoded))
    }
}

fn vary_token(token: &str) -> HeaderValue {
    HeaderValue::from_str(token)
        .unwrap_or_else(|_| panic!("vary token {token:?} is not a valid header value"))
}

// RFC 6265 cookie-name token: printable ASCII minus separators.
fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !br#"()<>@,;:\"/[]?={}"#.contains(&b))
}

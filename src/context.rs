//! Per-request segmentation context.
//!
//! `VaryContext` owns everything the engine knows about one request: the
//! ordered group registry, the no-cache flag, the pending-write flags, the
//! lifecycle guard and the one-shot header emission. A context is built from
//! the inbound cookie at the start of a request and discarded at its end;
//! there is no cross-request state to reset.
//!
//! The lifecycle is a two-state machine. Before the boundary event fires the
//! registry and the no-cache flag are mutable; [`VaryContext::emit_headers`]
//! fires the boundary, after which every mutator fails with
//! [`VaryError::DidSendHeaders`] and re-firing is a no-op.

use axum::http::header::{SET_COOKIE, VARY};
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::cookie::{Cookie, SameSite};
use metrics::counter;
use time::Duration;
use tracing::{debug, error, warn};

use crate::codec::{self, CookieState};
use crate::config::SameSitePolicy;
use crate::error::VaryError;
use crate::state::VaryState;
use crate::telemetry::{METRIC_COOKIE_WRITE, METRIC_VARY_HEADER};

/// Audit payload published to observers once per request, after emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Emission {
    /// A `Vary` header was written to the response.
    pub vary_sent: bool,
    /// The segmentation cookie was (re)written.
    pub cookie_sent: bool,
}

type EmitObserver = Box<dyn FnOnce(&Emission) + Send>;

/// Request-scoped segmentation state and operations.
pub struct VaryContext {
    groups: Vec<(String, String)>,
    nocache: bool,
    group_pending: bool,
    nocache_pending: bool,
    headers_sent: bool,
    observers: Vec<EmitObserver>,
}

impl VaryContext {
    /// An empty context: no groups, no-cache off, nothing pending.
    pub fn new() -> Self {
        Self::from_state(CookieState::default())
    }

    /// Build a context from a parsed inbound cookie.
    ///
    /// Inbound state is established fact, not a mutation: nothing is marked
    /// pending, so an untouched context never rewrites the cookie.
    pub(crate) fn from_state(state: CookieState) -> Self {
        Self {
            groups: state.groups,
            nocache: state.nocache,
            group_pending: false,
            nocache_pending: false,
            headers_sent: false,
            observers: Vec::new(),
        }
    }

    fn guard(&self) -> Result<(), VaryError> {
        if self.headers_sent {
            Err(VaryError::DidSendHeaders)
        } else {
            Ok(())
        }
    }

    /// Validate a group name for the registration path.
    ///
    /// Registration failures get two channels: the structured error for the
    /// caller, plus a `warn!` diagnostic for the developer. The assignment
    /// path ([`set_segment`](Self::set_segment)) stays silent and returns
    /// only the structured error.
    fn validated_registration(&self, name: &str) -> Result<(), VaryError> {
        if let Err(cause) = codec::validate_token(name) {
            let error = VaryError::InvalidGroupName(cause);
            warn!(
                code = error.code(),
                cause = cause.code(),
                "rejected segmentation group registration"
            );
            return Err(error);
        }
        Ok(())
    }

    /// Register a segmentation group.
    ///
    /// A new group starts with an empty segment value ("known, unassigned").
    /// Registering an existing group is a no-op and keeps its current value.
    pub fn register_group(&mut self, name: &str) -> Result<(), VaryError> {
        self.guard()?;
        self.validated_registration(name)?;
        if !self.in_group(name) {
            self.groups.push((name.to_string(), String::new()));
        }
        Ok(())
    }

    /// Register several groups at once, all or nothing.
    ///
    /// A single invalid name aborts the whole batch before any registration
    /// happens, so the registry is never left partially updated.
    pub fn register_groups<I, S>(&mut self, names: I) -> Result<(), VaryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.guard()?;
        let names: Vec<S> = names.into_iter().collect();
        for name in &names {
            self.validated_registration(name.as_ref())?;
        }
        for name in &names {
            let name = name.as_ref();
            if !self.in_group(name) {
                self.groups.push((name.to_string(), String::new()));
            }
        }
        Ok(())
    }

    /// Assign the current client to a segment of a group.
    ///
    /// Upserts the mapping (the group is registered if it was not) and marks
    /// the cookie for rewrite at the boundary.
    pub fn set_segment(&mut self, name: &str, value: &str) -> Result<(), VaryError> {
        self.guard()?;
        codec::validate_token(name).map_err(VaryError::InvalidGroupName)?;
        codec::validate_token(value).map_err(VaryError::InvalidGroupSegment)?;

        match self.groups.iter().position(|(existing, _)| existing == name) {
            Some(index) => self.groups[index].1 = value.to_string(),
            None => self.groups.push((name.to_string(), value.to_string())),
        }
        self.group_pending = true;
        Ok(())
    }

    /// True when the group is present in the registry.
    ///
    /// An empty segment value still counts as membership; a never-registered
    /// group does not.
    pub fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|(existing, _)| existing == name)
    }

    /// True when the group is registered and its stored segment equals
    /// `value` exactly. The empty string and `"0"` are distinct values.
    pub fn in_segment(&self, name: &str, value: &str) -> bool {
        self.groups
            .iter()
            .any(|(existing, segment)| existing == name && segment == value)
    }

    /// Read-only snapshot of the registry, in insertion order.
    pub fn groups(&self) -> &[(String, String)] {
        &self.groups
    }

    /// True when the no-cache escape hatch is set for this client.
    pub fn is_nocache(&self) -> bool {
        self.nocache
    }

    /// Force this client to bypass the shared cache entirely.
    ///
    /// Always marks the cookie for rewrite, but does not by itself trigger
    /// the segmentation `Vary` token (see [`emit_headers`](Self::emit_headers)).
    pub fn set_nocache(&mut self) -> Result<(), VaryError> {
        self.guard()?;
        self.nocache = true;
        self.nocache_pending = true;
        Ok(())
    }

    /// Clear the no-cache escape hatch; marks the cookie for rewrite.
    pub fn remove_nocache(&mut self) -> Result<(), VaryError> {
        self.guard()?;
        self.nocache = false;
        self.nocache_pending = true;
        Ok(())
    }

    /// True once the boundary event has fired.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// True when the cookie must be rewritten at the boundary.
    pub fn cookie_pending(&self) -> bool {
        self.group_pending || self.nocache_pending
    }

    /// Register an observer for the post-emission audit notification.
    ///
    /// Observers run exactly once, in registration order, after the
    /// lifecycle guard flips. An observer registered after emission never
    /// runs.
    pub fn on_emit(&mut self, observer: impl FnOnce(&Emission) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Fire the "about to send headers" boundary.
    ///
    /// The first call decides and writes the `Vary` header and any pending
    /// cookie rewrite, flips the lifecycle guard, then notifies observers.
    /// Re-entry is a no-op: nothing is written, observers do not fire again,
    /// and the returned [`Emission`] is all-false.
    ///
    /// Token choice: with encryption enabled, groups or no-cache produce the
    /// auth token; in plaintext mode only groups produce the segmentation
    /// token. No-cache alone never triggers the segmentation token, even
    /// though it always rewrites the cookie.
    pub fn emit_headers(&mut self, headers: &mut HeaderMap, state: &VaryState) -> Emission {
        if self.headers_sent {
            debug!("segmentation boundary re-entered; headers already emitted");
            return Emission::default();
        }

        let has_groups = !self.groups.is_empty();
        let vary = if state.encryption_enabled() {
            (has_groups || self.nocache).then(|| state.auth_vary().clone())
        } else {
            has_groups.then(|| state.segmentation_vary().clone())
        };

        let mut emission = Emission::default();

        if let Some(token) = vary {
            headers.append(VARY, token);
            counter!(METRIC_VARY_HEADER).increment(1);
            emission.vary_sent = true;
        }

        if self.cookie_pending() {
            if let Some(value) = self.build_set_cookie(state) {
                headers.append(SET_COOKIE, value);
                counter!(METRIC_COOKIE_WRITE).increment(1);
                emission.cookie_sent = true;
            }
        }

        self.headers_sent = true;

        debug!(
            vary_sent = emission.vary_sent,
            cookie_sent = emission.cookie_sent,
            group_count = self.groups.len(),
            nocache = self.nocache,
            "segmentation headers emitted"
        );

        for observer in self.observers.drain(..) {
            observer(&emission);
        }

        emission
    }

    /// Serialize current state into a `Set-Cookie` value with the configured
    /// attributes. An empty payload becomes a removal cookie so stale state
    /// does not linger on the client.
    fn build_set_cookie(&self, state: &VaryState) -> Option<HeaderValue> {
        let mut payload = codec::serialize(&self.groups, self.nocache);
        if let Some(cipher) = state.cipher() {
            payload = cipher.seal(&payload);
        }

        let settings = state.settings();
        let max_age = if payload.is_empty() {
            Duration::ZERO
        } else {
            Duration::seconds(settings.cookie_max_age_secs)
        };

        let cookie = Cookie::build((settings.cookie_name.clone(), payload))
            .path(settings.cookie_path.clone())
            .max_age(max_age)
            .secure(settings.cookie_secure)
            .http_only(settings.cookie_http_only)
            .same_site(same_site(settings.cookie_same_site))
            .build();

        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => Some(value),
            // Unreachable: tokens are validated, payloads are base64 and the
            // cookie name was checked at startup.
            Err(_) => {
                error!("segmentation cookie could not be encoded as a header value");
                None
            }
        }
    }
}

impl Default for VaryContext {
    fn default() -> Self {
        Self::new()
    }
}

fn same_site(policy: SameSitePolicy) -> SameSite {
    match policy {
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::None => SameSite::None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::config::VarySettings;
    use crate::error::TokenError;

    fn plaintext_state() -> VaryState {
        VaryState::new(VarySettings {
            cookie_secure: false,
            ..VarySettings::default()
        })
    }

    fn encrypted_state() -> VaryState {
        VaryState::new(VarySettings {
            cookie_secure: false,
            encryption: Some(crate::config::EncryptionSettings {
                key: "key-material".to_string(),
                iv: "iv-material".to_string(),
            }),
            ..VarySettings::default()
        })
    }

    #[test]
    fn membership_before_and_after_registration() {
        let mut ctx = VaryContext::new();
        assert!(!ctx.in_group("beta"));

        ctx.register_group("beta").expect("valid name registers");
        assert!(ctx.in_group("beta"));
        assert!(ctx.in_segment("beta", ""));
        assert!(!ctx.in_segment("beta", "0"));
    }

    #[test]
    fn register_is_idempotent_and_keeps_the_segment() {
        let mut ctx = VaryContext::new();
        ctx.set_segment("beta", "yes").expect("assignment succeeds");
        ctx.register_group("beta").expect("re-registration is a no-op");
        assert!(ctx.in_segment("beta", "yes"));
        assert_eq!(ctx.groups().len(), 1);
    }

    #[test]
    fn register_rejects_invalid_names_with_the_name_code() {
        let mut ctx = VaryContext::new();
        let error = ctx.register_group("has space").expect_err("space is forbidden");
        assert_eq!(error.code(), "invalid_vary_group_name");
        assert_eq!(error.token_cause(), Some(TokenError::InvalidChars));

        let error = ctx.register_group("a_--_b").expect_err("delimiter is forbidden");
        assert_eq!(error.token_cause(), Some(TokenError::CannotUseDelimiter));
        assert!(ctx.groups().is_empty());
    }

    #[test]
    fn batch_registration_is_all_or_nothing() {
        let mut ctx = VaryContext::new();
        ctx.register_group("existing").expect("valid name registers");

        let error = ctx
            .register_groups(["alpha", "bad name", "gamma"])
            .expect_err("one invalid entry aborts the batch");
        assert_eq!(error.code(), "invalid_vary_group_name");

        // The registry is exactly what it was before the call.
        assert_eq!(ctx.groups(), &[("existing".to_string(), String::new())]);

        ctx.register_groups(["alpha", "gamma"]).expect("clean batch applies");
        assert!(ctx.in_group("alpha"));
        assert!(ctx.in_group("gamma"));
    }

    #[test]
    fn set_segment_distinguishes_name_and_value_codes() {
        let mut ctx = VaryContext::new();

        let error = ctx.set_segment("bad name", "yes").expect_err("invalid name");
        assert_eq!(error.code(), "invalid_vary_group_name");

        let error = ctx.set_segment("beta", "bad value").expect_err("invalid value");
        assert_eq!(error.code(), "invalid_vary_group_segment");

        assert!(ctx.groups().is_empty());
        assert!(!ctx.cookie_pending());
    }

    #[test]
    fn set_segment_upserts_and_marks_the_cookie_pending() {
        let mut ctx = VaryContext::new();
        assert!(!ctx.cookie_pending());

        ctx.set_segment("beta", "yes").expect("assignment succeeds");
        assert!(ctx.cookie_pending());
        assert!(ctx.in_segment("beta", "yes"));

        ctx.set_segment("beta", "no").expect("reassignment succeeds");
        assert!(ctx.in_segment("beta", "no"));
        assert_eq!(ctx.groups().len(), 1);
    }

    #[test]
    fn empty_string_and_zero_are_distinct_segments() {
        let mut ctx = VaryContext::new();
        ctx.set_segment("beta", "0").expect("assignment succeeds");
        assert!(ctx.in_segment("beta", "0"));
        assert!(!ctx.in_segment("beta", ""));
    }

    #[test]
    fn nocache_toggles_mark_the_cookie_pending() {
        let mut ctx = VaryContext::new();
        ctx.set_nocache().expect("flag sets");
        assert!(ctx.is_nocache());
        assert!(ctx.cookie_pending());

        let mut ctx = VaryContext::new();
        ctx.remove_nocache().expect("flag clears");
        assert!(!ctx.is_nocache());
        assert!(ctx.cookie_pending());
    }

    #[test]
    fn no_emission_when_nothing_registered() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        let mut headers = HeaderMap::new();

        let emission = ctx.emit_headers(&mut headers, &state);
        assert_eq!(emission, Emission { vary_sent: false, cookie_sent: false });
        assert!(headers.get(VARY).is_none());
        assert!(headers.get(SET_COOKIE).is_none());
    }

    #[test]
    fn groups_alone_emit_vary_but_no_cookie() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.register_group("dev-group").expect("valid name registers");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);

        assert!(emission.vary_sent);
        assert!(!emission.cookie_sent);
        assert_eq!(
            headers.get(VARY).and_then(|v| v.to_str().ok()),
            Some("X-Segvary-Segmentation")
        );
        assert!(headers.get(SET_COOKIE).is_none());
    }

    #[test]
    fn assignment_emits_vary_and_rewrites_the_cookie() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.set_segment("dev-group", "yep").expect("assignment succeeds");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);

        assert!(emission.vary_sent);
        assert!(emission.cookie_sent);
        let cookie = headers
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("cookie was written");
        assert!(cookie.starts_with("segvary-state=dev-group_--_yep"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn nocache_alone_in_plaintext_mode_rewrites_cookie_without_vary() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.set_nocache().expect("flag sets");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);

        assert!(!emission.vary_sent);
        assert!(emission.cookie_sent);
        assert!(headers.get(VARY).is_none());
        let cookie = headers
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("cookie was written");
        assert!(cookie.starts_with("segvary-state=nocache"));
    }

    #[test]
    fn nocache_under_encryption_emits_the_auth_token() {
        let state = encrypted_state();
        let mut ctx = VaryContext::new();
        ctx.set_nocache().expect("flag sets");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);

        assert!(emission.vary_sent);
        assert!(emission.cookie_sent);
        assert_eq!(
            headers.get(VARY).and_then(|v| v.to_str().ok()),
            Some("X-Segvary-Auth")
        );
        let cookie = headers
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("cookie was written");
        // Sealed payload: the reserved token must not be readable.
        assert!(!cookie.contains("nocache"));
    }

    #[test]
    fn groups_under_encryption_emit_the_auth_token() {
        let state = encrypted_state();
        let mut ctx = VaryContext::new();
        ctx.register_group("beta").expect("valid name registers");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);
        assert!(emission.vary_sent);
        assert_eq!(
            headers.get(VARY).and_then(|v| v.to_str().ok()),
            Some("X-Segvary-Auth")
        );
    }

    #[test]
    fn removing_the_last_state_issues_a_removal_cookie() {
        let state = plaintext_state();
        let mut ctx = VaryContext::from_state(CookieState {
            groups: Vec::new(),
            nocache: true,
        });
        ctx.remove_nocache().expect("flag clears");

        let mut headers = HeaderMap::new();
        let emission = ctx.emit_headers(&mut headers, &state);

        assert!(emission.cookie_sent);
        let cookie = headers
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .expect("removal cookie was written");
        assert!(cookie.starts_with("segvary-state=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn mutators_fail_after_the_boundary_and_leave_state_untouched() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.set_segment("beta", "yes").expect("assignment succeeds");
        ctx.emit_headers(&mut HeaderMap::new(), &state);
        assert!(ctx.headers_sent());

        assert_eq!(ctx.register_group("late"), Err(VaryError::DidSendHeaders));
        assert_eq!(
            ctx.register_groups(["late", "later"]),
            Err(VaryError::DidSendHeaders)
        );
        assert_eq!(ctx.set_segment("beta", "no"), Err(VaryError::DidSendHeaders));
        assert_eq!(ctx.set_nocache(), Err(VaryError::DidSendHeaders));
        assert_eq!(ctx.remove_nocache(), Err(VaryError::DidSendHeaders));

        assert_eq!(ctx.groups(), &[("beta".to_string(), "yes".to_string())]);
        assert!(!ctx.is_nocache());
    }

    #[test]
    fn re_firing_the_boundary_is_a_no_op() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.set_segment("beta", "yes").expect("assignment succeeds");

        let mut headers = HeaderMap::new();
        let first = ctx.emit_headers(&mut headers, &state);
        assert!(first.vary_sent && first.cookie_sent);

        let before = headers.len();
        let second = ctx.emit_headers(&mut headers, &state);
        assert_eq!(second, Emission::default());
        assert_eq!(headers.len(), before);
    }

    #[test]
    fn observers_fire_exactly_once_after_the_guard_flips() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();
        ctx.register_group("beta").expect("valid name registers");

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(None));
        {
            let calls = calls.clone();
            let seen = seen.clone();
            ctx.on_emit(move |emission| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock().expect("observer lock") = Some(*emission);
            });
        }

        let mut headers = HeaderMap::new();
        ctx.emit_headers(&mut headers, &state);
        ctx.emit_headers(&mut headers, &state);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().expect("observer lock"),
            Some(Emission { vary_sent: true, cookie_sent: false })
        );
    }

    #[test]
    fn observers_fire_even_when_nothing_was_emitted() {
        let state = plaintext_state();
        let mut ctx = VaryContext::new();

        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            ctx.on_emit(move |emission| {
                assert_eq!(*emission, Emission::default());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        ctx.emit_headers(&mut HeaderMap::new(), &state);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

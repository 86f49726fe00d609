//! Segvary: request-time cache segmentation.
//!
//! Decides, per request, which cache variant a page belongs to — by
//! inspecting an (optionally encrypted) cookie and a set of registered
//! segmentation groups — and emits the `Vary` response header and cookie
//! mutations a front-line HTTP cache needs to serve group-specific variants
//! safely. An orthogonal no-cache escape hatch lets a single client bypass
//! the shared cache entirely.
//!
//! The engine does not implement the HTTP cache itself; it only produces the
//! signal (`Vary` token + cookie) an external cache folds into its variant
//! key.
//!
//! ## Usage
//!
//! ```ignore
//! let state = VaryState::new(VarySettings::default());
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(middleware::from_fn_with_state(state.clone(), vary_cache_layer));
//! ```
//!
//! Handlers mutate the request's [`VaryContext`] (register groups, assign
//! segments, toggle no-cache) until the middleware fires the headers
//! boundary; after that point every mutator fails with
//! [`VaryError::DidSendHeaders`].
//!
//! ## Configuration
//!
//! [`VarySettings`] embeds as a section of the host's TOML configuration:
//!
//! ```toml
//! [vary_cache]
//! cookie_name = "segvary-state"
//!
//! [vary_cache.encryption]
//! key = "..."
//! iv = "..."
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod middleware;
pub mod state;
pub mod telemetry;

pub use config::{EncryptionSettings, SameSitePolicy, VarySettings};
pub use context::{Emission, VaryContext};
pub use crypto::CookieCipher;
pub use error::{TokenError, VaryError};
pub use middleware::{SharedVaryContext, vary_cache_layer};
pub use state::VaryState;

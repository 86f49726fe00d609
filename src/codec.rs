//! Cookie codec: the delimiter grammar of the segmentation cookie.
//!
//! The serialized form is an optional leading no-cache token followed by
//! `name_--_value` pairs joined by `---__`, in registry insertion order:
//!
//! ```text
//! nocache---__beta_--_yes---__region_--_eu
//! ```
//!
//! Names and values are restricted to `[A-Za-z0-9_-]` and may never contain
//! either delimiter, so the grammar splits unambiguously. Serialization is
//! strict (writers go through [`validate_token`]); parsing is lenient,
//! because the cookie is attacker-influenced input — anything that does not
//! match the grammar is skipped, never raised.

use tracing::debug;

use crate::error::TokenError;

/// Separator between the name and the value of one pair.
pub const VALUE_SEPARATOR: &str = "_--_";
/// Separator between pairs.
pub const GROUP_SEPARATOR: &str = "---__";
/// Reserved leading token marking the no-cache escape hatch.
pub const NOCACHE_TOKEN: &str = "nocache";

/// Deserialized cookie payload: ordered group/segment pairs plus the
/// no-cache flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieState {
    pub groups: Vec<(String, String)>,
    pub nocache: bool,
}

/// Validate a group name or segment value.
///
/// Single source of truth for the registry mutators and the codec. The
/// delimiter check runs first: a token built entirely from allowed
/// characters can still spell out a delimiter (`a_--_b`), and that case must
/// be reported as a delimiter violation.
pub fn validate_token(token: &str) -> Result<(), TokenError> {
    if token.contains(VALUE_SEPARATOR) || token.contains(GROUP_SEPARATOR) {
        return Err(TokenError::CannotUseDelimiter);
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TokenError::InvalidChars);
    }
    Ok(())
}

/// Serialize the registry and the no-cache flag.
///
/// An empty registry with no-cache unset serializes to the empty string.
pub fn serialize(groups: &[(String, String)], nocache: bool) -> String {
    let mut chunks: Vec<String> = Vec::with_capacity(groups.len() + 1);
    if nocache {
        chunks.push(NOCACHE_TOKEN.to_string());
    }
    for (name, value) in groups {
        chunks.push(format!("{name}{VALUE_SEPARATOR}{value}"));
    }
    chunks.join(GROUP_SEPARATOR)
}

/// Parse a raw cookie value.
///
/// The no-cache token is recognized positionally (first chunk only). Chunks
/// with the wrong arity, or whose name or value fails [`validate_token`],
/// are skipped: a pair that would not survive re-serialization must not
/// enter the registry.
pub fn parse(raw: &str) -> CookieState {
    let mut state = CookieState::default();
    if raw.is_empty() {
        return state;
    }

    for (index, chunk) in raw.split(GROUP_SEPARATOR).enumerate() {
        if index == 0 && chunk == NOCACHE_TOKEN {
            state.nocache = true;
            continue;
        }

        let Some((name, value)) = chunk.split_once(VALUE_SEPARATOR) else {
            debug!(chunk_len = chunk.len(), "skipping segmentation cookie chunk without a value separator");
            continue;
        };
        if value.contains(VALUE_SEPARATOR) {
            debug!(chunk_len = chunk.len(), "skipping segmentation cookie chunk with extra value separators");
            continue;
        }
        if validate_token(name).is_err() || validate_token(value).is_err() {
            debug!(chunk_len = chunk.len(), "skipping segmentation cookie chunk with forbidden characters");
            continue;
        }

        state.groups.push((name.to_string(), value.to_string()));
    }

    state
}

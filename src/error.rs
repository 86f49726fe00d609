//! Error taxonomy for the segmentation contract.
//!
//! Every error carries a stable machine code; callers branch on the code or
//! the variant, never on message text. Malformed inbound cookies are not
//! errors at all — the codec degrades them silently.

use thiserror::Error;

/// Codec-level validation failure for a single group name or segment value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The token contains one of the reserved cookie delimiters.
    #[error("vary cache tokens cannot contain the reserved delimiters")]
    CannotUseDelimiter,
    /// The token contains characters outside letters, digits, hyphen and
    /// underscore.
    #[error("vary cache tokens may only contain letters, digits, hyphen and underscore")]
    InvalidChars,
}

impl TokenError {
    /// Stable machine code for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::CannotUseDelimiter => "vary_cache_group_cannot_use_delimiter",
            TokenError::InvalidChars => "vary_cache_group_invalid_chars",
        }
    }
}

/// Structured errors returned by the segmentation mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VaryError {
    /// The group name failed the character/delimiter rule.
    #[error("invalid vary group name")]
    InvalidGroupName(#[source] TokenError),
    /// The segment value failed the character/delimiter rule.
    #[error("invalid vary group segment")]
    InvalidGroupSegment(#[source] TokenError),
    /// A mutation was attempted after the response headers were sent.
    #[error("cannot modify segmentation state after response headers were sent")]
    DidSendHeaders,
}

impl VaryError {
    /// Stable machine code for diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            VaryError::InvalidGroupName(_) => "invalid_vary_group_name",
            VaryError::InvalidGroupSegment(_) => "invalid_vary_group_segment",
            VaryError::DidSendHeaders => "did_send_headers",
        }
    }

    /// Codec-level cause, when the failure came from token validation.
    pub fn token_cause(&self) -> Option<TokenError> {
        match self {
            VaryError::InvalidGroupName(cause) | VaryError::InvalidGroupSegment(cause) => {
                Some(*cause)
            }
            VaryError::DidSendHeaders => None,
        }
    }
}

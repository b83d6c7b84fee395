//! Local checks run before the guest is consulted.
//!
//! A request failing any of them is blocked without a guest call.

use std::fmt;

use crate::request::RequestSnapshot;
use waf_runtime_common::FilterConfig;

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// No `User-Agent`, or only whitespace.
    EmptyUserAgent,
    /// `User-Agent` longer than the configured limit.
    UserAgentTooLong,
    /// `User-Agent` is not valid UTF-8.
    InvalidUserAgent,
    /// Decoded path longer than the configured limit.
    PathTooLong,
    /// Decoded path is not valid UTF-8.
    InvalidPath,
    /// Method longer than the configured limit.
    MethodTooLong,
    /// Client country is on the block list.
    BlockedCountry,
    /// The guest answered `blocked`.
    Guest,
}

impl BlockReason {
    /// Short machine-readable name, used as a log field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyUserAgent => "empty_user_agent",
            Self::UserAgentTooLong => "user_agent_too_long",
            Self::InvalidUserAgent => "invalid_user_agent",
            Self::PathTooLong => "path_too_long",
            Self::InvalidPath => "invalid_path",
            Self::MethodTooLong => "method_too_long",
            Self::BlockedCountry => "blocked_country",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request fields that passed the pre-filters, in the form the guest sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screened<'a> {
    /// Trimmed `User-Agent`.
    pub user_agent: &'a str,
    /// Decoded path.
    pub path: &'a str,
}

/// Run every pre-filter against `snapshot`.
///
/// # Errors
///
/// Returns the first [`BlockReason`] that applies.
pub fn check<'a>(config: &FilterConfig, snapshot: &'a RequestSnapshot) -> Result<Screened<'a>, BlockReason> {
    let user_agent = check_user_agent(config, &snapshot.user_agent)?;

    if snapshot.path.len() > config.max_path_len {
        return Err(BlockReason::PathTooLong);
    }
    let path = std::str::from_utf8(&snapshot.path).map_err(|_| BlockReason::InvalidPath)?;

    if snapshot.method.len() > config.max_method_len {
        return Err(BlockReason::MethodTooLong);
    }

    if is_blocked_country(config, &snapshot.client.country_code) {
        return Err(BlockReason::BlockedCountry);
    }

    Ok(Screened { user_agent, path })
}

fn check_user_agent<'a>(config: &FilterConfig, raw: &'a [u8]) -> Result<&'a str, BlockReason> {
    let trimmed = raw.trim_ascii();

    if trimmed.is_empty() {
        return Err(BlockReason::EmptyUserAgent);
    }
    if trimmed.len() > config.max_user_agent_len {
        return Err(BlockReason::UserAgentTooLong);
    }

    std::str::from_utf8(trimmed).map_err(|_| BlockReason::InvalidUserAgent)
}

fn is_blocked_country(config: &FilterConfig, country_code: &str) -> bool {
    !country_code.is_empty()
        && config
            .blocked_countries
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(country_code))
}

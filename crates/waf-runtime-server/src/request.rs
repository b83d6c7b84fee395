//! Per-request snapshot handed to the filters.
//!
//! Only the fields the filters look at are copied out of the HTTP request.
//! The `User-Agent` value is kept as raw bytes so that non-text values can
//! be told apart from missing ones. The path is percent-decoded once here;
//! the pre-filters and the guest both see the decoded form.

use axum::extract::Request;
use axum::http::{Version, header};

use crate::client::ClientInfo;
use crate::prefilter::Screened;
use waf_runtime_core::AnalyzeRequestInput;

/// The request fields the filters decide on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    /// HTTP method.
    pub method: String,
    /// Raw `User-Agent` header value, empty when absent.
    pub user_agent: Vec<u8>,
    /// Percent-decoded request path, without the query string.
    ///
    /// Raw bytes, since a decoded path need not be UTF-8.
    pub path: Vec<u8>,
    /// Protocol major version.
    pub http_version_major: i64,
    /// Protocol minor version.
    pub http_version_minor: i64,
    /// Who sent the request.
    pub client: ClientInfo,
}

impl RequestSnapshot {
    /// Copy the filtered fields out of `request`.
    pub fn from_request(request: &Request, client: ClientInfo) -> Self {
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .map(|value| value.as_bytes().to_vec())
            .unwrap_or_default();
        let (http_version_major, http_version_minor) = version_numbers(request.version());

        Self {
            method: request.method().as_str().to_string(),
            user_agent,
            path: decode_path(request.uri().path()),
            http_version_major,
            http_version_minor,
            client,
        }
    }

    /// Guest input for this request, given the fields that passed the
    /// pre-filters.
    pub fn to_input(&self, screened: Screened<'_>) -> AnalyzeRequestInput {
        AnalyzeRequestInput {
            http_method: self.method.clone(),
            user_agent: screened.user_agent.to_string(),
            ip_address: self.client.ip,
            asn: i64::from(self.client.asn),
            path: screened.path.to_string(),
            http_version_major: self.http_version_major,
            http_version_minor: self.http_version_minor,
        }
    }
}

/// Percent-decode a request path into raw bytes.
///
/// Malformed escapes are kept literally.
pub fn decode_path(path: &str) -> Vec<u8> {
    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                decoded.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    decoded
}

fn hex_value(byte: u8) -> Option<u8> {
    char::from(byte)
        .to_digit(16)
        .and_then(|digit| u8::try_from(digit).ok())
}

fn version_numbers(version: Version) -> (i64, i64) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

//! Payload types exchanged with the guest.
//!
//! Every payload crossing the boundary is a UTF-8 JSON document. Results
//! travel inside an [`Envelope`] carrying either `ok` or `error`.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use waf_runtime_common::CallError;

/// Result envelope shared by host and guest.
///
/// Exactly one of the two fields is populated; absent fields are omitted
/// when serializing and accepted as `null` when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    /// Wrap a successful value.
    pub fn ok(value: T) -> Self {
        Self {
            ok: Some(value),
            error: None,
        }
    }

    /// Wrap an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: None,
            error: Some(message.into()),
        }
    }

    /// Convert into the call result it stands for.
    ///
    /// An error message wins over a value; an envelope carrying neither is
    /// a decoding failure.
    pub fn into_result(self) -> Result<T, CallError> {
        match (self.ok, self.error) {
            (_, Some(message)) => Err(CallError::Application(message)),
            (Some(value), None) => Ok(value),
            (None, None) => Err(CallError::Decode(
                "envelope carries neither ok nor error".into(),
            )),
        }
    }
}

/// Exported guest functions callable through the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestExport {
    /// `analyze_request(buf) -> buf`
    AnalyzeRequest,
    /// `verify_bot(buf) -> buf`
    VerifyBot,
}

impl GuestExport {
    /// Export name in the guest module.
    pub fn name(self) -> &'static str {
        match self {
            Self::AnalyzeRequest => "analyze_request",
            Self::VerifyBot => "verify_bot",
        }
    }
}

impl fmt::Display for GuestExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input of `analyze_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequestInput {
    pub http_method: String,
    pub user_agent: String,
    pub ip_address: IpAddr,
    pub asn: i64,
    pub path: String,
    pub http_version_major: i64,
    pub http_version_minor: i64,
}

/// Output of `analyze_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequestOutput {
    pub outcome: Outcome,
}

/// Verdict of the guest on one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Blocked,
    VerifiedBot,
    /// Any tag this host does not know; handled as a fail-open anomaly.
    #[serde(other)]
    Unrecognized,
}

/// Input of the `dns_lookup_ip_address` host function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupHostInput {
    pub ip_address: IpAddr,
    /// Only used for logging on the host side.
    #[serde(default)]
    pub user_agent: String,
}

/// Output of the `dns_lookup_ip_address` host function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupHostOutput {
    /// Resolved hostname, empty when the address has no usable PTR record.
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization_omits_empty_fields() {
        let ok = Envelope::ok(LookupHostOutput {
            hostname: "crawl.example.com".into(),
        });
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"ok":{"hostname":"crawl.example.com"}}"#
        );

        let err: Envelope<LookupHostOutput> = Envelope::error("lookup failed");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"error":"lookup failed"}"#
        );
    }

    #[test]
    fn test_envelope_into_result() {
        let envelope: Envelope<AnalyzeRequestOutput> =
            serde_json::from_str(r#"{"ok":{"outcome":"verified_bot"},"error":null}"#).unwrap();
        assert_eq!(envelope.into_result().unwrap().outcome, Outcome::VerifiedBot);

        let envelope: Envelope<AnalyzeRequestOutput> =
            serde_json::from_str(r#"{"ok":null,"error":"bad input"}"#).unwrap();
        assert_eq!(
            envelope.into_result(),
            Err(CallError::Application("bad input".into()))
        );

        let envelope: Envelope<AnalyzeRequestOutput> = serde_json::from_str("{}").unwrap();
        assert!(matches!(envelope.into_result(), Err(CallError::Decode(_))));
    }

    #[test]
    fn test_envelope_missing_fields_for_non_default_payload() {
        // Neither payload type implements `Default`.
        let envelope: Envelope<LookupHostOutput> =
            serde_json::from_str(r#"{"ok":{"hostname":"a.example"}}"#).unwrap();
        assert_eq!(envelope.into_result().unwrap().hostname, "a.example");

        let envelope: Envelope<AnalyzeRequestOutput> =
            serde_json::from_slice(br#"{"error":"no rules"}"#).unwrap();
        assert_eq!(
            envelope.into_result(),
            Err(CallError::Application("no rules".into()))
        );
    }

    #[test]
    fn test_outcome_tags() {
        let parse = |tag: &str| -> Outcome {
            serde_json::from_str::<AnalyzeRequestOutput>(&format!(r#"{{"outcome":"{tag}"}}"#))
                .unwrap()
                .outcome
        };

        assert_eq!(parse("allowed"), Outcome::Allowed);
        assert_eq!(parse("blocked"), Outcome::Blocked);
        assert_eq!(parse("verified_bot"), Outcome::VerifiedBot);
        assert_eq!(parse("bot"), Outcome::Unrecognized);
    }

    #[test]
    fn test_analyze_request_input_field_names() {
        let input = AnalyzeRequestInput {
            http_method: "GET".into(),
            user_agent: "curl/8.0".into(),
            ip_address: "203.0.113.9".parse().unwrap(),
            asn: 64_496,
            path: "/".into(),
            http_version_major: 1,
            http_version_minor: 1,
        };

        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["http_method"], "GET");
        assert_eq!(value["ip_address"], "203.0.113.9");
        assert_eq!(value["asn"], 64_496);
        assert_eq!(value["http_version_minor"], 1);
    }

    #[test]
    fn test_guest_export_names() {
        assert_eq!(GuestExport::AnalyzeRequest.name(), "analyze_request");
        assert_eq!(GuestExport::VerifyBot.to_string(), "verify_bot");
    }
}

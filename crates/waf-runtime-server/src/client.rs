//! Client metadata attached to inbound requests.
//!
//! Geo-IP and ASN enrichment happens upstream of this crate. An enriching
//! layer inserts a [`ClientInfo`] extension; without one, the peer address
//! of the connection is used with no country and ASN 0.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};

/// Who sent a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client address.
    pub ip: IpAddr,
    /// ISO 3166-1 alpha-2 country code, empty when unknown.
    pub country_code: String,
    /// Autonomous system number, 0 when unknown.
    pub asn: u32,
}

impl ClientInfo {
    /// Client metadata with a known country and ASN.
    pub fn new(ip: IpAddr, country_code: impl Into<String>, asn: u32) -> Self {
        Self {
            ip,
            country_code: country_code.into(),
            asn,
        }
    }

    /// Client metadata carrying only an address.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self::new(ip, "", 0)
    }

    /// Metadata for `request`: the [`ClientInfo`] extension if present,
    /// otherwise the peer address recorded by `ConnectInfo`.
    pub fn from_request(request: &Request) -> Option<Self> {
        let extensions = request.extensions();

        if let Some(info) = extensions.get::<ClientInfo>() {
            return Some(info.clone());
        }

        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Self::from_ip(addr.ip()))
    }
}

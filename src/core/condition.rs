//! Filter conditions
//!
//! A condition is one conjunctive match predicate: a field, a match type and
//! a typed value. Binding writes it into one pre-allocated slot of a filter
//! builder in two phases (field key plus match type, then the value).

use crate::core::constants::fields;
use crate::core::error::{Error, Result};
use crate::core::filter::MatchType;
use crate::core::guard::FilterBuilder;
use crate::core::identity::Identity;
use crate::engine::{Engine, WideString};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Which side of the connection an address or port condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Endpoint {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Application identifier, matched on the absolute executable path
    AleAppId { match_type: MatchType, path: String },
    IpLocalAddressV4 {
        match_type: MatchType,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    },
    IpRemoteAddressV4 {
        match_type: MatchType,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    },
    IpLocalAddressV6 {
        match_type: MatchType,
        address: Ipv6Addr,
        prefix_len: u8,
    },
    IpRemoteAddressV6 {
        match_type: MatchType,
        address: Ipv6Addr,
        prefix_len: u8,
    },
    IpLocalPort { match_type: MatchType, port: u16 },
    IpRemotePort { match_type: MatchType, port: u16 },
}

impl Condition {
    pub fn app_id(match_type: MatchType, path: impl Into<String>) -> Self {
        Self::AleAppId {
            match_type,
            path: path.into(),
        }
    }

    pub fn port(endpoint: Endpoint, match_type: MatchType, port: u16) -> Self {
        match endpoint {
            Endpoint::Local => Self::IpLocalPort { match_type, port },
            Endpoint::Remote => Self::IpRemotePort { match_type, port },
        }
    }

    pub fn v4(
        endpoint: Endpoint,
        match_type: MatchType,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Self {
        match endpoint {
            Endpoint::Local => Self::IpLocalAddressV4 {
                match_type,
                address,
                mask,
            },
            Endpoint::Remote => Self::IpRemoteAddressV4 {
                match_type,
                address,
                mask,
            },
        }
    }

    pub fn v6(
        endpoint: Endpoint,
        match_type: MatchType,
        address: Ipv6Addr,
        prefix_len: u8,
    ) -> Self {
        match endpoint {
            Endpoint::Local => Self::IpLocalAddressV6 {
                match_type,
                address,
                prefix_len,
            },
            Endpoint::Remote => Self::IpRemoteAddressV6 {
                match_type,
                address,
                prefix_len,
            },
        }
    }

    /// Address condition from a network: IPv4 becomes address plus mask,
    /// IPv6 becomes address plus prefix length.
    pub fn network(endpoint: Endpoint, match_type: MatchType, network: IpNetwork) -> Self {
        match network {
            IpNetwork::V4(net) => Self::v4(endpoint, match_type, net.ip(), net.mask()),
            IpNetwork::V6(net) => Self::v6(endpoint, match_type, net.ip(), net.prefix()),
        }
    }

    /// Address condition from raw bytes (4 for IPv4, 16 for IPv6).
    pub fn address_from_bytes(
        endpoint: Endpoint,
        match_type: MatchType,
        bytes: &[u8],
        prefix_len: u8,
    ) -> Result<Self> {
        let network = match validators::address_from_bytes(bytes)? {
            IpAddr::V4(addr) => IpNetwork::V4(
                ipnetwork::Ipv4Network::new(addr, prefix_len)
                    .map_err(|e| Error::InvalidInput(format!("IPv4 prefix: {e}")))?,
            ),
            IpAddr::V6(addr) => IpNetwork::V6(
                ipnetwork::Ipv6Network::new(addr, prefix_len)
                    .map_err(|e| Error::InvalidInput(format!("IPv6 prefix: {e}")))?,
            ),
        };
        Ok(Self::network(endpoint, match_type, network))
    }

    /// Field identity this condition targets.
    pub fn field(&self) -> Identity {
        match self {
            Self::AleAppId { .. } => fields::ALE_APP_ID,
            Self::IpLocalAddressV4 { .. } | Self::IpLocalAddressV6 { .. } => {
                fields::IP_LOCAL_ADDRESS
            }
            Self::IpRemoteAddressV4 { .. } | Self::IpRemoteAddressV6 { .. } => {
                fields::IP_REMOTE_ADDRESS
            }
            Self::IpLocalPort { .. } => fields::IP_LOCAL_PORT,
            Self::IpRemotePort { .. } => fields::IP_REMOTE_PORT,
        }
    }

    pub fn match_type(&self) -> MatchType {
        match self {
            Self::AleAppId { match_type, .. }
            | Self::IpLocalAddressV4 { match_type, .. }
            | Self::IpRemoteAddressV4 { match_type, .. }
            | Self::IpLocalAddressV6 { match_type, .. }
            | Self::IpRemoteAddressV6 { match_type, .. }
            | Self::IpLocalPort { match_type, .. }
            | Self::IpRemotePort { match_type, .. } => *match_type,
        }
    }

    /// Writes this condition into slot `index` of `builder`.
    ///
    /// Payload validation happens before anything reaches the engine, so an
    /// invalid condition leaves the slot untouched.
    pub fn bind<E: Engine>(&self, builder: &mut FilterBuilder<'_, E>, index: u32) -> Result<()> {
        match self {
            Self::AleAppId { path, .. } => {
                let blob = WideString::new(path).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "application path '{}' contains NUL",
                        path.escape_debug()
                    ))
                })?;
                builder.set_condition_field(index, &self.field(), self.match_type())?;
                builder.set_condition_blob_string(index, &blob)
            }
            Self::IpLocalAddressV4 { address, mask, .. }
            | Self::IpRemoteAddressV4 { address, mask, .. } => {
                builder.set_condition_field(index, &self.field(), self.match_type())?;
                builder.set_condition_v4(index, u32::from(*address), u32::from(*mask))
            }
            Self::IpLocalAddressV6 {
                address,
                prefix_len,
                ..
            }
            | Self::IpRemoteAddressV6 {
                address,
                prefix_len,
                ..
            } => {
                validators::validate_prefix_len(*prefix_len, 128)?;
                builder.set_condition_field(index, &self.field(), self.match_type())?;
                builder.set_condition_v6(index, &address.octets(), *prefix_len)
            }
            Self::IpLocalPort { port, .. } | Self::IpRemotePort { port, .. } => {
                builder.set_condition_field(index, &self.field(), self.match_type())?;
                builder.set_condition_u16(index, *port)
            }
        }
    }
}

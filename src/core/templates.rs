//! Standard VPN-control filter shapes
//!
//! Weights decide which filter wins inside one layer/sublayer (higher wins):
//!
//! | Template | Action | Weight |
//! |---|---|---|
//! | [`allow_local_port`] | Permit | 10 |
//! | [`allow_local_ip`] / [`allow_local_ipv6`] | Permit | 10 |
//! | [`allow_remote_localhost_dns`] | Permit | 10 |
//! | [`allow_application`] | Permit | 5 |
//! | [`allow_remote_ipv6`] | Permit | 5 |
//! | [`block_dns`] | Block | 4 |
//! | [`allow_remote_ip`] | Permit | 3 |
//! | [`block_all`] / [`block_all_at_boot`] | Block | 2 |
//!
//! Every template clears the action-override right. `persistent` ORs in the
//! persistent flag; the owning provider and sublayer must then be persistent
//! too.

use crate::core::condition::{Condition, Endpoint};
use crate::core::filter::{Action, Filter, FilterFlags, MatchType};
use crate::core::identity::Identity;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

pub const WEIGHT_ALLOW_LOCAL_PORT: u8 = 10;
pub const WEIGHT_ALLOW_APPLICATION: u8 = 5;
pub const WEIGHT_ALLOW_REMOTE_IP: u8 = 3;
pub const WEIGHT_ALLOW_REMOTE_IPV6: u8 = 5;
pub const WEIGHT_ALLOW_LOCAL_IP: u8 = 10;
pub const WEIGHT_ALLOW_LOCAL_IPV6: u8 = 10;
pub const WEIGHT_ALLOW_REMOTE_LOCALHOST_DNS: u8 = 10;
pub const WEIGHT_BLOCK_ALL: u8 = 2;
pub const WEIGHT_BLOCK_DNS: u8 = 4;

pub const DNS_PORT: u16 = 53;

/// Where a templated filter goes and how it is labelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterScope {
    pub provider: Identity,
    pub layer: Identity,
    pub sublayer: Identity,
    pub name: String,
    pub description: String,
}

impl FilterScope {
    pub fn new(
        provider: Identity,
        layer: Identity,
        sublayer: Identity,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            layer,
            sublayer,
            name: name.into(),
            description: description.into(),
        }
    }

    /// Same provider, sublayer and labels at another layer.
    pub fn at_layer(&self, layer: Identity) -> Self {
        Self {
            layer,
            ..self.clone()
        }
    }
}

fn templated(scope: &FilterScope, action: Action, weight: u8, persistent: bool) -> Filter {
    let mut filter = Filter::new(
        scope.provider,
        scope.layer,
        scope.sublayer,
        scope.name.clone(),
        scope.description.clone(),
    );
    filter.action = action;
    filter.weight = weight;
    filter.flags = FilterFlags::CLEAR_ACTION_RIGHT;
    if persistent {
        filter.flags |= FilterFlags::PERSISTENT;
    }
    filter
}

pub fn allow_local_port(scope: &FilterScope, port: u16, persistent: bool) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_LOCAL_PORT, persistent)
        .with_condition(Condition::port(Endpoint::Local, MatchType::Equal, port))
}

pub fn allow_application(scope: &FilterScope, binary_path: &str, persistent: bool) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_APPLICATION, persistent)
        .with_condition(Condition::app_id(MatchType::Equal, binary_path))
}

pub fn allow_remote_ip(
    scope: &FilterScope,
    ip: Ipv4Addr,
    mask: Ipv4Addr,
    persistent: bool,
) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_REMOTE_IP, persistent)
        .with_condition(Condition::v4(Endpoint::Remote, MatchType::Equal, ip, mask))
}

pub fn allow_remote_ipv6(
    scope: &FilterScope,
    ip: Ipv6Addr,
    prefix_len: u8,
    persistent: bool,
) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_REMOTE_IPV6, persistent)
        .with_condition(Condition::v6(Endpoint::Remote, MatchType::Equal, ip, prefix_len))
}

pub fn allow_local_ip(
    scope: &FilterScope,
    ip: Ipv4Addr,
    mask: Ipv4Addr,
    persistent: bool,
) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_LOCAL_IP, persistent)
        .with_condition(Condition::v4(Endpoint::Local, MatchType::Equal, ip, mask))
}

pub fn allow_local_ipv6(
    scope: &FilterScope,
    ip: Ipv6Addr,
    prefix_len: u8,
    persistent: bool,
) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_LOCAL_IPV6, persistent)
        .with_condition(Condition::v6(Endpoint::Local, MatchType::Equal, ip, prefix_len))
}

/// DNS requests to a resolver on the loopback address.
pub fn allow_remote_localhost_dns(scope: &FilterScope, persistent: bool) -> Filter {
    templated(scope, Action::Permit, WEIGHT_ALLOW_REMOTE_LOCALHOST_DNS, persistent)
        .with_condition(Condition::v4(
            Endpoint::Remote,
            MatchType::Equal,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::BROADCAST,
        ))
        .with_condition(Condition::port(Endpoint::Remote, MatchType::Equal, DNS_PORT))
}

fn block_all_condition(is_ipv6: bool) -> Condition {
    if is_ipv6 {
        Condition::v6(Endpoint::Remote, MatchType::Equal, Ipv6Addr::UNSPECIFIED, 0)
    } else {
        Condition::v4(
            Endpoint::Remote,
            MatchType::Equal,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        )
    }
}

/// Blocks every remote address of one family at the scope's layer.
pub fn block_all(scope: &FilterScope, is_ipv6: bool, persistent: bool) -> Filter {
    templated(scope, Action::Block, WEIGHT_BLOCK_ALL, persistent)
        .with_condition(block_all_condition(is_ipv6))
}

/// Block-all enforced from boot until the service installs its own rules.
///
/// Boot-time filters cannot be persistent.
pub fn block_all_at_boot(scope: &FilterScope, is_ipv6: bool) -> Filter {
    let mut filter = templated(scope, Action::Block, WEIGHT_BLOCK_ALL, false)
        .with_condition(block_all_condition(is_ipv6));
    filter.flags |= FilterFlags::BOOTTIME;
    filter
}

/// Blocks remote port 53, optionally except one IPv4 resolver.
pub fn block_dns(scope: &FilterScope, exception: Option<Ipv4Addr>, persistent: bool) -> Filter {
    let mut filter = templated(scope, Action::Block, WEIGHT_BLOCK_DNS, persistent)
        .with_condition(Condition::port(Endpoint::Remote, MatchType::Equal, DNS_PORT));
    if let Some(ip) = exception {
        filter.add_condition(Condition::v4(
            Endpoint::Remote,
            MatchType::NotEqual,
            ip,
            Ipv4Addr::BROADCAST,
        ));
    }
    filter
}

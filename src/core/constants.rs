//! Well-known identities and status codes consumed from the engine
//!
//! These values are defined by the engine's headers and are never
//! synthesized here. Layers name protocol hook points; fields name the
//! packet/connection properties a condition can match on.

use crate::core::identity::Identity;

/// Protocol hook points (layers)
pub mod layers {
    use super::Identity;

    /// Outbound connect authorization, IPv4
    pub const ALE_AUTH_CONNECT_V4: Identity =
        Identity::from_u128(0xc38d57d1_05a7_4c33_904f_7fbceee60e82);
    /// Outbound connect authorization, IPv6
    pub const ALE_AUTH_CONNECT_V6: Identity =
        Identity::from_u128(0x4a72393b_319f_44bc_84c3_ba54dcb3b6b4);
    /// Inbound accept authorization, IPv4
    pub const ALE_AUTH_RECV_ACCEPT_V4: Identity =
        Identity::from_u128(0xe1cd9fe7_f4b5_4273_96c0_592e487b8650);
    /// Inbound accept authorization, IPv6
    pub const ALE_AUTH_RECV_ACCEPT_V6: Identity =
        Identity::from_u128(0xa3b42c97_9f04_4672_b87e_cee9c483257f);

    pub const V4: [Identity; 2] = [ALE_AUTH_CONNECT_V4, ALE_AUTH_RECV_ACCEPT_V4];
    pub const V6: [Identity; 2] = [ALE_AUTH_CONNECT_V6, ALE_AUTH_RECV_ACCEPT_V6];

    /// Returns true for the IPv6 variants of the known layers.
    pub fn is_ipv6(layer: &Identity) -> bool {
        V6.contains(layer)
    }
}

/// Condition field identities
pub mod fields {
    use super::Identity;

    pub const ALE_APP_ID: Identity = Identity::from_u128(0xd78e1e87_8644_4ea5_9437_d809ecefc971);
    pub const IP_LOCAL_ADDRESS: Identity =
        Identity::from_u128(0xd9ee00de_c1ef_4617_bfe3_ffd8f5a08957);
    pub const IP_LOCAL_PORT: Identity = Identity::from_u128(0x0c1ba1af_5765_453f_af22_a8f791ac775b);
    pub const IP_REMOTE_ADDRESS: Identity =
        Identity::from_u128(0xb235ae9a_1d64_49b8_a44c_5ff3d9095045);
    pub const IP_REMOTE_PORT: Identity =
        Identity::from_u128(0xc35a604d_d22b_4e1a_91b4_68f674ee674b);
}

/// Provider flag: object survives engine and host restart
pub const PROVIDER_FLAG_PERSISTENT: u32 = 0x0000_0001;

/// Sublayer flag: object survives engine and host restart
pub const SUBLAYER_FLAG_PERSISTENT: u32 = 0x0000_0001;

/// Engine status codes
pub mod status {
    pub const CALLOUT_NOT_FOUND: u32 = 0x8032_0001;
    pub const CONDITION_NOT_FOUND: u32 = 0x8032_0002;
    pub const FILTER_NOT_FOUND: u32 = 0x8032_0003;
    pub const LAYER_NOT_FOUND: u32 = 0x8032_0004;
    /// The only status translated into a non-error result (provider lookups)
    pub const PROVIDER_NOT_FOUND: u32 = 0x8032_0005;
    pub const PROVIDER_CONTEXT_NOT_FOUND: u32 = 0x8032_0006;
    pub const SUBLAYER_NOT_FOUND: u32 = 0x8032_0007;
    pub const NOT_FOUND: u32 = 0x8032_0008;
    pub const ALREADY_EXISTS: u32 = 0x8032_0009;
    pub const IN_USE: u32 = 0x8032_000A;
    pub const WRONG_SESSION: u32 = 0x8032_000C;
    pub const NO_TXN_IN_PROGRESS: u32 = 0x8032_000D;
    pub const TXN_IN_PROGRESS: u32 = 0x8032_000E;
    pub const TXN_ABORTED: u32 = 0x8032_000F;
    pub const SESSION_ABORTED: u32 = 0x8032_0010;

    pub const ACCESS_DENIED: u32 = 0x8007_0005;
    pub const INVALID_HANDLE: u32 = 0x8007_0006;
    pub const INVALID_ARGUMENT: u32 = 0x8007_0057;
}

//! Provider, sublayer and filter value types
//!
//! These are plain values assembled by callers. Nothing here talks to the
//! engine; the [`Manager`](crate::core::manager::Manager) installs them.

use crate::core::condition::Condition;
use crate::core::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// What the engine does with traffic matching a filter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Block,
    Permit,
    CalloutTerminating,
    CalloutInspection,
    CalloutUnknown,
    Continue,
    None,
    NoneNoMatch,
}

impl Action {
    /// Engine action code.
    pub const fn code(self) -> u32 {
        match self {
            Self::Block => 0x1001,
            Self::Permit => 0x1002,
            Self::CalloutTerminating => 0x5003,
            Self::CalloutInspection => 0x6004,
            Self::CalloutUnknown => 0x4005,
            Self::Continue => 0x2006,
            Self::None => 0x0007,
            Self::NoneNoMatch => 0x0008,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0x1001 => Some(Self::Block),
            0x1002 => Some(Self::Permit),
            0x5003 => Some(Self::CalloutTerminating),
            0x6004 => Some(Self::CalloutInspection),
            0x4005 => Some(Self::CalloutUnknown),
            0x2006 => Some(Self::Continue),
            0x0007 => Some(Self::None),
            0x0008 => Some(Self::NoneNoMatch),
            _ => None,
        }
    }

    /// Terminating actions decide the fate of the traffic.
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Block | Self::Permit)
    }
}

/// Comparison applied between a condition's field and its value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchType {
    #[default]
    Equal,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Range,
    FlagsAllSet,
    FlagsAnySet,
    FlagsNoneSet,
    EqualCaseInsensitive,
    NotEqual,
    Prefix,
    NotPrefix,
}

impl MatchType {
    /// Engine match-type code (`0..=12`).
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Equal,
            1 => Self::Greater,
            2 => Self::Less,
            3 => Self::GreaterOrEqual,
            4 => Self::LessOrEqual,
            5 => Self::Range,
            6 => Self::FlagsAllSet,
            7 => Self::FlagsAnySet,
            8 => Self::FlagsNoneSet,
            9 => Self::EqualCaseInsensitive,
            10 => Self::NotEqual,
            11 => Self::Prefix,
            12 => Self::NotPrefix,
            _ => return None,
        })
    }
}

/// Filter flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterFlags(u32);

impl FilterFlags {
    pub const NONE: Self = Self(0x0000_0000);
    pub const PERSISTENT: Self = Self(0x0000_0001);
    pub const BOOTTIME: Self = Self(0x0000_0002);
    pub const HAS_PROVIDER_CONTEXT: Self = Self(0x0000_0004);
    pub const CLEAR_ACTION_RIGHT: Self = Self(0x0000_0008);
    pub const PERMIT_IF_CALLOUT_UNREGISTERED: Self = Self(0x0000_0010);
    pub const DISABLED: Self = Self(0x0000_0020);
    pub const INDEXED: Self = Self(0x0000_0040);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FilterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FilterFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Runtime filter identifier assigned by the engine on install.
///
/// Zero is never a valid installed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(u64);

impl FilterId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical owner of a group of sublayers and filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub key: Identity,
    pub name: String,
    pub description: String,
    pub persistent: bool,
}

impl Provider {
    pub fn new(
        key: Identity,
        name: impl Into<String>,
        description: impl Into<String>,
        persistent: bool,
    ) -> Self {
        Self {
            key,
            name: name.into(),
            description: description.into(),
            persistent,
        }
    }
}

/// Weighted bucket under a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sublayer {
    pub key: Identity,
    pub provider_key: Identity,
    pub name: String,
    pub description: String,
    pub weight: u16,
    pub persistent: bool,
}

impl Sublayer {
    pub fn new(
        key: Identity,
        provider_key: Identity,
        name: impl Into<String>,
        description: impl Into<String>,
        weight: u16,
        persistent: bool,
    ) -> Self {
        Self {
            key,
            provider_key,
            name: name.into(),
            description: description.into(),
            weight,
            persistent,
        }
    }
}

/// Engine-side state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub is_installed: bool,
    pub is_persistent: bool,
}

/// An action plus conjunctive conditions at one layer under one sublayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub key: Identity,
    pub provider: Identity,
    pub layer: Identity,
    pub sublayer: Identity,
    pub name: String,
    pub description: String,
    pub action: Action,
    pub weight: u8,
    pub flags: FilterFlags,
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Creates a filter with a fresh key, no conditions, weight 0 and no flags.
    ///
    /// The action defaults to [`Action::Block`]; templates override it.
    pub fn new(
        provider: Identity,
        layer: Identity,
        sublayer: Identity,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            key: Identity::new(),
            provider,
            layer,
            sublayer,
            name: name.into(),
            description: description.into(),
            action: Action::Block,
            weight: 0,
            flags: FilterFlags::NONE,
            conditions: Vec::new(),
        }
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn set_display_data(&mut self, name: impl Into<String>, description: impl Into<String>) {
        self.name = name.into();
        self.description = description.into();
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.add_condition(condition);
        self
    }
}

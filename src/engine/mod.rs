//! Call surface of the packet-inspection engine
//!
//! The engine itself lives outside this crate. Everything the controller
//! needs from it is expressed by the [`Engine`] trait: one method per
//! exported entry point, primitive arguments, opaque handles.
//!
//! # Implementations
//!
//! - [`dll::DllEngine`]: binds the vendor engine library at runtime
//! - [`memory::MemoryEngine`]: complete in-process engine for tests and dry runs
//!
//! Every method returns a raw [`Call`] outcome. Turning that outcome into a
//! crate [`Error`](crate::Error) is the job of [`crate::core::guard`], which
//! also catches unwinding faults at this boundary.

pub mod dll;
pub mod memory;

use crate::core::identity::Identity;
use std::fmt;
use std::num::NonZeroUsize;

/// Raw outcome of a single engine call, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFault {
    /// The engine ran and returned a non-zero status
    Status(u32),
    /// The call mechanism failed before the engine produced a status
    Transport(String),
    /// The loaded engine does not export this entry point
    Missing(&'static str),
}

pub type Call<T> = std::result::Result<T, CallFault>;

/// Converts an engine status into a call outcome (`0` is success).
pub fn check(status: u32) -> Call<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(CallFault::Status(status))
    }
}

/// Every named entry point of the engine call surface.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum EntryPoint {
    LibraryLoad,
    SessionCreate,
    SessionDestroy,
    EngineOpen,
    EngineClose,
    TransactionBegin,
    TransactionCommit,
    TransactionAbort,
    ProviderCreate,
    ProviderSetFlags,
    ProviderSetDisplayData,
    ProviderFree,
    ProviderAdd,
    ProviderDelete,
    ProviderGetFlags,
    SublayerCreate,
    SublayerSetProviderKey,
    SublayerSetDisplayData,
    SublayerSetWeight,
    SublayerSetFlags,
    SublayerFree,
    SublayerAdd,
    SublayerDelete,
    SublayerIsInstalled,
    FilterCreate,
    FilterSetProviderKey,
    FilterSetDisplayData,
    FilterSetAction,
    FilterAllocateConditions,
    FilterSetConditionFieldKey,
    FilterSetConditionMatchType,
    FilterSetConditionV4AddrMask,
    FilterSetConditionV6AddrMask,
    FilterSetConditionUint16,
    FilterSetConditionBlobString,
    FilterFree,
    FilterAdd,
    FilterDeleteById,
    FilterDeleteByProviderKey,
}

impl EntryPoint {
    /// Symbol exported by the vendor engine library for this entry point.
    pub const fn export_name(self) -> &'static str {
        match self {
            Self::LibraryLoad => "",
            Self::SessionCreate => "CreateWfpSessionObject",
            Self::SessionDestroy => "DeleteWfpSessionObject",
            Self::EngineOpen => "WfpEngineOpen",
            Self::EngineClose => "WfpEngineClose",
            Self::TransactionBegin => "WfpTransactionBegin",
            Self::TransactionCommit => "WfpTransactionCommit",
            Self::TransactionAbort => "WfpTransactionAbort",
            Self::ProviderCreate => "FWPM_PROVIDER0_CreatePtr",
            Self::ProviderSetFlags => "FWPM_PROVIDER0_SetFlags",
            Self::ProviderSetDisplayData => "FWPM_PROVIDER0_SetDisplayData",
            Self::ProviderFree => "FWPM_PROVIDER0_Delete",
            Self::ProviderAdd => "WfpProviderAdd",
            Self::ProviderDelete => "WfpProviderDeletePtr",
            Self::ProviderGetFlags => "WfpGetProviderFlagsPtr",
            Self::SublayerCreate => "FWPM_SUBLAYER0_CreatePtr",
            Self::SublayerSetProviderKey => "FWPM_SUBLAYER0_SetProviderKeyPtr",
            Self::SublayerSetDisplayData => "FWPM_SUBLAYER0_SetDisplayData",
            Self::SublayerSetWeight => "FWPM_SUBLAYER0_SetWeight",
            Self::SublayerSetFlags => "FWPM_SUBLAYER0_SetFlags",
            Self::SublayerFree => "FWPM_SUBLAYER0_Delete",
            Self::SublayerAdd => "WfpSubLayerAdd",
            Self::SublayerDelete => "WfpSubLayerDeletePtr",
            Self::SublayerIsInstalled => "WfpSubLayerIsInstalledPtr",
            Self::FilterCreate => "FWPM_FILTER_CreatePtr",
            Self::FilterSetProviderKey => "FWPM_FILTER_SetProviderKeyPtr",
            Self::FilterSetDisplayData => "FWPM_FILTER_SetDisplayData",
            Self::FilterSetAction => "FWPM_FILTER_SetAction",
            Self::FilterAllocateConditions => "FWPM_FILTER_AllocateConditions",
            Self::FilterSetConditionFieldKey => "FWPM_FILTER_SetConditionFieldKeyPtr",
            Self::FilterSetConditionMatchType => "FWPM_FILTER_SetConditionMatchType",
            Self::FilterSetConditionV4AddrMask => "FWPM_FILTER_SetConditionV4AddrMask",
            Self::FilterSetConditionV6AddrMask => "FWPM_FILTER_SetConditionV6AddrMask",
            Self::FilterSetConditionUint16 => "FWPM_FILTER_SetConditionUINT16",
            Self::FilterSetConditionBlobString => "FWPM_FILTER_SetConditionBlobString",
            Self::FilterFree => "FWPM_FILTER_Delete",
            Self::FilterAdd => "WfpFilterAdd",
            Self::FilterDeleteById => "WfpFilterDeleteById",
            Self::FilterDeleteByProviderKey => "WfpFiltersDeleteByProviderKeyPtr",
        }
    }
}

macro_rules! engine_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// Wraps a raw engine handle; zero means "no handle".
            pub fn from_raw(raw: usize) -> Option<Self> {
                NonZeroUsize::new(raw).map(Self)
            }

            pub const fn get(self) -> usize {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0.get())
            }
        }
    };
}

engine_handle!(
    /// Engine-side session object
    SessionHandle
);
engine_handle!(
    /// Open engine connection bound to a session
    EngineHandle
);
engine_handle!(
    /// Provider builder object (must be freed)
    ProviderHandle
);
engine_handle!(
    /// Sublayer builder object (must be freed)
    SublayerHandle
);
engine_handle!(
    /// Filter builder object (must be freed)
    FilterHandle
);

/// Nul-terminated UTF-16 string as passed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WideString(Vec<u16>);

impl WideString {
    /// Encodes `s`; returns `None` if `s` contains an interior NUL.
    pub fn new(s: &str) -> Option<Self> {
        if s.contains('\0') {
            return None;
        }
        let mut units: Vec<u16> = s.encode_utf16().collect();
        units.push(0);
        Some(Self(units))
    }

    /// Code units without the terminator.
    pub fn units(&self) -> &[u16] {
        &self.0[..self.0.len() - 1]
    }

    pub fn as_ptr(&self) -> *const u16 {
        self.0.as_ptr()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(self.units())
    }
}

/// Engine-side memory layout of an [`Identity`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl From<&Identity> for RawGuid {
    fn from(id: &Identity) -> Self {
        let (data1, data2, data3, data4) = id.as_fields();
        Self {
            data1,
            data2,
            data3,
            data4: *data4,
        }
    }
}

impl From<RawGuid> for Identity {
    fn from(raw: RawGuid) -> Self {
        Identity::from_fields(raw.data1, raw.data2, raw.data3, raw.data4)
    }
}

/// The enumerated engine call surface.
///
/// Calls are synchronous and run on the caller's thread. Implementations
/// take `&self`; any locking they need is internal. Builder handles returned
/// by the `*_create` methods stay valid until the matching `*_free`.
pub trait Engine {
    // Session / engine
    fn session_create(&self, dynamic: bool) -> Call<SessionHandle>;
    fn session_destroy(&self, session: SessionHandle) -> Call<()>;
    fn engine_open(&self, session: SessionHandle) -> Call<EngineHandle>;
    fn engine_close(&self, engine: EngineHandle) -> Call<()>;

    // Transactions
    fn transaction_begin(&self, engine: EngineHandle) -> Call<()>;
    fn transaction_commit(&self, engine: EngineHandle) -> Call<()>;
    fn transaction_abort(&self, engine: EngineHandle) -> Call<()>;

    // Providers
    fn provider_create(&self, key: &Identity) -> Call<ProviderHandle>;
    fn provider_set_flags(&self, provider: ProviderHandle, flags: u32) -> Call<()>;
    fn provider_set_display_data(
        &self,
        provider: ProviderHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()>;
    fn provider_free(&self, provider: ProviderHandle) -> Call<()>;
    fn provider_add(&self, engine: EngineHandle, provider: ProviderHandle) -> Call<()>;
    fn provider_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()>;
    /// Flags of an installed provider; `Status(PROVIDER_NOT_FOUND)` if absent.
    fn provider_get_flags(&self, engine: EngineHandle, key: &Identity) -> Call<u32>;

    // Sublayers
    fn sublayer_create(&self, key: &Identity, weight: u16) -> Call<SublayerHandle>;
    fn sublayer_set_provider_key(&self, sublayer: SublayerHandle, provider: &Identity)
    -> Call<()>;
    fn sublayer_set_display_data(
        &self,
        sublayer: SublayerHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()>;
    fn sublayer_set_weight(&self, sublayer: SublayerHandle, weight: u16) -> Call<()>;
    fn sublayer_set_flags(&self, sublayer: SublayerHandle, flags: u32) -> Call<()>;
    fn sublayer_free(&self, sublayer: SublayerHandle) -> Call<()>;
    fn sublayer_add(&self, engine: EngineHandle, sublayer: SublayerHandle) -> Call<()>;
    fn sublayer_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()>;
    fn sublayer_is_installed(&self, engine: EngineHandle, key: &Identity) -> Call<bool>;

    // Filters
    fn filter_create(
        &self,
        key: &Identity,
        layer: &Identity,
        sublayer: &Identity,
        weight: u8,
        flags: u32,
    ) -> Call<FilterHandle>;
    fn filter_set_provider_key(&self, filter: FilterHandle, provider: &Identity) -> Call<()>;
    fn filter_set_display_data(
        &self,
        filter: FilterHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()>;
    fn filter_set_action(&self, filter: FilterHandle, action: u32) -> Call<()>;
    fn filter_allocate_conditions(&self, filter: FilterHandle, count: u32) -> Call<()>;
    fn filter_set_condition_field_key(
        &self,
        filter: FilterHandle,
        index: u32,
        field: &Identity,
    ) -> Call<()>;
    fn filter_set_condition_match_type(
        &self,
        filter: FilterHandle,
        index: u32,
        match_type: u32,
    ) -> Call<()>;
    /// Host-order IPv4 address and mask.
    fn filter_set_condition_v4_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: u32,
        mask: u32,
    ) -> Call<()>;
    fn filter_set_condition_v6_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: &[u8; 16],
        prefix_len: u8,
    ) -> Call<()>;
    fn filter_set_condition_u16(&self, filter: FilterHandle, index: u32, value: u16) -> Call<()>;
    fn filter_set_condition_blob_string(
        &self,
        filter: FilterHandle,
        index: u32,
        value: &WideString,
    ) -> Call<()>;
    fn filter_free(&self, filter: FilterHandle) -> Call<()>;
    /// Installs the built filter and returns its runtime id.
    fn filter_add(&self, engine: EngineHandle, filter: FilterHandle) -> Call<u64>;
    fn filter_delete_by_id(&self, engine: EngineHandle, id: u64) -> Call<()>;
    fn filter_delete_by_provider_key(
        &self,
        engine: EngineHandle,
        provider: &Identity,
        layer: &Identity,
    ) -> Call<()>;
}

//! Runtime binding to the vendor engine library
//!
//! Every export is resolved once at load time. A missing export is not a
//! load failure: the corresponding method reports
//! [`CallFault::Missing`] so the rest of the surface stays usable against
//! older library builds.
//!
//! Builder-returning exports signal failure with a null handle; in that
//! case the last OS error is attached as a transport failure.

use crate::core::error::{Error, Result};
use crate::core::identity::Identity;
use crate::engine::{
    Call, CallFault, Engine, EngineHandle, EntryPoint, FilterHandle, ProviderHandle, RawGuid,
    SessionHandle, SublayerHandle, WideString, check,
};
use libloading::Library;
use std::io;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

macro_rules! procs {
    ($($field:ident: $entry:ident => fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        struct Procs {
            $($field: Option<unsafe extern "system" fn($($arg),*) $(-> $ret)?>,)*
        }

        impl Procs {
            /// # Safety
            ///
            /// The returned pointers are only valid while `lib` stays loaded.
            unsafe fn resolve(lib: &Library) -> Self {
                Self {
                    $($field: unsafe {
                        lib.get::<unsafe extern "system" fn($($arg),*) $(-> $ret)?>(
                            EntryPoint::$entry.export_name().as_bytes(),
                        )
                    }
                    .ok()
                    .map(|symbol| *symbol),)*
                }
            }

            fn is_resolved(&self, entry: EntryPoint) -> bool {
                match entry {
                    $(EntryPoint::$entry => self.$field.is_some(),)*
                    EntryPoint::LibraryLoad => true,
                }
            }
        }
    };
}

procs! {
    session_create: SessionCreate => fn(u8) -> usize;
    session_destroy: SessionDestroy => fn(usize);
    engine_open: EngineOpen => fn(usize, *mut usize) -> u32;
    engine_close: EngineClose => fn(usize) -> u32;

    transaction_begin: TransactionBegin => fn(usize) -> u32;
    transaction_commit: TransactionCommit => fn(usize) -> u32;
    transaction_abort: TransactionAbort => fn(usize) -> u32;

    provider_create: ProviderCreate => fn(*const RawGuid) -> usize;
    provider_set_flags: ProviderSetFlags => fn(usize, u32) -> u32;
    provider_set_display_data: ProviderSetDisplayData => fn(usize, *const u16, *const u16) -> u32;
    provider_free: ProviderFree => fn(usize) -> u32;
    provider_add: ProviderAdd => fn(usize, usize) -> u32;
    provider_delete: ProviderDelete => fn(usize, *const RawGuid) -> u32;
    provider_get_flags: ProviderGetFlags => fn(usize, *const RawGuid, *mut u32) -> u32;

    sublayer_create: SublayerCreate => fn(*const RawGuid, u16) -> usize;
    sublayer_set_provider_key: SublayerSetProviderKey => fn(usize, *const RawGuid) -> u32;
    sublayer_set_display_data: SublayerSetDisplayData => fn(usize, *const u16, *const u16) -> u32;
    sublayer_set_weight: SublayerSetWeight => fn(usize, u16) -> u32;
    sublayer_set_flags: SublayerSetFlags => fn(usize, u32) -> u32;
    sublayer_free: SublayerFree => fn(usize) -> u32;
    sublayer_add: SublayerAdd => fn(usize, usize) -> u32;
    sublayer_delete: SublayerDelete => fn(usize, *const RawGuid) -> u32;
    sublayer_is_installed: SublayerIsInstalled => fn(usize, *const RawGuid) -> u8;

    filter_create: FilterCreate =>
        fn(*const RawGuid, *const RawGuid, *const RawGuid, u8, u32) -> usize;
    filter_set_provider_key: FilterSetProviderKey => fn(usize, *const RawGuid) -> u32;
    filter_set_display_data: FilterSetDisplayData => fn(usize, *const u16, *const u16) -> u32;
    filter_set_action: FilterSetAction => fn(usize, u32) -> u32;
    filter_allocate_conditions: FilterAllocateConditions => fn(usize, u32) -> u32;
    filter_set_condition_field_key: FilterSetConditionFieldKey =>
        fn(usize, u32, *const RawGuid) -> u32;
    filter_set_condition_match_type: FilterSetConditionMatchType => fn(usize, u32, u32) -> u32;
    filter_set_condition_v4_addr_mask: FilterSetConditionV4AddrMask =>
        fn(usize, u32, u32, u32) -> u32;
    filter_set_condition_v6_addr_mask: FilterSetConditionV6AddrMask =>
        fn(usize, u32, *const u8, u8) -> u32;
    filter_set_condition_u16: FilterSetConditionUint16 => fn(usize, u32, u16) -> u32;
    filter_set_condition_blob_string: FilterSetConditionBlobString =>
        fn(usize, u32, *const u16) -> u32;
    filter_free: FilterFree => fn(usize) -> u32;
    filter_add: FilterAdd => fn(usize, usize, *mut u64) -> u32;
    filter_delete_by_id: FilterDeleteById => fn(usize, u64) -> u32;
    filter_delete_by_provider_key: FilterDeleteByProviderKey =>
        fn(usize, *const RawGuid, *const RawGuid) -> u32;
}

fn resolved<F>(proc: Option<F>, entry: EntryPoint) -> Call<F> {
    proc.ok_or(CallFault::Missing(entry.export_name()))
}

fn null_handle(entry: EntryPoint) -> CallFault {
    CallFault::Transport(format!(
        "{} returned a null handle: {}",
        entry.export_name(),
        io::Error::last_os_error()
    ))
}

/// Engine backed by the vendor library loaded from disk.
pub struct DllEngine {
    path: PathBuf,
    procs: Procs,
    // Must outlive `procs`
    _lib: Library,
}

impl std::fmt::Debug for DllEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DllEngine").field("path", &self.path).finish_non_exhaustive()
    }
}

impl DllEngine {
    /// Loads the engine library at `path` and resolves its exports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the library cannot be loaded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidInput(
                "engine library path is empty".to_string(),
            ));
        }

        // SAFETY: loading runs the library's initializers; the engine
        // library is trusted vendor code.
        let lib = unsafe { Library::new(path) }.map_err(|e| Error::Transport {
            entry: EntryPoint::LibraryLoad,
            message: format!("{}: {e}", path.display()),
        })?;
        // SAFETY: `lib` is stored next to `procs` and dropped after it.
        let procs = unsafe { Procs::resolve(&lib) };

        let missing: Vec<EntryPoint> = EntryPoint::iter()
            .filter(|entry| !procs.is_resolved(*entry))
            .collect();
        for entry in &missing {
            debug!("Engine export {} not found", entry.export_name());
        }
        if missing.is_empty() {
            info!("Loaded engine library {}", path.display());
        } else {
            warn!(
                "Loaded engine library {} with {} missing exports",
                path.display(),
                missing.len()
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            procs,
            _lib: lib,
        })
    }
}

// SAFETY for every call below: the function pointer was resolved from
// `self._lib`, which is still loaded, and every pointer argument refers to
// a live local or borrowed value for the duration of the call.
impl Engine for DllEngine {
    fn session_create(&self, dynamic: bool) -> Call<SessionHandle> {
        let f = resolved(self.procs.session_create, EntryPoint::SessionCreate)?;
        let raw = unsafe { f(u8::from(dynamic)) };
        SessionHandle::from_raw(raw).ok_or_else(|| null_handle(EntryPoint::SessionCreate))
    }

    fn session_destroy(&self, session: SessionHandle) -> Call<()> {
        let f = resolved(self.procs.session_destroy, EntryPoint::SessionDestroy)?;
        unsafe { f(session.get()) };
        Ok(())
    }

    fn engine_open(&self, session: SessionHandle) -> Call<EngineHandle> {
        let f = resolved(self.procs.engine_open, EntryPoint::EngineOpen)?;
        let mut raw = 0usize;
        check(unsafe { f(session.get(), &mut raw) })?;
        EngineHandle::from_raw(raw).ok_or_else(|| null_handle(EntryPoint::EngineOpen))
    }

    fn engine_close(&self, engine: EngineHandle) -> Call<()> {
        let f = resolved(self.procs.engine_close, EntryPoint::EngineClose)?;
        check(unsafe { f(engine.get()) })
    }

    fn transaction_begin(&self, engine: EngineHandle) -> Call<()> {
        let f = resolved(self.procs.transaction_begin, EntryPoint::TransactionBegin)?;
        check(unsafe { f(engine.get()) })
    }

    fn transaction_commit(&self, engine: EngineHandle) -> Call<()> {
        let f = resolved(self.procs.transaction_commit, EntryPoint::TransactionCommit)?;
        check(unsafe { f(engine.get()) })
    }

    fn transaction_abort(&self, engine: EngineHandle) -> Call<()> {
        let f = resolved(self.procs.transaction_abort, EntryPoint::TransactionAbort)?;
        check(unsafe { f(engine.get()) })
    }

    fn provider_create(&self, key: &Identity) -> Call<ProviderHandle> {
        let f = resolved(self.procs.provider_create, EntryPoint::ProviderCreate)?;
        let guid = RawGuid::from(key);
        let raw = unsafe { f(&guid) };
        ProviderHandle::from_raw(raw).ok_or_else(|| null_handle(EntryPoint::ProviderCreate))
    }

    fn provider_set_flags(&self, provider: ProviderHandle, flags: u32) -> Call<()> {
        let f = resolved(self.procs.provider_set_flags, EntryPoint::ProviderSetFlags)?;
        check(unsafe { f(provider.get(), flags) })
    }

    fn provider_set_display_data(
        &self,
        provider: ProviderHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let f = resolved(
            self.procs.provider_set_display_data,
            EntryPoint::ProviderSetDisplayData,
        )?;
        check(unsafe { f(provider.get(), name.as_ptr(), description.as_ptr()) })
    }

    fn provider_free(&self, provider: ProviderHandle) -> Call<()> {
        let f = resolved(self.procs.provider_free, EntryPoint::ProviderFree)?;
        check(unsafe { f(provider.get()) })
    }

    fn provider_add(&self, engine: EngineHandle, provider: ProviderHandle) -> Call<()> {
        let f = resolved(self.procs.provider_add, EntryPoint::ProviderAdd)?;
        check(unsafe { f(engine.get(), provider.get()) })
    }

    fn provider_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()> {
        let f = resolved(self.procs.provider_delete, EntryPoint::ProviderDelete)?;
        let guid = RawGuid::from(key);
        check(unsafe { f(engine.get(), &guid) })
    }

    fn provider_get_flags(&self, engine: EngineHandle, key: &Identity) -> Call<u32> {
        let f = resolved(self.procs.provider_get_flags, EntryPoint::ProviderGetFlags)?;
        let guid = RawGuid::from(key);
        let mut flags = 0u32;
        check(unsafe { f(engine.get(), &guid, &mut flags) })?;
        Ok(flags)
    }

    fn sublayer_create(&self, key: &Identity, weight: u16) -> Call<SublayerHandle> {
        let f = resolved(self.procs.sublayer_create, EntryPoint::SublayerCreate)?;
        let guid = RawGuid::from(key);
        let raw = unsafe { f(&guid, weight) };
        SublayerHandle::from_raw(raw).ok_or_else(|| null_handle(EntryPoint::SublayerCreate))
    }

    fn sublayer_set_provider_key(
        &self,
        sublayer: SublayerHandle,
        provider: &Identity,
    ) -> Call<()> {
        let f = resolved(
            self.procs.sublayer_set_provider_key,
            EntryPoint::SublayerSetProviderKey,
        )?;
        let guid = RawGuid::from(provider);
        check(unsafe { f(sublayer.get(), &guid) })
    }

    fn sublayer_set_display_data(
        &self,
        sublayer: SublayerHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let f = resolved(
            self.procs.sublayer_set_display_data,
            EntryPoint::SublayerSetDisplayData,
        )?;
        check(unsafe { f(sublayer.get(), name.as_ptr(), description.as_ptr()) })
    }

    fn sublayer_set_weight(&self, sublayer: SublayerHandle, weight: u16) -> Call<()> {
        let f = resolved(self.procs.sublayer_set_weight, EntryPoint::SublayerSetWeight)?;
        check(unsafe { f(sublayer.get(), weight) })
    }

    fn sublayer_set_flags(&self, sublayer: SublayerHandle, flags: u32) -> Call<()> {
        let f = resolved(self.procs.sublayer_set_flags, EntryPoint::SublayerSetFlags)?;
        check(unsafe { f(sublayer.get(), flags) })
    }

    fn sublayer_free(&self, sublayer: SublayerHandle) -> Call<()> {
        let f = resolved(self.procs.sublayer_free, EntryPoint::SublayerFree)?;
        check(unsafe { f(sublayer.get()) })
    }

    fn sublayer_add(&self, engine: EngineHandle, sublayer: SublayerHandle) -> Call<()> {
        let f = resolved(self.procs.sublayer_add, EntryPoint::SublayerAdd)?;
        check(unsafe { f(engine.get(), sublayer.get()) })
    }

    fn sublayer_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()> {
        let f = resolved(self.procs.sublayer_delete, EntryPoint::SublayerDelete)?;
        let guid = RawGuid::from(key);
        check(unsafe { f(engine.get(), &guid) })
    }

    fn sublayer_is_installed(&self, engine: EngineHandle, key: &Identity) -> Call<bool> {
        let f = resolved(
            self.procs.sublayer_is_installed,
            EntryPoint::SublayerIsInstalled,
        )?;
        let guid = RawGuid::from(key);
        Ok(unsafe { f(engine.get(), &guid) } != 0)
    }

    fn filter_create(
        &self,
        key: &Identity,
        layer: &Identity,
        sublayer: &Identity,
        weight: u8,
        flags: u32,
    ) -> Call<FilterHandle> {
        let f = resolved(self.procs.filter_create, EntryPoint::FilterCreate)?;
        let (key, layer, sublayer) = (
            RawGuid::from(key),
            RawGuid::from(layer),
            RawGuid::from(sublayer),
        );
        let raw = unsafe { f(&key, &layer, &sublayer, weight, flags) };
        FilterHandle::from_raw(raw).ok_or_else(|| null_handle(EntryPoint::FilterCreate))
    }

    fn filter_set_provider_key(&self, filter: FilterHandle, provider: &Identity) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_provider_key,
            EntryPoint::FilterSetProviderKey,
        )?;
        let guid = RawGuid::from(provider);
        check(unsafe { f(filter.get(), &guid) })
    }

    fn filter_set_display_data(
        &self,
        filter: FilterHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_display_data,
            EntryPoint::FilterSetDisplayData,
        )?;
        check(unsafe { f(filter.get(), name.as_ptr(), description.as_ptr()) })
    }

    fn filter_set_action(&self, filter: FilterHandle, action: u32) -> Call<()> {
        let f = resolved(self.procs.filter_set_action, EntryPoint::FilterSetAction)?;
        check(unsafe { f(filter.get(), action) })
    }

    fn filter_allocate_conditions(&self, filter: FilterHandle, count: u32) -> Call<()> {
        let f = resolved(
            self.procs.filter_allocate_conditions,
            EntryPoint::FilterAllocateConditions,
        )?;
        check(unsafe { f(filter.get(), count) })
    }

    fn filter_set_condition_field_key(
        &self,
        filter: FilterHandle,
        index: u32,
        field: &Identity,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_field_key,
            EntryPoint::FilterSetConditionFieldKey,
        )?;
        let guid = RawGuid::from(field);
        check(unsafe { f(filter.get(), index, &guid) })
    }

    fn filter_set_condition_match_type(
        &self,
        filter: FilterHandle,
        index: u32,
        match_type: u32,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_match_type,
            EntryPoint::FilterSetConditionMatchType,
        )?;
        check(unsafe { f(filter.get(), index, match_type) })
    }

    fn filter_set_condition_v4_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: u32,
        mask: u32,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_v4_addr_mask,
            EntryPoint::FilterSetConditionV4AddrMask,
        )?;
        check(unsafe { f(filter.get(), index, address, mask) })
    }

    fn filter_set_condition_v6_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: &[u8; 16],
        prefix_len: u8,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_v6_addr_mask,
            EntryPoint::FilterSetConditionV6AddrMask,
        )?;
        check(unsafe { f(filter.get(), index, address.as_ptr(), prefix_len) })
    }

    fn filter_set_condition_u16(&self, filter: FilterHandle, index: u32, value: u16) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_u16,
            EntryPoint::FilterSetConditionUint16,
        )?;
        check(unsafe { f(filter.get(), index, value) })
    }

    fn filter_set_condition_blob_string(
        &self,
        filter: FilterHandle,
        index: u32,
        value: &WideString,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_set_condition_blob_string,
            EntryPoint::FilterSetConditionBlobString,
        )?;
        check(unsafe { f(filter.get(), index, value.as_ptr()) })
    }

    fn filter_free(&self, filter: FilterHandle) -> Call<()> {
        let f = resolved(self.procs.filter_free, EntryPoint::FilterFree)?;
        check(unsafe { f(filter.get()) })
    }

    fn filter_add(&self, engine: EngineHandle, filter: FilterHandle) -> Call<u64> {
        let f = resolved(self.procs.filter_add, EntryPoint::FilterAdd)?;
        let mut id = 0u64;
        check(unsafe { f(engine.get(), filter.get(), &mut id) })?;
        Ok(id)
    }

    fn filter_delete_by_id(&self, engine: EngineHandle, id: u64) -> Call<()> {
        let f = resolved(self.procs.filter_delete_by_id, EntryPoint::FilterDeleteById)?;
        check(unsafe { f(engine.get(), id) })
    }

    fn filter_delete_by_provider_key(
        &self,
        engine: EngineHandle,
        provider: &Identity,
        layer: &Identity,
    ) -> Call<()> {
        let f = resolved(
            self.procs.filter_delete_by_provider_key,
            EntryPoint::FilterDeleteByProviderKey,
        )?;
        let (provider, layer) = (RawGuid::from(provider), RawGuid::from(layer));
        check(unsafe { f(engine.get(), &provider, &layer) })
    }
}

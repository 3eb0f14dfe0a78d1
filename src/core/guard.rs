//! Boundary guard for engine calls and scoped builder objects
//!
//! Every engine call site goes through [`shielded`]: a raw [`Call`] outcome
//! is normalized into a crate [`Error`], and an unwinding fault raised by the
//! engine binding is caught, logged and reported as [`Error::Fault`].
//!
//! Builder objects allocated by the engine are owned by the scoped types in
//! this module and released in `Drop`, so every exit path (success, error or
//! unwinding) frees them.

use crate::core::error::{Error, Result};
use crate::core::filter::MatchType;
use crate::core::identity::Identity;
use crate::engine::{
    Call, Engine, EngineHandle, EntryPoint, FilterHandle, ProviderHandle, SublayerHandle,
    WideString,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, warn};

/// Runs one engine call, normalizing its outcome and catching unwinds.
pub fn shielded<T>(entry: EntryPoint, call: impl FnOnce() -> Call<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(outcome) => outcome.map_err(|fault| Error::from_call(entry, fault)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("PANIC (recovered) in engine call {entry}: {message}");
            Err(Error::Fault { entry, message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Encodes a display string for the engine.
pub(crate) fn wide(value: &str, what: &str) -> Result<WideString> {
    WideString::new(value)
        .ok_or_else(|| Error::InvalidInput(format!("{what} contains an interior NUL")))
}

/// Provider builder owned for the duration of one operation.
pub struct ScopedProvider<'e, E: Engine> {
    engine: &'e E,
    handle: ProviderHandle,
}

impl<'e, E: Engine> ScopedProvider<'e, E> {
    pub fn create(engine: &'e E, key: &Identity) -> Result<Self> {
        let handle = shielded(EntryPoint::ProviderCreate, || engine.provider_create(key))?;
        Ok(Self { engine, handle })
    }

    pub fn set_flags(&mut self, flags: u32) -> Result<()> {
        shielded(EntryPoint::ProviderSetFlags, || {
            self.engine.provider_set_flags(self.handle, flags)
        })
    }

    pub fn set_display_data(&mut self, name: &str, description: &str) -> Result<()> {
        let name = wide(name, "provider name")?;
        let description = wide(description, "provider description")?;
        shielded(EntryPoint::ProviderSetDisplayData, || {
            self.engine
                .provider_set_display_data(self.handle, &name, &description)
        })
    }

    pub fn add(&self, engine: EngineHandle) -> Result<()> {
        shielded(EntryPoint::ProviderAdd, || {
            self.engine.provider_add(engine, self.handle)
        })
    }
}

impl<E: Engine> Drop for ScopedProvider<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = shielded(EntryPoint::ProviderFree, || {
            self.engine.provider_free(self.handle)
        }) {
            warn!("Failed to release provider builder {}: {e}", self.handle);
        }
    }
}

/// Sublayer builder owned for the duration of one operation.
pub struct ScopedSublayer<'e, E: Engine> {
    engine: &'e E,
    handle: SublayerHandle,
}

impl<'e, E: Engine> ScopedSublayer<'e, E> {
    pub fn create(engine: &'e E, key: &Identity, weight: u16) -> Result<Self> {
        let handle = shielded(EntryPoint::SublayerCreate, || {
            engine.sublayer_create(key, weight)
        })?;
        Ok(Self { engine, handle })
    }

    pub fn set_provider_key(&mut self, provider: &Identity) -> Result<()> {
        shielded(EntryPoint::SublayerSetProviderKey, || {
            self.engine.sublayer_set_provider_key(self.handle, provider)
        })
    }

    pub fn set_weight(&mut self, weight: u16) -> Result<()> {
        shielded(EntryPoint::SublayerSetWeight, || {
            self.engine.sublayer_set_weight(self.handle, weight)
        })
    }

    pub fn set_flags(&mut self, flags: u32) -> Result<()> {
        shielded(EntryPoint::SublayerSetFlags, || {
            self.engine.sublayer_set_flags(self.handle, flags)
        })
    }

    pub fn set_display_data(&mut self, name: &str, description: &str) -> Result<()> {
        let name = wide(name, "sublayer name")?;
        let description = wide(description, "sublayer description")?;
        shielded(EntryPoint::SublayerSetDisplayData, || {
            self.engine
                .sublayer_set_display_data(self.handle, &name, &description)
        })
    }

    pub fn add(&self, engine: EngineHandle) -> Result<()> {
        shielded(EntryPoint::SublayerAdd, || {
            self.engine.sublayer_add(engine, self.handle)
        })
    }
}

impl<E: Engine> Drop for ScopedSublayer<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = shielded(EntryPoint::SublayerFree, || {
            self.engine.sublayer_free(self.handle)
        }) {
            warn!("Failed to release sublayer builder {}: {e}", self.handle);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Keyed,
    Bound,
}

/// Filter builder with condition-slot accounting.
///
/// Slots must be allocated before any condition is written. Each slot is
/// written in two phases (field key and match type, then the typed value)
/// and exactly once.
pub struct FilterBuilder<'e, E: Engine> {
    engine: &'e E,
    handle: FilterHandle,
    slots: Option<Vec<Slot>>,
}

impl<'e, E: Engine> FilterBuilder<'e, E> {
    pub fn create(
        engine: &'e E,
        key: &Identity,
        layer: &Identity,
        sublayer: &Identity,
        weight: u8,
        flags: u32,
    ) -> Result<Self> {
        let handle = shielded(EntryPoint::FilterCreate, || {
            engine.filter_create(key, layer, sublayer, weight, flags)
        })?;
        Ok(Self {
            engine,
            handle,
            slots: None,
        })
    }

    pub fn handle(&self) -> FilterHandle {
        self.handle
    }

    /// Number of allocated condition slots (0 before allocation).
    pub fn allocated_slots(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    pub fn set_provider_key(&mut self, provider: &Identity) -> Result<()> {
        shielded(EntryPoint::FilterSetProviderKey, || {
            self.engine.filter_set_provider_key(self.handle, provider)
        })
    }

    pub fn set_display_data(&mut self, name: &str, description: &str) -> Result<()> {
        let name = wide(name, "filter name")?;
        let description = wide(description, "filter description")?;
        shielded(EntryPoint::FilterSetDisplayData, || {
            self.engine
                .filter_set_display_data(self.handle, &name, &description)
        })
    }

    pub fn set_action(&mut self, action: u32) -> Result<()> {
        shielded(EntryPoint::FilterSetAction, || {
            self.engine.filter_set_action(self.handle, action)
        })
    }

    pub fn allocate_conditions(&mut self, count: u32) -> Result<()> {
        if self.slots.is_some() {
            return Err(Error::InvalidState(
                "filter conditions already allocated".to_string(),
            ));
        }
        shielded(EntryPoint::FilterAllocateConditions, || {
            self.engine.filter_allocate_conditions(self.handle, count)
        })?;
        self.slots = Some(vec![Slot::Empty; count as usize]);
        Ok(())
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot> {
        let allocated = self.allocated_slots();
        self.slots
            .as_mut()
            .and_then(|slots| slots.get_mut(index as usize))
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "condition slot {index} out of range ({allocated} allocated)"
                ))
            })
    }

    /// Phase one: field key and match type.
    pub fn set_condition_field(
        &mut self,
        index: u32,
        field: &Identity,
        match_type: MatchType,
    ) -> Result<()> {
        if *self.slot_mut(index)? != Slot::Empty {
            return Err(Error::InvalidState(format!(
                "condition slot {index} written twice"
            )));
        }
        shielded(EntryPoint::FilterSetConditionFieldKey, || {
            self.engine
                .filter_set_condition_field_key(self.handle, index, field)
        })?;
        shielded(EntryPoint::FilterSetConditionMatchType, || {
            self.engine
                .filter_set_condition_match_type(self.handle, index, match_type.code())
        })?;
        *self.slot_mut(index)? = Slot::Keyed;
        Ok(())
    }

    fn write_value(
        &mut self,
        index: u32,
        entry: EntryPoint,
        call: impl FnOnce(&E, FilterHandle) -> Call<()>,
    ) -> Result<()> {
        match *self.slot_mut(index)? {
            Slot::Keyed => {}
            Slot::Empty => {
                return Err(Error::InvalidState(format!(
                    "condition slot {index} has no field key"
                )));
            }
            Slot::Bound => {
                return Err(Error::InvalidState(format!(
                    "condition slot {index} written twice"
                )));
            }
        }
        let (engine, handle) = (self.engine, self.handle);
        shielded(entry, || call(engine, handle))?;
        *self.slot_mut(index)? = Slot::Bound;
        Ok(())
    }

    /// Phase two: IPv4 address and mask (host order).
    pub fn set_condition_v4(&mut self, index: u32, address: u32, mask: u32) -> Result<()> {
        self.write_value(index, EntryPoint::FilterSetConditionV4AddrMask, |e, h| {
            e.filter_set_condition_v4_addr_mask(h, index, address, mask)
        })
    }

    /// Phase two: IPv6 address and prefix length.
    pub fn set_condition_v6(
        &mut self,
        index: u32,
        address: &[u8; 16],
        prefix_len: u8,
    ) -> Result<()> {
        self.write_value(index, EntryPoint::FilterSetConditionV6AddrMask, |e, h| {
            e.filter_set_condition_v6_addr_mask(h, index, address, prefix_len)
        })
    }

    /// Phase two: 16-bit value.
    pub fn set_condition_u16(&mut self, index: u32, value: u16) -> Result<()> {
        self.write_value(index, EntryPoint::FilterSetConditionUint16, |e, h| {
            e.filter_set_condition_u16(h, index, value)
        })
    }

    /// Phase two: UTF-16 blob.
    pub fn set_condition_blob_string(&mut self, index: u32, value: &WideString) -> Result<()> {
        self.write_value(index, EntryPoint::FilterSetConditionBlobString, |e, h| {
            e.filter_set_condition_blob_string(h, index, value)
        })
    }

    /// Installs the built filter; every allocated slot must be fully written.
    pub fn add(&self, engine: EngineHandle) -> Result<u64> {
        let Some(slots) = self.slots.as_ref() else {
            return Err(Error::InvalidState(
                "filter conditions were never allocated".to_string(),
            ));
        };
        if let Some(index) = slots.iter().position(|s| *s != Slot::Bound) {
            return Err(Error::InvalidState(format!(
                "condition slot {index} was never written"
            )));
        }
        shielded(EntryPoint::FilterAdd, || {
            self.engine.filter_add(engine, self.handle)
        })
    }
}

impl<E: Engine> Drop for FilterBuilder<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = shielded(EntryPoint::FilterFree, || {
            self.engine.filter_free(self.handle)
        }) {
            warn!("Failed to release filter builder {}: {e}", self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::{fields, layers};
    use crate::core::error::ErrorKind;
    use crate::engine::CallFault;
    use crate::engine::memory::MemoryEngine;

    fn builder(engine: &MemoryEngine) -> FilterBuilder<'_, MemoryEngine> {
        FilterBuilder::create(
            engine,
            &Identity::new(),
            &layers::ALE_AUTH_CONNECT_V4,
            &Identity::new(),
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_shielded_catches_panic() {
        let err = shielded::<()>(EntryPoint::FilterAdd, || panic!("engine blew up")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fault);
        assert!(err.to_string().contains("engine blew up"));
    }

    #[test]
    fn test_shielded_normalizes_status() {
        let err = shielded::<()>(EntryPoint::ProviderAdd, || Err(CallFault::Status(0x8032_0009)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend(0x8032_0009));
        assert_eq!(shielded(EntryPoint::ProviderAdd, || Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_builders_released_on_drop() {
        let engine = MemoryEngine::new();
        {
            let _p = ScopedProvider::create(&engine, &Identity::new()).unwrap();
            let _s = ScopedSublayer::create(&engine, &Identity::new(), 0).unwrap();
            let _f = builder(&engine);
            assert_eq!(engine.live_builders(), 3);
        }
        assert_eq!(engine.live_builders(), 0);
    }

    #[test]
    fn test_condition_before_allocation_is_invalid_state() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine);
        let err = b
            .set_condition_field(0, &fields::IP_LOCAL_PORT, MatchType::Equal)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_slot_out_of_range_and_double_write() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine);
        b.allocate_conditions(1).unwrap();
        assert_eq!(b.allocated_slots(), 1);

        let err = b
            .set_condition_field(1, &fields::IP_LOCAL_PORT, MatchType::Equal)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        b.set_condition_field(0, &fields::IP_LOCAL_PORT, MatchType::Equal)
            .unwrap();
        b.set_condition_u16(0, 443).unwrap();
        let err = b.set_condition_u16(0, 80).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = b
            .set_condition_field(0, &fields::IP_REMOTE_PORT, MatchType::Equal)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_value_without_field_key_is_invalid_state() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine);
        b.allocate_conditions(1).unwrap();
        let err = b.set_condition_u16(0, 53).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_double_allocation_is_invalid_state() {
        let engine = MemoryEngine::new();
        let mut b = builder(&engine);
        b.allocate_conditions(0).unwrap();
        assert_eq!(
            b.allocate_conditions(1).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_display_data_rejects_interior_nul() {
        let engine = MemoryEngine::new();
        let mut p = ScopedProvider::create(&engine, &Identity::new()).unwrap();
        let err = p.set_display_data("bad\0name", "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}

//! In-process engine
//!
//! A complete implementation of the [`Engine`] call surface backed by
//! plain collections. It keeps the engine's observable contract: sessions
//! (static and dynamic), one transaction at a time with snapshot rollback,
//! referential checks between providers, sublayers and filters, and
//! persistence across a simulated [`MemoryEngine::reboot`].
//!
//! Test support on top of the contract:
//!
//! - builder accounting ([`MemoryEngine::live_builders`])
//! - one-shot fault injection ([`MemoryEngine::fail_next`],
//!   [`MemoryEngine::panic_next`])
//! - inspection of installed objects
//! - [`MemoryEngine::classify`], a first-match oracle over the committed
//!   rule set
//!
//! Clones share state, so a test can keep a handle on the engine it gave
//! to a [`Manager`](crate::core::manager::Manager).

use crate::core::constants::{PROVIDER_FLAG_PERSISTENT, SUBLAYER_FLAG_PERSISTENT, fields, status};
use crate::core::filter::{Action, FilterFlags, MatchType};
use crate::core::identity::Identity;
use crate::engine::{
    Call, CallFault, Engine, EngineHandle, EntryPoint, FilterHandle, ProviderHandle,
    SessionHandle, SublayerHandle, WideString,
};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Typed value written into a condition slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionValue {
    Unset,
    V4AddrMask { address: u32, mask: u32 },
    V6AddrMask { address: [u8; 16], prefix_len: u8 },
    Uint16(u16),
    BlobString(String),
}

/// One condition slot as the engine stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionSlot {
    pub field: Identity,
    pub match_type: MatchType,
    pub value: ConditionValue,
}

impl ConditionSlot {
    fn empty() -> Self {
        Self {
            field: Identity::NIL,
            match_type: MatchType::Equal,
            value: ConditionValue::Unset,
        }
    }

    fn is_complete(&self) -> bool {
        !self.field.is_nil() && self.value != ConditionValue::Unset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProvider {
    pub key: Identity,
    pub name: String,
    pub description: String,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledSublayer {
    pub key: Identity,
    pub provider_key: Option<Identity>,
    pub name: String,
    pub description: String,
    pub weight: u16,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFilter {
    pub id: u64,
    pub key: Identity,
    pub provider: Option<Identity>,
    pub layer: Identity,
    pub sublayer: Identity,
    pub name: String,
    pub description: String,
    pub action: Action,
    pub weight: u8,
    pub flags: FilterFlags,
    pub conditions: Vec<ConditionSlot>,
}

/// Traffic presented to [`MemoryEngine::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub app_path: Option<String>,
}

impl Connection {
    /// Connection to `remote` from an unspecified local address of the same
    /// family.
    pub fn to(remote: SocketAddr) -> Self {
        let local_ip = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            local: SocketAddr::new(local_ip, 0),
            remote,
            app_path: None,
        }
    }

    pub fn from_local(mut self, local: SocketAddr) -> Self {
        self.local = local;
        self
    }

    pub fn by_app(mut self, path: impl Into<String>) -> Self {
        self.app_path = Some(path.into());
        self
    }
}

/// Installed object plus the dynamic engine handle that owns it, if any.
#[derive(Debug, Clone)]
struct Record<T> {
    value: T,
    owner: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct Store {
    providers: BTreeMap<Identity, Record<InstalledProvider>>,
    sublayers: BTreeMap<Identity, Record<InstalledSublayer>>,
    filters: BTreeMap<u64, Record<InstalledFilter>>,
}

impl Store {
    fn purge_owner(&mut self, owner: usize) {
        self.filters.retain(|_, r| r.owner != Some(owner));
        self.sublayers.retain(|_, r| r.owner != Some(owner));
        self.providers.retain(|_, r| r.owner != Some(owner));
    }

    fn sublayer_weight(&self, key: &Identity) -> u16 {
        self.sublayers.get(key).map_or(0, |r| r.value.weight)
    }
}

#[derive(Debug)]
struct Transaction {
    owner: usize,
    snapshot: Store,
}

#[derive(Debug)]
struct FilterDraft {
    filter: InstalledFilter,
    slots: Option<Vec<ConditionSlot>>,
}

#[derive(Debug)]
enum Builder {
    Provider(InstalledProvider),
    Sublayer(InstalledSublayer),
    Filter(FilterDraft),
}

#[derive(Debug)]
struct State {
    store: Store,
    txn: Option<Transaction>,
    sessions: HashMap<usize, bool>,
    engines: HashMap<usize, bool>,
    builders: HashMap<usize, Builder>,
    next_handle: usize,
    next_filter_id: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            store: Store::default(),
            txn: None,
            sessions: HashMap::new(),
            engines: HashMap::new(),
            builders: HashMap::new(),
            next_handle: 0,
            next_filter_id: 1,
        }
    }
}

const INVALID_HANDLE: CallFault = CallFault::Status(status::INVALID_HANDLE);
const INVALID_ARGUMENT: CallFault = CallFault::Status(status::INVALID_ARGUMENT);

impl State {
    fn alloc_handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    /// Validates an engine handle and returns the dynamic owner tag for
    /// objects it adds.
    fn owner_tag(&self, engine: EngineHandle) -> Call<Option<usize>> {
        match self.engines.get(&engine.get()) {
            Some(true) => Ok(Some(engine.get())),
            Some(false) => Ok(None),
            None => Err(INVALID_HANDLE),
        }
    }

    fn provider_builder(&mut self, handle: ProviderHandle) -> Call<&mut InstalledProvider> {
        match self.builders.get_mut(&handle.get()) {
            Some(Builder::Provider(p)) => Ok(p),
            _ => Err(INVALID_HANDLE),
        }
    }

    fn sublayer_builder(&mut self, handle: SublayerHandle) -> Call<&mut InstalledSublayer> {
        match self.builders.get_mut(&handle.get()) {
            Some(Builder::Sublayer(s)) => Ok(s),
            _ => Err(INVALID_HANDLE),
        }
    }

    fn filter_builder(&mut self, handle: FilterHandle) -> Call<&mut FilterDraft> {
        match self.builders.get_mut(&handle.get()) {
            Some(Builder::Filter(f)) => Ok(f),
            _ => Err(INVALID_HANDLE),
        }
    }

    fn slot(&mut self, handle: FilterHandle, index: u32) -> Call<&mut ConditionSlot> {
        self.filter_builder(handle)?
            .slots
            .as_mut()
            .and_then(|slots| slots.get_mut(index as usize))
            .ok_or(INVALID_ARGUMENT)
    }

    fn free(&mut self, raw: usize, is_kind: fn(&Builder) -> bool) -> Call<()> {
        match self.builders.get(&raw) {
            Some(b) if is_kind(b) => {
                self.builders.remove(&raw);
                Ok(())
            }
            _ => Err(INVALID_HANDLE),
        }
    }

    fn rollback(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.store = txn.snapshot;
        }
    }

    fn owned_txn(&self, engine: EngineHandle) -> Call<()> {
        self.owner_tag(engine)?;
        match &self.txn {
            Some(txn) if txn.owner == engine.get() => Ok(()),
            _ => Err(CallFault::Status(status::NO_TXN_IN_PROGRESS)),
        }
    }
}

enum Injection {
    Fail(CallFault),
    Panic,
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
    injected: Arc<Mutex<HashMap<EntryPoint, Injection>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes a pending injection for `entry`, then locks the state.
    fn enter(&self, entry: EntryPoint) -> Call<MutexGuard<'_, State>> {
        let pending = self
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry);
        match pending {
            Some(Injection::Fail(fault)) => Err(fault),
            Some(Injection::Panic) => panic!("injected fault in {entry}"),
            None => Ok(self.lock()),
        }
    }

    // ── Test controls ───────────────────────────────────────────────────

    /// The next call to `entry` returns `fault` without touching state.
    pub fn fail_next(&self, entry: EntryPoint, fault: CallFault) {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry, Injection::Fail(fault));
    }

    /// The next call to `entry` panics.
    pub fn panic_next(&self, entry: EntryPoint) {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry, Injection::Panic);
    }

    /// Simulates a host restart: every session, engine, builder and open
    /// transaction disappears, and only persistent objects survive.
    ///
    /// A persistent object whose provider or sublayer did not survive is
    /// dropped with it.
    pub fn reboot(&self) {
        let mut state = self.lock();
        state.rollback();
        state.sessions.clear();
        state.engines.clear();
        state.builders.clear();
        let store = &mut state.store;
        store
            .providers
            .retain(|_, r| r.value.flags & PROVIDER_FLAG_PERSISTENT != 0);
        store
            .sublayers
            .retain(|_, r| r.value.flags & SUBLAYER_FLAG_PERSISTENT != 0);
        store
            .filters
            .retain(|_, r| r.value.flags.contains(FilterFlags::PERSISTENT));

        let providers = &store.providers;
        store.sublayers.retain(|_, r| {
            r.value
                .provider_key
                .is_none_or(|p| providers.contains_key(&p))
        });
        let sublayers = &store.sublayers;
        store.filters.retain(|_, r| {
            let f = &r.value;
            (f.sublayer.is_nil() || sublayers.contains_key(&f.sublayer))
                && f.provider.is_none_or(|p| providers.contains_key(&p))
        });
        debug!(
            "Memory engine rebooted: {} providers, {} sublayers, {} filters survived",
            store.providers.len(),
            store.sublayers.len(),
            store.filters.len()
        );
    }

    // ── Inspection ──────────────────────────────────────────────────────

    /// Builder objects allocated and not yet freed.
    pub fn live_builders(&self) -> usize {
        self.lock().builders.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn open_engines(&self) -> usize {
        self.lock().engines.len()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().txn.is_some()
    }

    pub fn has_provider(&self, key: &Identity) -> bool {
        self.lock().store.providers.contains_key(key)
    }

    pub fn has_sublayer(&self, key: &Identity) -> bool {
        self.lock().store.sublayers.contains_key(key)
    }

    pub fn provider(&self, key: &Identity) -> Option<InstalledProvider> {
        self.lock().store.providers.get(key).map(|r| r.value.clone())
    }

    pub fn sublayer(&self, key: &Identity) -> Option<InstalledSublayer> {
        self.lock().store.sublayers.get(key).map(|r| r.value.clone())
    }

    /// Installed filters in id order (including uncommitted changes).
    pub fn filters(&self) -> Vec<InstalledFilter> {
        self.lock()
            .store
            .filters
            .values()
            .map(|r| r.value.clone())
            .collect()
    }

    pub fn filter_count(&self) -> usize {
        self.lock().store.filters.len()
    }

    /// Condition slots of a live filter builder.
    pub fn builder_conditions(&self, handle: FilterHandle) -> Option<Vec<ConditionSlot>> {
        match self.lock().builders.get(&handle.get()) {
            Some(Builder::Filter(draft)) => Some(draft.slots.clone().unwrap_or_default()),
            _ => None,
        }
    }

    /// Decides `conn` at `layer` against the committed rule set.
    ///
    /// Filters are tried by sublayer weight, then filter weight (both
    /// descending); the first enabled Permit or Block filter whose
    /// conditions all match decides. Unmatched traffic is permitted.
    pub fn classify(&self, layer: &Identity, conn: &Connection) -> Action {
        let state = self.lock();
        let store = state.txn.as_ref().map_or(&state.store, |txn| &txn.snapshot);

        let mut candidates: Vec<&InstalledFilter> = store
            .filters
            .values()
            .map(|r| &r.value)
            .filter(|f| f.layer == *layer && !f.flags.contains(FilterFlags::DISABLED))
            .collect();
        candidates.sort_by_key(|f| {
            (
                Reverse(store.sublayer_weight(&f.sublayer)),
                Reverse(f.weight),
                f.id,
            )
        });

        candidates
            .into_iter()
            .find(|f| f.action.is_terminating() && f.conditions.iter().all(|c| evaluate(c, conn)))
            .map_or(Action::Permit, |f| f.action)
    }
}

enum Observed<'a> {
    Port(u16),
    Addr(IpAddr),
    App(Option<&'a str>),
}

fn evaluate(slot: &ConditionSlot, conn: &Connection) -> bool {
    let observed = match slot.field {
        f if f == fields::IP_LOCAL_PORT => Observed::Port(conn.local.port()),
        f if f == fields::IP_REMOTE_PORT => Observed::Port(conn.remote.port()),
        f if f == fields::IP_LOCAL_ADDRESS => Observed::Addr(conn.local.ip()),
        f if f == fields::IP_REMOTE_ADDRESS => Observed::Addr(conn.remote.ip()),
        f if f == fields::ALE_APP_ID => Observed::App(conn.app_path.as_deref()),
        _ => return false,
    };

    match (observed, &slot.value) {
        (Observed::Port(port), ConditionValue::Uint16(value)) => {
            compare_ordered(slot.match_type, port.cmp(value))
        }
        (Observed::Addr(IpAddr::V4(ip)), ConditionValue::V4AddrMask { address, mask }) => {
            compare_equal(slot.match_type, u32::from(ip) & mask == address & mask)
        }
        (
            Observed::Addr(IpAddr::V6(ip)),
            ConditionValue::V6AddrMask {
                address,
                prefix_len,
            },
        ) => compare_equal(
            slot.match_type,
            prefix_matches(&ip.octets(), address, *prefix_len),
        ),
        (Observed::App(Some(path)), ConditionValue::BlobString(value)) => {
            compare_equal(slot.match_type, path.eq_ignore_ascii_case(value))
        }
        _ => false,
    }
}

fn compare_equal(match_type: MatchType, equal: bool) -> bool {
    match match_type {
        MatchType::Equal | MatchType::EqualCaseInsensitive => equal,
        MatchType::NotEqual => !equal,
        _ => false,
    }
}

fn compare_ordered(match_type: MatchType, ord: Ordering) -> bool {
    match match_type {
        MatchType::Equal => ord.is_eq(),
        MatchType::NotEqual => ord.is_ne(),
        MatchType::Greater => ord.is_gt(),
        MatchType::Less => ord.is_lt(),
        MatchType::GreaterOrEqual => ord.is_ge(),
        MatchType::LessOrEqual => ord.is_le(),
        _ => false,
    }
}

fn prefix_matches(a: &[u8; 16], b: &[u8; 16], prefix_len: u8) -> bool {
    let bits = u32::from(prefix_len.min(128));
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits);
    u128::from_be_bytes(*a) & mask == u128::from_be_bytes(*b) & mask
}

impl Engine for MemoryEngine {
    fn session_create(&self, dynamic: bool) -> Call<SessionHandle> {
        let mut state = self.enter(EntryPoint::SessionCreate)?;
        let raw = state.alloc_handle();
        state.sessions.insert(raw, dynamic);
        SessionHandle::from_raw(raw).ok_or(INVALID_HANDLE)
    }

    fn session_destroy(&self, session: SessionHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::SessionDestroy)?;
        state
            .sessions
            .remove(&session.get())
            .map(|_| ())
            .ok_or(INVALID_HANDLE)
    }

    fn engine_open(&self, session: SessionHandle) -> Call<EngineHandle> {
        let mut state = self.enter(EntryPoint::EngineOpen)?;
        let dynamic = *state.sessions.get(&session.get()).ok_or(INVALID_HANDLE)?;
        let raw = state.alloc_handle();
        state.engines.insert(raw, dynamic);
        EngineHandle::from_raw(raw).ok_or(INVALID_HANDLE)
    }

    fn engine_close(&self, engine: EngineHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::EngineClose)?;
        let dynamic = state
            .engines
            .remove(&engine.get())
            .ok_or(INVALID_HANDLE)?;
        if state.txn.as_ref().is_some_and(|t| t.owner == engine.get()) {
            state.rollback();
        }
        if dynamic {
            state.store.purge_owner(engine.get());
        }
        Ok(())
    }

    fn transaction_begin(&self, engine: EngineHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::TransactionBegin)?;
        state.owner_tag(engine)?;
        if state.txn.is_some() {
            return Err(CallFault::Status(status::TXN_IN_PROGRESS));
        }
        let snapshot = state.store.clone();
        state.txn = Some(Transaction {
            owner: engine.get(),
            snapshot,
        });
        Ok(())
    }

    fn transaction_commit(&self, engine: EngineHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::TransactionCommit)?;
        state.owned_txn(engine)?;
        state.txn = None;
        Ok(())
    }

    fn transaction_abort(&self, engine: EngineHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::TransactionAbort)?;
        state.owned_txn(engine)?;
        state.rollback();
        Ok(())
    }

    fn provider_create(&self, key: &Identity) -> Call<ProviderHandle> {
        let mut state = self.enter(EntryPoint::ProviderCreate)?;
        let raw = state.alloc_handle();
        state.builders.insert(
            raw,
            Builder::Provider(InstalledProvider {
                key: *key,
                name: String::new(),
                description: String::new(),
                flags: 0,
            }),
        );
        ProviderHandle::from_raw(raw).ok_or(INVALID_HANDLE)
    }

    fn provider_set_flags(&self, provider: ProviderHandle, flags: u32) -> Call<()> {
        let mut state = self.enter(EntryPoint::ProviderSetFlags)?;
        state.provider_builder(provider)?.flags = flags;
        Ok(())
    }

    fn provider_set_display_data(
        &self,
        provider: ProviderHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::ProviderSetDisplayData)?;
        let p = state.provider_builder(provider)?;
        p.name = name.to_string_lossy();
        p.description = description.to_string_lossy();
        Ok(())
    }

    fn provider_free(&self, provider: ProviderHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::ProviderFree)?;
        state.free(provider.get(), |b| matches!(b, Builder::Provider(_)))
    }

    fn provider_add(&self, engine: EngineHandle, provider: ProviderHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::ProviderAdd)?;
        let owner = state.owner_tag(engine)?;
        let value = state.provider_builder(provider)?.clone();
        if value.name.is_empty() {
            return Err(INVALID_ARGUMENT);
        }
        if state.store.providers.contains_key(&value.key) {
            return Err(CallFault::Status(status::ALREADY_EXISTS));
        }
        state
            .store
            .providers
            .insert(value.key, Record { value, owner });
        Ok(())
    }

    fn provider_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()> {
        let mut state = self.enter(EntryPoint::ProviderDelete)?;
        state.owner_tag(engine)?;
        let store = &mut state.store;
        if !store.providers.contains_key(key) {
            return Err(CallFault::Status(status::PROVIDER_NOT_FOUND));
        }
        let referenced = store
            .sublayers
            .values()
            .any(|r| r.value.provider_key == Some(*key))
            || store
                .filters
                .values()
                .any(|r| r.value.provider == Some(*key));
        if referenced {
            return Err(CallFault::Status(status::IN_USE));
        }
        store.providers.remove(key);
        Ok(())
    }

    fn provider_get_flags(&self, engine: EngineHandle, key: &Identity) -> Call<u32> {
        let state = self.enter(EntryPoint::ProviderGetFlags)?;
        state.owner_tag(engine)?;
        state
            .store
            .providers
            .get(key)
            .map(|r| r.value.flags)
            .ok_or(CallFault::Status(status::PROVIDER_NOT_FOUND))
    }

    fn sublayer_create(&self, key: &Identity, weight: u16) -> Call<SublayerHandle> {
        let mut state = self.enter(EntryPoint::SublayerCreate)?;
        let raw = state.alloc_handle();
        state.builders.insert(
            raw,
            Builder::Sublayer(InstalledSublayer {
                key: *key,
                provider_key: None,
                name: String::new(),
                description: String::new(),
                weight,
                flags: 0,
            }),
        );
        SublayerHandle::from_raw(raw).ok_or(INVALID_HANDLE)
    }

    fn sublayer_set_provider_key(
        &self,
        sublayer: SublayerHandle,
        provider: &Identity,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerSetProviderKey)?;
        state.sublayer_builder(sublayer)?.provider_key = Some(*provider);
        Ok(())
    }

    fn sublayer_set_display_data(
        &self,
        sublayer: SublayerHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerSetDisplayData)?;
        let s = state.sublayer_builder(sublayer)?;
        s.name = name.to_string_lossy();
        s.description = description.to_string_lossy();
        Ok(())
    }

    fn sublayer_set_weight(&self, sublayer: SublayerHandle, weight: u16) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerSetWeight)?;
        state.sublayer_builder(sublayer)?.weight = weight;
        Ok(())
    }

    fn sublayer_set_flags(&self, sublayer: SublayerHandle, flags: u32) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerSetFlags)?;
        state.sublayer_builder(sublayer)?.flags = flags;
        Ok(())
    }

    fn sublayer_free(&self, sublayer: SublayerHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerFree)?;
        state.free(sublayer.get(), |b| matches!(b, Builder::Sublayer(_)))
    }

    fn sublayer_add(&self, engine: EngineHandle, sublayer: SublayerHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerAdd)?;
        let owner = state.owner_tag(engine)?;
        let value = state.sublayer_builder(sublayer)?.clone();
        if value.name.is_empty() {
            return Err(INVALID_ARGUMENT);
        }
        if state.store.sublayers.contains_key(&value.key) {
            return Err(CallFault::Status(status::ALREADY_EXISTS));
        }
        if value
            .provider_key
            .is_some_and(|provider| !state.store.providers.contains_key(&provider))
        {
            return Err(CallFault::Status(status::PROVIDER_NOT_FOUND));
        }
        state
            .store
            .sublayers
            .insert(value.key, Record { value, owner });
        Ok(())
    }

    fn sublayer_delete(&self, engine: EngineHandle, key: &Identity) -> Call<()> {
        let mut state = self.enter(EntryPoint::SublayerDelete)?;
        state.owner_tag(engine)?;
        let store = &mut state.store;
        if !store.sublayers.contains_key(key) {
            return Err(CallFault::Status(status::SUBLAYER_NOT_FOUND));
        }
        if store.filters.values().any(|r| r.value.sublayer == *key) {
            return Err(CallFault::Status(status::IN_USE));
        }
        store.sublayers.remove(key);
        Ok(())
    }

    fn sublayer_is_installed(&self, engine: EngineHandle, key: &Identity) -> Call<bool> {
        let state = self.enter(EntryPoint::SublayerIsInstalled)?;
        state.owner_tag(engine)?;
        Ok(state.store.sublayers.contains_key(key))
    }

    fn filter_create(
        &self,
        key: &Identity,
        layer: &Identity,
        sublayer: &Identity,
        weight: u8,
        flags: u32,
    ) -> Call<FilterHandle> {
        let mut state = self.enter(EntryPoint::FilterCreate)?;
        let raw = state.alloc_handle();
        state.builders.insert(
            raw,
            Builder::Filter(FilterDraft {
                filter: InstalledFilter {
                    id: 0,
                    key: *key,
                    provider: None,
                    layer: *layer,
                    sublayer: *sublayer,
                    name: String::new(),
                    description: String::new(),
                    action: Action::Block,
                    weight,
                    flags: FilterFlags::from_bits(flags),
                    conditions: Vec::new(),
                },
                slots: None,
            }),
        );
        FilterHandle::from_raw(raw).ok_or(INVALID_HANDLE)
    }

    fn filter_set_provider_key(&self, filter: FilterHandle, provider: &Identity) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetProviderKey)?;
        state.filter_builder(filter)?.filter.provider = Some(*provider);
        Ok(())
    }

    fn filter_set_display_data(
        &self,
        filter: FilterHandle,
        name: &WideString,
        description: &WideString,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetDisplayData)?;
        let draft = state.filter_builder(filter)?;
        draft.filter.name = name.to_string_lossy();
        draft.filter.description = description.to_string_lossy();
        Ok(())
    }

    fn filter_set_action(&self, filter: FilterHandle, action: u32) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetAction)?;
        let action = Action::from_code(action).ok_or(INVALID_ARGUMENT)?;
        state.filter_builder(filter)?.filter.action = action;
        Ok(())
    }

    fn filter_allocate_conditions(&self, filter: FilterHandle, count: u32) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterAllocateConditions)?;
        state.filter_builder(filter)?.slots = Some(vec![ConditionSlot::empty(); count as usize]);
        Ok(())
    }

    fn filter_set_condition_field_key(
        &self,
        filter: FilterHandle,
        index: u32,
        field: &Identity,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionFieldKey)?;
        state.slot(filter, index)?.field = *field;
        Ok(())
    }

    fn filter_set_condition_match_type(
        &self,
        filter: FilterHandle,
        index: u32,
        match_type: u32,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionMatchType)?;
        let match_type = MatchType::from_code(match_type).ok_or(INVALID_ARGUMENT)?;
        state.slot(filter, index)?.match_type = match_type;
        Ok(())
    }

    fn filter_set_condition_v4_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: u32,
        mask: u32,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionV4AddrMask)?;
        state.slot(filter, index)?.value = ConditionValue::V4AddrMask { address, mask };
        Ok(())
    }

    fn filter_set_condition_v6_addr_mask(
        &self,
        filter: FilterHandle,
        index: u32,
        address: &[u8; 16],
        prefix_len: u8,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionV6AddrMask)?;
        if prefix_len > 128 {
            return Err(INVALID_ARGUMENT);
        }
        state.slot(filter, index)?.value = ConditionValue::V6AddrMask {
            address: *address,
            prefix_len,
        };
        Ok(())
    }

    fn filter_set_condition_u16(&self, filter: FilterHandle, index: u32, value: u16) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionUint16)?;
        state.slot(filter, index)?.value = ConditionValue::Uint16(value);
        Ok(())
    }

    fn filter_set_condition_blob_string(
        &self,
        filter: FilterHandle,
        index: u32,
        value: &WideString,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterSetConditionBlobString)?;
        state.slot(filter, index)?.value = ConditionValue::BlobString(value.to_string_lossy());
        Ok(())
    }

    fn filter_free(&self, filter: FilterHandle) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterFree)?;
        state.free(filter.get(), |b| matches!(b, Builder::Filter(_)))
    }

    fn filter_add(&self, engine: EngineHandle, filter: FilterHandle) -> Call<u64> {
        let mut state = self.enter(EntryPoint::FilterAdd)?;
        let owner = state.owner_tag(engine)?;
        let draft = state.filter_builder(filter)?;
        let slots = draft.slots.clone().unwrap_or_default();
        let mut value = draft.filter.clone();

        if value.name.is_empty() || !slots.iter().all(ConditionSlot::is_complete) {
            return Err(INVALID_ARGUMENT);
        }
        if value.flags.contains(FilterFlags::PERSISTENT)
            && value.flags.contains(FilterFlags::BOOTTIME)
        {
            return Err(INVALID_ARGUMENT);
        }
        if value.layer.is_nil() {
            return Err(CallFault::Status(status::LAYER_NOT_FOUND));
        }
        let store = &state.store;
        if store.filters.values().any(|r| r.value.key == value.key) {
            return Err(CallFault::Status(status::ALREADY_EXISTS));
        }
        if !value.sublayer.is_nil() && !store.sublayers.contains_key(&value.sublayer) {
            return Err(CallFault::Status(status::SUBLAYER_NOT_FOUND));
        }
        if value
            .provider
            .is_some_and(|provider| !store.providers.contains_key(&provider))
        {
            return Err(CallFault::Status(status::PROVIDER_NOT_FOUND));
        }

        let id = state.next_filter_id;
        state.next_filter_id += 1;
        value.id = id;
        value.conditions = slots;
        state.store.filters.insert(id, Record { value, owner });
        Ok(id)
    }

    fn filter_delete_by_id(&self, engine: EngineHandle, id: u64) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterDeleteById)?;
        state.owner_tag(engine)?;
        state
            .store
            .filters
            .remove(&id)
            .map(|_| ())
            .ok_or(CallFault::Status(status::FILTER_NOT_FOUND))
    }

    fn filter_delete_by_provider_key(
        &self,
        engine: EngineHandle,
        provider: &Identity,
        layer: &Identity,
    ) -> Call<()> {
        let mut state = self.enter(EntryPoint::FilterDeleteByProviderKey)?;
        state.owner_tag(engine)?;
        state
            .store
            .filters
            .retain(|_, r| !(r.value.provider == Some(*provider) && r.value.layer == *layer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::layers;

    fn open(engine: &MemoryEngine, dynamic: bool) -> EngineHandle {
        let session = engine.session_create(dynamic).unwrap();
        engine.engine_open(session).unwrap()
    }

    fn add_provider(engine: &MemoryEngine, h: EngineHandle, key: &Identity, flags: u32) {
        let b = engine.provider_create(key).unwrap();
        engine.provider_set_flags(b, flags).unwrap();
        let name = WideString::new("p").unwrap();
        engine.provider_set_display_data(b, &name, &name).unwrap();
        engine.provider_add(h, b).unwrap();
        engine.provider_free(b).unwrap();
    }

    fn add_sublayer(engine: &MemoryEngine, h: EngineHandle, key: &Identity, provider: &Identity) {
        let b = engine.sublayer_create(key, 0).unwrap();
        engine.sublayer_set_provider_key(b, provider).unwrap();
        let name = WideString::new("s").unwrap();
        engine.sublayer_set_display_data(b, &name, &name).unwrap();
        engine.sublayer_add(h, b).unwrap();
        engine.sublayer_free(b).unwrap();
    }

    fn add_port_filter(
        engine: &MemoryEngine,
        h: EngineHandle,
        provider: &Identity,
        sublayer: &Identity,
        action: Action,
        weight: u8,
        port: u16,
    ) -> u64 {
        let b = engine
            .filter_create(&Identity::new(), &layers::ALE_AUTH_CONNECT_V4, sublayer, weight, 0)
            .unwrap();
        engine.filter_set_provider_key(b, provider).unwrap();
        let name = WideString::new("f").unwrap();
        engine.filter_set_display_data(b, &name, &name).unwrap();
        engine.filter_set_action(b, action.code()).unwrap();
        engine.filter_allocate_conditions(b, 1).unwrap();
        engine
            .filter_set_condition_field_key(b, 0, &fields::IP_REMOTE_PORT)
            .unwrap();
        engine
            .filter_set_condition_match_type(b, 0, MatchType::Equal.code())
            .unwrap();
        engine.filter_set_condition_u16(b, 0, port).unwrap();
        let id = engine.filter_add(h, b).unwrap();
        engine.filter_free(b).unwrap();
        id
    }

    #[test]
    fn test_referential_checks() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let (p, s) = (Identity::new(), Identity::new());

        let b = engine.sublayer_create(&s, 0).unwrap();
        engine.sublayer_set_provider_key(b, &p).unwrap();
        let name = WideString::new("s").unwrap();
        engine.sublayer_set_display_data(b, &name, &name).unwrap();
        assert_eq!(
            engine.sublayer_add(h, b),
            Err(CallFault::Status(status::PROVIDER_NOT_FOUND))
        );
        engine.sublayer_free(b).unwrap();

        add_provider(&engine, h, &p, 0);
        add_sublayer(&engine, h, &s, &p);
        let id = add_port_filter(&engine, h, &p, &s, Action::Block, 1, 53);

        assert_eq!(
            engine.provider_delete(h, &p),
            Err(CallFault::Status(status::IN_USE))
        );
        assert_eq!(
            engine.sublayer_delete(h, &s),
            Err(CallFault::Status(status::IN_USE))
        );
        engine.filter_delete_by_id(h, id).unwrap();
        engine.sublayer_delete(h, &s).unwrap();
        engine.provider_delete(h, &p).unwrap();
        assert_eq!(
            engine.provider_get_flags(h, &p),
            Err(CallFault::Status(status::PROVIDER_NOT_FOUND))
        );
        assert_eq!(engine.live_builders(), 0);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let p = Identity::new();
        add_provider(&engine, h, &p, 0);
        let b = engine.provider_create(&p).unwrap();
        let name = WideString::new("dup").unwrap();
        engine.provider_set_display_data(b, &name, &name).unwrap();
        assert_eq!(
            engine.provider_add(h, b),
            Err(CallFault::Status(status::ALREADY_EXISTS))
        );
    }

    #[test]
    fn test_transaction_snapshot_and_nested_begin() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        engine.transaction_begin(h).unwrap();
        assert_eq!(
            engine.transaction_begin(h),
            Err(CallFault::Status(status::TXN_IN_PROGRESS))
        );
        let p = Identity::new();
        add_provider(&engine, h, &p, 0);
        assert!(engine.has_provider(&p));
        engine.transaction_abort(h).unwrap();
        assert!(!engine.has_provider(&p));
        assert_eq!(
            engine.transaction_commit(h),
            Err(CallFault::Status(status::NO_TXN_IN_PROGRESS))
        );
    }

    #[test]
    fn test_classify_uses_committed_view() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let (p, s) = (Identity::new(), Identity::new());
        add_provider(&engine, h, &p, 0);
        add_sublayer(&engine, h, &s, &p);
        let dns = Connection::to("1.1.1.1:53".parse().unwrap());

        engine.transaction_begin(h).unwrap();
        add_port_filter(&engine, h, &p, &s, Action::Block, 1, 53);
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &dns),
            Action::Permit
        );
        engine.transaction_commit(h).unwrap();
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &dns),
            Action::Block
        );
        // other layers are unaffected
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_RECV_ACCEPT_V4, &dns),
            Action::Permit
        );
    }

    #[test]
    fn test_classify_weight_order() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let (p, s) = (Identity::new(), Identity::new());
        add_provider(&engine, h, &p, 0);
        add_sublayer(&engine, h, &s, &p);
        add_port_filter(&engine, h, &p, &s, Action::Block, 2, 443);
        add_port_filter(&engine, h, &p, &s, Action::Permit, 10, 443);
        let https = Connection::to("10.0.0.1:443".parse().unwrap());
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &https),
            Action::Permit
        );
    }

    #[test]
    fn test_reboot_keeps_only_persistent_objects() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let (kept, lost) = (Identity::new(), Identity::new());
        add_provider(&engine, h, &kept, PROVIDER_FLAG_PERSISTENT);
        add_provider(&engine, h, &lost, 0);
        engine.reboot();
        assert!(engine.has_provider(&kept));
        assert!(!engine.has_provider(&lost));
        assert_eq!(engine.open_engines(), 0);
        assert_eq!(engine.live_sessions(), 0);
        assert_eq!(
            engine.provider_get_flags(h, &kept),
            Err(CallFault::Status(status::INVALID_HANDLE))
        );
    }

    #[test]
    fn test_reboot_drops_orphaned_persistent_objects() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let (kept, lost) = (Identity::new(), Identity::new());
        let (kept_sublayer, orphan_sublayer) = (Identity::new(), Identity::new());
        add_provider(&engine, h, &kept, PROVIDER_FLAG_PERSISTENT);
        add_provider(&engine, h, &lost, 0);

        for (key, provider) in [(&kept_sublayer, &kept), (&orphan_sublayer, &lost)] {
            let b = engine.sublayer_create(key, 0).unwrap();
            engine.sublayer_set_provider_key(b, provider).unwrap();
            engine.sublayer_set_flags(b, SUBLAYER_FLAG_PERSISTENT).unwrap();
            let name = WideString::new("s").unwrap();
            engine.sublayer_set_display_data(b, &name, &name).unwrap();
            engine.sublayer_add(h, b).unwrap();
            engine.sublayer_free(b).unwrap();
        }

        let persistent = FilterFlags::PERSISTENT.bits();
        for (provider, sublayer) in [(&kept, &kept_sublayer), (&lost, &orphan_sublayer)] {
            let layer = layers::ALE_AUTH_CONNECT_V4;
            let b = engine
                .filter_create(&Identity::new(), &layer, sublayer, 1, persistent)
                .unwrap();
            engine.filter_set_provider_key(b, provider).unwrap();
            let name = WideString::new("f").unwrap();
            engine.filter_set_display_data(b, &name, &name).unwrap();
            engine.filter_set_action(b, Action::Block.code()).unwrap();
            engine.filter_add(h, b).unwrap();
            engine.filter_free(b).unwrap();
        }
        assert_eq!(engine.filter_count(), 2);

        engine.reboot();
        assert!(engine.has_provider(&kept));
        assert!(!engine.has_provider(&lost));
        assert!(engine.has_sublayer(&kept_sublayer));
        assert!(!engine.has_sublayer(&orphan_sublayer));
        assert_eq!(engine.filter_count(), 1);
        assert!(
            engine
                .filters()
                .iter()
                .all(|f| f.sublayer == kept_sublayer && f.provider == Some(kept))
        );
    }

    #[test]
    fn test_dynamic_objects_removed_on_close() {
        let engine = MemoryEngine::new();
        let h = open(&engine, true);
        let p = Identity::new();
        add_provider(&engine, h, &p, 0);
        engine.engine_close(h).unwrap();
        assert!(!engine.has_provider(&p));
    }

    #[test]
    fn test_incomplete_slots_rejected() {
        let engine = MemoryEngine::new();
        let h = open(&engine, false);
        let b = engine
            .filter_create(&Identity::new(), &layers::ALE_AUTH_CONNECT_V4, &Identity::NIL, 0, 0)
            .unwrap();
        let name = WideString::new("f").unwrap();
        engine.filter_set_display_data(b, &name, &name).unwrap();
        engine.filter_allocate_conditions(b, 1).unwrap();
        assert_eq!(engine.filter_add(h, b), Err(INVALID_ARGUMENT));
        engine.filter_free(b).unwrap();
        assert_eq!(engine.filter_free(b), Err(INVALID_HANDLE));
    }

    #[test]
    fn test_injection_is_one_shot() {
        let engine = MemoryEngine::new();
        engine.fail_next(
            EntryPoint::SessionCreate,
            CallFault::Transport("pipe closed".to_string()),
        );
        assert!(engine.session_create(false).is_err());
        assert!(engine.session_create(false).is_ok());
    }

    #[test]
    fn test_prefix_matching() {
        let a = "fd00::1".parse::<Ipv6Addr>().unwrap().octets();
        let b = "fd00::2".parse::<Ipv6Addr>().unwrap().octets();
        assert!(prefix_matches(&a, &b, 64));
        assert!(!prefix_matches(&a, &b, 128));
        assert!(prefix_matches(&a, &[0; 16], 0));
    }
}

//! Stateful façade over one engine session
//!
//! The [`Manager`] lazily opens the engine on first use and owns the session
//! and engine handles for its whole lifetime. Builder objects are owned by
//! the scoped types of [`crate::core::guard`] and never outlive the call
//! that allocated them.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --initialize--> Open --transaction_start--> InTransaction
//!       ^                        |  <--commit / abort------------|
//!       +------uninitialize------+
//! any --unrecoverable fault--> Uninitialized
//! any --close--> Closed (terminal)
//! ```
//!
//! Mutations issued outside an explicit transaction run inside an implicit
//! one (begin, mutate, commit; abort on failure).
//!
//! The manager is not internally synchronized; callers serialize access.

use crate::core::constants::{PROVIDER_FLAG_PERSISTENT, SUBLAYER_FLAG_PERSISTENT, status};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::filter::{Filter, FilterId, Provider, ProviderInfo, Sublayer};
use crate::core::guard::{FilterBuilder, ScopedProvider, ScopedSublayer, shielded};
use crate::config::ControllerConfig;
use crate::core::identity::Identity;
use crate::engine::dll::DllEngine;
use crate::engine::{Engine, EngineHandle, EntryPoint, SessionHandle};
use crate::validators;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

/// Observable state of the engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Uninitialized,
    Open,
    InTransaction,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManagerOptions {
    /// Objects added through a dynamic session are removed by the engine
    /// when the session ends.
    pub dynamic_session: bool,
}

impl ManagerOptions {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            dynamic_session: config.dynamic_session,
        }
    }
}

/// Failure of `add_filter`, carrying the engine id when the filter had
/// already been added before the failing step.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct AddFilterError {
    pub installed: Option<FilterId>,
    pub source: Error,
}

impl AddFilterError {
    fn before_install(source: Error) -> Self {
        Self {
            installed: None,
            source,
        }
    }
}

impl From<AddFilterError> for Error {
    fn from(e: AddFilterError) -> Self {
        e.source
    }
}

#[derive(Debug)]
pub struct Manager<E: Engine> {
    engine: E,
    options: ManagerOptions,
    session: Option<SessionHandle>,
    handle: Option<EngineHandle>,
    in_transaction: bool,
    closed: bool,
}

impl<E: Engine> Manager<E> {
    pub fn new(engine: E) -> Self {
        Self::with_options(engine, ManagerOptions::default())
    }

    pub fn with_options(engine: E, options: ManagerOptions) -> Self {
        Self {
            engine,
            options,
            session: None,
            handle: None,
            in_transaction: false,
            closed: false,
        }
    }

    /// The engine binding this manager drives.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> ManagerOptions {
        self.options
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.handle.is_none() {
            SessionState::Uninitialized
        } else if self.in_transaction {
            SessionState::InTransaction
        } else {
            SessionState::Open
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            Err(Error::InvalidState("manager is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Opens a session and the engine. Idempotent.
    pub fn initialize(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.handle.is_some() {
            return Ok(());
        }

        let dynamic = self.options.dynamic_session;
        let session = shielded(EntryPoint::SessionCreate, || {
            self.engine.session_create(dynamic)
        })
        .inspect_err(|e| error!("Failed to initialize firewall engine: {e}"))
        .context("failed to create engine session")?;

        match shielded(EntryPoint::EngineOpen, || self.engine.engine_open(session)) {
            Ok(handle) => {
                self.session = Some(session);
                self.handle = Some(handle);
                self.in_transaction = false;
                info!(
                    "Firewall engine opened ({} session)",
                    if dynamic { "dynamic" } else { "static" }
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize firewall engine: {e}");
                if let Err(destroy) = shielded(EntryPoint::SessionDestroy, || {
                    self.engine.session_destroy(session)
                }) {
                    warn!("Failed to release engine session: {destroy}");
                }
                Err(e.context("failed to open engine"))
            }
        }
    }

    /// Closes the engine and the session. Best-effort; never fails.
    ///
    /// Afterwards the manager is indistinguishable from a freshly
    /// constructed one.
    pub fn uninitialize(&mut self) {
        if let Some(handle) = self.handle.take() {
            match shielded(EntryPoint::EngineClose, || self.engine.engine_close(handle)) {
                Ok(()) => info!("Firewall engine closed"),
                Err(e) => error!("Failed to close firewall engine: {e}"),
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = shielded(EntryPoint::SessionDestroy, || {
                self.engine.session_destroy(session)
            }) {
                error!("Failed to release engine session: {e}");
            }
        }
        self.in_transaction = false;
    }

    /// Aborts any open transaction, releases the engine and rejects all
    /// further operations.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.abort_quietly();
        self.uninitialize();
        self.closed = true;
    }

    fn ensure_open(&mut self) -> Result<EngineHandle> {
        self.initialize()?;
        self.handle
            .ok_or_else(|| Error::InvalidState("engine not initialized".to_string()))
    }

    fn require_initialized(&self, what: &str) -> Result<EngineHandle> {
        self.ensure_usable()?;
        self.handle.ok_or_else(|| {
            Error::InvalidState(format!("unable to {what} (engine not initialized)"))
        })
    }

    /// Forces the session back to `Uninitialized` after a fault that leaves
    /// the engine connection untrustworthy.
    fn settle_err(&mut self, e: Error) -> Error {
        if e.is_unrecoverable() && self.handle.is_some() {
            error!("Unrecoverable engine fault, resetting session: {e}");
            self.uninitialize();
        }
        e
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.settle_err(e))
    }

    fn begin_implicit(&self, engine: EngineHandle) -> Result<bool> {
        if self.in_transaction {
            return Ok(false);
        }
        shielded(EntryPoint::TransactionBegin, || {
            self.engine.transaction_begin(engine)
        })
        .context("failed to start transaction")?;
        Ok(true)
    }

    fn end_implicit(&self, engine: EngineHandle, implicit: bool, success: bool) -> Result<()> {
        if !implicit {
            return Ok(());
        }
        if success {
            let committed = shielded(EntryPoint::TransactionCommit, || {
                self.engine.transaction_commit(engine)
            });
            if let Err(e) = committed {
                error!("Failed to commit transaction: {e}");
                if let Err(abort) = shielded(EntryPoint::TransactionAbort, || {
                    self.engine.transaction_abort(engine)
                }) {
                    debug!("Abort after failed commit: {abort}");
                }
                return Err(e.context("failed to commit transaction"));
            }
            return Ok(());
        }
        if let Err(e) = shielded(EntryPoint::TransactionAbort, || {
            self.engine.transaction_abort(engine)
        }) {
            warn!("Failed to abort transaction: {e}");
        }
        Ok(())
    }

    /// Runs one mutation, inside an implicit transaction unless an explicit
    /// one is open.
    fn mutate<T>(
        &mut self,
        engine: EngineHandle,
        op: impl FnOnce(&E, EngineHandle) -> Result<T>,
    ) -> Result<T> {
        let begun = self.begin_implicit(engine);
        let implicit = self.settle(begun)?;
        let result = op(&self.engine, engine);
        let finished = self.end_implicit(engine, implicit, result.is_ok());
        let result = match (result, finished) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        };
        self.settle(result)
    }

    // ── Transactions ────────────────────────────────────────────────────

    pub fn transaction_start(&mut self) -> Result<()> {
        let engine = self.ensure_open().context("failed to initialize manager")?;
        let result = shielded(EntryPoint::TransactionBegin, || {
            self.engine.transaction_begin(engine)
        });
        match result {
            Ok(()) => {
                self.in_transaction = true;
                debug!("Transaction started");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start transaction: {e}");
                self.settle(Err(e))
            }
        }
    }

    pub fn transaction_commit(&mut self) -> Result<()> {
        let engine = self.ensure_open().context("failed to initialize manager")?;
        let result = shielded(EntryPoint::TransactionCommit, || {
            self.engine.transaction_commit(engine)
        });
        match result {
            Ok(()) => {
                self.in_transaction = false;
                debug!("Transaction committed");
                Ok(())
            }
            Err(e) => {
                error!("Failed to commit transaction: {e}");
                if e.status() == Some(status::NO_TXN_IN_PROGRESS) {
                    self.in_transaction = false;
                }
                self.settle(Err(e))
            }
        }
    }

    pub fn transaction_abort(&mut self) -> Result<()> {
        let engine = self.ensure_open().context("failed to initialize manager")?;
        let result = shielded(EntryPoint::TransactionAbort, || {
            self.engine.transaction_abort(engine)
        });
        self.in_transaction = false;
        match result {
            Ok(()) => {
                debug!("Transaction aborted");
                Ok(())
            }
            Err(e) => {
                error!("Failed to abort transaction: {e}");
                self.settle(Err(e))
            }
        }
    }

    fn abort_quietly(&mut self) {
        if self.in_transaction && self.handle.is_some() {
            if let Err(e) = self.transaction_abort() {
                warn!("Failed to abort transaction: {e}");
            }
        }
        self.in_transaction = false;
    }

    /// Runs `f` inside one transaction: commit on `Ok`, abort on `Err`.
    ///
    /// A panic inside `f` aborts the transaction and then resumes unwinding.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.transaction_start()?;
        match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(value)) => match self.transaction_commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.abort_quietly();
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                self.abort_quietly();
                Err(e)
            }
            Err(payload) => {
                error!("Panic inside transaction, aborting");
                self.abort_quietly();
                panic::resume_unwind(payload)
            }
        }
    }

    // ── Providers ───────────────────────────────────────────────────────

    /// Returns `{false, false}` for an unknown provider, never an error.
    pub fn get_provider_info(&mut self, key: &Identity) -> Result<ProviderInfo> {
        let engine = self.ensure_open().context("failed to initialize manager")?;
        let result = shielded(EntryPoint::ProviderGetFlags, || {
            self.engine.provider_get_flags(engine, key)
        });
        match result {
            Ok(flags) => Ok(ProviderInfo {
                is_installed: true,
                is_persistent: flags & PROVIDER_FLAG_PERSISTENT == PROVIDER_FLAG_PERSISTENT,
            }),
            Err(e) if e.status() == Some(status::PROVIDER_NOT_FOUND) => {
                Ok(ProviderInfo::default())
            }
            Err(e) => self.settle(Err(e.context("failed to query provider"))),
        }
    }

    pub fn add_provider(&mut self, provider: &Provider) -> Result<()> {
        validators::validate_display_name(&provider.name).context("unable to add provider")?;
        let engine = self.ensure_open().context("failed to initialize manager")?;

        self.mutate(engine, |binding, engine| {
            let mut builder = ScopedProvider::create(binding, &provider.key)
                .context("failed to create provider")?;
            if provider.persistent {
                builder
                    .set_flags(PROVIDER_FLAG_PERSISTENT)
                    .context("failed to set provider flags")?;
            }
            builder
                .set_display_data(&provider.name, &provider.description)
                .context("failed to set provider display data")?;
            builder.add(engine).context("failed to add provider")?;
            debug!("Provider {} added (persistent: {})", provider.key, provider.persistent);
            Ok(())
        })
    }

    /// Removes a provider. Tolerates an uninitialized engine (shutdown idiom).
    pub fn delete_provider(&mut self, key: &Identity) -> Result<()> {
        self.ensure_usable()?;
        let Some(engine) = self.handle else {
            debug!("Skipping provider delete for {key}: engine not initialized");
            return Ok(());
        };
        self.mutate(engine, |binding, engine| {
            shielded(EntryPoint::ProviderDelete, || binding.provider_delete(engine, key))
                .context("failed to delete provider")?;
            debug!("Provider {key} deleted");
            Ok(())
        })
    }

    // ── Sublayers ───────────────────────────────────────────────────────

    pub fn is_sublayer_installed(&mut self, key: &Identity) -> Result<bool> {
        let engine = self.ensure_open().context("failed to initialize manager")?;
        let result = shielded(EntryPoint::SublayerIsInstalled, || {
            self.engine.sublayer_is_installed(engine, key)
        })
        .context("failed to query sublayer");
        self.settle(result)
    }

    pub fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<()> {
        validators::validate_display_name(&sublayer.name).context("unable to add sublayer")?;
        let engine = self.ensure_open().context("failed to initialize manager")?;

        self.mutate(engine, |binding, engine| {
            let mut builder = ScopedSublayer::create(binding, &sublayer.key, sublayer.weight)
                .context("failed to create sublayer")?;
            builder
                .set_provider_key(&sublayer.provider_key)
                .context("failed to set provider key")?;
            builder
                .set_weight(sublayer.weight)
                .context("failed to set sublayer weight")?;
            if sublayer.persistent {
                builder
                    .set_flags(SUBLAYER_FLAG_PERSISTENT)
                    .context("failed to set sublayer flags")?;
            }
            builder
                .set_display_data(&sublayer.name, &sublayer.description)
                .context("failed to set sublayer display data")?;
            builder.add(engine).context("failed to add sublayer")?;
            debug!(
                "Sublayer {} added under provider {} (weight {})",
                sublayer.key, sublayer.provider_key, sublayer.weight
            );
            Ok(())
        })
    }

    /// Removes a sublayer. Requires an initialized engine.
    pub fn delete_sublayer(&mut self, key: &Identity) -> Result<()> {
        let engine = self.require_initialized("delete sublayer")?;
        self.mutate(engine, |binding, engine| {
            shielded(EntryPoint::SublayerDelete, || binding.sublayer_delete(engine, key))
                .context("failed to delete sublayer")?;
            debug!("Sublayer {key} deleted");
            Ok(())
        })
    }

    // ── Filters ─────────────────────────────────────────────────────────

    /// Installs `filter` and returns the engine-assigned id.
    ///
    /// If a step fails after the engine accepted the filter, the error
    /// carries the id so the caller can remove it.
    pub fn add_filter(&mut self, filter: &Filter) -> std::result::Result<FilterId, AddFilterError> {
        self.add_filter_with_slots(filter, filter.conditions.len())
    }

    /// Like [`Manager::add_filter`] but allocates `slots` condition slots
    /// instead of one per condition.
    #[doc(hidden)]
    pub fn add_filter_with_slots(
        &mut self,
        filter: &Filter,
        slots: usize,
    ) -> std::result::Result<FilterId, AddFilterError> {
        validators::validate_display_name(&filter.name)
            .context("unable to add filter")
            .map_err(AddFilterError::before_install)?;
        let engine = self
            .ensure_open()
            .context("failed to initialize manager")
            .map_err(AddFilterError::before_install)?;

        let begun = self.begin_implicit(engine);
        let implicit = self.settle(begun).map_err(AddFilterError::before_install)?;
        let installed = install_filter(&self.engine, engine, filter, slots);
        let finished = self.end_implicit(engine, implicit, installed.is_ok());

        let outcome = match (installed, finished) {
            (Ok(id), Ok(())) => {
                debug!(
                    "Filter {} added as #{id} (action {}, {} conditions, weight {})",
                    filter.key,
                    filter.action,
                    filter.conditions.len(),
                    filter.weight
                );
                Ok(id)
            }
            (Ok(id), Err(e)) => Err(AddFilterError {
                installed: Some(id),
                source: e,
            }),
            (Err(e), _) => Err(AddFilterError::before_install(e)),
        };

        outcome.map_err(|AddFilterError { installed, source }| AddFilterError {
            installed,
            source: self.settle_err(source),
        })
    }

    /// Removes one filter by engine id. Requires an initialized engine.
    pub fn delete_filter_by_id(&mut self, id: FilterId) -> Result<()> {
        let engine = self.require_initialized("delete filter")?;
        validators::validate_filter_id(id.get()).context("unable to delete filter")?;
        self.mutate(engine, |binding, engine| {
            shielded(EntryPoint::FilterDeleteById, || {
                binding.filter_delete_by_id(engine, id.get())
            })
            .context("failed to delete filter")?;
            debug!("Filter #{id} deleted");
            Ok(())
        })
    }

    /// Removes every filter of `provider` at `layer`. Requires an
    /// initialized engine.
    pub fn delete_filter_by_provider_key(
        &mut self,
        provider: &Identity,
        layer: &Identity,
    ) -> Result<()> {
        let engine = self.require_initialized("delete filters")?;
        self.mutate(engine, |binding, engine| {
            shielded(EntryPoint::FilterDeleteByProviderKey, || {
                binding.filter_delete_by_provider_key(engine, provider, layer)
            })
            .context("failed to delete provider filters")?;
            debug!("Filters of provider {provider} at layer {layer} deleted");
            Ok(())
        })
    }
}

/// Builds and adds one filter; the builder is released on every path.
fn install_filter<E: Engine>(
    binding: &E,
    engine: EngineHandle,
    filter: &Filter,
    slots: usize,
) -> Result<FilterId> {
    let mut builder = FilterBuilder::create(
        binding,
        &filter.key,
        &filter.layer,
        &filter.sublayer,
        filter.weight,
        filter.flags.bits(),
    )
    .context("failed to create filter")?;

    builder
        .set_provider_key(&filter.provider)
        .context("failed to set provider key")?;
    builder
        .set_display_data(&filter.name, &filter.description)
        .context("failed to set display data")?;
    builder
        .set_action(filter.action.code())
        .context("failed to set filter action")?;

    let slots = u32::try_from(slots)
        .map_err(|_| Error::InvalidInput(format!("too many filter conditions ({slots})")))?;
    builder
        .allocate_conditions(slots)
        .context("failed to allocate filter conditions")?;

    for (index, condition) in (0u32..).zip(&filter.conditions) {
        condition
            .bind(&mut builder, index)
            .context("failed to apply filter condition")?;
    }

    let id = builder.add(engine).context("failed to add filter")?;
    if id == 0 {
        return Err(Error::Transport {
            entry: EntryPoint::FilterAdd,
            message: "engine reported success without a filter id".to_string(),
        });
    }
    Ok(FilterId::new(id))
}

impl Manager<DllEngine> {
    /// Loads the configured engine library and wraps it in a manager.
    ///
    /// The library path comes from [`ControllerConfig::resolved_engine_library`],
    /// so the environment override applies. No session is opened yet.
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        let path = config.resolved_engine_library().ok_or_else(|| {
            Error::InvalidInput(format!(
                "no engine library configured (set engine_library or {})",
                crate::config::ENGINE_LIBRARY_ENV
            ))
        })?;
        let engine = DllEngine::load(&path).context("failed to load engine library")?;
        debug!("Engine library ready: {engine:?}");
        Ok(Self::with_options(engine, ManagerOptions::from_config(config)))
    }
}

impl<E: Engine> Drop for Manager<E> {
    fn drop(&mut self) {
        self.abort_quietly();
        self.uninitialize();
    }
}

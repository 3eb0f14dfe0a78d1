//! Shared test utilities for core module tests
//!
//! Provides common fixtures so suites do not each rebuild providers,
//! sublayers and managers. This module is only compiled in test mode.

use crate::core::filter::{Provider, Sublayer};
use crate::core::identity::Identity;
use crate::core::manager::Manager;
use crate::core::templates::FilterScope;
use crate::engine::memory::{Connection, MemoryEngine};
use std::net::SocketAddr;
use std::sync::{Mutex, Once};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("WFPCTL_ENGINE_LIBRARY", "engine.dll");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("WFPCTL_ENGINE_LIBRARY");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static LOGGING_INIT: Once = Once::new();

/// Routes `tracing` output through the test harness (shown for failing
/// tests only). Safe to call from every test.
pub fn init_test_logging() {
    LOGGING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A fresh engine plus a manager driving a clone of it.
pub fn memory_manager() -> (MemoryEngine, Manager<MemoryEngine>) {
    init_test_logging();
    let engine = MemoryEngine::new();
    let manager = Manager::new(engine.clone());
    (engine, manager)
}

pub fn test_provider(persistent: bool) -> Provider {
    Provider::new(Identity::new(), "test provider", "", persistent)
}

pub fn test_sublayer(provider: &Provider, weight: u16) -> Sublayer {
    Sublayer::new(
        Identity::new(),
        provider.key,
        "test sublayer",
        "",
        weight,
        provider.persistent,
    )
}

/// Installs a provider and a sublayer under it, returning the scope for
/// filters at `layer`.
pub fn installed_scope(manager: &mut Manager<MemoryEngine>, layer: Identity) -> FilterScope {
    let provider = test_provider(false);
    let sublayer = test_sublayer(&provider, 0);
    manager.add_provider(&provider).unwrap();
    manager.add_sublayer(&sublayer).unwrap();
    FilterScope::new(provider.key, layer, sublayer.key, "test filter", "")
}

/// Outbound connection to `remote` ("ip:port").
pub fn outbound(remote: &str) -> Connection {
    Connection::to(remote.parse::<SocketAddr>().unwrap())
}

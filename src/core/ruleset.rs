//! Block-all ruleset ("kill switch")
//!
//! One provider, one sublayer under it, and a block-all filter at each
//! configured layer. Enabling and disabling each run in a single engine
//! transaction, so a failure leaves the previous state in place.
//!
//! A persistent ruleset additionally installs boot-time block-all filters,
//! which keep traffic blocked from host start until the service re-applies
//! its rules.

use crate::config::ControllerConfig;
use crate::core::constants::layers;
use crate::core::error::{Error, Result, ResultExt};
use crate::core::filter::{FilterId, Provider, Sublayer};
use crate::core::identity::Identity;
use crate::core::manager::Manager;
use crate::core::templates::{self, FilterScope};
use crate::engine::Engine;
use tracing::info;

pub const DEFAULT_PROVIDER_KEY: Identity =
    Identity::from_u128(0x5e1f_9a02_3c7d_4b6e_9f10_2a4c_6e8b_0d01);
pub const DEFAULT_SUBLAYER_KEY: Identity =
    Identity::from_u128(0x5e1f_9a02_3c7d_4b6e_9f10_2a4c_6e8b_0d02);

/// Just below the maximum, leaving the top weight to drivers that must
/// always be evaluated first.
pub const DEFAULT_SUBLAYER_WEIGHT: u16 = 0xFFF0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllRuleset {
    pub provider: Provider,
    pub sublayer: Sublayer,
    pub layers: Vec<Identity>,
    pub filter_name: String,
}

impl BlockAllRuleset {
    /// Ruleset over the four connect/accept layers of both families.
    ///
    /// Persistence follows `provider.persistent`.
    pub fn new(provider: Provider, sublayer: Sublayer) -> Self {
        let filter_name = provider.name.clone();
        Self {
            provider,
            sublayer,
            layers: layers::V4.iter().chain(&layers::V6).copied().collect(),
            filter_name,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        let provider = Provider::new(
            config.provider_key,
            config.provider_name.clone(),
            config.provider_description.clone(),
            config.persistent,
        );
        let sublayer = Sublayer::new(
            config.sublayer_key,
            config.provider_key,
            config.sublayer_name.clone(),
            config.sublayer_description.clone(),
            config.sublayer_weight,
            config.persistent,
        );
        Self::new(provider, sublayer).with_filter_name(config.filter_name.clone())
    }

    pub fn with_layers(mut self, layers: impl IntoIterator<Item = Identity>) -> Self {
        self.layers = layers.into_iter().collect();
        self
    }

    pub fn with_filter_name(mut self, name: impl Into<String>) -> Self {
        self.filter_name = name.into();
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.provider.persistent
    }

    pub fn is_enabled<E: Engine>(&self, manager: &mut Manager<E>) -> Result<bool> {
        Ok(manager
            .get_provider_info(&self.provider.key)
            .context("failed to get provider info")?
            .is_installed)
    }

    /// Installs the ruleset. Does nothing if the provider is already
    /// installed.
    ///
    /// Returns the ids of the filters added.
    pub fn enable<E: Engine>(&self, manager: &mut Manager<E>) -> Result<Vec<FilterId>> {
        manager.transaction(|m| self.install(m))
    }

    /// Removes the ruleset. Does nothing if the provider is not installed.
    pub fn disable<E: Engine>(&self, manager: &mut Manager<E>) -> Result<()> {
        manager.transaction(|m| self.uninstall(m))
    }

    /// Re-installs the ruleset if it is enabled with a different persistence
    /// than `persistent`; enables it otherwise.
    pub fn set_persistent<E: Engine>(
        &mut self,
        manager: &mut Manager<E>,
        persistent: bool,
    ) -> Result<()> {
        let mut next = self.clone();
        next.provider.persistent = persistent;
        next.sublayer.persistent = persistent;

        let info = manager
            .get_provider_info(&next.provider.key)
            .context("failed to get provider info")?;
        if info.is_installed && info.is_persistent == persistent {
            info!("Ruleset already enabled (persistent: {persistent})");
            *self = next;
            return Ok(());
        }

        info!("Enabling ruleset with persistent = {persistent}");
        manager.transaction(|m| {
            next.uninstall(m)?;
            next.install(m)
        })?;
        *self = next;
        Ok(())
    }

    fn install<E: Engine>(&self, m: &mut Manager<E>) -> Result<Vec<FilterId>> {
        if self.is_enabled(m)? {
            return Ok(Vec::new());
        }

        m.add_provider(&self.provider)
            .context("failed to add provider")?;
        if !m
            .is_sublayer_installed(&self.sublayer.key)
            .context("failed to check sublayer is installed")?
        {
            m.add_sublayer(&self.sublayer)
                .context("failed to add sublayer")?;
        }

        let persistent = self.is_persistent();
        let mut ids = Vec::with_capacity(self.layers.len() * 2);
        for layer in &self.layers {
            let scope = FilterScope::new(
                self.provider.key,
                *layer,
                self.sublayer.key,
                self.filter_name.clone(),
                "Block all",
            );
            let is_ipv6 = layers::is_ipv6(layer);

            let id = m
                .add_filter(&templates::block_all(&scope, is_ipv6, persistent))
                .map_err(|e| Error::from(e).context("failed to add filter 'block all'"))?;
            ids.push(id);

            if persistent {
                let boot_scope = FilterScope {
                    description: "Block all (boot time)".to_string(),
                    ..scope.clone()
                };
                let boot = templates::block_all_at_boot(&boot_scope, is_ipv6);
                let id = m
                    .add_filter(&boot)
                    .map_err(|e| Error::from(e).context("failed to add boot-time filter"))?;
                ids.push(id);
            }
        }

        info!(
            "Block-all ruleset enabled: {} filters over {} layers (persistent: {persistent})",
            ids.len(),
            self.layers.len()
        );
        Ok(ids)
    }

    fn uninstall<E: Engine>(&self, m: &mut Manager<E>) -> Result<()> {
        if !self.is_enabled(m)? {
            return Ok(());
        }

        for layer in &self.layers {
            m.delete_filter_by_provider_key(&self.provider.key, layer)
                .context("failed to delete filters")?;
        }
        if m
            .is_sublayer_installed(&self.sublayer.key)
            .context("failed to check sublayer is installed")?
        {
            m.delete_sublayer(&self.sublayer.key)
                .context("failed to delete sublayer")?;
        }
        m.delete_provider(&self.provider.key)
            .context("failed to delete provider")?;

        info!("Block-all ruleset disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::{Action, FilterFlags};
    use crate::engine::memory::{Connection, MemoryEngine};

    fn ruleset(persistent: bool) -> BlockAllRuleset {
        let config = ControllerConfig {
            persistent,
            provider_key: Identity::new(),
            sublayer_key: Identity::new(),
            ..ControllerConfig::default()
        };
        BlockAllRuleset::from_config(&config)
    }

    #[test]
    fn test_enable_disable_roundtrip() {
        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let rules = ruleset(false);

        assert!(!rules.is_enabled(&mut manager).unwrap());
        let ids = rules.enable(&mut manager).unwrap();
        assert_eq!(ids.len(), 4);
        assert!(rules.is_enabled(&mut manager).unwrap());
        assert!(engine.has_sublayer(&rules.sublayer.key));

        let ping = Connection::to("1.1.1.1:0".parse().unwrap());
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &ping),
            Action::Block
        );

        rules.disable(&mut manager).unwrap();
        assert!(!rules.is_enabled(&mut manager).unwrap());
        assert_eq!(engine.filter_count(), 0);
        assert!(!engine.has_sublayer(&rules.sublayer.key));
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &ping),
            Action::Permit
        );
    }

    #[test]
    fn test_enable_is_idempotent() {
        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let rules = ruleset(false);
        rules.enable(&mut manager).unwrap();
        assert!(rules.enable(&mut manager).unwrap().is_empty());
        assert_eq!(engine.filter_count(), 4);
    }

    #[test]
    fn test_persistent_adds_boot_time_filters() {
        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let rules = ruleset(true);
        let ids = rules.enable(&mut manager).unwrap();
        assert_eq!(ids.len(), 8);

        let filters = engine.filters();
        let boot = filters
            .iter()
            .filter(|f| f.flags.contains(FilterFlags::BOOTTIME))
            .count();
        assert_eq!(boot, 4);
        assert!(
            filters
                .iter()
                .filter(|f| !f.flags.contains(FilterFlags::BOOTTIME))
                .all(|f| f.flags.contains(FilterFlags::PERSISTENT))
        );
    }

    #[test]
    fn test_boot_time_filters_are_labelled() {
        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        ruleset(true).enable(&mut manager).unwrap();

        for f in engine.filters() {
            let expected = if f.flags.contains(FilterFlags::BOOTTIME) {
                "Block all (boot time)"
            } else {
                "Block all"
            };
            assert_eq!(f.description, expected);
        }
    }

    #[test]
    fn test_set_persistent_reinstalls() {
        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let mut rules = ruleset(false);
        rules.enable(&mut manager).unwrap();

        rules.set_persistent(&mut manager, true).unwrap();
        let info = manager.get_provider_info(&rules.provider.key).unwrap();
        assert!(info.is_installed && info.is_persistent);
        assert_eq!(engine.filter_count(), 8);

        // Same persistence: no change
        rules.set_persistent(&mut manager, true).unwrap();
        assert_eq!(engine.filter_count(), 8);
    }

    #[test]
    fn test_failed_enable_leaves_nothing_installed() {
        use crate::core::constants::status;
        use crate::engine::{CallFault, EntryPoint};

        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let rules = ruleset(false);
        manager.initialize().unwrap();
        engine.fail_next(
            EntryPoint::FilterAdd,
            CallFault::Status(status::INVALID_ARGUMENT),
        );

        assert!(rules.enable(&mut manager).is_err());
        assert!(!engine.has_provider(&rules.provider.key));
        assert!(!engine.has_sublayer(&rules.sublayer.key));
        assert_eq!(engine.filter_count(), 0);
        assert_eq!(engine.live_builders(), 0);
    }

    #[test]
    fn test_failed_set_persistent_keeps_previous_persistence() {
        use crate::core::constants::status;
        use crate::core::filter::ProviderInfo;
        use crate::engine::{CallFault, EntryPoint};

        let engine = MemoryEngine::new();
        let mut manager = Manager::new(engine.clone());
        let mut rules = ruleset(false);
        rules.enable(&mut manager).unwrap();

        engine.fail_next(
            EntryPoint::FilterAdd,
            CallFault::Status(status::INVALID_ARGUMENT),
        );
        assert!(rules.set_persistent(&mut manager, true).is_err());

        assert!(!rules.is_persistent());
        assert!(!rules.sublayer.persistent);
        assert_eq!(engine.filter_count(), 4);
        assert_eq!(
            manager.get_provider_info(&rules.provider.key).unwrap(),
            ProviderInfo {
                is_installed: true,
                is_persistent: false
            }
        );

        // A later enable installs what the engine already has
        assert!(rules.enable(&mut manager).unwrap().is_empty());
        assert_eq!(engine.filter_count(), 4);
    }
}

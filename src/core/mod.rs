//! Firewall control over the packet-inspection engine
//!
//! - [`identity`]: 128-bit object identities
//! - [`constants`]: well-known layers, condition fields and engine statuses
//! - [`condition`] / [`filter`]: the filter model
//! - [`templates`]: standard filter shapes with fixed weights
//! - [`guard`]: fault shielding and scoped builder objects
//! - [`manager`]: stateful session and transaction façade
//! - [`ruleset`]: the block-all ruleset built on the manager
//! - [`error`]: error types and status descriptions

pub mod condition;
pub mod constants;
pub mod error;
pub mod filter;
pub mod guard;
pub mod identity;
pub mod manager;
pub mod ruleset;
pub mod templates;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;

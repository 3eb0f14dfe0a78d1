//! wfpctl - packet-filter engine controller
//!
//! A typed controller for a Windows-Filtering-Platform-style packet engine:
//! providers, weighted sublayers and filters with typed conditions,
//! installed transactionally through a single engine session.
//!
//! # Architecture
//!
//! - [`engine`] - The engine call surface, the runtime library binding and
//!   an in-process engine
//! - [`core`] - Identities, the filter model, templates, the session
//!   manager and the block-all ruleset
//! - [`validators`] - Input validation shared by the manager and conditions
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (config directory, strings)
//!
//! # Safety Features
//!
//! - Every engine call is shielded: unwinding faults become errors
//! - Builder objects are released on every path (RAII guards)
//! - Condition slots are checked: each written exactly once, never out of range
//! - Mutations outside an explicit transaction run in an implicit one
//! - Unrecoverable faults reset the session instead of reusing it
//!
//! The crate emits `tracing` events but never installs a subscriber.

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod core;
pub mod engine;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::condition::{Condition, Endpoint};
pub use core::error::{Error, ErrorKind, Result};
pub use core::filter::{Action, Filter, FilterFlags, FilterId, MatchType, Provider, Sublayer};
pub use core::identity::Identity;
pub use core::manager::{Manager, ManagerOptions, SessionState};
pub use core::ruleset::BlockAllRuleset;
pub use engine::Engine;

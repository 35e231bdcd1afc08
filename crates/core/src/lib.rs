//! Core types for phasekv
//!
//! This crate defines the vocabulary shared by every other crate:
//! - [`Key`], [`Tid`], [`Phase`], [`SystemType`]: identifiers and modes
//! - [`Value`], [`ValueKind`], [`Entry`], [`Update`]: record values and the
//!   update semantics applied to them
//! - [`TxnError`]: the runtime error taxonomy
//! - [`EngineConfig`]: all tunables

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::EngineConfig;
pub use error::{ConfigError, ConfigResult, TxnError};
pub use types::{Key, Phase, SystemType, Tid, KEY_LEN, SHARD_COUNT};
pub use value::{Entry, Update, Value, ValueKind};

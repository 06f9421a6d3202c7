//! # ternary-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TuneError`]**: the one error type of the library crates.
//! * **[`MatrixShape`]**, **[`KernelArch`]**, **[`TileConfig`]**, **[`TilePlan`]**: the data model.
//! * **[`ModelProfile`]**: kernel shapes and per-family defaults of a model.
//! * **[`TunerConfig`]**: tuner settings (serialised as JSON).
//! * **[`ConfigStore`]** / **[`BestConfig`]**: the persisted winner.

pub mod config;
pub mod error;
pub mod profile;
pub mod store;
pub mod tiling;

pub use config::{RunSettings, SearchKnobs, TunerConfig, WorkloadKind};
pub use error::{Result, TuneError};
pub use profile::ModelProfile;
pub use store::{render_kernel_ini, write_atomic, BestConfig, ConfigStore};
pub use tiling::{KernelArch, MatrixShape, TileConfig, TileLists, TilePlan, TERNARY_BLOCK_LEN};

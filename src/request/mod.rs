// src/request/mod.rs

//! Task request construction.
//!
//! - [`slice`]: dimensions, timeouts and the per-slice request body.
//! - [`defaults`]: engine-wide defaults and build identity.
//! - [`builder`]: merging caller parameters over defaults into a [`TaskSpec`].

pub mod builder;
pub mod defaults;
pub mod slice;

pub use builder::{build_task_spec, TaskParams, TaskSpec, ISOLATED_OUTDIR_ENV};
pub use defaults::{
    preferred_os_dimension, BuildInfo, EngineDefaults, GerritChange, ProjectProfile,
};
pub use slice::{
    CipdPackage, DimensionOverrides, DimensionSet, InputRef, TaskSlice, Timeouts,
};

//! Spatial indexing of particles on top of `wgsort`.
//!
//! Particle positions are mapped to the Morton key of their cell on a uniform grid, sorted
//! with their slot as payload, and turned into tables giving, for each cell, the range of
//! the sorted particle array holding its members:
//! - [`morton`]: the pure cell-key codec shared by the kernels and the host.
//! - [`ParticleIndex`]: owns the device buffers and runs the builds.
//! - [`IndexSnapshot`]: host copy of a build, with cell and neighborhood queries.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod kernels;
pub mod morton;
pub mod neighbors;
pub mod particle_index;

pub use config::{Domain, IndexConfig, PositionLayout};
pub use error::{IndexError, IndexResult};
pub use kernels::CellRange;
pub use neighbors::IndexSnapshot;
pub use particle_index::{BuildState, BuildStats, IndexViews, ParticleIndex};

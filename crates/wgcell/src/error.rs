//! Errors of the particle index.

use crate::particle_index::BuildState;
use thiserror::Error;
use wgcompute::ComputeError;

/// Errors reported while configuring or building a [`ParticleIndex`](crate::ParticleIndex).
#[derive(Debug, Error)]
pub enum IndexError {
    /// Error of the underlying compute backend or radix sort.
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// The number of bits per axis is zero or the 3D key would not fit in 32 bits.
    #[error("Invalid number of bits per axis: {0} (must be in 1..={max})", max = crate::morton::MAX_BITS_PER_AXIS)]
    InvalidBitsPerAxis(u32),

    /// The domain bounds are not finite or not strictly increasing.
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// The position layout cannot be read as three consecutive `f32`.
    #[error("Invalid position layout: {0}")]
    InvalidLayout(String),

    /// The particle buffer is smaller than what the layout needs for every particle.
    #[error("Particle buffer too small: {required} bytes needed for {num_particles} particles, {available} available")]
    ParticleBufferTooSmall {
        /// Number of particles to index.
        num_particles: u32,
        /// Minimum size, in bytes.
        required: u64,
        /// Actual size, in bytes.
        available: u64,
    },

    /// A build step was called out of order.
    #[error("Invalid build state: expected {expected:?}, found {found:?}")]
    InvalidState {
        /// State required by the step.
        expected: BuildState,
        /// Current state.
        found: BuildState,
    },

    /// The built index contradicts the particle positions.
    #[error("Inconsistent index: {0}")]
    Inconsistent(String),
}

impl IndexError {
    /// Is this error detected before any work is submitted?
    pub fn is_config_error(&self) -> bool {
        match self {
            Self::Compute(e) => e.is_config_error(),
            Self::InvalidBitsPerAxis(_)
            | Self::InvalidDomain(_)
            | Self::InvalidLayout(_)
            | Self::ParticleBufferTooSmall { .. }
            | Self::InvalidState { .. } => true,
            Self::Inconsistent(_) => false,
        }
    }
}

/// Convenience alias for `Result<T, IndexError>`.
pub type IndexResult<T> = Result<T, IndexError>;

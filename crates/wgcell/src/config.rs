//! Configuration of the particle index.

use crate::error::{IndexError, IndexResult};
use crate::morton::{self, MAX_BITS_PER_AXIS};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Where the position of a particle lives inside the particle buffer.
///
/// Particle `i` has its position stored as three consecutive `f32` starting at byte
/// `i * stride + offset`. Both values are resolved once, when the index is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLayout {
    /// Byte offset of the position inside a particle.
    pub offset: u32,
    /// Size, in bytes, of a particle.
    pub stride: u32,
}

impl PositionLayout {
    /// Tightly packed `[f32; 3]` positions.
    pub const PACKED: Self = Self {
        offset: 0,
        stride: 12,
    };

    /// Positions stored as 16-byte aligned `vec3<f32>` (or `vec4<f32>`).
    pub const ALIGNED: Self = Self {
        offset: 0,
        stride: 16,
    };

    /// Position field at `offset` in a particle struct of `stride` bytes.
    pub const fn new(offset: u32, stride: u32) -> Self {
        Self { offset, stride }
    }

    /// Checks that positions can be read as whole words.
    pub fn check(&self) -> IndexResult<()> {
        if self.offset % 4 != 0 || self.stride % 4 != 0 {
            return Err(IndexError::InvalidLayout(format!(
                "offset ({}) and stride ({}) must be multiples of 4",
                self.offset, self.stride
            )));
        }
        if self.offset as u64 + 12 > self.stride as u64 {
            return Err(IndexError::InvalidLayout(format!(
                "a position at offset {} does not fit in a stride of {} bytes",
                self.offset, self.stride
            )));
        }
        Ok(())
    }

    /// Offset and stride in 4-byte words.
    pub fn in_words(&self) -> (u32, u32) {
        (self.offset / 4, self.stride / 4)
    }

    /// Minimum size, in bytes, of a buffer holding `num_particles` particles.
    pub fn required_bytes(&self, num_particles: u32) -> u64 {
        if num_particles == 0 {
            return 0;
        }
        (num_particles as u64 - 1) * self.stride as u64 + self.offset as u64 + 12
    }
}

impl Default for PositionLayout {
    fn default() -> Self {
        Self::PACKED
    }
}

/// Axis-aligned box mapped onto the cell grid.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Domain {
    min: Point3<f32>,
    max: Point3<f32>,
    inv_extent: Vector3<f32>,
}

impl Domain {
    /// The box `[min, max]`.
    ///
    /// # Errors
    ///
    /// Fails if a bound is not finite or if `max <= min` along an axis.
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> IndexResult<Self> {
        let extent = max - min;
        let valid = min.iter().chain(max.iter()).all(|v| v.is_finite())
            && extent.iter().all(|e| *e > 0.0 && e.is_finite());
        if !valid {
            return Err(IndexError::InvalidDomain(format!(
                "min {:?} and max {:?} must be finite with max > min on every axis",
                min.coords.as_slice(),
                max.coords.as_slice()
            )));
        }

        Ok(Self {
            min,
            max,
            inv_extent: extent.map(|e| 1.0 / e),
        })
    }

    /// The unit cube.
    pub fn unit() -> Self {
        Self {
            min: Point3::origin(),
            max: Point3::new(1.0, 1.0, 1.0),
            inv_extent: Vector3::repeat(1.0),
        }
    }

    /// Lower corner.
    pub fn min(&self) -> Point3<f32> {
        self.min
    }

    /// Upper corner.
    pub fn max(&self) -> Point3<f32> {
        self.max
    }

    /// Component-wise inverse of `max - min`.
    ///
    /// Kernels normalize with this reciprocal so that host and device perform the exact same
    /// floating-point operations.
    pub fn inv_extent(&self) -> Vector3<f32> {
        self.inv_extent
    }

    /// Maps `p` to the unit cube (without clamping).
    pub fn normalize(&self, p: &Point3<f32>) -> Vector3<f32> {
        (p - self.min).component_mul(&self.inv_extent)
    }

    /// Grid cell containing `p`, with `bits` bits per axis.
    pub fn cell_of(&self, p: &Point3<f32>, bits: u32) -> [u32; 3] {
        let n = self.normalize(p);
        [
            morton::bin_position(n.x, bits),
            morton::bin_position(n.y, bits),
            morton::bin_position(n.z, bits),
        ]
    }

    /// Morton key of the cell containing `p`.
    pub fn key_of(&self, p: &Point3<f32>, bits: u32) -> u32 {
        let [i, j, k] = self.cell_of(p, bits);
        morton::encode3(i, j, k, bits)
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::unit()
    }
}

/// Configuration of a [`ParticleIndex`](crate::ParticleIndex).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of bits of each cell coordinate. The grid has `2^bits_per_axis` cells per axis.
    pub bits_per_axis: u32,
    /// Lower corner of the indexed domain.
    pub domain_min: [f32; 3],
    /// Upper corner of the indexed domain.
    pub domain_max: [f32; 3],
    /// Location of the positions in the particle buffer.
    pub layout: PositionLayout,
    /// Run the consistency check after every build.
    pub validate: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bits_per_axis: 4,
            domain_min: [0.0; 3],
            domain_max: [1.0; 3],
            layout: PositionLayout::PACKED,
            validate: cfg!(debug_assertions),
        }
    }
}

impl IndexConfig {
    /// Reports configuration errors.
    pub fn check(&self) -> IndexResult<()> {
        if self.bits_per_axis == 0 || self.bits_per_axis > MAX_BITS_PER_AXIS {
            return Err(IndexError::InvalidBitsPerAxis(self.bits_per_axis));
        }
        self.layout.check()?;
        self.domain().map(|_| ())
    }

    /// The indexed domain.
    pub fn domain(&self) -> IndexResult<Domain> {
        Domain::new(self.domain_min.into(), self.domain_max.into())
    }

    /// Number of cells along each axis.
    pub fn grid_dim(&self) -> u32 {
        1 << self.bits_per_axis
    }

    /// Total number of cells, i.e. the length of both range tables.
    pub fn num_cells(&self) -> u32 {
        1 << (3 * self.bits_per_axis)
    }
}

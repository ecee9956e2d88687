//! Kernels computing the cell keys and the cell range tables.

use crate::config::{Domain, PositionLayout};
use crate::morton;
use encase::ShaderType;
use nalgebra::Vector3;
use naga_oil::compose::ShaderDefValue;
use rayon::prelude::*;
use wgcompute::composer::ShaderDefs;
use wgcompute::kernel::{ensure_words, read_uniform};
use wgcompute::{Binding, ComputeError, ComputeResult, HostArgs, Kernel, MAX_WORKGROUPS};
use wgsort::SENTINEL_KEY;

/// Workgroup size of the index kernels, injected into `cells.wgsl` as the `WG` shader def.
pub(crate) const WG: u32 = 256;

/// Workgroup size, cell range and parameter structs shared by the index kernels.
pub const CELLS: &str = include_str!("cells.wgsl");
/// Binning and Morton interleaving, matching [`crate::morton`].
pub const MORTON: &str = include_str!("morton.wgsl");

fn index_defs() -> ShaderDefs {
    [
        ("WG".to_string(), ShaderDefValue::UInt(WG)),
        ("SENTINEL_KEY".to_string(), ShaderDefValue::UInt(SENTINEL_KEY)),
    ]
    .into()
}

/// Half-open range `[left, right)` of the sorted particle array covered by a cell.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct CellRange {
    /// First sorted position of the cell.
    pub left: u32,
    /// One past the last sorted position of the cell.
    pub right: u32,
}

impl CellRange {
    /// The range `[left, right)`.
    pub fn new(left: u32, right: u32) -> Self {
        Self { left, right }
    }

    /// Number of particles in the cell.
    pub fn len(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    /// Is the cell empty?
    pub fn is_empty(&self) -> bool {
        self.left >= self.right
    }

    /// The range as indices of the sorted arrays.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.left as usize..self.right as usize
    }
}

/// Parameters of the [`MortonKeys`] kernel.
#[derive(Copy, Clone, Debug, PartialEq, ShaderType)]
pub struct MortonParams {
    /// Number of bits of each cell coordinate.
    pub bits_per_axis: u32,
    /// Number of real particles.
    pub num_particles: u32,
    /// Number of keys to write, padding included.
    pub padded_len: u32,
    /// Offset of the position of a particle, in words.
    pub position_offset: u32,
    /// Size of a particle, in words.
    pub position_stride: u32,
    /// Lower corner of the domain.
    pub domain_min: Vector3<f32>,
    /// Inverse extent of the domain.
    pub inv_extent: Vector3<f32>,
}

impl MortonParams {
    /// Parameters for `num_particles` positions read through `layout`.
    pub fn new(
        bits_per_axis: u32,
        layout: PositionLayout,
        domain: &Domain,
        num_particles: u32,
        padded_len: u32,
    ) -> Self {
        let (position_offset, position_stride) = layout.in_words();
        Self {
            bits_per_axis,
            num_particles,
            padded_len,
            position_offset,
            position_stride,
            domain_min: domain.min().coords,
            inv_extent: domain.inv_extent(),
        }
    }
}

/// Parameters of the [`BuildIndex`] and [`FlattenIndex`] kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ShaderType)]
pub struct IndexParams {
    /// Number of real sorted keys.
    pub num_keys: u32,
    /// Number of cells of the grid.
    pub num_cells: u32,
    /// Number of bits of each cell coordinate.
    pub bits_per_axis: u32,
}

impl IndexParams {
    /// Parameters for `num_keys` keys over a grid of `2^bits_per_axis` cells per axis.
    pub fn new(num_keys: u32, bits_per_axis: u32) -> Self {
        Self {
            num_keys,
            num_cells: 1 << (3 * bits_per_axis),
            bits_per_axis,
        }
    }
}

/// Number of workgroups of a grid-stride loop over `num_cells` cells.
pub fn cell_groups(num_cells: u32) -> u32 {
    num_cells.div_ceil(WG).clamp(1, MAX_WORKGROUPS)
}

fn check_bits(kernel: &'static str, bits: u32) -> ComputeResult<()> {
    if bits == 0 || bits > morton::MAX_BITS_PER_AXIS {
        return Err(ComputeError::InvalidConfig(format!(
            "{kernel}: unsupported number of bits per axis: {bits}"
        )));
    }
    Ok(())
}

fn cells_view<'a>(
    kernel: &'static str,
    what: &str,
    words: &'a [u32],
    num_cells: usize,
) -> ComputeResult<&'a [CellRange]> {
    ensure_words(kernel, what, words, num_cells * 2)?;
    Ok(bytemuck::cast_slice(&words[..num_cells * 2]))
}

fn cells_view_mut<'a>(
    kernel: &'static str,
    what: &str,
    words: &'a mut [u32],
    num_cells: usize,
) -> ComputeResult<&'a mut [CellRange]> {
    ensure_words(kernel, what, words, num_cells * 2)?;
    Ok(bytemuck::cast_slice_mut(&mut words[..num_cells * 2]))
}

/// Cell key of every particle, and [`SENTINEL_KEY`] for the padding slots.
///
/// Positions are read as three consecutive `f32` at word `i * stride + offset` of the
/// particle buffer, normalized against the domain, binned and interleaved.
pub struct MortonKeys;

impl Kernel for MortonKeys {
    fn name(&self) -> &'static str {
        "morton_keys"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("morton_keys.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[CELLS, MORTON]
    }

    fn shader_defs(&self) -> ShaderDefs {
        index_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, particles], [keys]) = args.split::<2, 1>()?;
        let params: MortonParams = read_uniform(self.name(), params)?;
        check_bits(self.name(), params.bits_per_axis)?;

        let len = params.padded_len.min(num_groups * WG) as usize;
        let num_particles = (params.num_particles as usize).min(len);
        let stride = params.position_stride as usize;
        let offset = params.position_offset as usize;
        ensure_words(self.name(), "keys", keys, len)?;
        if num_particles > 0 {
            ensure_words(
                self.name(),
                "particles",
                particles,
                (num_particles - 1) * stride + offset + 3,
            )?;
        }

        let bits = params.bits_per_axis;
        keys[..len].par_iter_mut().enumerate().for_each(|(i, key)| {
            if i >= num_particles {
                *key = SENTINEL_KEY;
                return;
            }

            let base = i * stride + offset;
            let bin = |axis: usize| {
                let x = f32::from_bits(particles[base + axis]);
                let normalized = (x - params.domain_min[axis]) * params.inv_extent[axis];
                morton::bin_position(normalized, bits)
            };
            *key = morton::encode3(bin(0), bin(1), bin(2), bits);
        });
        Ok(())
    }
}

/// Range table indexed by cell key.
///
/// Cell `c` covers the sorted positions holding key `c`. A cell with no particle gets the empty
/// range starting where its key would be inserted, so the ranges of all the cells, taken in key
/// order, partition `[0, num_keys)`.
pub struct BuildIndex;

impl Kernel for BuildIndex {
    fn name(&self) -> &'static str {
        "build_index"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("build_index.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[CELLS, MORTON]
    }

    fn shader_defs(&self) -> ShaderDefs {
        index_defs()
    }

    fn run_host(&self, _num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, sorted_keys], [cells]) = args.split::<2, 1>()?;
        let params: IndexParams = read_uniform(self.name(), params)?;
        let num_keys = params.num_keys as usize;
        let num_cells = params.num_cells as usize;
        ensure_words(self.name(), "sorted keys", sorted_keys, num_keys)?;
        let cells = cells_view_mut(self.name(), "cells", cells, num_cells)?;

        // Single scan: every key change opens a range and closes the empty cells before it.
        let mut next_cell = 0;
        for (p, key) in sorted_keys[..num_keys].iter().enumerate() {
            let key = *key as usize;
            if key >= num_cells || key + 1 < next_cell {
                return Err(ComputeError::InvalidConfig(format!(
                    "{}: key {key} at position {p} is out of order or out of the grid",
                    self.name()
                )));
            }

            if key >= next_cell {
                cells[next_cell..key].fill(CellRange::new(p as u32, p as u32));
                cells[key] = CellRange::new(p as u32, p as u32);
                next_cell = key + 1;
            }
            cells[key].right = p as u32 + 1;
        }

        let end = num_keys as u32;
        cells[next_cell.min(num_cells)..].fill(CellRange::new(end, end));
        Ok(())
    }
}

/// Range table indexed by the linear cell index `(i * dim + j) * dim + k`.
pub struct FlattenIndex;

impl Kernel for FlattenIndex {
    fn name(&self) -> &'static str {
        "flatten_index"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("flatten_index.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[CELLS, MORTON]
    }

    fn shader_defs(&self) -> ShaderDefs {
        index_defs()
    }

    fn run_host(&self, _num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, cells], [linear_cells]) = args.split::<2, 1>()?;
        let params: IndexParams = read_uniform(self.name(), params)?;
        check_bits(self.name(), params.bits_per_axis)?;
        let num_cells = params.num_cells as usize;
        let cells = cells_view(self.name(), "cells", cells, num_cells)?;
        let linear_cells = cells_view_mut(self.name(), "linear cells", linear_cells, num_cells)?;

        let bits = params.bits_per_axis;
        linear_cells
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, range)| {
                let [i, j, k] = morton::linear_coords(index as u32, bits);
                *range = cells[morton::encode3(i, j, k, bits) as usize];
            });
        Ok(())
    }
}

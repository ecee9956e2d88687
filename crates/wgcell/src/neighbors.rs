//! Host-side queries over a built index.

use crate::config::Domain;
use crate::kernels::CellRange;
use crate::morton;
use nalgebra::Point3;
use std::ops::Range;

/// Host copy of the results of a [`ParticleIndex`](crate::ParticleIndex) build.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSnapshot {
    /// Number of bits of each cell coordinate.
    pub bits_per_axis: u32,
    /// The indexed domain.
    pub domain: Domain,
    /// Cell key of each sorted particle.
    pub sorted_keys: Vec<u32>,
    /// Original slot of each sorted particle.
    pub sorted_indices: Vec<u32>,
    /// Range of the sorted arrays covered by each cell, indexed by cell key.
    pub cells: Vec<CellRange>,
    /// Same ranges, indexed by linear cell index.
    pub linear_cells: Vec<CellRange>,
}

impl IndexSnapshot {
    /// Number of cells along each axis.
    pub fn grid_dim(&self) -> u32 {
        1 << self.bits_per_axis
    }

    /// Coordinates of the cell containing `point`. Points outside the domain are clamped.
    pub fn cell_of(&self, point: &Point3<f32>) -> [u32; 3] {
        self.domain.cell_of(point, self.bits_per_axis)
    }

    /// Key of the cell containing `point`.
    pub fn key_of(&self, point: &Point3<f32>) -> u32 {
        self.domain.key_of(point, self.bits_per_axis)
    }

    /// Range of the sorted arrays holding the particles of the cell with key `key`.
    pub fn range_by_key(&self, key: u32) -> Option<Range<usize>> {
        self.cells.get(key as usize).map(CellRange::range)
    }

    /// Range of the sorted arrays holding the particles of cell `(i, j, k)`.
    pub fn range_by_cell(&self, i: u32, j: u32, k: u32) -> Option<Range<usize>> {
        let dim = self.grid_dim();
        if i >= dim || j >= dim || k >= dim {
            return None;
        }
        let index = morton::linear_index(i, j, k, self.bits_per_axis);
        self.linear_cells.get(index as usize).map(CellRange::range)
    }

    /// Slots of the particles of the cell with key `key`.
    pub fn particles_in_key(&self, key: u32) -> &[u32] {
        self.range_by_key(key)
            .and_then(|range| self.sorted_indices.get(range))
            .unwrap_or(&[])
    }

    /// Slots of the particles of cell `(i, j, k)`.
    pub fn particles_in_cell(&self, i: u32, j: u32, k: u32) -> &[u32] {
        self.range_by_cell(i, j, k)
            .and_then(|range| self.sorted_indices.get(range))
            .unwrap_or(&[])
    }

    /// Cell `(i, j, k)` and its neighbors at distance 1 along every axis, clipped to the grid.
    pub fn neighbor_cells(&self, i: u32, j: u32, k: u32) -> impl Iterator<Item = [u32; 3]> {
        let max = self.grid_dim() - 1;
        let span = move |c: u32| c.saturating_sub(1)..=c.saturating_add(1).min(max);
        span(i).flat_map(move |ni| {
            span(j).flat_map(move |nj| span(k).map(move |nk| [ni, nj, nk]))
        })
    }

    /// Slots of the particles in the cell of `point` and its neighboring cells.
    ///
    /// This is a superset of the particles closer than one cell size to `point`, in no
    /// particular order.
    pub fn neighbors_of<'a>(&'a self, point: &Point3<f32>) -> impl Iterator<Item = u32> + 'a {
        let [i, j, k] = self.cell_of(point);
        self.neighbor_cells(i, j, k)
            .flat_map(move |[ni, nj, nk]| self.particles_in_cell(ni, nj, nk).iter().copied())
    }
}

//! Spatial index of particles: Morton keys, sorted particle indices and cell range tables.

use crate::config::{Domain, IndexConfig};
use crate::error::{IndexError, IndexResult};
use crate::kernels::{
    cell_groups, BuildIndex, CellRange, FlattenIndex, IndexParams, MortonKeys, MortonParams,
};
use crate::morton;
use crate::neighbors::IndexSnapshot;
use nalgebra::Point3;
use rayon::prelude::*;
use std::time::Duration;
use wgcompute::tensor::{GpuScalar, GpuVector};
use wgcompute::{BufferHandle, ComputeBackend, KernelDispatch};
use wgsort::RadixSort;

/// Progress of the current build of a [`ParticleIndex`].
///
/// A build goes through `Uninitialized → KeysComputed → Sorted → RangeTableBuilt`. Any failure
/// during a step sends the index back to `Uninitialized`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuildState {
    /// Nothing usable on the device.
    Uninitialized,
    /// Cell keys and identity payload written to the sort input.
    KeysComputed,
    /// Keys and particle indices sorted.
    Sorted,
    /// Both range tables built: the index can be read.
    RangeTableBuilt,
}

/// Timings of a [`ParticleIndex::build`].
#[derive(Default, Copy, Clone, Debug)]
pub struct BuildStats {
    /// Time spent computing the cell keys.
    pub keys_time: Duration,
    /// Time spent sorting.
    pub sort_time: Duration,
    /// Time spent building both range tables.
    pub tables_time: Duration,
    /// Time spent in the consistency check, if it ran.
    pub validation_time: Option<Duration>,
}

impl BuildStats {
    /// Total time of the build.
    pub fn total_time(&self) -> Duration {
        self.keys_time + self.sort_time + self.tables_time + self.validation_time.unwrap_or_default()
    }

    /// Total time of the build, in milliseconds.
    pub fn total_time_ms(&self) -> f32 {
        self.total_time().as_secs_f32() * 1000.0
    }
}

/// Read-only views over the device buffers of a built index.
///
/// Valid until the next mutation of the [`ParticleIndex`] they borrow.
#[derive(Copy, Clone, Debug)]
pub struct IndexViews<'a> {
    /// Sorted cell keys, followed by the sort padding.
    pub sorted_keys: &'a GpuVector<u32>,
    /// Original slot of each sorted key.
    pub sorted_indices: &'a GpuVector<u32>,
    /// Range of the sorted arrays covered by each cell, indexed by cell key.
    pub cells: &'a GpuVector<CellRange>,
    /// Same ranges, indexed by linear cell index.
    pub linear_cells: &'a GpuVector<CellRange>,
    /// Number of real particles.
    pub num_particles: u32,
    /// Number of bits of each cell coordinate.
    pub bits_per_axis: u32,
    /// The indexed domain.
    pub domain: &'a Domain,
}

/// Builds and owns the spatial index of a particle buffer.
///
/// Each build computes the Morton key of every particle, sorts the keys with the particle
/// slots as payload, then derives the range table indexed by cell key and its remap indexed by
/// linear cell index. The index owns every intermediate buffer and only hands out read-only
/// views of its results.
pub struct ParticleIndex {
    config: IndexConfig,
    domain: Domain,
    num_particles: u32,
    state: BuildState,
    sort: RadixSort,
    morton_params: GpuScalar<MortonParams>,
    index_params: GpuScalar<IndexParams>,
    cells: GpuVector<CellRange>,
    linear_cells: GpuVector<CellRange>,
}

impl ParticleIndex {
    /// Creates an index for `num_particles` particles and allocates its buffers.
    ///
    /// # Errors
    ///
    /// Fails on invalid configurations, if `num_particles` is zero or too large for a single
    /// sort, or if an allocation fails.
    pub fn new<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        config: IndexConfig,
        num_particles: u32,
    ) -> IndexResult<Self> {
        config.check()?;
        let domain = config.domain()?;
        let sort = RadixSort::new(backend, num_particles)?;
        let bits = config.bits_per_axis;
        let num_cells = config.num_cells();

        let morton_params = GpuScalar::init(
            backend,
            MortonParams::new(bits, config.layout, &domain, num_particles, sort.padded_len()),
        )?;
        let index_params = GpuScalar::init(backend, IndexParams::new(num_particles, bits))?;
        let cells = GpuVector::uninit(backend, num_cells as u64)?;
        let linear_cells = GpuVector::uninit(backend, num_cells as u64)?;

        log::info!(
            "particle index on {}: {num_particles} particles, {dim}x{dim}x{dim} cells, domain {:?} to {:?}",
            backend.name(),
            config.domain_min,
            config.domain_max,
            dim = config.grid_dim(),
        );

        Ok(Self {
            config,
            domain,
            num_particles,
            state: BuildState::Uninitialized,
            sort,
            morton_params,
            index_params,
            cells,
            linear_cells,
        })
    }

    /// The configuration of this index.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The indexed domain.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Number of indexed particles.
    pub fn num_particles(&self) -> u32 {
        self.num_particles
    }

    /// Progress of the current build.
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Changes the number of particles, growing the buffers if needed.
    ///
    /// The index must be rebuilt afterwards.
    pub fn set_num_particles<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        num_particles: u32,
    ) -> IndexResult<()> {
        self.state = BuildState::Uninitialized;
        self.sort.resize(backend, num_particles)?;
        self.morton_params.write(
            backend,
            MortonParams::new(
                self.config.bits_per_axis,
                self.config.layout,
                &self.domain,
                num_particles,
                self.sort.padded_len(),
            ),
        )?;
        self.index_params.write(
            backend,
            IndexParams::new(num_particles, self.config.bits_per_axis),
        )?;
        self.num_particles = num_particles;
        log::debug!("particle index resized to {num_particles} particles");
        Ok(())
    }

    /// Runs a full build over the positions stored in `particles`.
    ///
    /// If [`IndexConfig::validate`] is set, the result is checked against the positions with
    /// [`Self::check_consistency`] and a violation fails the build.
    pub fn build<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        particles: BufferHandle,
    ) -> IndexResult<BuildStats> {
        let mut stats = BuildStats::default();

        let t0 = web_time::Instant::now();
        self.compute_keys(backend, particles)?;
        stats.keys_time = t0.elapsed();

        let t0 = web_time::Instant::now();
        self.sort_keys(backend)?;
        stats.sort_time = t0.elapsed();

        let t0 = web_time::Instant::now();
        self.build_tables(backend)?;
        stats.tables_time = t0.elapsed();

        if self.config.validate {
            let t0 = web_time::Instant::now();
            if let Err(err) = self.check_consistency(backend, particles) {
                self.state = BuildState::Uninitialized;
                return Err(err);
            }
            stats.validation_time = Some(t0.elapsed());
        }

        log::debug!(
            "particle index built in {:.3}ms (keys: {:?}, sort: {:?}, tables: {:?}, validation: {:?})",
            stats.total_time_ms(),
            stats.keys_time,
            stats.sort_time,
            stats.tables_time,
            stats.validation_time,
        );
        Ok(stats)
    }

    /// Writes the cell key of every particle and the identity payload to the sort input.
    ///
    /// Starts a new build: allowed in any state.
    pub fn compute_keys<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        particles: BufferHandle,
    ) -> IndexResult<()> {
        self.state = BuildState::Uninitialized;
        self.check_particles(backend, particles)?;

        let batch = [
            KernelDispatch::new(&MortonKeys)
                .bind([
                    self.morton_params.buffer(),
                    particles,
                    self.sort.input_keys().buffer(),
                ])
                .dispatch(self.sort.group_count()),
            self.sort.init_identity_values_dispatch(),
        ];
        backend.run_batch(&batch)?;

        self.state = BuildState::KeysComputed;
        Ok(())
    }

    /// Sorts the keys computed by [`Self::compute_keys`].
    pub fn sort_keys<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> IndexResult<()> {
        self.advance(BuildState::KeysComputed, BuildState::Sorted, |index| {
            Ok(index.sort.execute(backend)?)
        })
    }

    /// Builds the range table indexed by cell key, then its remap indexed by linear cell index.
    pub fn build_tables<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> IndexResult<()> {
        self.advance(BuildState::Sorted, BuildState::RangeTableBuilt, |index| {
            let groups = cell_groups(index.config.num_cells());
            let batch = [
                KernelDispatch::new(&BuildIndex)
                    .bind([
                        index.index_params.buffer(),
                        index.sort.sorted_keys().buffer(),
                        index.cells.buffer(),
                    ])
                    .dispatch(groups),
                KernelDispatch::new(&FlattenIndex)
                    .bind([
                        index.index_params.buffer(),
                        index.cells.buffer(),
                        index.linear_cells.buffer(),
                    ])
                    .dispatch(groups),
            ];
            Ok(backend.run_batch(&batch)?)
        })
    }

    fn advance(
        &mut self,
        from: BuildState,
        to: BuildState,
        step: impl FnOnce(&Self) -> IndexResult<()>,
    ) -> IndexResult<()> {
        self.expect_state(from)?;
        self.state = BuildState::Uninitialized;
        step(&*self)?;
        log::trace!("particle index: {from:?} -> {to:?}");
        self.state = to;
        Ok(())
    }

    fn expect_state(&self, expected: BuildState) -> IndexResult<()> {
        if self.state != expected {
            return Err(IndexError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn check_particles<B: ComputeBackend + ?Sized>(
        &self,
        backend: &B,
        particles: BufferHandle,
    ) -> IndexResult<()> {
        let required = self.config.layout.required_bytes(self.num_particles);
        let available = backend.size_of(particles)?;
        if available < required {
            return Err(IndexError::ParticleBufferTooSmall {
                num_particles: self.num_particles,
                required,
                available,
            });
        }
        Ok(())
    }

    /// Sorted cell keys. Only the first [`Self::num_particles`] entries are real keys.
    pub fn sorted_keys(&self) -> IndexResult<&GpuVector<u32>> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(self.sort.sorted_keys())
    }

    /// Original slot of each sorted key.
    pub fn sorted_indices(&self) -> IndexResult<&GpuVector<u32>> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(self.sort.sorted_values())
    }

    /// Range table indexed by cell key.
    pub fn cells(&self) -> IndexResult<&GpuVector<CellRange>> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(&self.cells)
    }

    /// Range table indexed by linear cell index.
    pub fn linear_cells(&self) -> IndexResult<&GpuVector<CellRange>> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(&self.linear_cells)
    }

    /// Every result of the last build, for consumers binding them to their own kernels.
    pub fn views(&self) -> IndexResult<IndexViews<'_>> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(IndexViews {
            sorted_keys: self.sort.sorted_keys(),
            sorted_indices: self.sort.sorted_values(),
            cells: &self.cells,
            linear_cells: &self.linear_cells,
            num_particles: self.num_particles,
            bits_per_axis: self.config.bits_per_axis,
            domain: &self.domain,
        })
    }

    /// Reads the results of the last build back to the host.
    pub fn snapshot<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> IndexResult<IndexSnapshot> {
        self.expect_state(BuildState::RangeTableBuilt)?;
        Ok(IndexSnapshot {
            bits_per_axis: self.config.bits_per_axis,
            domain: self.domain,
            sorted_keys: self.sort.read_sorted_keys(backend)?,
            sorted_indices: self.sort.read_sorted_values(backend)?,
            cells: self.cells.read(backend)?,
            linear_cells: self.linear_cells.read(backend)?,
        })
    }

    /// Reads the particle positions back, following the configured layout.
    pub fn read_positions<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        particles: BufferHandle,
    ) -> IndexResult<Vec<Point3<f32>>> {
        self.check_particles(backend, particles)?;
        let layout = self.config.layout;
        let bytes = backend.download(particles, layout.required_bytes(self.num_particles))?;
        let (offset, stride) = (layout.offset as usize, layout.stride as usize);

        Ok((0..self.num_particles as usize)
            .map(|i| {
                let base = i * stride + offset;
                let xyz: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[base..base + 12]);
                Point3::from(xyz)
            })
            .collect())
    }

    /// Checks the last build against the positions currently stored in `particles`.
    ///
    /// Verifies that:
    /// - the sorted indices are a permutation of the particle slots,
    /// - the ranges, taken in key order, partition `[0, num_particles)`,
    /// - every member of the range of key `K` has key `K`, recomputed from its position,
    /// - the linear table is the remap of the keyed table.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Inconsistent`] on the first violation found.
    pub fn check_consistency<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        particles: BufferHandle,
    ) -> IndexResult<()> {
        let snapshot = self.snapshot(backend)?;
        let positions = self.read_positions(backend, particles)?;
        check_snapshot(&snapshot, &positions).map_err(IndexError::Inconsistent)
    }

    /// Frees every buffer of the index.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) -> IndexResult<()> {
        self.sort.release(backend)?;
        self.morton_params.release(backend)?;
        self.index_params.release(backend)?;
        self.cells.release(backend)?;
        self.linear_cells.release(backend)?;
        Ok(())
    }
}

fn check_snapshot(snapshot: &IndexSnapshot, positions: &[Point3<f32>]) -> Result<(), String> {
    let n = positions.len();
    let bits = snapshot.bits_per_axis;
    let num_cells = 1usize << (3 * bits);

    if snapshot.sorted_keys.len() != n || snapshot.sorted_indices.len() != n {
        return Err(format!(
            "{} sorted keys and {} sorted indices for {n} particles",
            snapshot.sorted_keys.len(),
            snapshot.sorted_indices.len()
        ));
    }
    if snapshot.cells.len() != num_cells || snapshot.linear_cells.len() != num_cells {
        return Err(format!(
            "range tables of {} and {} cells for a grid of {num_cells} cells",
            snapshot.cells.len(),
            snapshot.linear_cells.len()
        ));
    }

    let mut seen = vec![false; n];
    for (p, slot) in snapshot.sorted_indices.iter().enumerate() {
        match seen.get_mut(*slot as usize) {
            Some(seen) if !*seen => *seen = true,
            _ => return Err(format!("sorted index {slot} at position {p} is not a unique particle slot")),
        }
    }

    let mut expected_left = 0;
    for (key, range) in snapshot.cells.iter().enumerate() {
        if range.left != expected_left || range.right < range.left {
            return Err(format!(
                "cell {key} has range [{}, {}), expected it to start at {expected_left}",
                range.left, range.right
            ));
        }
        expected_left = range.right;
    }
    if expected_left as usize != n {
        return Err(format!("the ranges cover [0, {expected_left}) instead of [0, {n})"));
    }

    (0..n).into_par_iter().try_for_each(|p| {
        let key = snapshot.sorted_keys[p];
        let slot = snapshot.sorted_indices[p] as usize;
        let in_range = snapshot
            .cells
            .get(key as usize)
            .is_some_and(|range| range.range().contains(&p));
        if !in_range {
            return Err(format!("sorted position {p} is outside of the range of its key {key}"));
        }

        let recomputed = snapshot.domain.key_of(&positions[slot], bits);
        if recomputed != key {
            return Err(format!(
                "particle {slot} is stored under key {key} but its position {:?} maps to key {recomputed}",
                positions[slot].coords.as_slice()
            ));
        }
        Ok(())
    })?;

    (0..num_cells).into_par_iter().try_for_each(|index| {
        let [i, j, k] = morton::linear_coords(index as u32, bits);
        let key = morton::encode3(i, j, k, bits) as usize;
        if snapshot.linear_cells[index] != snapshot.cells[key] {
            return Err(format!(
                "linear cell {index} holds {:?}, the range of its key {key} is {:?}",
                snapshot.linear_cells[index], snapshot.cells[key]
            ));
        }
        Ok(())
    })
}

#[cfg(test)]
mod test {
    use super::{BuildState, ParticleIndex};
    use crate::config::{IndexConfig, PositionLayout};
    use crate::error::IndexError;
    use crate::kernels::CellRange;
    use crate::morton;
    use nalgebra::Point3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use wgcompute::gpu::GpuInstance;
    use wgcompute::tensor::GpuVector;
    use wgcompute::{ComputeBackend, HostBackend, WgpuBackend};
    use wgsort::RadixSort;

    fn validated(config: IndexConfig) -> IndexConfig {
        IndexConfig {
            validate: true,
            ..config
        }
    }

    fn random_points(rng: &mut impl Rng, n: usize, min: f32, max: f32) -> Vec<[f32; 3]> {
        (0..n)
            .map(|_| {
                [
                    rng.random_range(min..max),
                    rng.random_range(min..max),
                    rng.random_range(min..max),
                ]
            })
            .collect()
    }

    #[test]
    fn uniform_points_in_the_unit_cube() {
        let mut backend = HostBackend::new();
        let mut rng = StdRng::seed_from_u64(12345);
        let points = random_points(&mut rng, 65_536, 0.0, 1.0);
        let particles = GpuVector::init(&mut backend, &points).unwrap();

        let config = validated(IndexConfig::default());
        let mut index = ParticleIndex::new(&mut backend, config, 65_536).unwrap();
        let stats = index.build(&mut backend, particles.buffer()).unwrap();
        assert!(stats.validation_time.is_some());
        assert_eq!(index.state(), BuildState::RangeTableBuilt);

        let snapshot = index.snapshot(&mut backend).unwrap();
        let total: u32 = snapshot.cells.iter().map(|c| c.len()).sum();
        assert_eq!(total, 65_536);

        // Brute-force membership of cell (2, 3, 1).
        let domain = index.domain();
        let mut expected: Vec<u32> = (0..points.len() as u32)
            .filter(|i| domain.cell_of(&Point3::from(points[*i as usize]), 4) == [2, 3, 1])
            .collect();
        let key = morton::encode3(2, 3, 1, 4);
        let mut members = snapshot.particles_in_key(key).to_vec();
        members.sort();
        expected.sort();
        assert!(!expected.is_empty());
        assert_eq!(members, expected);

        let mut by_cell = snapshot.particles_in_cell(2, 3, 1).to_vec();
        by_cell.sort();
        assert_eq!(by_cell, expected);
    }

    #[test]
    fn strided_layout_outside_of_the_domain() {
        let mut backend = HostBackend::new();
        let mut rng = StdRng::seed_from_u64(42);
        let points = random_points(&mut rng, 1000, -3.0, 3.0);

        // Particles of 8 floats: 4 words of other data, then the position.
        let mut particle_data = vec![0.0f32; points.len() * 8];
        for (i, p) in points.iter().enumerate() {
            particle_data[i * 8] = i as f32;
            particle_data[i * 8 + 4..i * 8 + 7].copy_from_slice(p);
        }
        let particles = GpuVector::init(&mut backend, &particle_data).unwrap();

        let config = validated(IndexConfig {
            bits_per_axis: 3,
            domain_min: [-2.0, -2.0, -2.0],
            domain_max: [2.0, 2.0, 2.0],
            layout: PositionLayout::new(16, 32),
            ..Default::default()
        });
        let mut index = ParticleIndex::new(&mut backend, config, 1000).unwrap();
        index.build(&mut backend, particles.buffer()).unwrap();

        let keys: Vec<u32> = points
            .iter()
            .map(|p| index.domain().key_of(&Point3::from(*p), 3))
            .collect();
        let slots: Vec<u32> = (0..1000).collect();
        let (expected_keys, expected_slots) = RadixSort::eval_cpu(&keys, &slots);

        let snapshot = index.snapshot(&mut backend).unwrap();
        assert_eq!(snapshot.sorted_keys, expected_keys);
        assert_eq!(snapshot.sorted_indices, expected_slots);

        // Points beyond the domain are clamped into the boundary cells.
        let far = Point3::new(-10.0, 10.0, 0.0);
        assert_eq!(snapshot.cell_of(&far), [0, 7, 4]);
    }

    #[test]
    fn single_cell_and_single_particle() {
        let mut backend = HostBackend::new();
        let config = validated(IndexConfig {
            bits_per_axis: 2,
            ..Default::default()
        });

        let points = vec![[0.5f32, 0.5, 0.5]; 300];
        let particles = GpuVector::init(&mut backend, &points).unwrap();
        let mut index = ParticleIndex::new(&mut backend, config.clone(), 300).unwrap();
        index.build(&mut backend, particles.buffer()).unwrap();

        let snapshot = index.snapshot(&mut backend).unwrap();
        let key = snapshot.key_of(&Point3::new(0.5, 0.5, 0.5));
        for (c, range) in snapshot.cells.iter().enumerate() {
            let expected = match (c as u32).cmp(&key) {
                std::cmp::Ordering::Less => CellRange::new(0, 0),
                std::cmp::Ordering::Equal => CellRange::new(0, 300),
                std::cmp::Ordering::Greater => CellRange::new(300, 300),
            };
            assert_eq!(*range, expected);
        }
        // Equal keys keep the order of the particle slots.
        assert_eq!(snapshot.sorted_indices, (0..300).collect::<Vec<_>>());

        let one = GpuVector::init(&mut backend, &[[1.0f32, 0.0, 1.0]]).unwrap();
        let mut index = ParticleIndex::new(&mut backend, config, 1).unwrap();
        index.build(&mut backend, one.buffer()).unwrap();
        let snapshot = index.snapshot(&mut backend).unwrap();
        assert_eq!(snapshot.particles_in_cell(3, 0, 3), &[0]);
        assert_eq!(snapshot.cells.iter().filter(|c| !c.is_empty()).count(), 1);
    }

    #[test]
    fn steps_must_run_in_order() {
        let mut backend = HostBackend::new();
        let points = vec![[0.1f32, 0.2, 0.3]; 10];
        let particles = GpuVector::init(&mut backend, &points).unwrap();
        let mut index = ParticleIndex::new(&mut backend, IndexConfig::default(), 10).unwrap();

        assert!(matches!(
            index.sorted_keys(),
            Err(IndexError::InvalidState {
                expected: BuildState::RangeTableBuilt,
                found: BuildState::Uninitialized,
            })
        ));
        assert!(index.sort_keys(&mut backend).is_err());
        assert!(index.build_tables(&mut backend).is_err());

        index.compute_keys(&mut backend, particles.buffer()).unwrap();
        assert_eq!(index.state(), BuildState::KeysComputed);
        let err = index.build_tables(&mut backend).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(index.state(), BuildState::KeysComputed);
        assert!(index.views().is_err());

        index.sort_keys(&mut backend).unwrap();
        assert_eq!(index.state(), BuildState::Sorted);
        index.build_tables(&mut backend).unwrap();
        assert_eq!(index.state(), BuildState::RangeTableBuilt);

        let views = index.views().unwrap();
        assert_eq!(views.num_particles, 10);
        assert_eq!(views.cells.len(), 4096);
        index.check_consistency(&mut backend, particles.buffer()).unwrap();
    }

    #[test]
    fn configuration_errors() {
        let mut backend = HostBackend::new();
        let err = ParticleIndex::new(&mut backend, IndexConfig::default(), 0)
            .err()
            .unwrap();
        assert!(matches!(err, IndexError::Compute(_)));
        assert!(err.is_config_error());

        let config = IndexConfig {
            bits_per_axis: 11,
            ..Default::default()
        };
        assert!(matches!(
            ParticleIndex::new(&mut backend, config, 10),
            Err(IndexError::InvalidBitsPerAxis(11))
        ));

        // Nine positions for ten particles.
        let points = vec![[0.5f32; 3]; 9];
        let particles = GpuVector::init(&mut backend, &points).unwrap();
        let mut index = ParticleIndex::new(&mut backend, IndexConfig::default(), 10).unwrap();
        let err = index.build(&mut backend, particles.buffer()).unwrap_err();
        assert!(matches!(
            err,
            IndexError::ParticleBufferTooSmall {
                num_particles: 10,
                required: 120,
                available: 108,
            }
        ));
        assert!(err.is_config_error());
        assert_eq!(index.state(), BuildState::Uninitialized);
    }

    #[test]
    fn tampering_is_detected() {
        let mut backend = HostBackend::new();
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = random_points(&mut rng, 2000, 0.0, 1.0);
        let particles = GpuVector::init(&mut backend, &points).unwrap();

        let config = IndexConfig {
            validate: false,
            ..Default::default()
        };
        let mut index = ParticleIndex::new(&mut backend, config, 2000).unwrap();
        let stats = index.build(&mut backend, particles.buffer()).unwrap();
        assert!(stats.validation_time.is_none());
        index.check_consistency(&mut backend, particles.buffer()).unwrap();

        // A particle moved to the opposite corner since the build.
        let moved = points[0];
        points[0] = moved.map(|x| 1.0 - x);
        particles.write(&mut backend, &points).unwrap();
        assert!(matches!(
            index.check_consistency(&mut backend, particles.buffer()),
            Err(IndexError::Inconsistent(_))
        ));

        // Rebuilding fixes it, then a broken range table is caught.
        index.build(&mut backend, particles.buffer()).unwrap();
        index.check_consistency(&mut backend, particles.buffer()).unwrap();
        let cells = *index.cells().unwrap();
        let mut ranges = cells.read(&mut backend).unwrap();
        let first = ranges.iter().position(|r| !r.is_empty()).unwrap();
        ranges[first].right -= 1;
        cells.write(&mut backend, &ranges).unwrap();
        let err = index
            .check_consistency(&mut backend, particles.buffer())
            .unwrap_err();
        assert!(matches!(err, IndexError::Inconsistent(_)));
        assert!(!err.is_config_error());
    }

    #[test]
    fn rebuild_after_corruption() {
        let mut backend = HostBackend::new();
        let points = vec![[0.25f32, 0.5, 0.75]; 64];
        let particles = GpuVector::init(&mut backend, &points).unwrap();
        let mut index =
            ParticleIndex::new(&mut backend, validated(IndexConfig::default()), 64).unwrap();
        index.build(&mut backend, particles.buffer()).unwrap();

        let linear = *index.linear_cells().unwrap();
        linear.write(&mut backend, &[CellRange::new(3, 1)]).unwrap();
        assert!(index.check_consistency(&mut backend, particles.buffer()).is_err());

        index.build(&mut backend, particles.buffer()).unwrap();
        assert_eq!(index.state(), BuildState::RangeTableBuilt);
    }

    #[test]
    fn resize_between_builds() {
        let mut backend = HostBackend::new();
        let mut rng = StdRng::seed_from_u64(99);
        let config = validated(IndexConfig {
            bits_per_axis: 5,
            ..Default::default()
        });
        let mut index = ParticleIndex::new(&mut backend, config, 1000).unwrap();

        for n in [1000, 5000, 1, 300] {
            let points = random_points(&mut rng, n, 0.0, 1.0);
            let particles = GpuVector::init(&mut backend, &points).unwrap();
            index.set_num_particles(&mut backend, n as u32).unwrap();
            assert_eq!(index.state(), BuildState::Uninitialized);
            index.build(&mut backend, particles.buffer()).unwrap();

            let snapshot = index.snapshot(&mut backend).unwrap();
            assert_eq!(snapshot.sorted_indices.len(), n);
            assert_eq!(snapshot.cells.last().unwrap().right as usize, n);
            particles.release(&mut backend).unwrap();
        }
    }

    fn build_snapshot(
        backend: &mut impl ComputeBackend,
        points: &[[f32; 3]],
        config: IndexConfig,
    ) -> super::IndexSnapshot {
        let particles = GpuVector::init(backend, points).unwrap();
        let mut index = ParticleIndex::new(backend, config, points.len() as u32).unwrap();
        index.build(backend, particles.buffer()).unwrap();
        let snapshot = index.snapshot(backend).unwrap();
        index.release(backend).unwrap();
        particles.release(backend).unwrap();
        snapshot
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn device_index_matches_host() {
        let Ok(gpu) = GpuInstance::new().await else {
            log::warn!("no gpu adapter available, skipping device test");
            return;
        };
        let mut device = WgpuBackend::new(gpu);
        let mut host = HostBackend::new();

        let mut rng = StdRng::seed_from_u64(12345);
        let points = random_points(&mut rng, 16_384, -0.1, 1.1);
        for bits in [1, 4, 6] {
            let config = validated(IndexConfig {
                bits_per_axis: bits,
                ..Default::default()
            });
            let expected = build_snapshot(&mut host, &points, config.clone());
            let result = build_snapshot(&mut device, &points, config);
            assert_eq!(result.sorted_keys, expected.sorted_keys);
            assert_eq!(result.sorted_indices, expected.sorted_indices);
            assert_eq!(result.cells, expected.cells);
            assert_eq!(result.linear_cells, expected.linear_cells);
        }
    }
}

//! Stable LSD radix sort of `u32` keys with a `u32` payload.

use self::kernels::{
    Histogram, HistogramSum, InitRange, RadixParams, RadixScatter, RangeParams, ScanParams,
    SortParams, Transpose, WorkgroupScan, WG,
};
use wgcompute::tensor::{GpuScalar, GpuVector};
use wgcompute::{
    BackendExt, ComputeBackend, ComputeError, ComputeResult, Dispatch, KernelDispatch,
    MAX_WORKGROUPS,
};

pub mod kernels;

/// Number of keys handled by one workgroup.
pub const ITEMS_PER_GROUP: u32 = WG;
/// Width, in bits, of the digit sorted by one pass.
pub const BITS_PER_PASS: u32 = 8;
/// Number of distinct digit values.
pub const NUM_BINS: u32 = 1 << BITS_PER_PASS;
/// Number of passes needed to sort full 32-bit keys.
pub const NUM_PASSES: u32 = u32::BITS / BITS_PER_PASS;
/// Key written to the padding slots that round the input up to a multiple of
/// [`ITEMS_PER_GROUP`].
///
/// Padding always follows every real key in the input and the sort is stable, so padding
/// sorts after every real key, including real keys equal to the sentinel.
pub const SENTINEL_KEY: u32 = u32::MAX;

/// GPU-accelerated radix sort for sorting arrays of `u32` keys with associated values.
///
/// The sort runs [`NUM_PASSES`] passes of [`BITS_PER_PASS`] bits. Every pass is a single
/// batch of six dispatches:
/// 1. **Histogram**: per-workgroup count of each digit.
/// 2. **Histogram sum**: global count of each digit.
/// 3. **Scan**: exclusive prefix sum of the global histogram.
/// 4. **Transpose**: workgroup histograms from `[group][digit]` to `[digit][group]`.
/// 5. **Scan**: per-digit exclusive prefix sum across workgroups.
/// 6. **Scatter**: stable write of every key and value to its sorted position.
///
/// Keys and values ping-pong between two buffer pairs. With an even number of passes the
/// sorted result lands back in the buffers the input was written to, see
/// [`RadixSort::sorted_keys`].
pub struct RadixSort {
    num_elements: u32,
    workspace: RadixSortWorkspace,
}

/// Buffers of a [`RadixSort`].
///
/// The workspace owns the ping-pong key/value buffers, the histogram and prefix buffers of a
/// pass, and the uniform parameters of every dispatch. It grows on demand and never shrinks.
pub struct RadixSortWorkspace {
    capacity: u32,
    keys: [GpuVector<u32>; 2],
    values: [GpuVector<u32>; 2],
    group_histograms: GpuVector<u32>,
    global_histogram: GpuVector<u32>,
    global_prefix: GpuVector<u32>,
    transposed_histograms: GpuVector<u32>,
    group_prefix: GpuVector<u32>,
    pass_uniforms: Vec<(GpuScalar<RadixParams>, GpuScalar<SortParams>)>,
    group_scan_params: GpuScalar<ScanParams>,
    global_scan_params: GpuScalar<ScanParams>,
    inverted_scan_params: GpuScalar<ScanParams>,
    range_params: GpuScalar<RangeParams>,
}

/// Snapshot of the intermediate buffers after a pass, read back for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassState {
    /// Per-workgroup histograms, `[group][digit]`.
    pub group_histograms: Vec<u32>,
    /// Global digit histogram.
    pub global_histogram: Vec<u32>,
    /// Exclusive prefix sum of the global histogram.
    pub global_prefix: Vec<u32>,
    /// Per-workgroup histograms, `[digit][group]`.
    pub transposed_histograms: Vec<u32>,
    /// Per-digit exclusive prefix sum across workgroups, `[digit][group]`.
    pub group_prefix: Vec<u32>,
    /// Keys written by the pass, padding included.
    pub keys: Vec<u32>,
    /// Values written by the pass, padding included.
    pub values: Vec<u32>,
}

/// Rounds `num_elements` up to a whole number of workgroups.
pub fn padded_len(num_elements: u32) -> u32 {
    num_elements.div_ceil(ITEMS_PER_GROUP) * ITEMS_PER_GROUP
}

fn group_count_for(num_elements: u32) -> ComputeResult<u32> {
    if num_elements == 0 {
        return Err(ComputeError::InvalidConfig(
            "cannot sort an empty array".to_string(),
        ));
    }

    let group_count = num_elements.div_ceil(ITEMS_PER_GROUP);
    if group_count > MAX_WORKGROUPS {
        return Err(ComputeError::InvalidConfig(format!(
            "{num_elements} elements need {group_count} workgroups, the limit is {MAX_WORKGROUPS}"
        )));
    }
    Ok(group_count)
}

impl RadixSortWorkspace {
    /// Allocates a workspace able to sort up to `num_elements` elements.
    ///
    /// # Errors
    ///
    /// Fails if `num_elements` is zero, needs more than [`MAX_WORKGROUPS`] workgroups, or if
    /// an allocation fails.
    pub fn with_capacity<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        num_elements: u32,
    ) -> ComputeResult<Self> {
        let group_count = group_count_for(num_elements)?;
        let capacity = group_count * ITEMS_PER_GROUP;
        let matrix_len = (group_count * NUM_BINS) as u64;

        let mut pass_uniforms = Vec::with_capacity(NUM_PASSES as usize);
        for pass in 0..NUM_PASSES {
            let radix = radix_params(pass, capacity);
            pass_uniforms.push((
                GpuScalar::init(backend, radix)?,
                GpuScalar::init(backend, SortParams::new(radix, group_count))?,
            ));
        }

        let group_scan = ScanParams::new(group_count, NUM_BINS);
        Ok(Self {
            capacity,
            keys: [
                GpuVector::uninit(backend, capacity as u64)?,
                GpuVector::uninit(backend, capacity as u64)?,
            ],
            values: [
                GpuVector::uninit(backend, capacity as u64)?,
                GpuVector::uninit(backend, capacity as u64)?,
            ],
            group_histograms: GpuVector::uninit(backend, matrix_len)?,
            global_histogram: GpuVector::uninit(backend, NUM_BINS as u64)?,
            global_prefix: GpuVector::uninit(backend, NUM_BINS as u64)?,
            transposed_histograms: GpuVector::uninit(backend, matrix_len)?,
            group_prefix: GpuVector::uninit(backend, matrix_len)?,
            pass_uniforms,
            group_scan_params: GpuScalar::init(backend, group_scan)?,
            global_scan_params: GpuScalar::init(backend, ScanParams::new(1, NUM_BINS))?,
            inverted_scan_params: GpuScalar::init(backend, group_scan.inverted())?,
            range_params: GpuScalar::init(backend, RangeParams::new(capacity))?,
        })
    }

    /// Maximum number of elements (padding included) this workspace can sort.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Frees every buffer of the workspace.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) -> ComputeResult<()> {
        for v in self.keys.into_iter().chain(self.values) {
            v.release(backend)?;
        }
        self.group_histograms.release(backend)?;
        self.global_histogram.release(backend)?;
        self.global_prefix.release(backend)?;
        self.transposed_histograms.release(backend)?;
        self.group_prefix.release(backend)?;
        for (radix, sort) in self.pass_uniforms {
            radix.release(backend)?;
            sort.release(backend)?;
        }
        self.group_scan_params.release(backend)?;
        self.global_scan_params.release(backend)?;
        self.inverted_scan_params.release(backend)?;
        self.range_params.release(backend)
    }

    /// Rewrites the uniform parameters for `padded_len` elements.
    fn configure<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        padded_len: u32,
    ) -> ComputeResult<()> {
        let group_count = padded_len / ITEMS_PER_GROUP;
        for (pass, (radix_uniform, sort_uniform)) in self.pass_uniforms.iter().enumerate() {
            let radix = radix_params(pass as u32, padded_len);
            radix_uniform.write(backend, radix)?;
            sort_uniform.write(backend, SortParams::new(radix, group_count))?;
        }

        let group_scan = ScanParams::new(group_count, NUM_BINS);
        self.group_scan_params.write(backend, group_scan)?;
        self.inverted_scan_params
            .write(backend, group_scan.inverted())?;
        self.range_params
            .write(backend, RangeParams::new(padded_len))
    }
}

fn radix_params(pass: u32, padded_len: u32) -> RadixParams {
    RadixParams {
        bit_offset: pass * BITS_PER_PASS,
        num_bins: NUM_BINS,
        total_size: padded_len,
        items_per_group: ITEMS_PER_GROUP,
    }
}

impl RadixSort {
    /// Creates a radix sort for `num_elements` keys and allocates its workspace.
    ///
    /// # Errors
    ///
    /// Fails if `num_elements` is zero, needs more than [`MAX_WORKGROUPS`] workgroups, or if
    /// an allocation fails.
    pub fn new<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        num_elements: u32,
    ) -> ComputeResult<Self> {
        let workspace = RadixSortWorkspace::with_capacity(backend, num_elements)?;
        log::debug!(
            "radix sort: {num_elements} elements, {} workgroups",
            workspace.capacity / ITEMS_PER_GROUP
        );
        Ok(Self {
            num_elements,
            workspace,
        })
    }

    /// Changes the number of elements to sort, growing the workspace if needed.
    pub fn resize<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        num_elements: u32,
    ) -> ComputeResult<()> {
        group_count_for(num_elements)?;

        if padded_len(num_elements) > self.workspace.capacity {
            log::debug!("radix sort: growing workspace to {num_elements} elements");
            let workspace = RadixSortWorkspace::with_capacity(backend, num_elements)?;
            std::mem::replace(&mut self.workspace, workspace).release(backend)?;
        } else {
            self.workspace.configure(backend, padded_len(num_elements))?;
        }

        self.num_elements = num_elements;
        Ok(())
    }

    /// Number of real (non-padding) elements.
    pub fn num_elements(&self) -> u32 {
        self.num_elements
    }

    /// Number of sorted elements, padding included.
    pub fn padded_len(&self) -> u32 {
        padded_len(self.num_elements)
    }

    /// Number of workgroups of each pass.
    pub fn group_count(&self) -> u32 {
        self.padded_len() / ITEMS_PER_GROUP
    }

    /// The workspace of this sort.
    pub fn workspace(&self) -> &RadixSortWorkspace {
        &self.workspace
    }

    /// Keys read by the first pass.
    ///
    /// Its first [`Self::padded_len`] elements must be initialized before
    /// [`Self::execute`], either through [`Self::upload_keys`] or by a kernel writing
    /// [`SENTINEL_KEY`] to the padding slots.
    pub fn input_keys(&self) -> &GpuVector<u32> {
        &self.workspace.keys[0]
    }

    /// Values read by the first pass.
    pub fn input_values(&self) -> &GpuVector<u32> {
        &self.workspace.values[0]
    }

    /// Keys sorted by the last [`Self::execute`].
    pub fn sorted_keys(&self) -> &GpuVector<u32> {
        &self.workspace.keys[(NUM_PASSES % 2) as usize]
    }

    /// Values sorted by the last [`Self::execute`].
    pub fn sorted_values(&self) -> &GpuVector<u32> {
        &self.workspace.values[(NUM_PASSES % 2) as usize]
    }

    /// Uploads the keys to sort, followed by [`SENTINEL_KEY`] padding.
    ///
    /// # Errors
    ///
    /// Fails if `keys.len()` differs from [`Self::num_elements`].
    pub fn upload_keys<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        keys: &[u32],
    ) -> ComputeResult<()> {
        self.check_len("keys", keys.len())?;
        let mut padded = Vec::with_capacity(self.padded_len() as usize);
        padded.extend_from_slice(keys);
        padded.resize(self.padded_len() as usize, SENTINEL_KEY);
        self.input_keys().write(backend, &padded)
    }

    /// Uploads the values associated with the keys.
    ///
    /// Padding slots get their own index as value, so they never alias a real value slot.
    pub fn upload_values<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        values: &[u32],
    ) -> ComputeResult<()> {
        self.check_len("values", values.len())?;
        let mut padded = Vec::with_capacity(self.padded_len() as usize);
        padded.extend_from_slice(values);
        padded.extend(values.len() as u32..self.padded_len());
        self.input_values().write(backend, &padded)
    }

    /// Sets the input values to `0..padded_len` on the device: after sorting, the values are
    /// the original position of each sorted key.
    pub fn init_identity_values<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> ComputeResult<()> {
        backend.run(self.init_identity_values_dispatch())
    }

    /// The dispatch run by [`Self::init_identity_values`], for callers batching it with their
    /// own kernels.
    pub fn init_identity_values_dispatch(&self) -> Dispatch<'static> {
        KernelDispatch::new(&InitRange)
            .bind([
                self.workspace.range_params.buffer(),
                self.input_values().buffer(),
            ])
            .dispatch(self.group_count())
    }

    /// Runs every pass. The result is in [`Self::sorted_keys`] and [`Self::sorted_values`].
    pub fn execute<B: ComputeBackend + ?Sized>(&self, backend: &mut B) -> ComputeResult<()> {
        self.validate_buffers(backend)?;
        for pass in 0..NUM_PASSES {
            self.run_pass(backend, pass)?;
        }
        Ok(())
    }

    /// Runs a single pass, reading the output of pass `pass - 1` (or the input buffers for
    /// pass 0).
    ///
    /// # Errors
    ///
    /// Fails if `pass >= NUM_PASSES`.
    pub fn execute_pass<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        pass: u32,
    ) -> ComputeResult<()> {
        if pass >= NUM_PASSES {
            return Err(ComputeError::InvalidConfig(format!(
                "pass {pass} out of range, the sort has {NUM_PASSES} passes"
            )));
        }
        self.validate_buffers(backend)?;
        self.run_pass(backend, pass)
    }

    fn run_pass<B: ComputeBackend + ?Sized>(&self, backend: &mut B, pass: u32) -> ComputeResult<()> {
        log::trace!("radix sort: pass {pass}");
        backend.run_batch(&self.pass_batch(pass))
    }

    /// The six dispatches of pass `pass`.
    fn pass_batch(&self, pass: u32) -> [Dispatch<'static>; 6] {
        let ws = &self.workspace;
        let src = (pass % 2) as usize;
        let dst = 1 - src;
        let group_count = self.group_count();
        let (radix_params, sort_params) = &ws.pass_uniforms[pass as usize];

        [
            KernelDispatch::new(&Histogram)
                .bind([
                    radix_params.buffer(),
                    ws.keys[src].buffer(),
                    ws.group_histograms.buffer(),
                ])
                .dispatch(group_count),
            KernelDispatch::new(&HistogramSum)
                .bind([
                    ws.group_scan_params.buffer(),
                    ws.group_histograms.buffer(),
                    ws.global_histogram.buffer(),
                ])
                .dispatch(1),
            KernelDispatch::new(&WorkgroupScan)
                .bind([
                    ws.global_scan_params.buffer(),
                    ws.global_histogram.buffer(),
                    ws.global_prefix.buffer(),
                ])
                .dispatch(1),
            KernelDispatch::new(&Transpose)
                .bind([
                    ws.group_scan_params.buffer(),
                    ws.group_histograms.buffer(),
                    ws.transposed_histograms.buffer(),
                ])
                .dispatch(group_count),
            KernelDispatch::new(&WorkgroupScan)
                .bind([
                    ws.inverted_scan_params.buffer(),
                    ws.transposed_histograms.buffer(),
                    ws.group_prefix.buffer(),
                ])
                .dispatch(NUM_BINS),
            KernelDispatch::new(&RadixScatter)
                .bind([
                    sort_params.buffer(),
                    ws.keys[src].buffer(),
                    ws.values[src].buffer(),
                    ws.global_prefix.buffer(),
                    ws.group_prefix.buffer(),
                    ws.keys[dst].buffer(),
                    ws.values[dst].buffer(),
                ])
                .dispatch(group_count),
        ]
    }

    /// Checks every buffer against the sizes required by the current element count.
    fn validate_buffers<B: ComputeBackend + ?Sized>(&self, backend: &B) -> ComputeResult<()> {
        let ws = &self.workspace;
        let padded = self.padded_len() as u64 * 4;
        let matrix = (self.group_count() * NUM_BINS) as u64 * 4;
        let bins = NUM_BINS as u64 * 4;

        let requirements = [
            ("keys (ping)", ws.keys[0].buffer(), padded),
            ("keys (pong)", ws.keys[1].buffer(), padded),
            ("values (ping)", ws.values[0].buffer(), padded),
            ("values (pong)", ws.values[1].buffer(), padded),
            ("group histograms", ws.group_histograms.buffer(), matrix),
            ("global histogram", ws.global_histogram.buffer(), bins),
            ("global prefix", ws.global_prefix.buffer(), bins),
            ("transposed histograms", ws.transposed_histograms.buffer(), matrix),
            ("group prefix", ws.group_prefix.buffer(), matrix),
        ];

        for (what, buffer, required) in requirements {
            let available = backend.size_of(buffer)?;
            if available < required {
                return Err(ComputeError::too_small(what, required, available));
            }
        }
        Ok(())
    }

    fn check_len(&self, what: &str, len: usize) -> ComputeResult<()> {
        if len != self.num_elements as usize {
            return Err(ComputeError::LengthMismatch {
                what: what.to_string(),
                expected: self.num_elements as usize,
                actual: len,
            });
        }
        Ok(())
    }

    /// Reads the first [`Self::num_elements`] sorted keys.
    pub fn read_sorted_keys<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> ComputeResult<Vec<u32>> {
        self.sorted_keys()
            .read_prefix(backend, self.num_elements as usize)
    }

    /// Reads the first [`Self::num_elements`] sorted values.
    pub fn read_sorted_values<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
    ) -> ComputeResult<Vec<u32>> {
        self.sorted_values()
            .read_prefix(backend, self.num_elements as usize)
    }

    /// Reads the intermediate buffers as left by pass `pass`, which must be the last pass
    /// executed.
    pub fn read_pass_state<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        pass: u32,
    ) -> ComputeResult<PassState> {
        let ws = &self.workspace;
        let matrix = (self.group_count() * NUM_BINS) as usize;
        let padded = self.padded_len() as usize;
        let dst = 1 - (pass % 2) as usize;

        Ok(PassState {
            group_histograms: ws.group_histograms.read_prefix(backend, matrix)?,
            global_histogram: ws.global_histogram.read(backend)?,
            global_prefix: ws.global_prefix.read(backend)?,
            transposed_histograms: ws.transposed_histograms.read_prefix(backend, matrix)?,
            group_prefix: ws.group_prefix.read_prefix(backend, matrix)?,
            keys: ws.keys[dst].read_prefix(backend, padded)?,
            values: ws.values[dst].read_prefix(backend, padded)?,
        })
    }

    /// Uploads `keys` and `values`, sorts them and reads the result back.
    ///
    /// With `values == None` the values are the identity permutation, so the returned values
    /// are the argsort of `keys`.
    pub fn sort<B: ComputeBackend + ?Sized>(
        &self,
        backend: &mut B,
        keys: &[u32],
        values: Option<&[u32]>,
    ) -> ComputeResult<(Vec<u32>, Vec<u32>)> {
        self.upload_keys(backend, keys)?;
        match values {
            Some(values) => self.upload_values(backend, values)?,
            None => self.init_identity_values(backend)?,
        }
        self.execute(backend)?;
        Ok((
            self.read_sorted_keys(backend)?,
            self.read_sorted_values(backend)?,
        ))
    }

    /// Frees every buffer of this sort.
    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) -> ComputeResult<()> {
        self.workspace.release(backend)
    }

    /// CPU reference implementation of the sort.
    ///
    /// This computes the same result as the device version: a stable sort of `keys`, with
    /// `values` permuted alongside.
    pub fn eval_cpu(keys: &[u32], values: &[u32]) -> (Vec<u32>, Vec<u32>) {
        let mut pairs: Vec<_> = keys.iter().copied().zip(values.iter().copied()).collect();
        pairs.sort_by_key(|(k, _)| *k);
        pairs.into_iter().unzip()
    }
}

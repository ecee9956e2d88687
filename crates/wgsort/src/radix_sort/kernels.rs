//! The kernels of the radix sort and their host twins.

use encase::ShaderType;
use naga_oil::compose::ShaderDefValue;
use rayon::prelude::*;
use wgcompute::composer::ShaderDefs;
use wgcompute::kernel::{ensure_words, read_uniform};
use wgcompute::{Binding, ComputeError, ComputeResult, HostArgs, Kernel};

/// Workgroup size of every sort kernel, injected into `sorting.wgsl` as the `WG` shader def.
pub(crate) const WG: u32 = 256;

/// Constants, parameter structs and helpers shared by the sort kernels.
pub const SORTING: &str = include_str!("sorting.wgsl");

fn sorting_defs() -> ShaderDefs {
    [("WG".to_string(), ShaderDefValue::UInt(WG))].into()
}

/// Parameters of the histogram kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ShaderType)]
pub struct RadixParams {
    /// First bit of the digit sorted by this pass.
    pub bit_offset: u32,
    /// Number of distinct digit values.
    pub num_bins: u32,
    /// Number of keys, padding included.
    pub total_size: u32,
    /// Number of keys handled by one workgroup.
    pub items_per_group: u32,
}

/// Parameters of the histogram-sum, scan and transpose kernels.
///
/// These kernels see their input as a row-major `group_count x num_bins` matrix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ShaderType)]
pub struct ScanParams {
    /// Number of rows.
    pub group_count: u32,
    /// Number of columns.
    pub num_bins: u32,
}

impl ScanParams {
    /// Parameters for a `group_count x num_bins` matrix.
    pub fn new(group_count: u32, num_bins: u32) -> Self {
        Self {
            group_count,
            num_bins,
        }
    }

    /// Parameters of the same data seen as its transpose.
    pub fn inverted(self) -> Self {
        Self::new(self.num_bins, self.group_count)
    }
}

/// Parameters of the scatter kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ShaderType)]
pub struct SortParams {
    /// First bit of the digit sorted by this pass.
    pub bit_offset: u32,
    /// Number of distinct digit values.
    pub num_bins: u32,
    /// Number of keys, padding included.
    pub total_size: u32,
    /// Number of keys handled by one workgroup.
    pub items_per_group: u32,
    /// Number of workgroups of the pass.
    pub group_count: u32,
}

impl SortParams {
    /// Scatter parameters matching histogram parameters.
    pub fn new(radix: RadixParams, group_count: u32) -> Self {
        Self {
            bit_offset: radix.bit_offset,
            num_bins: radix.num_bins,
            total_size: radix.total_size,
            items_per_group: radix.items_per_group,
            group_count,
        }
    }
}

/// Parameters of the identity-payload kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ShaderType)]
pub struct RangeParams {
    /// Number of values to write.
    pub len: u32,
}

impl RangeParams {
    /// Parameters writing `0..len`.
    pub fn new(len: u32) -> Self {
        Self { len }
    }
}

fn digit_of(key: u32, bit_offset: u32, num_bins: u32) -> usize {
    ((key >> bit_offset) & (num_bins - 1)) as usize
}

fn check_bins(kernel: &'static str, num_bins: u32) -> ComputeResult<()> {
    if num_bins == 0 || !num_bins.is_power_of_two() {
        return Err(ComputeError::InvalidConfig(format!(
            "{kernel}: the number of bins must be a power of two, got {num_bins}"
        )));
    }
    Ok(())
}

/// Writes `values[i] = i` for `i < len`.
pub struct InitRange;

impl Kernel for InitRange {
    fn name(&self) -> &'static str {
        "init_range"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("init_range.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params], [values]) = args.split::<1, 1>()?;
        let params: RangeParams = read_uniform(self.name(), params)?;
        let len = params.len.min(num_groups * WG) as usize;
        ensure_words(self.name(), "values", values, len)?;

        values[..len]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = i as u32);
        Ok(())
    }
}

/// Per-workgroup digit histogram, written row-major as `[group][digit]`.
pub struct Histogram;

impl Kernel for Histogram {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("histogram.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, keys], [histograms]) = args.split::<2, 1>()?;
        let params: RadixParams = read_uniform(self.name(), params)?;
        check_bins(self.name(), params.num_bins)?;

        let num_bins = params.num_bins as usize;
        let per_group = params.items_per_group as usize;
        let total = params.total_size as usize;
        ensure_words(
            self.name(),
            "keys",
            keys,
            total.min(num_groups as usize * per_group),
        )?;
        ensure_words(
            self.name(),
            "histograms",
            histograms,
            num_groups as usize * num_bins,
        )?;

        histograms[..num_groups as usize * num_bins]
            .par_chunks_mut(num_bins)
            .enumerate()
            .for_each(|(group, row)| {
                row.fill(0);
                let start = (group * per_group).min(total);
                let end = (start + per_group).min(total);
                for key in &keys[start..end] {
                    row[digit_of(*key, params.bit_offset, params.num_bins)] += 1;
                }
            });
        Ok(())
    }
}

/// Column sums of the per-workgroup histograms: the global digit histogram.
pub struct HistogramSum;

impl Kernel for HistogramSum {
    fn name(&self) -> &'static str {
        "histogram_sum"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("histogram_sum.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, _num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, histograms], [global]) = args.split::<2, 1>()?;
        let params: ScanParams = read_uniform(self.name(), params)?;
        let rows = params.group_count as usize;
        let num_bins = params.num_bins.min(WG) as usize;
        ensure_words(
            self.name(),
            "histograms",
            histograms,
            rows * params.num_bins as usize,
        )?;
        ensure_words(self.name(), "global histogram", global, num_bins)?;

        for (bin, total) in global[..num_bins].iter_mut().enumerate() {
            *total = (0..rows)
                .map(|g| histograms[g * params.num_bins as usize + bin])
                .sum();
        }
        Ok(())
    }
}

/// Exclusive scan of every row of a row-major `group_count x num_bins` matrix, one
/// workgroup per row.
///
/// Dispatched twice per pass: once over the global histogram (`1 x 256`), once over the
/// transposed workgroup histograms (`256 x group_count`), see [`ScanParams::inverted`].
pub struct WorkgroupScan;

impl Kernel for WorkgroupScan {
    fn name(&self) -> &'static str {
        "workgroup_scan"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("workgroup_scan.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, input], [output]) = args.split::<2, 1>()?;
        let params: ScanParams = read_uniform(self.name(), params)?;
        let rows = params.group_count.min(num_groups) as usize;
        let len = params.num_bins as usize;
        if len == 0 {
            return Ok(());
        }
        ensure_words(self.name(), "input", input, rows * len)?;
        ensure_words(self.name(), "output", output, rows * len)?;

        output[..rows * len]
            .par_chunks_mut(len)
            .zip(input[..rows * len].par_chunks(len))
            .for_each(|(out_row, in_row)| {
                let mut running = 0u32;
                for (out, value) in out_row.iter_mut().zip(in_row) {
                    *out = running;
                    running = running.wrapping_add(*value);
                }
            });
        Ok(())
    }
}

/// Transposes a row-major `group_count x num_bins` matrix.
pub struct Transpose;

impl Kernel for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("transpose.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, input], [output]) = args.split::<2, 1>()?;
        let params: ScanParams = read_uniform(self.name(), params)?;
        let rows = params.group_count as usize;
        let cols = params.num_bins as usize;
        let len = (rows * cols).min(num_groups as usize * WG as usize);
        ensure_words(self.name(), "input", input, len)?;
        ensure_words(self.name(), "output", output, rows * cols)?;

        for (idx, value) in input[..len].iter().enumerate() {
            let (r, c) = (idx / cols, idx % cols);
            output[c * rows + r] = *value;
        }
        Ok(())
    }
}

/// Stable scatter of keys and values to their sorted position for the current digit.
///
/// The destination of an item of digit `d` in group `g` is
/// `global_prefix[d] + group_prefix[d * group_count + g] + rank`, where `rank` counts the
/// items of `g` with digit `d` that precede it.
pub struct RadixScatter;

impl Kernel for RadixScatter {
    fn name(&self) -> &'static str {
        "radix_sort"
    }

    fn bindings(&self) -> &'static [Binding] {
        &[
            Binding::Uniform,
            Binding::Read,
            Binding::Read,
            Binding::Read,
            Binding::Read,
            Binding::ReadWrite,
            Binding::ReadWrite,
        ]
    }

    fn wgsl(&self) -> &'static str {
        include_str!("radix_sort.wgsl")
    }

    fn modules(&self) -> &'static [&'static str] {
        &[SORTING]
    }

    fn shader_defs(&self) -> ShaderDefs {
        sorting_defs()
    }

    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
        let ([params, keys_in, values_in, global_prefix, group_prefix], [keys_out, values_out]) =
            args.split::<5, 2>()?;
        let params: SortParams = read_uniform(self.name(), params)?;
        check_bins(self.name(), params.num_bins)?;

        let num_bins = params.num_bins as usize;
        let per_group = params.items_per_group as usize;
        let total = params.total_size.min(num_groups * params.items_per_group) as usize;
        let group_count = params.group_count as usize;
        ensure_words(self.name(), "keys_in", keys_in, total)?;
        ensure_words(self.name(), "values_in", values_in, total)?;
        ensure_words(self.name(), "global_prefix", global_prefix, num_bins)?;
        ensure_words(
            self.name(),
            "group_prefix",
            group_prefix,
            num_bins * group_count,
        )?;

        let mut ranks = vec![0u32; num_bins];
        for group in 0..num_groups as usize {
            let start = (group * per_group).min(total);
            let end = (start + per_group).min(total);
            if group >= group_count && start < end {
                return Err(ComputeError::InvalidConfig(format!(
                    "{}: group {group} is beyond the group count {group_count}",
                    self.name()
                )));
            }
            ranks.fill(0);

            for i in start..end {
                let key = keys_in[i];
                let digit = digit_of(key, params.bit_offset, params.num_bins);
                let dst = global_prefix[digit] as usize
                    + group_prefix[digit * group_count + group] as usize
                    + ranks[digit] as usize;
                ranks[digit] += 1;

                match (keys_out.get_mut(dst), values_out.get_mut(dst)) {
                    (Some(k), Some(v)) => {
                        *k = key;
                        *v = values_in[i];
                    }
                    _ => {
                        return Err(ComputeError::too_small(
                            format!("{}: output", self.name()),
                            (dst as u64 + 1) * 4,
                            keys_out.len().min(values_out.len()) as u64 * 4,
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

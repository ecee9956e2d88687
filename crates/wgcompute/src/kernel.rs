//! Kernels and their dispatches.

use crate::backend::{BufferHandle, BufferKind};
use crate::composer::ShaderDefs;
use crate::error::{ComputeError, ComputeResult};
use encase::internal::CreateFrom;
use encase::{ShaderType, UniformBuffer};

/// Maximum number of workgroups of a single dispatch along `x`.
///
/// This is the default `max_compute_workgroups_per_dimension` limit of `wgpu`.
pub const MAX_WORKGROUPS: u32 = 65_535;

/// How a kernel accesses one of its bound buffers.
///
/// Slot `i` of [`Kernel::bindings`] corresponds to `@group(0) @binding(i)` in the WGSL source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    /// `var<uniform>` parameters.
    Uniform,
    /// `var<storage, read>` buffer.
    Read,
    /// `var<storage, read_write>` buffer.
    ReadWrite,
}

impl Binding {
    /// Can the kernel write to this slot?
    pub fn is_writable(self) -> bool {
        self == Binding::ReadWrite
    }

    /// The kind of buffer this slot accepts.
    pub fn buffer_kind(self) -> BufferKind {
        match self {
            Binding::Uniform => BufferKind::Uniform,
            Binding::Read | Binding::ReadWrite => BufferKind::Storage,
        }
    }
}

/// A compute kernel with a WGSL implementation and its host emulation.
///
/// Both implementations must produce identical results for identical inputs. The WGSL source
/// must declare an entry point named `main` and use every binding listed by
/// [`Kernel::bindings`]. It is composed with `naga_oil`: it may `#import` any of
/// [`Kernel::modules`] and read any of [`Kernel::shader_defs`].
pub trait Kernel: Send + Sync {
    /// Unique name of the kernel. Also used as the pipeline cache key.
    fn name(&self) -> &'static str;

    /// Binding layout of the kernel.
    fn bindings(&self) -> &'static [Binding];

    /// WGSL source of the kernel entry point.
    fn wgsl(&self) -> &'static str;

    /// Composable WGSL modules imported by [`Kernel::wgsl`], dependencies first.
    fn modules(&self) -> &'static [&'static str] {
        &[]
    }

    /// Shader defs of the kernel and of the modules it imports.
    fn shader_defs(&self) -> ShaderDefs {
        ShaderDefs::new()
    }

    /// Runs `num_groups` workgroups of this kernel on the CPU.
    fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()>;
}

/// Buffers bound to a kernel running on the host backend.
///
/// Each slot holds the words of one bound buffer, in binding order.
pub struct HostArgs {
    kernel: &'static str,
    slots: Vec<(Binding, Vec<u32>)>,
}

impl HostArgs {
    pub(crate) fn new(kernel: &'static str, slots: Vec<(Binding, Vec<u32>)>) -> Self {
        Self { kernel, slots }
    }

    pub(crate) fn into_slots(self) -> Vec<(Binding, Vec<u32>)> {
        self.slots
    }

    /// Splits the bound buffers into `R` read-only views (uniform and read slots, in binding
    /// order) and `W` writable views (read-write slots, in binding order).
    ///
    /// # Errors
    ///
    /// Fails if the slot counts do not match `R` and `W`.
    pub fn split<const R: usize, const W: usize>(
        &mut self,
    ) -> ComputeResult<([&[u32]; R], [&mut [u32]; W])> {
        let kernel = self.kernel;
        let actual = self.slots.len();
        let count_error = || ComputeError::BindingCount {
            kernel,
            expected: R + W,
            actual,
        };

        let mut reads = Vec::with_capacity(R);
        let mut writes = Vec::with_capacity(W);

        for (binding, words) in self.slots.iter_mut() {
            if binding.is_writable() {
                writes.push(&mut words[..]);
            } else {
                reads.push(&words[..]);
            }
        }

        let reads = reads.try_into().map_err(|_| count_error())?;
        let writes = writes.try_into().map_err(|_| count_error())?;
        Ok((reads, writes))
    }

    /// Name of the kernel being run.
    pub fn kernel(&self) -> &'static str {
        self.kernel
    }
}

/// Decodes a uniform parameter struct, laid out by `encase`, from the words of a uniform buffer.
pub fn read_uniform<T: ShaderType + CreateFrom>(
    kernel: &'static str,
    words: &[u32],
) -> ComputeResult<T> {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    let size = T::min_size().get();
    if (bytes.len() as u64) < size {
        return Err(ComputeError::too_small(
            format!("{kernel}: uniform"),
            size,
            bytes.len() as u64,
        ));
    }
    UniformBuffer::new(bytes)
        .create()
        .map_err(|e| ComputeError::encoding(format!("{kernel}: uniform"), e))
}

/// Checks that a host view holds at least `required` words.
pub fn ensure_words(
    kernel: &'static str,
    what: &str,
    words: &[u32],
    required: usize,
) -> ComputeResult<()> {
    if words.len() < required {
        Err(ComputeError::too_small(
            format!("{kernel}: {what}"),
            required as u64 * 4,
            words.len() as u64 * 4,
        ))
    } else {
        Ok(())
    }
}

/// A kernel launch: the kernel, its bound buffers and the number of workgroups along `x`.
pub struct Dispatch<'a> {
    kernel: &'a dyn Kernel,
    buffers: Vec<BufferHandle>,
    num_groups: u32,
}

impl<'a> Dispatch<'a> {
    /// The dispatched kernel.
    pub fn kernel(&self) -> &'a dyn Kernel {
        self.kernel
    }

    /// Buffers bound to the kernel, in binding order.
    pub fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    /// Number of workgroups.
    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    /// Checks the dispatch against its kernel's binding layout.
    ///
    /// `kind_of` resolves the kind of a bound buffer, failing for unknown handles.
    pub fn validate(
        &self,
        mut kind_of: impl FnMut(BufferHandle) -> ComputeResult<BufferKind>,
    ) -> ComputeResult<()> {
        let name = self.kernel.name();
        let layout = self.kernel.bindings();

        if layout.len() != self.buffers.len() {
            return Err(ComputeError::BindingCount {
                kernel: name,
                expected: layout.len(),
                actual: self.buffers.len(),
            });
        }

        if self.num_groups == 0 || self.num_groups > MAX_WORKGROUPS {
            return Err(ComputeError::WorkgroupCount {
                kernel: name,
                num_groups: self.num_groups,
            });
        }

        for (slot, (binding, buffer)) in layout.iter().zip(self.buffers.iter()).enumerate() {
            let kind = kind_of(*buffer)?;
            if kind != binding.buffer_kind() {
                return Err(ComputeError::BindingKind {
                    kernel: name,
                    slot,
                    expected: binding.buffer_kind(),
                    actual: kind,
                });
            }

            if binding.is_writable() {
                let aliased = self
                    .buffers
                    .iter()
                    .enumerate()
                    .any(|(other, b)| other != slot && b == buffer);
                if aliased {
                    return Err(ComputeError::AliasedBinding {
                        kernel: name,
                        buffer: *buffer,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Builder for a [`Dispatch`].
///
/// ```ignore
/// let dispatch = KernelDispatch::new(&kernel)
///     .bind([params, input, output])
///     .dispatch(num_groups);
/// backend.run_batch(&[dispatch])?;
/// ```
pub struct KernelDispatch<'a> {
    kernel: &'a dyn Kernel,
    buffers: Vec<BufferHandle>,
}

impl<'a> KernelDispatch<'a> {
    /// Starts a dispatch of `kernel` with no bound buffers.
    pub fn new(kernel: &'a dyn Kernel) -> Self {
        Self {
            kernel,
            buffers: vec![],
        }
    }

    /// Binds `buffers` to slots `0..N`, replacing any previous binding.
    pub fn bind<const N: usize>(mut self, buffers: [BufferHandle; N]) -> Self {
        self.buffers = buffers.to_vec();
        self
    }

    /// Finishes the dispatch with `num_groups` workgroups along `x`.
    pub fn dispatch(self, num_groups: u32) -> Dispatch<'a> {
        Dispatch {
            kernel: self.kernel,
            buffers: self.buffers,
            num_groups,
        }
    }
}

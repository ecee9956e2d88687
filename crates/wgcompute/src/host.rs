//! CPU emulation of compute kernels.

use crate::backend::{BufferHandle, BufferKind, ComputeBackend};
use crate::error::{ComputeError, ComputeResult};
use crate::kernel::{Binding, Dispatch, HostArgs};

struct HostBuffer {
    kind: BufferKind,
    size: u64,
    words: Vec<u32>,
}

/// Backend running the host twin of each kernel on the CPU.
///
/// Always available, used for:
/// - machines without a GPU adapter,
/// - correctness validation (device results must match host results),
/// - deterministic tests.
///
/// Buffers are stored as `u32` words. During a dispatch, every bound buffer is moved out of the
/// buffer table and handed to [`Kernel::run_host`](crate::Kernel::run_host), then moved back.
#[derive(Default)]
pub struct HostBackend {
    buffers: Vec<Option<HostBuffer>>,
    num_dispatches: u64,
}

impl HostBackend {
    /// Creates a backend with no buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of dispatches executed so far.
    pub fn num_dispatches(&self) -> u64 {
        self.num_dispatches
    }

    fn buffer(&self, handle: BufferHandle) -> ComputeResult<&HostBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(|b| b.as_ref())
            .ok_or(ComputeError::UnknownBuffer(handle))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> ComputeResult<&mut HostBuffer> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(|b| b.as_mut())
            .ok_or(ComputeError::UnknownBuffer(handle))
    }

    fn run_dispatch(&mut self, dispatch: &Dispatch<'_>) -> ComputeResult<()> {
        let kernel = dispatch.kernel();
        let handles = dispatch.buffers();
        let mut slots: Vec<(Binding, Vec<u32>)> = Vec::with_capacity(handles.len());

        // Writable slots are never aliased, so a buffer bound twice is read-only and the
        // second slot can get a copy.
        for (slot, (binding, handle)) in kernel.bindings().iter().zip(handles).enumerate() {
            let words = match handles[..slot].iter().position(|h| h == handle) {
                Some(first) => slots[first].1.clone(),
                None => std::mem::take(&mut self.buffer_mut(*handle)?.words),
            };
            slots.push((*binding, words));
        }

        let mut args = HostArgs::new(kernel.name(), slots);
        let result = kernel.run_host(dispatch.num_groups(), &mut args);

        for (slot, (handle, (_, words))) in handles.iter().zip(args.into_slots()).enumerate() {
            if !handles[..slot].contains(handle) {
                self.buffer_mut(*handle)?.words = words;
            }
        }

        self.num_dispatches += 1;
        result
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn is_gpu(&self) -> bool {
        false
    }

    fn allocate(&mut self, size_bytes: u64, kind: BufferKind) -> ComputeResult<BufferHandle> {
        let num_words = size_bytes.div_ceil(4) as usize;
        let mut words = Vec::new();
        words
            .try_reserve_exact(num_words)
            .map_err(|e| ComputeError::Allocation {
                size: size_bytes,
                reason: e.to_string(),
            })?;
        words.resize(num_words, 0);

        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(HostBuffer {
            kind,
            size: size_bytes,
            words,
        }));
        Ok(handle)
    }

    fn release(&mut self, buffer: BufferHandle) -> ComputeResult<()> {
        self.buffer(buffer)?;
        self.buffers[buffer.0 as usize] = None;
        Ok(())
    }

    fn size_of(&self, buffer: BufferHandle) -> ComputeResult<u64> {
        self.buffer(buffer).map(|b| b.size)
    }

    fn kind_of(&self, buffer: BufferHandle) -> ComputeResult<BufferKind> {
        self.buffer(buffer).map(|b| b.kind)
    }

    fn upload(&mut self, buffer: BufferHandle, bytes: &[u8]) -> ComputeResult<()> {
        let target = self.buffer_mut(buffer)?;
        check_transfer(bytes.len() as u64, target.size)?;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut target.words);
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn download(&mut self, buffer: BufferHandle, byte_count: u64) -> ComputeResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        check_transfer(byte_count, source.size)?;
        let src: &[u8] = bytemuck::cast_slice(&source.words);
        Ok(src[..byte_count as usize].to_vec())
    }

    fn run_batch(&mut self, batch: &[Dispatch<'_>]) -> ComputeResult<()> {
        for dispatch in batch {
            dispatch.validate(|h| self.kind_of(h))?;
        }

        for dispatch in batch {
            log::trace!(
                "host: {} x{} groups",
                dispatch.kernel().name(),
                dispatch.num_groups()
            );
            self.run_dispatch(dispatch)?;
        }

        Ok(())
    }
}

pub(crate) fn check_transfer(len: u64, buffer_size: u64) -> ComputeResult<()> {
    if len % 4 != 0 {
        return Err(ComputeError::InvalidConfig(format!(
            "transfer size {len} is not a multiple of 4"
        )));
    }
    if len > buffer_size {
        return Err(ComputeError::too_small("transfer", len, buffer_size));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::HostBackend;
    use crate::kernel::{ensure_words, read_uniform, Binding, HostArgs, Kernel, KernelDispatch};
    use crate::tensor::{GpuScalar, GpuVector};
    use crate::{BackendExt, BufferKind, ComputeBackend, ComputeError, ComputeResult};

    /// `output[i] = input[i] * factor`.
    struct Scale;

    impl Kernel for Scale {
        fn name(&self) -> &'static str {
            "scale"
        }

        fn bindings(&self) -> &'static [Binding] {
            &[Binding::Uniform, Binding::Read, Binding::ReadWrite]
        }

        fn wgsl(&self) -> &'static str {
            ""
        }

        fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
            let ([factor, input], [output]) = args.split::<2, 1>()?;
            let factor: u32 = read_uniform(self.name(), factor)?;
            let len = (num_groups * 4) as usize;
            ensure_words(self.name(), "input", input, len)?;
            ensure_words(self.name(), "output", output, len)?;
            for i in 0..len {
                output[i] = input[i] * factor;
            }
            Ok(())
        }
    }

    #[test]
    fn batch_runs_in_order() {
        let mut backend = HostBackend::new();
        let factor = GpuScalar::init(&mut backend, 3u32).unwrap();
        let a = GpuVector::init(&mut backend, &[1u32, 2, 3, 4]).unwrap();
        let b = GpuVector::<u32>::uninit(&mut backend, 4).unwrap();

        let batch = [
            KernelDispatch::new(&Scale)
                .bind([factor.buffer(), a.buffer(), b.buffer()])
                .dispatch(1),
            KernelDispatch::new(&Scale)
                .bind([factor.buffer(), b.buffer(), a.buffer()])
                .dispatch(1),
        ];
        backend.run_batch(&batch).unwrap();

        assert_eq!(a.read(&mut backend).unwrap(), vec![9, 18, 27, 36]);
        assert_eq!(b.read(&mut backend).unwrap(), vec![3, 6, 9, 12]);
        assert_eq!(backend.num_dispatches(), 2);
    }

    #[test]
    fn invalid_batches_run_nothing() {
        let mut backend = HostBackend::new();
        let factor = GpuScalar::init(&mut backend, 2u32).unwrap();
        let a = GpuVector::init(&mut backend, &[1u32, 2, 3, 4]).unwrap();
        let b = GpuVector::<u32>::uninit(&mut backend, 4).unwrap();

        // The second dispatch aliases a writable slot: the first one must not run either.
        let batch = [
            KernelDispatch::new(&Scale)
                .bind([factor.buffer(), a.buffer(), b.buffer()])
                .dispatch(1),
            KernelDispatch::new(&Scale)
                .bind([factor.buffer(), a.buffer(), a.buffer()])
                .dispatch(1),
        ];
        let err = backend.run_batch(&batch).unwrap_err();
        assert!(matches!(err, ComputeError::AliasedBinding { .. }));
        assert!(err.is_config_error());

        let wrong_kind = KernelDispatch::new(&Scale)
            .bind([a.buffer(), a.buffer(), factor.buffer()])
            .dispatch(1);
        assert!(matches!(
            backend.run(wrong_kind),
            Err(ComputeError::BindingKind { slot: 0, .. })
        ));

        let missing = KernelDispatch::new(&Scale)
            .bind([factor.buffer(), a.buffer()])
            .dispatch(1);
        assert!(matches!(
            backend.run(missing),
            Err(ComputeError::BindingCount { expected: 3, actual: 2, .. })
        ));

        assert_eq!(a.read(&mut backend).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(b.read(&mut backend).unwrap(), vec![0; 4]);
        assert_eq!(backend.num_dispatches(), 0);
    }

    #[test]
    fn kernel_errors_restore_buffers() {
        let mut backend = HostBackend::new();
        let factor = GpuScalar::init(&mut backend, 2u32).unwrap();
        let a = GpuVector::init(&mut backend, &[1u32, 2, 3, 4]).unwrap();
        let b = GpuVector::<u32>::uninit(&mut backend, 4).unwrap();

        let too_many_groups = KernelDispatch::new(&Scale)
            .bind([factor.buffer(), a.buffer(), b.buffer()])
            .dispatch(2);
        let err = backend.run(too_many_groups).unwrap_err();
        assert!(matches!(err, ComputeError::BufferTooSmall { .. }));
        assert_eq!(a.read(&mut backend).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn transfers_are_bounds_checked() {
        let mut backend = HostBackend::new();
        let buf = backend.allocate(8, BufferKind::Storage).unwrap();
        assert!(backend.upload_slice(buf, &[1u32, 2, 3]).is_err());
        assert!(backend.upload(buf, &[0u8; 3]).is_err());
        backend.upload_slice(buf, &[7u32]).unwrap();
        assert_eq!(backend.download_vec::<u32>(buf, 2).unwrap(), vec![7, 0]);

        backend.release(buf).unwrap();
        assert!(matches!(
            backend.size_of(buf),
            Err(ComputeError::UnknownBuffer(_))
        ));
    }
}

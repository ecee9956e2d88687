//! Compute backend running kernels on a `wgpu` device.

use crate::backend::{BufferHandle, BufferKind, ComputeBackend};
use crate::composer::ComposerExt;
use crate::error::{ComputeError, ComputeResult};
use crate::gpu::GpuInstance;
use crate::host::check_transfer;
use crate::kernel::{Dispatch, Kernel};
use std::borrow::Cow;
use naga_oil::compose::Composer;
use std::collections::HashMap;
use wgpu::{BufferUsages, ComputePipeline, ErrorFilter};

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    size: u64,
}

/// Backend running the WGSL source of each kernel on a `wgpu` device.
///
/// Kernels are composed with `naga_oil` and compiled on first use, then cached by kernel name.
/// The composer is shared by every kernel, so a module imported by several kernels is only
/// parsed once. A batch is recorded into a
/// single compute pass; `wgpu` synchronizes storage accesses between consecutive dispatches of
/// a pass, which provides the full barrier required between batch entries.
pub struct WgpuBackend {
    gpu: GpuInstance,
    name: String,
    buffers: Vec<Option<DeviceBuffer>>,
    composer: Composer,
    pipelines: HashMap<&'static str, ComputePipeline>,
}

impl WgpuBackend {
    /// Creates a backend running on the device of `gpu`.
    pub fn new(gpu: GpuInstance) -> Self {
        let name = format!("wgpu ({:?}, {})", gpu.info().backend, gpu.info().name);
        Self {
            gpu,
            name,
            buffers: vec![],
            composer: Composer::default(),
            pipelines: HashMap::new(),
        }
    }

    /// The device and queue this backend runs on.
    pub fn gpu(&self) -> &GpuInstance {
        &self.gpu
    }

    fn buffer(&self, handle: BufferHandle) -> ComputeResult<&DeviceBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(|b| b.as_ref())
            .ok_or(ComputeError::UnknownBuffer(handle))
    }

    fn load_pipeline(&mut self, kernel: &dyn Kernel) -> ComputeResult<()> {
        let name = kernel.name();
        if self.pipelines.contains_key(name) {
            return Ok(());
        }

        let naga_module = self
            .composer
            .make_kernel_module(kernel)
            .map_err(|e| ComputeError::compose(name, e))?;

        let device = self.gpu.device();
        device.push_error_scope(ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Naga(Cow::Owned(naga_module)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ComputeError::Dispatch {
                kernel: name.to_string(),
                reason: err.to_string(),
            });
        }

        log::debug!("compiled kernel `{name}`");
        self.pipelines.insert(name, pipeline);
        Ok(())
    }

    fn wait(&self) -> ComputeResult<()> {
        self.gpu
            .device()
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| ComputeError::Wait(e.to_string()))
    }
}

impl ComputeBackend for WgpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_gpu(&self) -> bool {
        true
    }

    fn allocate(&mut self, size_bytes: u64, kind: BufferKind) -> ComputeResult<BufferHandle> {
        let usage = match kind {
            BufferKind::Storage => BufferUsages::STORAGE,
            BufferKind::Uniform => BufferUsages::UNIFORM,
        } | BufferUsages::COPY_SRC
            | BufferUsages::COPY_DST;

        if kind == BufferKind::Storage && size_bytes > self.gpu.max_storage_binding_size() {
            return Err(ComputeError::Allocation {
                size: size_bytes,
                reason: format!(
                    "larger than the maximum storage binding size ({} bytes)",
                    self.gpu.max_storage_binding_size()
                ),
            });
        }

        // Empty bindings are invalid, and uniform bindings are read in 16-byte rows.
        let padded_size = size_bytes.max(16).next_multiple_of(16);

        let device = self.gpu.device();
        device.push_error_scope(ErrorFilter::OutOfMemory);
        device.push_error_scope(ErrorFilter::Validation);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: padded_size,
            usage,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());

        if let Some(err) = validation.or(out_of_memory) {
            return Err(ComputeError::Allocation {
                size: size_bytes,
                reason: err.to_string(),
            });
        }

        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(DeviceBuffer {
            buffer,
            kind,
            size: size_bytes,
        }));
        Ok(handle)
    }

    fn release(&mut self, buffer: BufferHandle) -> ComputeResult<()> {
        self.buffer(buffer)?;
        if let Some(released) = self.buffers[buffer.0 as usize].take() {
            released.buffer.destroy();
        }
        Ok(())
    }

    fn size_of(&self, buffer: BufferHandle) -> ComputeResult<u64> {
        self.buffer(buffer).map(|b| b.size)
    }

    fn kind_of(&self, buffer: BufferHandle) -> ComputeResult<BufferKind> {
        self.buffer(buffer).map(|b| b.kind)
    }

    fn upload(&mut self, buffer: BufferHandle, bytes: &[u8]) -> ComputeResult<()> {
        let target = self.buffer(buffer)?;
        check_transfer(bytes.len() as u64, target.size)?;
        if !bytes.is_empty() {
            self.gpu.queue().write_buffer(&target.buffer, 0, bytes);
        }
        Ok(())
    }

    fn download(&mut self, buffer: BufferHandle, byte_count: u64) -> ComputeResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        check_transfer(byte_count, source.size)?;
        if byte_count == 0 {
            return Ok(vec![]);
        }

        let device = self.gpu.device();
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: byte_count,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, byte_count);
        self.gpu.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait()?;

        receiver
            .recv()
            .map_err(|e| ComputeError::Readback(e.to_string()))?
            .map_err(|e| ComputeError::Readback(e.to_string()))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    fn run_batch(&mut self, batch: &[Dispatch<'_>]) -> ComputeResult<()> {
        for dispatch in batch {
            dispatch.validate(|h| self.kind_of(h))?;
        }

        for dispatch in batch {
            self.load_pipeline(dispatch.kernel())?;
        }

        let device = self.gpu.device();
        device.push_error_scope(ErrorFilter::Validation);

        let mut bind_groups = Vec::with_capacity(batch.len());
        for dispatch in batch {
            let pipeline = &self.pipelines[dispatch.kernel().name()];
            let layout = pipeline.get_bind_group_layout(0);
            let entries = dispatch
                .buffers()
                .iter()
                .enumerate()
                .map(|(binding, handle)| {
                    Ok(wgpu::BindGroupEntry {
                        binding: binding as u32,
                        resource: self.buffer(*handle)?.buffer.as_entire_binding(),
                    })
                })
                .collect::<ComputeResult<Vec<_>>>()?;
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(dispatch.kernel().name()),
                layout: &layout,
                entries: &entries,
            }));
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("batch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("batch"),
                timestamp_writes: None,
            });

            for (dispatch, bind_group) in batch.iter().zip(bind_groups.iter()) {
                log::trace!(
                    "{}: {} x{} groups",
                    self.name,
                    dispatch.kernel().name(),
                    dispatch.num_groups()
                );
                pass.set_pipeline(&self.pipelines[dispatch.kernel().name()]);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(dispatch.num_groups(), 1, 1);
            }
        }
        self.gpu.queue().submit(Some(encoder.finish()));

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            let kernels: Vec<_> = batch.iter().map(|d| d.kernel().name()).collect();
            return Err(ComputeError::Dispatch {
                kernel: kernels.join(", "),
                reason: err.to_string(),
            });
        }

        self.wait()
    }
}

#[cfg(test)]
mod test {
    use super::WgpuBackend;
    use crate::gpu::GpuInstance;
    use crate::composer::{check_kernel, ShaderDefs};
    use crate::kernel::{read_uniform, Binding, HostArgs, Kernel, KernelDispatch};
    use crate::tensor::{GpuScalar, GpuVector};
    use crate::{ComputeBackend, ComputeError, ComputeResult, HostBackend};
    use encase::ShaderType;
    use naga_oil::compose::ShaderDefValue;

    #[derive(ShaderType, Copy, Clone, Debug)]
    struct OffsetParams {
        offset: u32,
        len: u32,
    }

    const GROUP_SIZE: &str = r#"
#define_import_path test::group_size

const GROUP_SIZE: u32 = #{GROUP_SIZE};
"#;

    /// `data[i] += offset` over a grid-stride loop.
    struct AddOffset;

    impl Kernel for AddOffset {
        fn name(&self) -> &'static str {
            "add_offset"
        }

        fn bindings(&self) -> &'static [Binding] {
            &[Binding::Uniform, Binding::ReadWrite]
        }

        fn wgsl(&self) -> &'static str {
            r#"
#import test::group_size::GROUP_SIZE

struct OffsetParams { offset: u32, len: u32 }
@group(0) @binding(0) var<uniform> params: OffsetParams;
@group(0) @binding(1) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(GROUP_SIZE)
fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    for (var i = gid.x; i < params.len; i = i + groups.x * GROUP_SIZE) {
        data[i] = data[i] + params.offset;
    }
}
"#
        }

        fn modules(&self) -> &'static [&'static str] {
            &[GROUP_SIZE]
        }

        fn shader_defs(&self) -> ShaderDefs {
            [("GROUP_SIZE".to_string(), ShaderDefValue::UInt(64))].into()
        }

        fn run_host(&self, _num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
            let ([params], [data]) = args.split::<1, 1>()?;
            let params: OffsetParams = read_uniform(self.name(), params)?;
            for v in &mut data[..params.len as usize] {
                *v += params.offset;
            }
            Ok(())
        }
    }

    fn run_add_offset(backend: &mut impl ComputeBackend) -> Vec<u32> {
        let input: Vec<u32> = (0..1000).collect();
        let params = GpuScalar::init(
            backend,
            OffsetParams {
                offset: 7,
                len: 1000,
            },
        )
        .unwrap();
        let data = GpuVector::init(backend, &input).unwrap();
        backend
            .run_batch(&[
                KernelDispatch::new(&AddOffset)
                    .bind([params.buffer(), data.buffer()])
                    .dispatch(3),
                KernelDispatch::new(&AddOffset)
                    .bind([params.buffer(), data.buffer()])
                    .dispatch(1),
            ])
            .unwrap();
        data.read(backend).unwrap()
    }

    #[test]
    fn kernel_composes() {
        check_kernel(&AddOffset).unwrap();
    }

    #[test]
    fn missing_shader_defs_are_reported() {
        struct Undefined;

        impl Kernel for Undefined {
            fn name(&self) -> &'static str {
                "undefined"
            }

            fn bindings(&self) -> &'static [Binding] {
                AddOffset.bindings()
            }

            fn wgsl(&self) -> &'static str {
                AddOffset.wgsl()
            }

            fn modules(&self) -> &'static [&'static str] {
                AddOffset.modules()
            }

            fn run_host(&self, num_groups: u32, args: &mut HostArgs) -> ComputeResult<()> {
                AddOffset.run_host(num_groups, args)
            }
        }

        let err = check_kernel(&Undefined).unwrap_err();
        assert!(matches!(err, ComputeError::Compose { kernel: "undefined", .. }));
        assert!(err.is_backend_error());
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn device_matches_host() {
        let Ok(gpu) = GpuInstance::new().await else {
            log::warn!("no gpu adapter available, skipping device test");
            return;
        };
        let mut device = WgpuBackend::new(gpu);
        let mut host = HostBackend::new();

        let expected: Vec<u32> = (0..1000).map(|i| i + 14).collect();
        assert_eq!(run_add_offset(&mut host), expected);
        assert_eq!(run_add_offset(&mut device), expected);
    }
}

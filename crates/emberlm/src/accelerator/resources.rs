//! Staging banks, the persistent bind group and the dispatch protocol.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages};

use super::context::AcceleratorContext;
use super::kernels::{bind_group_layout, Kernel, KernelParams, KernelSet};
use crate::dims::ModelDims;
use crate::error::EngineError;

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Input staging banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bank {
    /// Vector operand (binding 1).
    A,
    /// Matrix operand (binding 2).
    B,
    /// Vector operand (binding 3).
    C,
    /// Vector operand (binding 4).
    D,
}

/// Where a slice of a result bank lands on the host.
pub(crate) struct Readback<'a> {
    pub dst: &'a mut [f32],
    /// First element of the result bank to copy.
    pub offset: usize,
}

impl<'a> Readback<'a> {
    pub fn whole(dst: &'a mut [f32]) -> Self {
        Self { dst, offset: 0 }
    }
}

pub(crate) struct AcceleratorResources {
    context: Arc<AcceleratorContext>,
    kernels: KernelSet,
    params: Buffer,
    bank_a: Buffer,
    bank_b: Buffer,
    bank_c: Buffer,
    bank_d: Buffer,
    result: Buffer,
    result2: Buffer,
    readback: Buffer,
    bind_group: wgpu::BindGroup,
    vector_capacity: usize,
    matrix_capacity: usize,
}

fn storage_buffer(device: &wgpu::Device, label: &str, elements: usize, usage: BufferUsages) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: elements as u64 * F32_BYTES,
        usage,
        mapped_at_creation: false,
    })
}

impl AcceleratorResources {
    /// Builds every pipeline and allocates banks sized for `dims`.
    ///
    /// Shader or pipeline validation errors surface as
    /// [`EngineError::AcceleratorUnavailable`].
    pub async fn new(context: Arc<AcceleratorContext>, dims: &ModelDims) -> Result<Self> {
        dims.validate()?;
        let vector_capacity = dims.max_vector_len();
        let matrix_capacity = dims.max_matrix_len();

        let matrix_bytes = matrix_capacity as u64 * F32_BYTES;
        if matrix_bytes > context.max_binding_bytes() {
            return Err(EngineError::AcceleratorUnavailable(format!(
                "matrix bank needs {} bytes, adapter binds at most {}",
                matrix_bytes,
                context.max_binding_bytes()
            ))
            .into());
        }

        let device = &context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let layout = bind_group_layout(device);
        let kernels = KernelSet::new(device, &layout);

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: bytemuck::cast_slice(&[KernelParams::default()]),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });
        let input_usage = BufferUsages::STORAGE | BufferUsages::COPY_DST;
        let output_usage = BufferUsages::STORAGE | BufferUsages::COPY_SRC;
        let bank_a = storage_buffer(device, "Bank A", vector_capacity, input_usage);
        let bank_b = storage_buffer(device, "Bank B", matrix_capacity, input_usage);
        let bank_c = storage_buffer(device, "Bank C", vector_capacity, input_usage);
        // cos and sin rows back to back.
        let bank_d = storage_buffer(device, "Bank D", vector_capacity.max(2 * dims.rotary_width()), input_usage);
        let result = storage_buffer(device, "Result", vector_capacity, output_usage);
        let result2 = storage_buffer(device, "Result 2", vector_capacity, output_usage);
        let readback = storage_buffer(
            device,
            "Readback",
            2 * vector_capacity,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        );

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Kernel Bind Group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: bank_a.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: bank_b.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: bank_c.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: bank_d.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: result.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 6, resource: result2.as_entire_binding() },
            ],
        });

        if let Some(err) = device.pop_error_scope().await {
            return Err(EngineError::AcceleratorUnavailable(format!("kernel build failed: {err}")).into());
        }

        log::info!(
            "accelerator banks: vector={} floats, matrix={} floats ({:.2}MB)",
            vector_capacity,
            matrix_capacity,
            matrix_bytes as f64 / 1_048_576.0
        );

        Ok(Self {
            context,
            kernels,
            params,
            bank_a,
            bank_b,
            bank_c,
            bank_d,
            result,
            result2,
            readback,
            bind_group,
            vector_capacity,
            matrix_capacity,
        })
    }

    fn bank(&self, bank: Bank) -> (&Buffer, usize) {
        match bank {
            Bank::A => (&self.bank_a, self.vector_capacity),
            Bank::B => (&self.bank_b, self.matrix_capacity),
            Bank::C => (&self.bank_c, self.vector_capacity),
            Bank::D => (&self.bank_d, self.bank_d.size() as usize / F32_BYTES as usize),
        }
    }

    /// Phase (a): copies a host operand into a staging bank.
    pub fn stage(&self, kernel: Kernel, bank: Bank, data: &[f32]) -> Result<()> {
        let (buffer, capacity) = self.bank(bank);
        if data.len() > capacity {
            return Err(EngineError::shape(
                kernel.label(),
                format!("operand of at most {capacity} elements for bank {bank:?}"),
                format!("operand of {} elements", data.len()),
            )
            .into());
        }
        if !data.is_empty() {
            self.context
                .queue
                .write_buffer(buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    /// Phases (b) to (d): submits `kernel` as one task, copies the requested
    /// result ranges back and blocks until the device has finished.
    pub fn dispatch(
        &self,
        kernel: Kernel,
        params: KernelParams,
        workgroups: u32,
        primary: Readback<'_>,
        secondary: Option<Readback<'_>>,
    ) -> Result<()> {
        for rb in std::iter::once(&primary).chain(secondary.as_ref()) {
            if rb.offset + rb.dst.len() > self.vector_capacity {
                return Err(EngineError::shape(
                    kernel.label(),
                    format!("result within {} elements", self.vector_capacity),
                    format!("result range {}..{}", rb.offset, rb.offset + rb.dst.len()),
                )
                .into());
            }
        }
        log::trace!(
            "dispatch {}: {} workgroups, {:?}",
            kernel.label(),
            workgroups,
            params
        );

        let queue = &self.context.queue;
        queue.write_buffer(&self.params, 0, bytemuck::cast_slice(&[params]));

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.label()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.kernels.get(kernel));
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }

        let secondary_base = self.vector_capacity as u64 * F32_BYTES;
        let copies = [
            Some((&self.result, &primary, 0u64)),
            secondary.as_ref().map(|rb| (&self.result2, rb, secondary_base)),
        ];
        for (source, rb, dst_base) in copies.into_iter().flatten() {
            if rb.dst.is_empty() {
                continue;
            }
            encoder.copy_buffer_to_buffer(
                source,
                rb.offset as u64 * F32_BYTES,
                &self.readback,
                dst_base,
                rb.dst.len() as u64 * F32_BYTES,
            );
        }
        queue.submit(std::iter::once(encoder.finish()));

        self.wait_for_readback(kernel)?;

        {
            let view = self.readback.slice(..).get_mapped_range();
            let floats: &[f32] = bytemuck::cast_slice(&view);
            let Readback { dst, .. } = primary;
            let len = dst.len();
            dst.copy_from_slice(&floats[..len]);
            if let Some(Readback { dst, .. }) = secondary {
                let base = self.vector_capacity;
                let len = dst.len();
                dst.copy_from_slice(&floats[base..base + len]);
            }
        }
        self.readback.unmap();
        Ok(())
    }

    fn wait_for_readback(&self, kernel: Kernel) -> Result<()> {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        self.readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });

        self.context
            .device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| EngineError::AcceleratorDispatch {
                kernel: kernel.label(),
                reason: format!("device poll failed: {e:?}"),
            })?;

        rx.try_recv()
            .map_err(|_| anyhow!("readback mapping did not complete"))?
            .map_err(|e| EngineError::AcceleratorDispatch {
                kernel: kernel.label(),
                reason: format!("readback mapping failed: {e:?}"),
            })?;
        Ok(())
    }
}

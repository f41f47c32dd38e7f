//! Compute pipelines, one per primitive, sharing a single bind group layout.
//!
//! | binding | kind              | contents                               |
//! |---------|-------------------|----------------------------------------|
//! | 0       | uniform           | [`KernelParams`]                       |
//! | 1       | storage, read     | vector bank A                          |
//! | 2       | storage, read     | matrix bank B                          |
//! | 3       | storage, read     | vector bank C                          |
//! | 4       | storage, read     | vector bank D                          |
//! | 5       | storage, rw       | result bank                            |
//! | 6       | storage, rw       | second result bank (RoPE keys)         |
//!
//! Inputs and outputs never share a bank.

use wgpu::ShaderModuleDescriptor;

/// Workgroup width of the per-output-index kernels.
pub(crate) const ELEMENTWISE_WORKGROUP: u32 = 64;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct KernelParams {
    pub len: u32,
    pub rows: u32,
    pub cols: u32,
    pub head_begin: u32,
    pub head_dim: u32,
    pub stride: u32,
    pub eps: f32,
    pub _padding: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kernel {
    Matmul,
    Mul,
    Add,
    RmsNorm,
    Softmax,
    Rope,
    Silu,
    AttentionScores,
    AttentionValues,
}

impl Kernel {
    pub const ALL: [Kernel; 9] = [
        Kernel::Matmul,
        Kernel::Mul,
        Kernel::Add,
        Kernel::RmsNorm,
        Kernel::Softmax,
        Kernel::Rope,
        Kernel::Silu,
        Kernel::AttentionScores,
        Kernel::AttentionValues,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Kernel::Matmul => "matmul",
            Kernel::Mul => "mul",
            Kernel::Add => "add",
            Kernel::RmsNorm => "rms_norm",
            Kernel::Softmax => "softmax",
            Kernel::Rope => "rope",
            Kernel::Silu => "silu",
            Kernel::AttentionScores => "attention_scores",
            Kernel::AttentionValues => "attention_values",
        }
    }

    fn shader(&self) -> ShaderModuleDescriptor<'static> {
        match self {
            Kernel::Matmul => wgpu::include_wgsl!("shaders/matmul.wgsl"),
            Kernel::Mul => wgpu::include_wgsl!("shaders/mul.wgsl"),
            Kernel::Add => wgpu::include_wgsl!("shaders/add.wgsl"),
            Kernel::RmsNorm => wgpu::include_wgsl!("shaders/rms_norm.wgsl"),
            Kernel::Softmax => wgpu::include_wgsl!("shaders/softmax.wgsl"),
            Kernel::Rope => wgpu::include_wgsl!("shaders/rope.wgsl"),
            Kernel::Silu => wgpu::include_wgsl!("shaders/silu.wgsl"),
            Kernel::AttentionScores => wgpu::include_wgsl!("shaders/attention_scores.wgsl"),
            Kernel::AttentionValues => wgpu::include_wgsl!("shaders/attention_values.wgsl"),
        }
    }

    /// Workgroups needed for `outputs` independent output elements.
    pub fn workgroups_for(&self, outputs: usize) -> u32 {
        match self {
            // Single-workgroup reductions.
            Kernel::RmsNorm | Kernel::Softmax => 1,
            _ => (outputs as u32).div_ceil(ELEMENTWISE_WORKGROUP),
        }
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Kernel Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, true),
            storage_entry(4, true),
            storage_entry(5, false),
            storage_entry(6, false),
        ],
    })
}

/// Compiled pipelines indexed by [`Kernel`].
pub(crate) struct KernelSet {
    pipelines: Vec<wgpu::ComputePipeline>,
}

impl KernelSet {
    pub fn new(device: &wgpu::Device, layout: &wgpu::BindGroupLayout) -> Self {
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Kernel Pipeline Layout"),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });

        let pipelines = Kernel::ALL
            .iter()
            .map(|kernel| {
                let module = device.create_shader_module(kernel.shader());
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.label()),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();
        Self { pipelines }
    }

    pub fn get(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        &self.pipelines[kernel as usize]
    }
}

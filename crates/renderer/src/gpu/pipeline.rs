use wgpu::naga::ShaderStage;

use crate::compile::{
    assemble_fragment, create_glsl_module, parse_glsl, reflect_uniforms, ProgramError,
    UNIFORM_BINDING, VERTEX_SHADER_GLSL,
};

use super::target::TARGET_FORMAT;
use super::uniforms::UniformBindings;

/// Minimum uniform buffer size; also the rounding granularity for std140 blocks.
const UNIFORM_BLOCK_ALIGN: u64 = 16;

pub(crate) struct UniformBlock {
    pub buffer: wgpu::Buffer,
    pub bind_group: wgpu::BindGroup,
}

/// Linked render pipeline plus the uniform state resolved for it.
pub(crate) struct GpuProgram {
    pub pipeline: wgpu::RenderPipeline,
    pub uniform_block: Option<UniformBlock>,
    pub bindings: UniformBindings,
}

impl GpuProgram {
    /// Compiles the full-screen vertex stage and `fragment_source`, reflects
    /// the uniform block, and links them into a pipeline targeting the
    /// offscreen format.
    pub(crate) fn link(device: &wgpu::Device, fragment_source: &str) -> Result<Self, ProgramError> {
        let assembled = assemble_fragment(fragment_source);
        tracing::debug!(
            wrapped = assembled.wrapped,
            bytes = assembled.text.len(),
            "assembled fragment shader"
        );

        parse_glsl(ShaderStage::Vertex, VERTEX_SHADER_GLSL)?;
        let fragment_ir = parse_glsl(ShaderStage::Fragment, &assembled.text).inspect_err(|_| {
            tracing::debug!(source = %assembled.text, "fragment shader source");
        })?;
        let reflection = reflect_uniforms(&fragment_ir)?;
        let block_size = reflection
            .span
            .max(reflection.bindings.required_span())
            .next_multiple_of(UNIFORM_BLOCK_ALIGN);
        tracing::debug!(
            uniforms = ?reflection.bindings.slots().collect::<Vec<_>>(),
            block_size,
            "resolved uniform bindings"
        );

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let vertex_module = create_glsl_module(
            device,
            "fullscreen triangle vertex",
            ShaderStage::Vertex,
            VERTEX_SHADER_GLSL,
        );
        let fragment_module = create_glsl_module(
            device,
            "effect fragment",
            ShaderStage::Fragment,
            &assembled.text,
        );

        let uniform_layout = (block_size > 0).then(|| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("uniform layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: UNIFORM_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            })
        });
        let bind_group_layouts: Vec<&wgpu::BindGroupLayout> = uniform_layout.iter().collect();

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("effect pipeline layout"),
            bind_group_layouts: &bind_group_layouts,
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("effect pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some("main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some("main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });

        let uniform_block = uniform_layout.map(|layout| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("uniform buffer"),
                size: block_size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("uniform bind group"),
                layout: &layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: UNIFORM_BINDING,
                    resource: buffer.as_entire_binding(),
                }],
            });
            UniformBlock { buffer, bind_group }
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(ProgramError::Link {
                log: error.to_string(),
            });
        }

        Ok(Self {
            pipeline,
            uniform_block,
            bindings: reflection.bindings,
        })
    }
}

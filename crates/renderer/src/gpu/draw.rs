use super::pipeline::GpuProgram;
use super::target::RenderTarget;
use super::uniforms::{write_uniforms, UniformValues};

/// Records one full-screen pass into `encoder`.
///
/// Clears the target to opaque black, uploads only the uniforms the program
/// declares, and draws the three-vertex triangle that covers the viewport.
pub(crate) fn encode_draw(
    encoder: &mut wgpu::CommandEncoder,
    queue: &wgpu::Queue,
    program: &GpuProgram,
    target: &RenderTarget,
    values: &UniformValues,
) {
    if let Some(block) = program.uniform_block.as_ref() {
        write_uniforms(queue, &block.buffer, &program.bindings, values);
    }

    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("effect pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: &target.view,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        occlusion_query_set: None,
        timestamp_writes: None,
    });
    render_pass.set_viewport(
        0.0,
        0.0,
        target.size.width as f32,
        target.size.height as f32,
        0.0,
        1.0,
    );
    render_pass.set_pipeline(&program.pipeline);
    if let Some(block) = program.uniform_block.as_ref() {
        render_pass.set_bind_group(0, &block.bind_group, &[]);
    }
    render_pass.draw(0..3, 0..1);
}

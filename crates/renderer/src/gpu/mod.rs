//! Headless GPU path from shader text to pixels in host memory.
//!
//! - `context` creates the instance, adapter, and device without a surface and
//!   routes asynchronous API errors through the configured policy.
//! - `target` owns the fixed-size offscreen color texture.
//! - `pipeline` links the wrapped GLSL into a render pipeline and resolves
//!   which standard uniforms the shader actually reads.
//! - `uniforms` maps those uniforms to byte offsets and writes them per frame.
//! - `draw` records the clear plus full-screen triangle.
//! - `readback` rotates transfer buffers so a frame's copy is mapped only after
//!   later frames have been queued behind it.
//! - `session` ties the pieces together for one run.

mod context;
mod draw;
mod pipeline;
mod readback;
mod session;
mod target;
mod uniforms;

pub use context::AdapterProfile;
pub use readback::{
    padded_row_bytes, Collection, ReadbackError, ReadbackStats, RingSchedule,
};
pub use session::{RenderSession, RunSummary};
pub use uniforms::{UniformBindings, UniformLocation, UniformSlot, UniformValues};

use std::collections::BTreeMap;
use std::fmt;

use crate::runtime::TimeSample;
use crate::types::RenderSize;

/// Standard inputs the draw pass knows how to feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UniformSlot {
    /// `float iTime`
    Time,
    /// `vec3 iResolution`
    Resolution,
    /// `int iFrame`
    Frame,
}

impl UniformSlot {
    pub const ALL: [UniformSlot; 3] = [
        UniformSlot::Time,
        UniformSlot::Resolution,
        UniformSlot::Frame,
    ];

    pub fn glsl_name(self) -> &'static str {
        match self {
            UniformSlot::Time => "iTime",
            UniformSlot::Resolution => "iResolution",
            UniformSlot::Frame => "iFrame",
        }
    }

    pub fn glsl_type(self) -> &'static str {
        match self {
            UniformSlot::Time => "float",
            UniformSlot::Resolution => "vec3",
            UniformSlot::Frame => "int",
        }
    }

    /// Matches a uniform block member, accepting the underscore-prefixed
    /// spelling the injected header uses.
    pub fn from_member_name(name: &str) -> Option<Self> {
        let bare = name.strip_prefix('_').unwrap_or(name);
        Self::ALL.into_iter().find(|slot| slot.glsl_name() == bare)
    }

    fn byte_len(self) -> u64 {
        match self {
            UniformSlot::Time | UniformSlot::Frame => 4,
            UniformSlot::Resolution => 12,
        }
    }
}

impl fmt::Display for UniformSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.glsl_name())
    }
}

/// Byte offset of a uniform inside the shader's uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    pub offset: u64,
}

/// Uniforms resolved at link time. A slot missing from the map is not
/// declared by the shader and is never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformBindings {
    locations: BTreeMap<UniformSlot, UniformLocation>,
}

impl UniformBindings {
    pub fn insert(&mut self, slot: UniformSlot, location: UniformLocation) {
        self.locations.insert(slot, location);
    }

    pub fn location(&self, slot: UniformSlot) -> Option<UniformLocation> {
        self.locations.get(&slot).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = UniformSlot> + '_ {
        self.locations.keys().copied()
    }

    /// Smallest block size that covers every bound slot.
    pub fn required_span(&self) -> u64 {
        self.locations
            .iter()
            .map(|(slot, location)| location.offset + slot.byte_len())
            .max()
            .unwrap_or(0)
    }

    /// Serialises the values of every bound slot.
    pub fn plan_writes(&self, values: &UniformValues) -> Vec<UniformWrite> {
        self.locations
            .iter()
            .map(|(slot, location)| UniformWrite {
                slot: *slot,
                offset: location.offset,
                bytes: values.bytes_for(*slot),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformWrite {
    pub slot: UniformSlot,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Per-frame uniform values, before they are filtered by [`UniformBindings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformValues {
    pub time: f32,
    pub resolution: [f32; 3],
    pub frame: i32,
}

impl UniformValues {
    pub fn new(sample: TimeSample, size: RenderSize) -> Self {
        Self {
            time: sample.seconds,
            resolution: [size.width as f32, size.height as f32, 1.0],
            frame: sample.frame_index.min(i32::MAX as u64) as i32,
        }
    }

    fn bytes_for(&self, slot: UniformSlot) -> Vec<u8> {
        match slot {
            UniformSlot::Time => bytemuck::bytes_of(&self.time).to_vec(),
            UniformSlot::Resolution => bytemuck::cast_slice(&self.resolution).to_vec(),
            UniformSlot::Frame => bytemuck::bytes_of(&self.frame).to_vec(),
        }
    }
}

/// Pushes the bound uniforms through the queue; they land before the next
/// submission executes.
pub(crate) fn write_uniforms(
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    bindings: &UniformBindings,
    values: &UniformValues,
) {
    for write in bindings.plan_writes(values) {
        queue.write_buffer(buffer, write.offset, &write.bytes);
    }
}

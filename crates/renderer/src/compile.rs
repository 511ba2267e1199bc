use std::borrow::Cow;
use std::collections::BTreeSet;

use thiserror::Error;
use wgpu::naga::front::glsl::{Frontend, Options};
use wgpu::naga::{
    self, AddressSpace, Expression, GlobalVariable, Handle, Module, ShaderStage, TypeInner,
};

use crate::gpu::{UniformBindings, UniformLocation, UniformSlot};

/// Marker that identifies ShaderToy-style effect code.
pub const ENTRY_MARKER: &str = "void mainImage";

const VERSION_DIRECTIVE: &str = "#version";

/// Uniform blocks are expected at this (group, binding) pair.
pub(crate) const UNIFORM_GROUP: u32 = 0;
pub(crate) const UNIFORM_BINDING: u32 = 0;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("failed to compile {stage} shader:\n{log}")]
    Compile { stage: &'static str, log: String },

    #[error("failed to link shader program:\n{log}")]
    Link { log: String },

    #[error("uniform `{name}` must be declared as `{expected}`")]
    UniformType { name: String, expected: &'static str },
}

/// Fragment text ready for compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFragment {
    pub text: String,
    /// True when the header and trailer were injected around the source.
    pub wrapped: bool,
}

/// Decides whether `source` needs the ShaderToy prelude.
///
/// Sources that carry their own `#version`, or that do not define
/// `mainImage`, are already complete programs and pass through untouched.
/// Everything else becomes `HEADER + source + TRAILER`.
pub fn assemble_fragment(source: &str) -> AssembledFragment {
    if source.contains(VERSION_DIRECTIVE) || !source.contains(ENTRY_MARKER) {
        return AssembledFragment {
            text: source.to_string(),
            wrapped: false,
        };
    }

    let mut text = String::with_capacity(HEADER.len() + source.len() + TRAILER.len() + 1);
    text.push_str(HEADER);
    text.push_str(source);
    if !source.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(TRAILER);
    AssembledFragment {
        text,
        wrapped: true,
    }
}

/// Runs naga's GLSL frontend so compile errors surface with a readable log.
pub(crate) fn parse_glsl(stage: ShaderStage, source: &str) -> Result<Module, ProgramError> {
    let mut frontend = Frontend::default();
    frontend
        .parse(&Options::from(stage), source)
        .map_err(|errors| ProgramError::Compile {
            stage: stage_name(stage),
            log: errors.to_string(),
        })
}

fn stage_name(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vertex",
        ShaderStage::Fragment => "fragment",
        _ => "compute",
    }
}

/// Uniform block layout recovered from a parsed fragment module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformReflection {
    pub bindings: UniformBindings,
    /// Size in bytes of the block at (0, 0); zero when the shader has none.
    pub span: u64,
}

/// Locates the uniform block at set 0 / binding 0 and maps the members the
/// shader reads onto [`UniformSlot`]s.
///
/// Every recognised member is type-checked, but only members some function
/// accesses get a location; the rest behave like an inactive GL uniform.
pub(crate) fn reflect_uniforms(module: &Module) -> Result<UniformReflection, ProgramError> {
    let mut reflection = UniformReflection::default();

    let block = module.global_variables.iter().find(|(_, global)| {
        global.space == AddressSpace::Uniform
            && global.binding.as_ref().is_some_and(|binding| {
                binding.group == UNIFORM_GROUP && binding.binding == UNIFORM_BINDING
            })
    });
    let Some((block_handle, global)) = block else {
        return Ok(reflection);
    };

    let TypeInner::Struct { members, span } = &module.types[global.ty].inner else {
        return Ok(reflection);
    };
    reflection.span = u64::from(*span);
    let accessed = accessed_members(module, block_handle);

    for (index, member) in members.iter().enumerate() {
        let Some(name) = member.name.as_deref() else {
            continue;
        };
        let Some(slot) = UniformSlot::from_member_name(name) else {
            tracing::trace!(member = name, "ignoring unrecognised uniform member");
            continue;
        };
        if !member_type_matches(slot, &module.types[member.ty].inner) {
            return Err(ProgramError::UniformType {
                name: name.to_string(),
                expected: slot.glsl_type(),
            });
        }
        if !accessed.contains(&(index as u32)) {
            tracing::trace!(member = name, "uniform declared but never read");
            continue;
        }
        reflection.bindings.insert(
            slot,
            UniformLocation {
                offset: u64::from(member.offset),
            },
        );
    }

    Ok(reflection)
}

/// Member indices of `block` reached through `AccessIndex` in any function
/// or entry point of the module.
fn accessed_members(module: &Module, block: Handle<GlobalVariable>) -> BTreeSet<u32> {
    let functions = module
        .functions
        .iter()
        .map(|(_, function)| function)
        .chain(module.entry_points.iter().map(|entry| &entry.function));

    let mut accessed = BTreeSet::new();
    for function in functions {
        for (_, expression) in function.expressions.iter() {
            let Expression::AccessIndex { base, index } = *expression else {
                continue;
            };
            if matches!(function.expressions[base], Expression::GlobalVariable(handle) if handle == block)
            {
                accessed.insert(index);
            }
        }
    }
    accessed
}

fn member_type_matches(slot: UniformSlot, inner: &TypeInner) -> bool {
    match (slot, inner) {
        (UniformSlot::Time, TypeInner::Scalar(scalar)) => *scalar == naga::Scalar::F32,
        (UniformSlot::Frame, TypeInner::Scalar(scalar)) => *scalar == naga::Scalar::I32,
        (
            UniformSlot::Resolution,
            TypeInner::Vector {
                size: naga::VectorSize::Tri,
                scalar,
            },
        ) => *scalar == naga::Scalar::F32,
        _ => false,
    }
}

pub(crate) fn create_glsl_module(
    device: &wgpu::Device,
    label: &str,
    stage: ShaderStage,
    text: &str,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(text.to_string()),
            stage,
            defines: &[],
        },
    })
}

/// GLSL prologue injected ahead of ShaderToy effect code.
///
/// The block members are underscore-prefixed and aliased by macros so the
/// effect code can use the bare ShaderToy names.
pub const HEADER: &str = r"#version 450
layout(std140, set = 0, binding = 0) uniform ToyParams {
    vec3 _iResolution;
    float _iTime;
    int _iFrame;
} toy;

#define iResolution toy._iResolution
#define iTime toy._iTime
#define iFrame toy._iFrame

layout(location = 0) out vec4 _fragColor;
";

/// GLSL epilogue that hands raw fragment coordinates to `mainImage`.
pub const TRAILER: &str = r"void main() { mainImage(_fragColor, gl_FragCoord.xy); }
";

/// Full-screen triangle in clip space; covers the viewport with one primitive.
pub const VERTEX_SHADER_GLSL: &str = r"#version 450

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -1.0),
    vec2(3.0, -1.0),
    vec2(-1.0, 3.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    gl_Position = vec4(positions[vertex_index], 0.0, 1.0);
}
";

/// Animated gradient rendered when no fragment shader file is given.
pub const BUILTIN_EFFECT: &str = r"void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    vec2 uv = fragCoord.xy / iResolution.xy;
    vec3 col = 0.5 + 0.5 * cos(float(iFrame) * 0.16 + uv.xyx + vec3(0.0, 2.0, 4.0));
    fragColor = vec4(col, 1.0);
}
";

#[cfg(test)]
mod tests {
    use super::*;

    const SOLID: &str = "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0, 0.0, 0.0, 1.0);\n}\n";

    #[test]
    fn source_without_marker_is_verbatim() {
        let source = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(1.0); }\n";
        let assembled = assemble_fragment(source);
        assert!(!assembled.wrapped);
        assert_eq!(assembled.text, source);

        let no_version = "void main() {}\n";
        assert_eq!(assemble_fragment(no_version).text, no_version);
    }

    #[test]
    fn versioned_effect_is_verbatim() {
        let source = format!("#version 450\n{SOLID}");
        let assembled = assemble_fragment(&source);
        assert!(!assembled.wrapped);
        assert_eq!(assembled.text, source);
    }

    #[test]
    fn effect_gets_header_body_trailer_in_order() {
        let assembled = assemble_fragment(SOLID);
        assert!(assembled.wrapped);
        assert_eq!(assembled.text, format!("{HEADER}{SOLID}{TRAILER}"));
    }

    #[test]
    fn missing_trailing_newline_is_patched() {
        let body = SOLID.trim_end();
        let assembled = assemble_fragment(body);
        assert_eq!(assembled.text, format!("{HEADER}{body}\n{TRAILER}"));
    }

    #[test]
    fn wrapped_effect_binds_only_the_uniforms_it_reads() {
        let assembled = assemble_fragment(BUILTIN_EFFECT);
        let module = parse_glsl(ShaderStage::Fragment, &assembled.text).expect("parse");
        let reflection = reflect_uniforms(&module).expect("reflect");
        assert_eq!(
            reflection.bindings.location(UniformSlot::Resolution),
            Some(UniformLocation { offset: 0 })
        );
        assert_eq!(reflection.bindings.location(UniformSlot::Time), None);
        assert_eq!(
            reflection.bindings.location(UniformSlot::Frame),
            Some(UniformLocation { offset: 16 })
        );
        assert!(reflection.span >= reflection.bindings.required_span());
    }

    #[test]
    fn effect_reading_every_uniform_binds_header_offsets() {
        let effect = r"void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    vec2 uv = fragCoord / iResolution.xy;
    fragColor = vec4(uv, fract(iTime + float(iFrame)), 1.0);
}
";
        let assembled = assemble_fragment(effect);
        let module = parse_glsl(ShaderStage::Fragment, &assembled.text).expect("parse");
        let bindings = reflect_uniforms(&module).expect("reflect").bindings;
        assert_eq!(
            bindings.location(UniformSlot::Resolution),
            Some(UniformLocation { offset: 0 })
        );
        assert_eq!(
            bindings.location(UniformSlot::Time),
            Some(UniformLocation { offset: 12 })
        );
        assert_eq!(
            bindings.location(UniformSlot::Frame),
            Some(UniformLocation { offset: 16 })
        );
    }

    #[test]
    fn frame_only_effect_leaves_time_and_resolution_unbound() {
        let effect = r"void mainImage(out vec4 fragColor, in vec2 fragCoord) {
    fragColor = vec4(float(iFrame) / 255.0, 0.0, 0.0, 1.0);
}
";
        let assembled = assemble_fragment(effect);
        let module = parse_glsl(ShaderStage::Fragment, &assembled.text).expect("parse");
        let bindings = reflect_uniforms(&module).expect("reflect").bindings;
        assert_eq!(bindings.slots().collect::<Vec<_>>(), vec![UniformSlot::Frame]);
    }

    #[test]
    fn effect_without_uniforms_binds_nothing() {
        let assembled = assemble_fragment(SOLID);
        let module = parse_glsl(ShaderStage::Fragment, &assembled.text).expect("parse");
        let reflection = reflect_uniforms(&module).expect("reflect");
        assert!(reflection.bindings.is_empty());
        assert!(reflection.span >= 20);
    }

    #[test]
    fn verbatim_shader_without_block_has_no_uniforms() {
        let source = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() { c = vec4(0.0, 1.0, 0.0, 1.0); }\n";
        let module = parse_glsl(ShaderStage::Fragment, source).expect("parse");
        let reflection = reflect_uniforms(&module).expect("reflect");
        assert!(reflection.bindings.is_empty());
        assert_eq!(reflection.span, 0);
    }

    #[test]
    fn partial_block_binds_only_declared_members() {
        let source = r"#version 450
layout(std140, set = 0, binding = 0) uniform Params {
    float iTime;
} params;
layout(location = 0) out vec4 c;
void main() { c = vec4(params.iTime); }
";
        let module = parse_glsl(ShaderStage::Fragment, source).expect("parse");
        let reflection = reflect_uniforms(&module).expect("reflect");
        assert!(reflection.bindings.location(UniformSlot::Time).is_some());
        assert!(reflection.bindings.location(UniformSlot::Frame).is_none());
        assert!(reflection.bindings.location(UniformSlot::Resolution).is_none());
    }

    #[test]
    fn mistyped_uniform_is_rejected() {
        let source = r"#version 450
layout(std140, set = 0, binding = 0) uniform Params {
    float iFrame;
} params;
layout(location = 0) out vec4 c;
void main() { c = vec4(params.iFrame); }
";
        let module = parse_glsl(ShaderStage::Fragment, source).expect("parse");
        let err = reflect_uniforms(&module).unwrap_err();
        assert!(matches!(
            err,
            ProgramError::UniformType { ref name, expected: "int" } if name == "iFrame"
        ));
    }

    #[test]
    fn malformed_effect_reports_compile_log() {
        let assembled = assemble_fragment(
            "void mainImage(out vec4 fragColor, in vec2 fragCoord) { fragColor = nope; }",
        );
        let err = parse_glsl(ShaderStage::Fragment, &assembled.text).unwrap_err();
        match err {
            ProgramError::Compile { stage, log } => {
                assert_eq!(stage, "fragment");
                assert!(!log.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn vertex_shader_parses() {
        parse_glsl(ShaderStage::Vertex, VERTEX_SHADER_GLSL).expect("vertex shader");
    }
}

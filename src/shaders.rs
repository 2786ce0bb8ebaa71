//! GLSL shader sources and compilation helpers.
//!
//! The sprite shaders target GLSL 3.30 (OpenGL 3.3) for integer vertex
//! attributes and explicit attribute locations.

use glow::HasContext;

use crate::sprite_batch::MAX_SPRITES_PER_BATCH;

/// Vertex shader for sprite quads.
///
/// Positions arrive in clip space, so there are no transform uniforms. The
/// source index is passed through `flat` so every fragment of a sprite samples
/// the same source.
///
/// # Attributes
///
/// | Location | Name              | Type   |
/// |----------|-------------------|--------|
/// | 0        | `a_position`      | `vec4` |
/// | 1        | `a_color`         | `vec4` |
/// | 2        | `a_tex_coord`     | `vec2` |
/// | 3        | `a_texture_index` | `uint` |
pub const SPRITE_VERTEX_SRC: &str = r"#version 330 core

layout(location = 0) in vec4 a_position;
layout(location = 1) in vec4 a_color;
layout(location = 2) in vec2 a_tex_coord;
layout(location = 3) in uint a_texture_index;

out vec4 v_color;
out vec2 v_tex_coord;
flat out uint v_texture_index;

void main() {
    v_color = a_color;
    // GL textures store their bottom row first.
    v_tex_coord = vec2(a_tex_coord.x, 1.0 - a_tex_coord.y);
    v_texture_index = a_texture_index;
    gl_Position = a_position;
}
";

/// Fragment shader for sprite quads.
///
/// GLSL 3.30 only allows constant indices into sampler arrays, so the source
/// is selected with one branch per slot. Sources hold premultiplied alpha; the
/// straight-alpha tint is premultiplied before it is applied.
///
/// # Uniforms
///
/// | Name        | Type            | Description                      |
/// |-------------|-----------------|----------------------------------|
/// | `u_sources` | `sampler2D[16]` | Texture unit `i` in slot `i`     |
#[must_use]
pub fn sprite_fragment_src() -> String {
    let mut src = format!(
        r"#version 330 core

in vec4 v_color;
in vec2 v_tex_coord;
flat in uint v_texture_index;

uniform sampler2D u_sources[{MAX_SPRITES_PER_BATCH}];

out vec4 frag_color;

vec4 sample_source() {{
"
    );
    for slot in 0..MAX_SPRITES_PER_BATCH {
        src.push_str(&format!(
            "    if (v_texture_index == {slot}u) return texture(u_sources[{slot}], v_tex_coord);\n"
        ));
    }
    src.push_str(
        r"    return vec4(0.0);
}

void main() {
    vec4 tint = vec4(v_color.rgb * v_color.a, v_color.a);
    frag_color = sample_source() * tint;
}
",
    );
    src
}

/// Compile a shader program from vertex and fragment source strings.
///
/// The compiled shader objects are detached and deleted after successful
/// linking, so only the program handle needs to be cleaned up by the caller.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
///
/// # Errors
///
/// Returns a descriptive error string if shader compilation or program
/// linking fails.
pub unsafe fn compile_program(
    gl: &glow::Context,
    vertex_src: &str,
    fragment_src: &str,
) -> Result<glow::Program, String> {
    let program = unsafe { gl.create_program() }?;

    let vs = unsafe { compile_shader(gl, glow::VERTEX_SHADER, vertex_src) }?;
    let fs = match unsafe { compile_shader(gl, glow::FRAGMENT_SHADER, fragment_src) } {
        Ok(fs) => fs,
        Err(err) => {
            unsafe {
                gl.delete_shader(vs);
                gl.delete_program(program);
            }
            return Err(err);
        }
    };

    unsafe {
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        gl.link_program(program);

        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            gl.delete_shader(vs);
            gl.delete_shader(fs);
            return Err(format!("Program link error: {log}"));
        }

        gl.detach_shader(program, vs);
        gl.detach_shader(program, fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);
    }

    Ok(program)
}

/// Compile a single shader stage (vertex or fragment) from source.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
unsafe fn compile_shader(
    gl: &glow::Context,
    shader_type: u32,
    source: &str,
) -> Result<glow::Shader, String> {
    unsafe {
        let shader = gl.create_shader(shader_type)?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(format!("Shader compile error: {log}"));
        }

        Ok(shader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_source_has_one_branch_per_slot() {
        let src = sprite_fragment_src();
        assert!(src.contains("uniform sampler2D u_sources[16];"));
        assert!(src.contains("v_texture_index == 15u"));
        assert!(!src.contains("v_texture_index == 16u"));
        assert_eq!(src.matches("return texture(").count(), MAX_SPRITES_PER_BATCH);
        assert!(src.contains(
            "    if (v_texture_index == 0u) return texture(u_sources[0], v_tex_coord);\n    if (v_texture_index == 1u)"
        ));
    }
}

//! OpenGL [`Device`] via glow.
//!
//! Producers and consumers share one GL context group (or an equivalent
//! share mechanism), so a [`TextureHandle`] is a texture name and a
//! [`FenceHandle`] published by a producer is a `GLsync` pointer. Import
//! therefore validates and wraps; nothing is copied, and releasing an import
//! never deletes the producer's object.
//!
//! `GLsync` objects are binary, so the fence value in a snapshot only orders
//! frames; [`queue_wait`](Device::queue_wait) issues `glWaitSync`, a
//! server-side wait that never blocks the calling thread. Completion fences
//! are signaled by inserting a fresh sync object, retrievable with
//! [`GlDevice::signaled_sync`].
//!
//! # Safety
//!
//! A [`GlDevice`] issues raw GL calls from safe trait methods. The context it
//! was created with must be current on the calling thread whenever any of its
//! methods run; see [`GlDevice::new`].
//!
//! A fence handle is a raw `GLsync` pointer. Import rejects values the driver
//! does not recognize as a sync object (`glIsSync`), but a sync the producer
//! deletes after it was imported cannot be detected: producers must keep a
//! published sync alive until they publish its replacement.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use glow::HasContext;

use crate::device::{BatchSubmission, Device, TextureDesc};
use crate::error::{ImportFault, SynchronizationFault};
use crate::shaders;
use crate::sprite_batch::MAX_SPRITES_PER_BATCH;
use crate::types::{
    Color, FenceHandle, PixelFormat, PixelSize, ProducerKind, TargetHandle, TextureHandle, Vertex,
};

/// Convert a `u32` to `i32` for GL API calls, saturating.
fn gl_size(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[expect(clippy::cast_possible_truncation)]
fn native_sync(raw: u64) -> glow::NativeFence {
    glow::NativeFence(raw as usize as *mut _)
}

fn raw_sync(sync: glow::NativeFence) -> u64 {
    sync.0 as usize as u64
}

fn sync_from_handle(handle: FenceHandle) -> Result<glow::NativeFence, ImportFault> {
    if handle.0 == 0 || usize::try_from(handle.0).is_err() {
        return Err(ImportFault::InvalidFence(handle));
    }
    Ok(native_sync(handle.0))
}

/// An imported shared texture name.
#[derive(Debug)]
pub struct GlTexture {
    texture: glow::Texture,
}

/// A producer's `GLsync`, or the latest sync inserted for a completion
/// fence.
#[derive(Debug)]
pub struct GlFence {
    handle: FenceHandle,
    sync: glow::NativeFence,
    owned: bool,
    value: u64,
}

/// A destination texture wrapped in a framebuffer.
#[derive(Debug)]
pub struct GlTarget {
    framebuffer: glow::Framebuffer,
}

/// OpenGL compositor device. See the [module docs](self).
pub struct GlDevice {
    gl: Arc<glow::Context>,
    program: glow::Program,
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    signaled: HashMap<u64, (u64, u64)>,
}

impl GlDevice {
    /// Compile the sprite program and create the streaming vertex buffer.
    ///
    /// # Safety
    ///
    /// `gl` must be current on the calling thread, and must be current
    /// whenever any method of the returned device (including the [`Device`]
    /// methods) is called. Shared textures and syncs must come from contexts
    /// in the same share group.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if shader compilation fails or a
    /// GL object cannot be created.
    pub unsafe fn new(gl: Arc<glow::Context>) -> Result<Self, String> {
        let fragment_src = shaders::sprite_fragment_src();
        let program =
            unsafe { shaders::compile_program(&gl, shaders::SPRITE_VERTEX_SRC, &fragment_src)? };

        unsafe {
            let sources = gl
                .get_uniform_location(program, "u_sources")
                .ok_or("u_sources missing from sprite shader")?;
            #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let units: Vec<i32> = (0..MAX_SPRITES_PER_BATCH).map(|unit| unit as i32).collect();
            gl.use_program(Some(program));
            gl.uniform_1_i32_slice(Some(&sources), &units);
            gl.use_program(None);
        }

        let (vao, vbo) = unsafe {
            let vao = gl.create_vertex_array()?;
            let vbo = gl.create_buffer()?;

            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            // Vertex is 48 bytes and its offsets are below that; all fit i32.
            #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            {
                let stride = std::mem::size_of::<Vertex>() as i32;
                let offset = |field: usize| field as i32;
                gl.enable_vertex_attrib_array(0);
                gl.vertex_attrib_pointer_f32(
                    0,
                    4,
                    glow::FLOAT,
                    false,
                    stride,
                    offset(std::mem::offset_of!(Vertex, position)),
                );
                gl.enable_vertex_attrib_array(1);
                gl.vertex_attrib_pointer_f32(
                    1,
                    4,
                    glow::FLOAT,
                    false,
                    stride,
                    offset(std::mem::offset_of!(Vertex, color)),
                );
                gl.enable_vertex_attrib_array(2);
                gl.vertex_attrib_pointer_f32(
                    2,
                    2,
                    glow::FLOAT,
                    false,
                    stride,
                    offset(std::mem::offset_of!(Vertex, tex_coord)),
                );
                gl.enable_vertex_attrib_array(3);
                gl.vertex_attrib_pointer_i32(
                    3,
                    1,
                    glow::UNSIGNED_INT,
                    stride,
                    offset(std::mem::offset_of!(Vertex, texture_index)),
                );
            }
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);

            (vao, vbo)
        };

        Ok(Self {
            gl,
            program,
            vao,
            vbo,
            signaled: HashMap::new(),
        })
    }

    /// The latest `GLsync` inserted for a completion fence and the value it
    /// stands for. Valid until the next signal or the fence's release.
    #[must_use]
    pub fn signaled_sync(&self, completion: FenceHandle) -> Option<(u64, u64)> {
        self.signaled.get(&completion.0).copied()
    }

    /// Clean up the GL objects owned by this device.
    ///
    /// # Safety
    ///
    /// Must be called with the same GL context that was used to create the
    /// device, and must be called exactly once. Imports must have been
    /// released first.
    pub unsafe fn destroy(&self) {
        let gl = &self.gl;
        unsafe {
            gl.delete_program(self.program);
            gl.delete_vertex_array(self.vao);
            gl.delete_buffer(self.vbo);
        }
    }

    fn check_error(&self, what: &str) -> Result<(), SynchronizationFault> {
        // SAFETY: the context is current per `new`'s contract.
        let error = unsafe { self.gl.get_error() };
        if error == glow::NO_ERROR {
            Ok(())
        } else {
            Err(SynchronizationFault::Submit(format!(
                "{what}: GL error 0x{error:04x}"
            )))
        }
    }

    fn bind_target(&self, target: glow::Framebuffer, size: PixelSize) {
        // SAFETY: the context is current per `new`'s contract.
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(target));
            self.gl
                .viewport(0, 0, gl_size(size.width), gl_size(size.height));
        }
    }

    fn clear_bound(&self, color: Color) {
        let [r, g, b, a] = color.to_array();
        // SAFETY: the context is current per `new`'s contract.
        unsafe {
            self.gl.clear_color(r * a, g * a, b * a, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }
}

impl Device for GlDevice {
    type Texture = GlTexture;
    type Fence = GlFence;
    type Target = GlTarget;
    type View = glow::Texture;
    type TargetView = glow::Framebuffer;

    fn name(&self) -> &'static str {
        "opengl"
    }

    fn native_kind(&self) -> ProducerKind {
        ProducerKind::OpenGl
    }

    #[allow(clippy::match_like_matches_macro)]
    fn can_import(&self, producer: ProducerKind) -> bool {
        match producer {
            ProducerKind::OpenGl => true,
            ProducerKind::Software
            | ProducerKind::D3D11
            | ProducerKind::D3D12
            | ProducerKind::Vulkan => false,
        }
    }

    fn import_texture(
        &mut self,
        handle: TextureHandle,
        desc: &TextureDesc,
    ) -> Result<GlTexture, ImportFault> {
        if !self.can_import(desc.producer) {
            return Err(ImportFault::DeviceMismatch {
                device: self.name(),
                producer: desc.producer,
            });
        }
        // Shared GL textures are stored RGBA; a BGRA claim cannot be honored
        // without touching the producer's swizzle state.
        if desc.format != PixelFormat::Rgba8Unorm {
            return Err(ImportFault::FormatMismatch {
                expected: desc.format,
                found: PixelFormat::Rgba8Unorm,
            });
        }
        let texture = u32::try_from(handle.0)
            .ok()
            .and_then(NonZeroU32::new)
            .map(glow::NativeTexture)
            .ok_or(ImportFault::InvalidTexture(handle))?;
        // SAFETY: the context is current per `new`'s contract.
        if !unsafe { self.gl.is_texture(texture) } {
            return Err(ImportFault::InvalidTexture(handle));
        }
        Ok(GlTexture { texture })
    }

    fn texture_view(&self, texture: &GlTexture) -> glow::Texture {
        texture.texture
    }

    fn release_texture(&mut self, _texture: GlTexture) {
        // The producer owns the texture name.
    }

    fn import_fence(
        &mut self,
        producer: ProducerKind,
        handle: FenceHandle,
    ) -> Result<GlFence, ImportFault> {
        if !self.can_import(producer) {
            return Err(ImportFault::DeviceMismatch {
                device: self.name(),
                producer,
            });
        }
        let sync = sync_from_handle(handle)?;
        // SAFETY: the context is current per `new`'s contract. `glIsSync`
        // only looks the pointer up; it never dereferences it.
        if !unsafe { self.gl.is_sync(sync) } {
            return Err(ImportFault::InvalidFence(handle));
        }
        Ok(GlFence {
            handle,
            sync,
            owned: false,
            value: 0,
        })
    }

    fn release_fence(&mut self, fence: GlFence) {
        if fence.owned {
            self.signaled.remove(&fence.handle.0);
            // SAFETY: the context is current, and the sync was created by
            // `queue_signal` and not yet deleted.
            unsafe { self.gl.delete_sync(fence.sync) };
        }
    }

    fn open_target(
        &mut self,
        handle: TargetHandle,
        _size: PixelSize,
    ) -> Result<GlTarget, ImportFault> {
        let texture = u32::try_from(handle.0)
            .ok()
            .and_then(NonZeroU32::new)
            .map(glow::NativeTexture)
            .ok_or(ImportFault::InvalidTarget(handle))?;
        let gl = &self.gl;
        // SAFETY: the context is current per `new`'s contract.
        unsafe {
            if !gl.is_texture(texture) {
                return Err(ImportFault::InvalidTarget(handle));
            }
            let framebuffer = gl.create_framebuffer().map_err(ImportFault::Backend)?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(framebuffer);
                return Err(ImportFault::InvalidTarget(handle));
            }
            Ok(GlTarget { framebuffer })
        }
    }

    fn target_view(&self, target: &GlTarget) -> glow::Framebuffer {
        target.framebuffer
    }

    fn release_target(&mut self, target: GlTarget) {
        // SAFETY: the context is current; the framebuffer is ours.
        unsafe { self.gl.delete_framebuffer(target.framebuffer) };
    }

    fn clear_target(
        &mut self,
        target: glow::Framebuffer,
        target_size: PixelSize,
        color: Color,
    ) -> Result<(), SynchronizationFault> {
        self.bind_target(target, target_size);
        self.clear_bound(color);
        // SAFETY: the context is current per `new`'s contract.
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
        self.check_error("clear")
    }

    fn draw_batch(
        &mut self,
        batch: &BatchSubmission<'_, glow::Texture, glow::Framebuffer>,
    ) -> Result<(), SynchronizationFault> {
        if batch.sources.len() > MAX_SPRITES_PER_BATCH {
            return Err(SynchronizationFault::Submit(format!(
                "{} sources exceed {MAX_SPRITES_PER_BATCH} texture units",
                batch.sources.len()
            )));
        }
        let count = i32::try_from(batch.vertices.len()).map_err(|_| {
            SynchronizationFault::Submit("vertex count exceeds i32::MAX".into())
        })?;

        self.bind_target(batch.target, batch.target_size);
        if let Some(color) = batch.clear {
            self.clear_bound(color);
        }

        let gl = &self.gl;
        // SAFETY: the context is current per `new`'s contract, and every
        // source is a live texture name in the share group.
        unsafe {
            gl.enable(glow::BLEND);
            gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
            gl.use_program(Some(self.program));

            for (unit, source) in (glow::TEXTURE0..).zip(batch.sources) {
                gl.active_texture(unit);
                gl.bind_texture(glow::TEXTURE_2D, Some(*source));
            }

            gl.bind_vertex_array(Some(self.vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(batch.vertices),
                glow::STREAM_DRAW,
            );
            gl.draw_arrays(glow::TRIANGLES, 0, count);

            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            for unit in (glow::TEXTURE0..).take(batch.sources.len()) {
                gl.active_texture(unit);
                gl.bind_texture(glow::TEXTURE_2D, None);
            }
            gl.active_texture(glow::TEXTURE0);
            gl.use_program(None);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        self.check_error("draw")
    }

    fn submit(&mut self) -> Result<(), SynchronizationFault> {
        // SAFETY: the context is current per `new`'s contract.
        unsafe { self.gl.flush() };
        self.check_error("submit")
    }

    fn queue_wait(&mut self, fence: &GlFence, _value: u64) -> Result<(), SynchronizationFault> {
        // SAFETY: the context is current, and `fence.sync` passed `glIsSync`
        // at import; the producer keeps it alive per the module contract.
        unsafe {
            self.gl
                .wait_sync(fence.sync, 0, glow::TIMEOUT_IGNORED);
        }
        self.check_error("wait")
    }

    fn queue_signal(&mut self, fence: &mut GlFence, value: u64) -> Result<(), SynchronizationFault> {
        if value < fence.value {
            return Err(SynchronizationFault::NonMonotonicSignal {
                current: fence.value,
                requested: value,
            });
        }
        // SAFETY: the context is current per `new`'s contract.
        let sync = unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }
            .map_err(SynchronizationFault::Submit)?;
        if fence.owned {
            // SAFETY: the previous sync was created here and is replaced.
            unsafe { self.gl.delete_sync(fence.sync) };
        }
        fence.sync = sync;
        fence.owned = true;
        fence.value = value;
        self.signaled
            .insert(fence.handle.0, (raw_sync(sync), value));
        // SAFETY: the context is current per `new`'s contract.
        unsafe { self.gl.flush() };
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn null_fence_handles_are_rejected_before_reaching_gl() {
        assert!(matches!(
            sync_from_handle(FenceHandle(0)),
            Err(ImportFault::InvalidFence(FenceHandle(0)))
        ));
    }

    #[test]
    fn fence_handles_carry_the_sync_pointer() {
        let sync = sync_from_handle(FenceHandle(0x1000)).unwrap();
        assert_eq!(raw_sync(sync), 0x1000);
    }
}

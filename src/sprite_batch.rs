//! Batched textured-quad compositor.
//!
//! A [`SpriteBatch`] runs a `Idle -> Began -> Idle` state machine against one
//! bound target. Sprites accumulate into a fixed-capacity batch that shares a
//! single vertex upload and a single draw call; a full batch is flushed
//! before the next sprite is appended, so draw order is preserved across
//! flushes.
//!
//! Calling an operation in the wrong state is a contract violation and
//! aborts through [`fatal`](crate::fatal).

use crate::device::{BatchSubmission, Device};
use crate::error::SynchronizationFault;
use crate::types::{Color, PixelRect, PixelSize, Vertex};

/// Sprites per draw call.
pub const MAX_SPRITES_PER_BATCH: usize = 16;

/// Vertices per sprite: two triangles, no index buffer.
pub const VERTICES_PER_SPRITE: usize = 6;

const MAX_VERTICES: usize = MAX_SPRITES_PER_BATCH * VERTICES_PER_SPRITE;

/// One textured-rectangle draw request.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sprite<V> {
    /// View of the source texture.
    pub source: V,
    /// Full size of the source texture.
    pub source_size: PixelSize,
    /// Region of the source to sample, in source pixels.
    pub source_rect: PixelRect,
    /// Region of the target to cover, in target pixels.
    pub dest_rect: PixelRect,
    /// Straight-alpha tint multiplied into every sample.
    pub tint: Color,
}

/// Flush and sprite counters, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Draw calls issued.
    pub flushes: u64,
    /// Sprites drawn.
    pub sprites: u64,
}

#[derive(Debug)]
enum State<T> {
    Idle,
    Began {
        target: T,
        target_size: PixelSize,
        clear: Option<Color>,
        drawn: bool,
    },
}

/// The sprite compositor. See the [module docs](self).
///
/// Owns nothing on the GPU; the vertex and source staging buffers are reused
/// across batches and never shrink.
pub struct SpriteBatch<D: Device> {
    state: State<D::TargetView>,
    vertices: Vec<Vertex>,
    sources: Vec<D::View>,
    stats: BatchStats,
}

impl<D: Device> SpriteBatch<D> {
    /// An idle compositor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            vertices: Vec::with_capacity(MAX_VERTICES),
            sources: Vec::with_capacity(MAX_SPRITES_PER_BATCH),
            stats: BatchStats::default(),
        }
    }

    /// Whether a `begin` is awaiting its `end`.
    #[must_use]
    pub fn is_began(&self) -> bool {
        matches!(self.state, State::Began { .. })
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Bind `target` and start an empty batch.
    ///
    /// The target must already be usable as a color attachment.
    #[track_caller]
    pub fn begin(&mut self, target: D::TargetView, target_size: PixelSize) {
        if self.is_began() {
            crate::fatal!("sprite batch begin called while already began");
        }
        if target_size.is_empty() {
            crate::fatal!("sprite batch target has zero size {target_size:?}");
        }
        self.vertices.clear();
        self.sources.clear();
        self.state = State::Began {
            target,
            target_size,
            clear: None,
            drawn: false,
        };
    }

    /// Clear the whole target before anything is drawn. `None` clears to
    /// transparent.
    ///
    /// Only legal after `begin` and before the first `draw`.
    #[track_caller]
    pub fn clear(&mut self, color: Option<Color>) {
        match &mut self.state {
            State::Idle => crate::fatal!("sprite batch clear called while idle"),
            State::Began { drawn: true, .. } => {
                crate::fatal!("sprite batch clear called after draw");
            }
            State::Began { clear, .. } => *clear = Some(color.unwrap_or(Color::TRANSPARENT)),
        }
    }

    /// Append `sprite`, flushing first if the batch is full.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if the implicit flush fails. The
    /// frame is lost; the caller should still `end` the batch.
    #[track_caller]
    pub fn draw(
        &mut self,
        device: &mut D,
        sprite: &Sprite<D::View>,
    ) -> Result<(), SynchronizationFault> {
        let State::Began { target_size, .. } = self.state else {
            crate::fatal!("sprite batch draw called while idle");
        };
        if sprite.source_size.is_empty() {
            crate::fatal!("sprite source has zero size {:?}", sprite.source_size);
        }

        if self.vertices.len() == MAX_VERTICES {
            self.flush(device)?;
        }

        let index = match self.sources.iter().position(|view| *view == sprite.source) {
            Some(index) => index,
            None => {
                self.sources.push(sprite.source);
                self.sources.len() - 1
            }
        };
        #[expect(clippy::cast_possible_truncation)]
        let index = index as u32;
        self.vertices
            .extend_from_slice(&sprite_vertices(target_size, sprite, index));
        if let State::Began { drawn, .. } = &mut self.state {
            *drawn = true;
        }
        self.stats.sprites += 1;
        Ok(())
    }

    /// [`draw`](Self::draw) with a white tint.
    ///
    /// # Errors
    ///
    /// See [`draw`](Self::draw).
    #[track_caller]
    pub fn draw_untinted(
        &mut self,
        device: &mut D,
        source: D::View,
        source_size: PixelSize,
        source_rect: PixelRect,
        dest_rect: PixelRect,
    ) -> Result<(), SynchronizationFault> {
        self.draw(
            device,
            &Sprite {
                source,
                source_size,
                source_rect,
                dest_rect,
                tint: Color::WHITE,
            },
        )
    }

    /// Flush what is left, submit, and signal `completion` if given.
    ///
    /// Ending an empty batch issues no draw call, but a supplied completion
    /// fence is still signaled. The batch is idle afterwards even on error.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if the flush, submission or signal
    /// fails.
    #[track_caller]
    pub fn end(
        &mut self,
        device: &mut D,
        completion: Option<(&mut D::Fence, u64)>,
    ) -> Result<(), SynchronizationFault> {
        if !self.is_began() {
            crate::fatal!("sprite batch end called while idle");
        }
        let flushed = self.flush(device);
        self.state = State::Idle;
        flushed?;

        device.submit()?;
        if let Some((fence, value)) = completion {
            device.queue_signal(fence, value)?;
        }
        Ok(())
    }

    /// Issue the pending clear and sprites, if any.
    fn flush(&mut self, device: &mut D) -> Result<(), SynchronizationFault> {
        let State::Began {
            target,
            target_size,
            clear,
            ..
        } = &mut self.state
        else {
            crate::fatal!("sprite batch flushed while idle");
        };
        let clear = clear.take();

        let result = if self.vertices.is_empty() {
            match clear {
                Some(color) => device.clear_target(*target, *target_size, color),
                None => Ok(()),
            }
        } else {
            if self.vertices.len() % VERTICES_PER_SPRITE != 0
                || self.vertices.len() > MAX_VERTICES
                || self.sources.len() > MAX_SPRITES_PER_BATCH
            {
                crate::fatal!(
                    "sprite batch holds {} vertices and {} sources",
                    self.vertices.len(),
                    self.sources.len()
                );
            }
            self.stats.flushes += 1;
            tracing::trace!(
                sprites = self.vertices.len() / VERTICES_PER_SPRITE,
                sources = self.sources.len(),
                "flushing sprite batch"
            );
            device.draw_batch(&BatchSubmission {
                target: *target,
                target_size: *target_size,
                clear,
                sources: &self.sources,
                vertices: &self.vertices,
            })
        };

        self.vertices.clear();
        self.sources.clear();
        result
    }
}

impl<D: Device> Default for SpriteBatch<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// The two triangles covering `sprite.dest_rect`, in clip space.
#[expect(clippy::cast_precision_loss)]
fn sprite_vertices<V>(
    target_size: PixelSize,
    sprite: &Sprite<V>,
    texture_index: u32,
) -> [Vertex; VERTICES_PER_SPRITE] {
    let (tw, th) = (target_size.width as f32, target_size.height as f32);
    let (sw, sh) = (
        sprite.source_size.width as f32,
        sprite.source_size.height as f32,
    );
    let dest = sprite.dest_rect;
    let src = sprite.source_rect;

    let left = dest.x as f32 / tw * 2.0 - 1.0;
    let right = dest.right() as f32 / tw * 2.0 - 1.0;
    let top = 1.0 - dest.y as f32 / th * 2.0;
    let bottom = 1.0 - dest.bottom() as f32 / th * 2.0;

    let u0 = src.x as f32 / sw;
    let u1 = src.right() as f32 / sw;
    let v0 = src.y as f32 / sh;
    let v1 = src.bottom() as f32 / sh;

    let color = sprite.tint.to_array();
    let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
        position: [x, y, 0.0, 1.0],
        color,
        tex_coord: [u, v],
        texture_index,
        _pad: 0,
    };
    let top_left = corner(left, top, u0, v0);
    let top_right = corner(right, top, u1, v0);
    let bottom_left = corner(left, bottom, u0, v1);
    let bottom_right = corner(right, bottom, u1, v1);
    [
        top_left,
        top_right,
        bottom_left,
        bottom_left,
        top_right,
        bottom_right,
    ]
}

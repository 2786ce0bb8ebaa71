//! CPU reference [`Device`].
//!
//! Stands in for a GPU in tests and headless tools. A [`SharedHandles`] table
//! plays the role of the OS handle namespace: a producer registers textures,
//! fences and destination surfaces in it and publishes their handles, and a
//! [`SoftwareDevice`] built on a clone of the same table imports them.
//!
//! Work is recorded into a queue and executed in order on
//! [`submit`](Device::submit): waits poll the fence until it reaches the
//! target value or the device's timeout elapses, draws are rasterized with a
//! top-left fill rule, nearest sampling and premultiplied "over" blending.
//!
//! All pixel data is premultiplied alpha, stored in the image's own channel
//! order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use image::RgbaImage;

use crate::device::{BatchSubmission, Device, TextureDesc};
use crate::error::{ImportFault, SynchronizationFault};
use crate::types::{
    Color, FenceHandle, PixelFormat, PixelSize, ProducerKind, TargetHandle, TextureHandle, Vertex,
};

/// Fence waits give up after this long unless configured otherwise.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_millis(100);

const SPIN_POLLS: u32 = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ImageKind {
    Texture,
    Target,
}

struct Image {
    kind: ImageKind,
    format: PixelFormat,
    pixels: RgbaImage,
}

impl Image {
    fn new(kind: ImageKind, size: PixelSize, format: PixelFormat) -> Self {
        Self {
            kind,
            format,
            pixels: RgbaImage::new(size.width, size.height),
        }
    }

    fn size(&self) -> PixelSize {
        PixelSize::new(self.pixels.width(), self.pixels.height())
    }

    /// Stored bytes in RGBA order.
    fn get(&self, x: u32, y: u32) -> [u8; 4] {
        let [c0, c1, c2, a] = self.pixels.get_pixel(x, y).0;
        match self.format {
            PixelFormat::Rgba8Unorm => [c0, c1, c2, a],
            PixelFormat::Bgra8Unorm => [c2, c1, c0, a],
        }
    }

    fn put(&mut self, x: u32, y: u32, [r, g, b, a]: [u8; 4]) {
        let stored = match self.format {
            PixelFormat::Rgba8Unorm => [r, g, b, a],
            PixelFormat::Bgra8Unorm => [b, g, r, a],
        };
        self.pixels.put_pixel(x, y, image::Rgba(stored));
    }

    fn fill(&mut self, premultiplied: Color) {
        let rgba = premultiplied.to_rgba8();
        let (width, height) = self.pixels.dimensions();
        for y in 0..height {
            for x in 0..width {
                self.put(x, y, rgba);
            }
        }
    }

    fn to_rgba(&self) -> RgbaImage {
        let (width, height) = self.pixels.dimensions();
        RgbaImage::from_fn(width, height, |x, y| image::Rgba(self.get(x, y)))
    }
}

type SharedImage = Arc<Mutex<Image>>;
type Timeline = Arc<AtomicU64>;

#[derive(Default)]
struct HandleTable {
    next: u64,
    images: HashMap<u64, SharedImage>,
    fences: HashMap<u64, Timeline>,
}

impl HandleTable {
    fn allocate(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// The namespace software handles live in. Cloning shares the table.
#[derive(Clone, Default)]
pub struct SharedHandles {
    table: Arc<Mutex<HandleTable>>,
}

impl SharedHandles {
    /// An empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_image(&self, kind: ImageKind, size: PixelSize, format: PixelFormat) -> u64 {
        let mut table = lock(&self.table);
        let id = table.allocate();
        table
            .images
            .insert(id, Arc::new(Mutex::new(Image::new(kind, size, format))));
        id
    }

    fn image(&self, handle: u64, kind: ImageKind) -> Option<SharedImage> {
        let table = lock(&self.table);
        let image = table.images.get(&handle)?;
        let matches = lock(image).kind == kind;
        matches.then(|| image.clone())
    }

    fn timeline(&self, handle: FenceHandle) -> Option<Timeline> {
        lock(&self.table).fences.get(&handle.0).cloned()
    }

    /// Register a transparent texture a producer can render into and share.
    #[must_use]
    pub fn create_texture(&self, size: PixelSize, format: PixelFormat) -> TextureHandle {
        TextureHandle(self.insert_image(ImageKind::Texture, size, format))
    }

    /// Register a transparent destination surface.
    #[must_use]
    pub fn create_target(&self, size: PixelSize, format: PixelFormat) -> TargetHandle {
        TargetHandle(self.insert_image(ImageKind::Target, size, format))
    }

    /// Fill a texture with a straight-alpha `color`. Returns `false` if the
    /// handle is unknown.
    pub fn fill(&self, texture: TextureHandle, color: Color) -> bool {
        let Some(image) = self.image(texture.0, ImageKind::Texture) else {
            return false;
        };
        lock(&image).fill(premultiply(color));
        true
    }

    /// Write one premultiplied RGBA texel. Returns `false` if the handle is
    /// unknown or the texel out of bounds.
    pub fn put_pixel(&self, texture: TextureHandle, x: u32, y: u32, rgba: [u8; 4]) -> bool {
        let Some(image) = self.image(texture.0, ImageKind::Texture) else {
            return false;
        };
        let mut image = lock(&image);
        let size = image.size();
        if x >= size.width || y >= size.height {
            return false;
        }
        image.put(x, y, rgba);
        true
    }

    /// Read one pixel of a destination surface, in RGBA order.
    #[must_use]
    pub fn read_pixel(&self, target: TargetHandle, x: u32, y: u32) -> Option<[u8; 4]> {
        let image = self.image(target.0, ImageKind::Target)?;
        let image = lock(&image);
        let size = image.size();
        (x < size.width && y < size.height).then(|| image.get(x, y))
    }

    /// Drop a texture from the namespace. Devices that already imported it
    /// keep their reference; new imports of the handle fail.
    pub fn destroy_texture(&self, texture: TextureHandle) {
        lock(&self.table).images.remove(&texture.0);
    }

    /// Register a timeline fence starting at `initial`.
    #[must_use]
    pub fn create_fence(&self, initial: u64) -> FenceHandle {
        let mut table = lock(&self.table);
        let id = table.allocate();
        table.fences.insert(id, Arc::new(AtomicU64::new(initial)));
        FenceHandle(id)
    }

    /// Signal a fence from the producer side. Fences never move backwards.
    pub fn signal_fence(&self, fence: FenceHandle, value: u64) {
        if let Some(timeline) = self.timeline(fence) {
            timeline.fetch_max(value, Ordering::Release);
        }
    }

    /// Current value of a fence.
    #[must_use]
    pub fn fence_value(&self, fence: FenceHandle) -> Option<u64> {
        self.timeline(fence)
            .map(|timeline| timeline.load(Ordering::Acquire))
    }
}

/// An imported software texture.
#[derive(Debug)]
pub struct SoftwareTexture {
    view: SoftwareView,
    handle: TextureHandle,
}

impl SoftwareTexture {
    /// The handle it was imported from.
    #[must_use]
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }
}

/// An imported software fence.
#[derive(Debug)]
pub struct SoftwareFence {
    handle: FenceHandle,
    timeline: Timeline,
}

impl SoftwareFence {
    /// The handle it was imported from.
    #[must_use]
    pub fn handle(&self) -> FenceHandle {
        self.handle
    }
}

/// An opened software destination surface.
#[derive(Debug)]
pub struct SoftwareTarget {
    view: SoftwareTargetView,
    handle: TargetHandle,
}

impl SoftwareTarget {
    /// The handle it was opened from.
    #[must_use]
    pub fn handle(&self) -> TargetHandle {
        self.handle
    }
}

/// Sampling view of a [`SoftwareTexture`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SoftwareView(u64);

/// Rendering view of a [`SoftwareTarget`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SoftwareTargetView(u64);

/// A recorded `draw_batch`, kept for inspection.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawCall {
    /// The target drawn into.
    pub target: SoftwareTargetView,
    /// Clear applied before drawing.
    pub clear: Option<Color>,
    /// Number of bound sources.
    pub sources: usize,
    /// Uploaded vertices, in draw order.
    pub vertices: Vec<Vertex>,
}

enum Command {
    Wait {
        timeline: Timeline,
        value: u64,
    },
    Clear {
        target: SharedImage,
        color: Color,
    },
    Draw {
        target: SharedImage,
        sources: Vec<SharedImage>,
        vertices: Vec<Vertex>,
    },
    Signal {
        timeline: Timeline,
        value: u64,
    },
}

/// Failure to write a debug PNG.
#[derive(thiserror::Error, Debug)]
pub enum DumpError {
    /// The view is not (or no longer) open on this device.
    #[error("dump error: no open image behind view {0}")]
    UnknownView(u64),

    /// Encoding or writing the file failed.
    #[error("dump error: {0}")]
    Image(#[from] image::ImageError),
}

/// The CPU reference device. See the [module docs](self).
pub struct SoftwareDevice {
    handles: SharedHandles,
    fence_timeout: Duration,
    next_id: u64,
    textures: HashMap<u64, SharedImage>,
    targets: HashMap<u64, SharedImage>,
    live_fences: usize,
    queue: Vec<Command>,
    draw_calls: Vec<DrawCall>,
}

impl SoftwareDevice {
    /// A device importing from `handles`, with the default fence timeout.
    #[must_use]
    pub fn new(handles: SharedHandles) -> Self {
        Self {
            handles,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            next_id: 0,
            textures: HashMap::new(),
            targets: HashMap::new(),
            live_fences: 0,
            queue: Vec::new(),
            draw_calls: Vec::new(),
        }
    }

    /// Bound every queued fence wait by `timeout`.
    #[must_use]
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// The namespace this device imports from.
    #[must_use]
    pub fn handles(&self) -> &SharedHandles {
        &self.handles
    }

    /// Draw calls issued so far, oldest first.
    #[must_use]
    pub fn draw_calls(&self) -> &[DrawCall] {
        &self.draw_calls
    }

    /// Take the recorded draw calls, leaving the log empty.
    pub fn take_draw_calls(&mut self) -> Vec<DrawCall> {
        std::mem::take(&mut self.draw_calls)
    }

    /// Imported textures, imported fences and opened targets not yet
    /// released.
    #[must_use]
    pub fn live_imports(&self) -> usize {
        self.textures.len() + self.targets.len() + self.live_fences
    }

    /// Write an imported texture to a PNG file.
    ///
    /// # Errors
    ///
    /// Returns a [`DumpError`] if the view is not open or the file cannot be
    /// written.
    pub fn save_texture_png(
        &self,
        view: SoftwareView,
        path: impl AsRef<Path>,
    ) -> Result<(), DumpError> {
        let image = self
            .textures
            .get(&view.0)
            .ok_or(DumpError::UnknownView(view.0))?;
        save_png(image, path.as_ref())
    }

    /// Write an opened target to a PNG file.
    ///
    /// # Errors
    ///
    /// Returns a [`DumpError`] if the view is not open or the file cannot be
    /// written.
    pub fn save_target_png(
        &self,
        view: SoftwareTargetView,
        path: impl AsRef<Path>,
    ) -> Result<(), DumpError> {
        let image = self
            .targets
            .get(&view.0)
            .ok_or(DumpError::UnknownView(view.0))?;
        save_png(image, path.as_ref())
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn target_image(&self, view: SoftwareTargetView) -> Result<SharedImage, SynchronizationFault> {
        self.targets.get(&view.0).cloned().ok_or_else(|| {
            SynchronizationFault::Submit(format!("target view {} is not open", view.0))
        })
    }

    fn execute(&self, command: Command) -> Result<(), SynchronizationFault> {
        match command {
            Command::Wait { timeline, value } => wait_for(&timeline, value, self.fence_timeout),
            Command::Clear { target, color } => {
                lock(&target).fill(premultiply(color));
                Ok(())
            }
            Command::Draw {
                target,
                sources,
                vertices,
            } => {
                if sources.iter().any(|source| Arc::ptr_eq(source, &target)) {
                    return Err(SynchronizationFault::Submit(
                        "batch samples its own target".into(),
                    ));
                }
                let mut target = lock(&target);
                let guards: Vec<_> = sources.iter().map(|source| lock(source)).collect();
                let sources: Vec<&Image> = guards.iter().map(|guard| &**guard).collect();
                for triangle in vertices.chunks_exact(3) {
                    rasterize(&mut target, &sources, triangle);
                }
                Ok(())
            }
            Command::Signal { timeline, value } => signal(&timeline, value),
        }
    }
}

impl Device for SoftwareDevice {
    type Texture = SoftwareTexture;
    type Fence = SoftwareFence;
    type Target = SoftwareTarget;
    type View = SoftwareView;
    type TargetView = SoftwareTargetView;

    fn name(&self) -> &'static str {
        "software"
    }

    fn native_kind(&self) -> ProducerKind {
        ProducerKind::Software
    }

    #[allow(clippy::match_like_matches_macro)]
    fn can_import(&self, producer: ProducerKind) -> bool {
        match producer {
            ProducerKind::Software => true,
            ProducerKind::OpenGl
            | ProducerKind::D3D11
            | ProducerKind::D3D12
            | ProducerKind::Vulkan => false,
        }
    }

    fn set_fence_timeout(&mut self, timeout: Duration) {
        self.fence_timeout = timeout;
    }

    fn import_texture(
        &mut self,
        handle: TextureHandle,
        desc: &TextureDesc,
    ) -> Result<SoftwareTexture, ImportFault> {
        if !self.can_import(desc.producer) {
            return Err(ImportFault::DeviceMismatch {
                device: self.name(),
                producer: desc.producer,
            });
        }
        let image = self
            .handles
            .image(handle.0, ImageKind::Texture)
            .ok_or(ImportFault::InvalidTexture(handle))?;
        {
            let image = lock(&image);
            if image.format != desc.format {
                return Err(ImportFault::FormatMismatch {
                    expected: desc.format,
                    found: image.format,
                });
            }
            if image.size() != desc.size {
                return Err(ImportFault::SizeMismatch {
                    expected: desc.size,
                    found: image.size(),
                });
            }
        }
        let id = self.allocate_id();
        self.textures.insert(id, image);
        Ok(SoftwareTexture {
            view: SoftwareView(id),
            handle,
        })
    }

    fn texture_view(&self, texture: &SoftwareTexture) -> SoftwareView {
        texture.view
    }

    fn release_texture(&mut self, texture: SoftwareTexture) {
        self.textures.remove(&texture.view.0);
    }

    fn import_fence(
        &mut self,
        producer: ProducerKind,
        handle: FenceHandle,
    ) -> Result<SoftwareFence, ImportFault> {
        if !self.can_import(producer) {
            return Err(ImportFault::DeviceMismatch {
                device: self.name(),
                producer,
            });
        }
        let timeline = self
            .handles
            .timeline(handle)
            .ok_or(ImportFault::InvalidFence(handle))?;
        self.live_fences += 1;
        Ok(SoftwareFence { handle, timeline })
    }

    fn release_fence(&mut self, _fence: SoftwareFence) {
        self.live_fences = self.live_fences.saturating_sub(1);
    }

    fn open_target(
        &mut self,
        handle: TargetHandle,
        size: PixelSize,
    ) -> Result<SoftwareTarget, ImportFault> {
        let image = self
            .handles
            .image(handle.0, ImageKind::Target)
            .ok_or(ImportFault::InvalidTarget(handle))?;
        let found = lock(&image).size();
        if found != size {
            return Err(ImportFault::SizeMismatch {
                expected: size,
                found,
            });
        }
        let id = self.allocate_id();
        self.targets.insert(id, image);
        Ok(SoftwareTarget {
            view: SoftwareTargetView(id),
            handle,
        })
    }

    fn target_view(&self, target: &SoftwareTarget) -> SoftwareTargetView {
        target.view
    }

    fn release_target(&mut self, target: SoftwareTarget) {
        self.targets.remove(&target.view.0);
    }

    fn clear_target(
        &mut self,
        target: SoftwareTargetView,
        _target_size: PixelSize,
        color: Color,
    ) -> Result<(), SynchronizationFault> {
        let target = self.target_image(target)?;
        self.queue.push(Command::Clear { target, color });
        Ok(())
    }

    fn draw_batch(
        &mut self,
        batch: &BatchSubmission<'_, SoftwareView, SoftwareTargetView>,
    ) -> Result<(), SynchronizationFault> {
        if batch.vertices.len() % 3 != 0 {
            return Err(SynchronizationFault::Submit(format!(
                "{} vertices do not form whole triangles",
                batch.vertices.len()
            )));
        }
        if let Some(vertex) = batch
            .vertices
            .iter()
            .find(|vertex| vertex.texture_index as usize >= batch.sources.len())
        {
            return Err(SynchronizationFault::Submit(format!(
                "vertex samples source {} of {}",
                vertex.texture_index,
                batch.sources.len()
            )));
        }
        let target = self.target_image(batch.target)?;

        // Views of one shared image are bound once, since each source is
        // locked for the whole draw.
        let mut sources: Vec<SharedImage> = Vec::with_capacity(batch.sources.len());
        let mut slots: Vec<u32> = Vec::with_capacity(batch.sources.len());
        for view in batch.sources {
            let image = self.textures.get(&view.0).ok_or_else(|| {
                SynchronizationFault::Submit(format!("texture view {} is not open", view.0))
            })?;
            let slot = match sources.iter().position(|bound| Arc::ptr_eq(bound, image)) {
                Some(slot) => slot,
                None => {
                    sources.push(image.clone());
                    sources.len() - 1
                }
            };
            #[expect(clippy::cast_possible_truncation)]
            let slot = slot as u32;
            slots.push(slot);
        }
        let vertices = batch
            .vertices
            .iter()
            .map(|vertex| Vertex {
                texture_index: slots[vertex.texture_index as usize],
                ..*vertex
            })
            .collect();

        if let Some(color) = batch.clear {
            self.queue.push(Command::Clear {
                target: target.clone(),
                color,
            });
        }
        self.queue.push(Command::Draw {
            target,
            sources,
            vertices,
        });
        self.draw_calls.push(DrawCall {
            target: batch.target,
            clear: batch.clear,
            sources: batch.sources.len(),
            vertices: batch.vertices.to_vec(),
        });
        Ok(())
    }

    fn submit(&mut self) -> Result<(), SynchronizationFault> {
        let queue = std::mem::take(&mut self.queue);
        for command in queue {
            // Work queued behind a failed command is dropped with it.
            self.execute(command)?;
        }
        Ok(())
    }

    fn queue_wait(&mut self, fence: &SoftwareFence, value: u64) -> Result<(), SynchronizationFault> {
        self.queue.push(Command::Wait {
            timeline: fence.timeline.clone(),
            value,
        });
        Ok(())
    }

    fn queue_signal(
        &mut self,
        fence: &mut SoftwareFence,
        value: u64,
    ) -> Result<(), SynchronizationFault> {
        if self.queue.is_empty() {
            return signal(&fence.timeline, value);
        }
        self.queue.push(Command::Signal {
            timeline: fence.timeline.clone(),
            value,
        });
        Ok(())
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            tracing::debug!(commands = self.queue.len(), "discarding unsubmitted work");
        }
    }
}

fn premultiply(color: Color) -> Color {
    Color::rgba(
        color.r * color.a,
        color.g * color.a,
        color.b * color.a,
        color.a,
    )
}

fn wait_for(timeline: &AtomicU64, value: u64, timeout: Duration) -> Result<(), SynchronizationFault> {
    let start = Instant::now();
    let mut polls = 0_u32;
    while timeline.load(Ordering::Acquire) < value {
        if start.elapsed() >= timeout {
            return Err(SynchronizationFault::WaitTimeout {
                value,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        if polls < SPIN_POLLS {
            polls += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
    }
    Ok(())
}

fn signal(timeline: &AtomicU64, value: u64) -> Result<(), SynchronizationFault> {
    let previous = timeline.fetch_max(value, Ordering::Release);
    if previous > value {
        return Err(SynchronizationFault::NonMonotonicSignal {
            current: previous,
            requested: value,
        });
    }
    Ok(())
}

fn save_png(image: &SharedImage, path: &Path) -> Result<(), DumpError> {
    let rgba = lock(image).to_rgba();
    rgba.save(path)?;
    tracing::debug!(path = %path.display(), "wrote image dump");
    Ok(())
}

type Point = [f32; 2];

fn edge(a: Point, b: Point, p: Point) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Top and left edges own the pixels exactly on them, so two triangles
/// sharing an edge never both cover a pixel.
#[allow(clippy::float_cmp)]
fn is_top_left(a: Point, b: Point) -> bool {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    (dy == 0.0 && dx > 0.0) || dy < 0.0
}

#[allow(clippy::float_cmp)]
fn covers(weight: f32, a: Point, b: Point) -> bool {
    weight > 0.0 || (weight == 0.0 && is_top_left(a, b))
}

#[allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn rasterize(target: &mut Image, sources: &[&Image], triangle: &[Vertex]) {
    let size = target.size();
    let (width, height) = (size.width as f32, size.height as f32);
    let to_screen = |vertex: &Vertex| -> Point {
        [
            (vertex.position[0] + 1.0) * 0.5 * width,
            (1.0 - vertex.position[1]) * 0.5 * height,
        ]
    };

    let mut corners = [&triangle[0], &triangle[1], &triangle[2]];
    let mut points = corners.map(to_screen);
    let mut area = edge(points[0], points[1], points[2]);
    if area == 0.0 {
        return;
    }
    if area < 0.0 {
        corners.swap(1, 2);
        points.swap(1, 2);
        area = -area;
    }
    let Some(source) = sources.get(triangle[0].texture_index as usize) else {
        return;
    };
    let source_size = source.size();

    let min_x = points.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min);
    let max_x = points.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max);
    let min_y = points.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min);
    let max_y = points.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max);
    let x0 = min_x.floor().max(0.0) as u32;
    let x1 = max_x.ceil().clamp(0.0, width) as u32;
    let y0 = min_y.floor().max(0.0) as u32;
    let y1 = max_y.ceil().clamp(0.0, height) as u32;

    let [a, b, c] = points;
    for y in y0..y1 {
        for x in x0..x1 {
            let p = [x as f32 + 0.5, y as f32 + 0.5];
            let wa = edge(b, c, p);
            let wb = edge(c, a, p);
            let wc = edge(a, b, p);
            if !(covers(wa, b, c) && covers(wb, c, a) && covers(wc, a, b)) {
                continue;
            }
            let (la, lb, lc) = (wa / area, wb / area, wc / area);
            let lerp = |f: fn(&Vertex) -> f32| {
                la * f(corners[0]) + lb * f(corners[1]) + lc * f(corners[2])
            };

            let u = lerp(|v| v.tex_coord[0]);
            let v = lerp(|v| v.tex_coord[1]);
            let tx = ((u * source_size.width as f32).floor() as i64)
                .clamp(0, i64::from(source_size.width) - 1) as u32;
            let ty = ((v * source_size.height as f32).floor() as i64)
                .clamp(0, i64::from(source_size.height) - 1) as u32;
            let texel = Color::from_rgba8(source.get(tx, ty));

            let tint = premultiply(Color::rgba(
                lerp(|v| v.color[0]),
                lerp(|v| v.color[1]),
                lerp(|v| v.color[2]),
                lerp(|v| v.color[3]),
            ));
            let src = Color::rgba(
                texel.r * tint.r,
                texel.g * tint.g,
                texel.b * tint.b,
                texel.a * tint.a,
            );
            let dst = Color::from_rgba8(target.get(x, y));
            let keep = 1.0 - src.a;
            let out = Color::rgba(
                src.r + dst.r * keep,
                src.g + dst.g * keep,
                src.b + dst.b * keep,
                src.a + dst.a * keep,
            );
            target.put(x, y, out.to_rgba8());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::PixelRect;

    fn quad(target: PixelSize, dest: PixelRect, tint: Color) -> Vec<Vertex> {
        use crate::sprite_batch::Sprite;
        let mut batch = crate::sprite_batch::SpriteBatch::<SoftwareDevice>::new();
        let handles = SharedHandles::new();
        let mut device = SoftwareDevice::new(handles.clone());
        let target_handle = handles.create_target(target, PixelFormat::Rgba8Unorm);
        let opened = device.open_target(target_handle, target).unwrap();
        let texture = handles.create_texture(PixelSize::new(1, 1), PixelFormat::Rgba8Unorm);
        let desc = TextureDesc {
            producer: ProducerKind::Software,
            size: PixelSize::new(1, 1),
            format: PixelFormat::Rgba8Unorm,
        };
        let imported = device.import_texture(texture, &desc).unwrap();
        batch.begin(device.target_view(&opened), target);
        let sprite = Sprite {
            source: device.texture_view(&imported),
            source_size: PixelSize::new(1, 1),
            source_rect: PixelRect::new(0, 0, 1, 1),
            dest_rect: dest,
            tint,
        };
        batch.draw(&mut device, &sprite).unwrap();
        batch.end(&mut device, None).unwrap();
        device.take_draw_calls().remove(0).vertices
    }

    fn device_with_target(size: PixelSize) -> (SharedHandles, SoftwareDevice, TargetHandle, SoftwareTarget) {
        let handles = SharedHandles::new();
        let mut device = SoftwareDevice::new(handles.clone());
        let handle = handles.create_target(size, PixelFormat::Rgba8Unorm);
        let target = device.open_target(handle, size).unwrap();
        (handles, device, handle, target)
    }

    #[test]
    fn shared_edge_is_covered_once() {
        let size = PixelSize::new(8, 8);
        let half_red = Color::rgba(1.0, 0.0, 0.0, 0.5);
        let vertices = quad(size, size.to_rect(), half_red);

        let (handles, mut device, handle, target) = device_with_target(size);
        let texture = handles.create_texture(PixelSize::new(1, 1), PixelFormat::Rgba8Unorm);
        handles.fill(texture, Color::WHITE);
        let desc = TextureDesc {
            producer: ProducerKind::Software,
            size: PixelSize::new(1, 1),
            format: PixelFormat::Rgba8Unorm,
        };
        let imported = device.import_texture(texture, &desc).unwrap();
        let view = device.texture_view(&imported);
        let target_view = device.target_view(&target);
        device
            .draw_batch(&BatchSubmission {
                target: target_view,
                target_size: size,
                clear: Some(Color::TRANSPARENT),
                sources: &[view],
                vertices: &vertices,
            })
            .unwrap();
        device.submit().unwrap();

        // A doubly covered diagonal pixel would read 191 (0.75) instead of 128.
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(handles.read_pixel(handle, x, y), Some([128, 0, 0, 128]));
            }
        }
    }

    #[test]
    fn bgra_textures_are_swizzled_on_sample() {
        let size = PixelSize::new(2, 2);
        let vertices = quad(size, size.to_rect(), Color::WHITE);
        let (handles, mut device, handle, target) = device_with_target(size);
        let texture = handles.create_texture(PixelSize::new(1, 1), PixelFormat::Bgra8Unorm);
        handles.fill(texture, Color::rgba(0.0, 0.0, 1.0, 1.0));
        let desc = TextureDesc {
            producer: ProducerKind::Software,
            size: PixelSize::new(1, 1),
            format: PixelFormat::Bgra8Unorm,
        };
        let imported = device.import_texture(texture, &desc).unwrap();
        let view = device.texture_view(&imported);
        let target_view = device.target_view(&target);
        device
            .draw_batch(&BatchSubmission {
                target: target_view,
                target_size: size,
                clear: None,
                sources: &[view],
                vertices: &vertices,
            })
            .unwrap();
        device.submit().unwrap();
        assert_eq!(handles.read_pixel(handle, 1, 1), Some([0, 0, 255, 255]));
    }

    #[test]
    fn two_imports_of_one_texture_draw_in_one_batch() {
        let size = PixelSize::new(4, 2);
        let (handles, mut device, handle, target) = device_with_target(size);
        let texture = handles.create_texture(PixelSize::new(1, 1), PixelFormat::Rgba8Unorm);
        handles.fill(texture, Color::WHITE);
        let desc = TextureDesc {
            producer: ProducerKind::Software,
            size: PixelSize::new(1, 1),
            format: PixelFormat::Rgba8Unorm,
        };
        let first = device.import_texture(texture, &desc).unwrap();
        let second = device.import_texture(texture, &desc).unwrap();
        let views = [device.texture_view(&first), device.texture_view(&second)];
        assert_ne!(views[0], views[1]);

        let mut batch = crate::sprite_batch::SpriteBatch::<SoftwareDevice>::new();
        batch.begin(device.target_view(&target), size);
        for (column, view) in (0..).zip(views) {
            batch
                .draw_untinted(
                    &mut device,
                    view,
                    PixelSize::new(1, 1),
                    PixelRect::new(0, 0, 1, 1),
                    PixelRect::new(column * 2, 0, 2, 2),
                )
                .unwrap();
        }
        batch.end(&mut device, None).unwrap();

        let calls = device.take_draw_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].sources, 2);
        assert_eq!(handles.read_pixel(handle, 0, 0), Some([255, 255, 255, 255]));
        assert_eq!(handles.read_pixel(handle, 3, 1), Some([255, 255, 255, 255]));
        device.release_texture(first);
        device.release_texture(second);
    }

    #[test]
    fn import_validates_descriptor() {
        let handles = SharedHandles::new();
        let mut device = SoftwareDevice::new(handles.clone());
        let texture = handles.create_texture(PixelSize::new(4, 4), PixelFormat::Rgba8Unorm);
        let desc = TextureDesc {
            producer: ProducerKind::Software,
            size: PixelSize::new(4, 4),
            format: PixelFormat::Bgra8Unorm,
        };
        assert!(matches!(
            device.import_texture(texture, &desc),
            Err(ImportFault::FormatMismatch { .. })
        ));
        let desc = TextureDesc {
            size: PixelSize::new(2, 4),
            format: PixelFormat::Rgba8Unorm,
            ..desc
        };
        assert!(matches!(
            device.import_texture(texture, &desc),
            Err(ImportFault::SizeMismatch { .. })
        ));

        let target = handles.create_target(PixelSize::new(4, 4), PixelFormat::Rgba8Unorm);
        assert!(matches!(
            device.import_texture(TextureHandle(target.0), &desc),
            Err(ImportFault::InvalidTexture(_))
        ));
        assert!(matches!(
            device.open_target(TargetHandle(texture.0), PixelSize::new(4, 4)),
            Err(ImportFault::InvalidTarget(_))
        ));
        assert_eq!(device.live_imports(), 0);
    }

    #[test]
    fn queued_wait_times_out_instead_of_blocking() {
        let handles = SharedHandles::new();
        let mut device =
            SoftwareDevice::new(handles.clone()).with_fence_timeout(Duration::from_millis(5));
        let fence_handle = handles.create_fence(1);
        let fence = device
            .import_fence(ProducerKind::Software, fence_handle)
            .unwrap();

        device.queue_wait(&fence, 1).unwrap();
        device.submit().unwrap();

        device.queue_wait(&fence, 2).unwrap();
        assert_eq!(
            device.submit(),
            Err(SynchronizationFault::WaitTimeout {
                value: 2,
                timeout_ms: 5
            })
        );
        device.release_fence(fence);
    }

    #[test]
    fn wait_orders_work_behind_producer_signal() {
        let handles = SharedHandles::new();
        let mut device = SoftwareDevice::new(handles.clone());
        let producer = handles.create_fence(0);
        let completion = handles.create_fence(0);
        let wait_on = device.import_fence(ProducerKind::Software, producer).unwrap();
        let mut signal_on = device
            .import_fence(ProducerKind::Software, completion)
            .unwrap();

        device.queue_wait(&wait_on, 3).unwrap();
        device.queue_signal(&mut signal_on, 1).unwrap();
        assert_eq!(handles.fence_value(completion), Some(0));

        let producer_handles = handles.clone();
        let signaler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(2));
            producer_handles.signal_fence(producer, 3);
        });
        device.submit().unwrap();
        signaler.join().unwrap();
        assert_eq!(handles.fence_value(completion), Some(1));
    }

    #[test]
    fn signals_never_move_backwards() {
        let handles = SharedHandles::new();
        let mut device = SoftwareDevice::new(handles.clone());
        let handle = handles.create_fence(5);
        let mut fence = device.import_fence(ProducerKind::Software, handle).unwrap();
        assert_eq!(
            device.queue_signal(&mut fence, 4),
            Err(SynchronizationFault::NonMonotonicSignal {
                current: 5,
                requested: 4
            })
        );
        assert_eq!(handles.fence_value(handle), Some(5));
    }

    #[test]
    fn target_dump_round_trips_through_png() {
        let size = PixelSize::new(3, 2);
        let (handles, mut device, _, target) = device_with_target(size);
        let view = device.target_view(&target);
        device
            .clear_target(view, size, Color::rgba(0.0, 0.0, 1.0, 1.0))
            .unwrap();
        device.submit().unwrap();

        let path = std::env::temp_dir().join(format!("frame-relay-dump-{}.png", std::process::id()));
        device.save_target_png(view, &path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1).0, [0, 0, 255, 255]);

        assert!(matches!(
            device.save_texture_png(SoftwareView(999), &path),
            Err(DumpError::UnknownView(999))
        ));
        drop(handles);
    }
}

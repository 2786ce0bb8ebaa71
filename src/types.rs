//! Plain-data types shared by the channel, the cache, and the compositor.
//!
//! Native handles are opaque `u64` identifiers. Their meaning depends on the
//! [`ProducerKind`] that published them: a GL texture name in a shared
//! context group, a `GLsync` pointer, an NT handle, an entry in the software
//! backend's handle table, and so on. This crate only compares them for
//! identity and hands them to a [`Device`](crate::Device) for import.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Width and height of a texture or surface, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl PixelSize {
    /// Create a size from a width and height.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The rectangle covering this whole size, anchored at the origin.
    #[must_use]
    pub const fn to_rect(self) -> PixelRect {
        PixelRect::new(0, 0, self.width, self.height)
    }
}

/// An axis-aligned rectangle in pixel space, origin at the top-left.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl PixelRect {
    /// Create a rectangle from its top-left corner and size.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The size of the rectangle.
    #[must_use]
    pub const fn size(self) -> PixelSize {
        PixelSize::new(self.width, self.height)
    }

    /// Right edge (exclusive).
    #[must_use]
    pub const fn right(self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Bottom edge (exclusive).
    #[must_use]
    pub const fn bottom(self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// The pixel containing the center of the rectangle.
    #[must_use]
    pub const fn center(self) -> (u32, u32) {
        (
            self.x.saturating_add(self.width / 2),
            self.y.saturating_add(self.height / 2),
        )
    }
}

/// A straight-alpha RGBA color with components in `[0, 1]`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Color {
    /// Red.
    pub r: f32,
    /// Green.
    pub g: f32,
    /// Blue.
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

impl Color {
    /// Opaque white; the default sprite tint.
    pub const WHITE: Self = Self::rgba(1.0, 1.0, 1.0, 1.0);
    /// Opaque black.
    pub const BLACK: Self = Self::rgba(0.0, 0.0, 0.0, 1.0);
    /// Fully transparent black; the default clear color.
    pub const TRANSPARENT: Self = Self::rgba(0.0, 0.0, 0.0, 0.0);

    /// Create a color from its components.
    #[must_use]
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Create a color from 8-bit components.
    #[must_use]
    pub fn from_rgba8([r, g, b, a]: [u8; 4]) -> Self {
        Self::rgba(
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
            f32::from(a) / 255.0,
        )
    }

    /// Convert to 8-bit components, clamping and rounding.
    #[must_use]
    pub fn to_rgba8(self) -> [u8; 4] {
        // Clamped to [0, 255] before the cast.
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let quantize = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [
            quantize(self.r),
            quantize(self.g),
            quantize(self.b),
            quantize(self.a),
        ]
    }

    /// The components as an array, in RGBA order.
    #[must_use]
    pub const fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::TRANSPARENT
    }
}

/// Pixel layout of a shared texture.
///
/// The discriminants are the tags written into shared memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PixelFormat {
    /// 8 bits per channel, RGBA byte order.
    Rgba8Unorm = 1,
    /// 8 bits per channel, BGRA byte order.
    Bgra8Unorm = 2,
}

impl PixelFormat {
    /// The tag stored in the channel.
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a tag read from the channel.
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Rgba8Unorm),
            2 => Some(Self::Bgra8Unorm),
            _ => None,
        }
    }

    /// Bytes per pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
        }
    }
}

/// The graphics API a producer rendered with, and therefore the namespace its
/// native handles live in.
///
/// Devices declare which kinds they can import with an explicit `match`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProducerKind {
    /// Handles index the software backend's handle table.
    Software = 1,
    /// Texture names and `GLsync` objects shared through a GL context group.
    OpenGl = 2,
    /// NT handles to D3D11 shared resources and fences.
    D3D11 = 3,
    /// NT handles to D3D12 shared resources and fences.
    D3D12 = 4,
    /// Exported Vulkan memory and timeline semaphores.
    Vulkan = 5,
}

impl ProducerKind {
    /// The tag stored in the channel.
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Decode a tag read from the channel.
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Software),
            2 => Some(Self::OpenGl),
            3 => Some(Self::D3D11),
            4 => Some(Self::D3D12),
            5 => Some(Self::Vulkan),
            _ => None,
        }
    }
}

/// Opaque identifier of a shared texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureHandle(pub u64);

/// Opaque identifier of a shared, value-signaled fence.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FenceHandle(pub u64);

/// Opaque identifier of a destination surface supplied by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetHandle(pub u64);

/// One corner of a sprite quad, ready for the GPU.
///
/// Sprites are drawn as two triangles (six vertices, no index buffer).
/// `texture_index` selects which of the batch's bound sources the fragment
/// shader samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    /// Clip-space position (`z = 0`, `w = 1`).
    pub position: [f32; 4],
    /// Straight-alpha tint.
    pub color: [f32; 4],
    /// Normalized texture coordinates into the source.
    pub tex_coord: [f32; 2],
    /// Index of the source in the batch's source table.
    pub texture_index: u32,
    /// Keeps the struct free of implicit padding.
    pub _pad: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }

    #[test]
    fn format_tags_round_trip_and_reject_unknown() {
        for format in [PixelFormat::Rgba8Unorm, PixelFormat::Bgra8Unorm] {
            assert_eq!(PixelFormat::from_tag(format.tag()), Some(format));
        }
        assert_eq!(PixelFormat::from_tag(0), None);
        assert_eq!(ProducerKind::from_tag(0), None);
        assert_eq!(ProducerKind::from_tag(99), None);
        assert_eq!(
            ProducerKind::from_tag(ProducerKind::Vulkan.tag()),
            Some(ProducerKind::Vulkan)
        );
    }

    #[test]
    fn color_quantization_clamps() {
        assert_eq!(Color::rgba(2.0, -1.0, 0.5, 1.0).to_rgba8(), [255, 0, 128, 255]);
        assert_eq!(Color::from_rgba8([255, 0, 0, 255]), Color::rgba(1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn rect_center_and_edges() {
        let rect = PixelRect::new(10, 20, 30, 40);
        assert_eq!(rect.center(), (25, 40));
        assert_eq!(rect.right(), 40);
        assert_eq!(rect.bottom(), 60);
        assert_eq!(PixelSize::new(8, 0).to_rect().size(), PixelSize::new(8, 0));
        assert!(PixelSize::new(8, 0).is_empty());
    }

    #[test]
    fn rect_center_saturates_near_the_edge_of_the_range() {
        let rect = PixelRect::new(u32::MAX - 2, u32::MAX - 1, 10, 10);
        assert_eq!(rect.center(), (u32::MAX, u32::MAX));
        assert_eq!(rect.right(), u32::MAX);
    }
}

//! Per-consumer import cache.
//!
//! Importing a cross-process handle is expensive relative to a frame budget,
//! and producers keep the same shared texture for many frames (until a resize
//! or device reset). [`CachedImporter`] keeps the last imported texture and
//! fence keyed by handle identity and only re-imports when a snapshot names a
//! different resource.

use crate::channel::Snapshot;
use crate::device::{Device, TextureDesc};
use crate::error::ImportFault;
use crate::owned::Owned;
use crate::types::{FenceHandle, PixelFormat, PixelSize, ProducerKind, TextureHandle};

/// Import and release counters, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Successful texture imports.
    pub texture_imports: u64,
    /// Imported textures handed back to the device.
    pub texture_releases: u64,
    /// Successful fence imports.
    pub fence_imports: u64,
    /// Imported fences handed back to the device.
    pub fence_releases: u64,
}

struct TextureEntry<D: Device> {
    producer: ProducerKind,
    handle: TextureHandle,
    size: PixelSize,
    format: PixelFormat,
    texture: Owned<D::Texture>,
    view: D::View,
}

struct FenceEntry<D: Device> {
    producer: ProducerKind,
    handle: FenceHandle,
    fence: Owned<D::Fence>,
}

/// A snapshot resolved to live GPU objects, valid until the next call that
/// mutably borrows the cache.
pub struct ImportedFrame<'a, D: Device> {
    /// Sequence number of the resolved snapshot.
    pub sequence: u64,
    /// Sampling view of the shared texture.
    pub view: D::View,
    /// Size of the shared texture.
    pub size: PixelSize,
    /// The producer's fence.
    pub fence: &'a D::Fence,
    /// Value `fence` reaches once the producer finished this frame.
    pub fence_value: u64,
    /// Whether this resolve imported the texture (as opposed to reusing it).
    pub imported: bool,
}

impl<D: Device> std::fmt::Debug for ImportedFrame<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportedFrame")
            .field("sequence", &self.sequence)
            .field("view", &self.view)
            .field("size", &self.size)
            .field("fence_value", &self.fence_value)
            .field("imported", &self.imported)
            .finish_non_exhaustive()
    }
}

/// Imports snapshot handles through a [`Device`], reusing them across frames.
///
/// The cache exclusively owns what it imports. There is never more than one
/// live texture and one live fence; the previous generation is released
/// before a replacement is imported.
pub struct CachedImporter<D: Device> {
    texture: Option<TextureEntry<D>>,
    fence: Option<FenceEntry<D>>,
    stats: ImportStats,
}

impl<D: Device> CachedImporter<D> {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            texture: None,
            fence: None,
            stats: ImportStats::default(),
        }
    }

    /// Resolve `snapshot` to live GPU objects.
    ///
    /// A texture handle matching the cached one is reused as-is. A different
    /// texture handle evicts both cached objects and imports both anew; a
    /// different fence handle alone re-imports only the fence.
    ///
    /// # Errors
    ///
    /// Returns an [`ImportFault`] if the device cannot import the snapshot's
    /// producer kind or rejects a handle. The cache is left empty rather than
    /// partially installed, and nothing is retried.
    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(device = device.name(), sequence = snapshot.sequence)
    )]
    pub fn resolve<'a>(
        &'a mut self,
        device: &mut D,
        snapshot: &Snapshot,
    ) -> Result<ImportedFrame<'a, D>, ImportFault> {
        if !device.can_import(snapshot.producer) {
            self.clear(device);
            return Err(ImportFault::DeviceMismatch {
                device: device.name(),
                producer: snapshot.producer,
            });
        }

        let texture_hit = self.texture.as_ref().is_some_and(|entry| {
            entry.producer == snapshot.producer
                && entry.handle == snapshot.texture
                && entry.size == snapshot.size
                && entry.format == snapshot.format
        });
        if !texture_hit {
            self.clear(device);
            self.import_texture(device, snapshot)?;
        }

        let fence_hit = self.fence.as_ref().is_some_and(|entry| {
            entry.producer == snapshot.producer && entry.handle == snapshot.fence
        });
        if !fence_hit {
            self.release_fence(device);
            if let Err(fault) = self.import_fence(device, snapshot) {
                self.clear(device);
                return Err(fault);
            }
        }

        let (Some(texture), Some(fence)) = (&self.texture, &self.fence) else {
            crate::fatal!("import cache incomplete after a successful resolve");
        };
        Ok(ImportedFrame {
            sequence: snapshot.sequence,
            view: texture.view,
            size: texture.size,
            fence: fence.fence.get(),
            fence_value: snapshot.fence_value,
            imported: !texture_hit,
        })
    }

    fn import_texture(&mut self, device: &mut D, snapshot: &Snapshot) -> Result<(), ImportFault> {
        let desc = TextureDesc {
            producer: snapshot.producer,
            size: snapshot.size,
            format: snapshot.format,
        };
        let texture = device.import_texture(snapshot.texture, &desc)?;
        let view = device.texture_view(&texture);
        self.stats.texture_imports += 1;
        tracing::debug!(
            handle = snapshot.texture.0,
            width = snapshot.size.width,
            height = snapshot.size.height,
            "imported shared texture"
        );
        self.texture = Some(TextureEntry {
            producer: snapshot.producer,
            handle: snapshot.texture,
            size: snapshot.size,
            format: snapshot.format,
            texture: Owned::new(texture, "imported texture"),
            view,
        });
        Ok(())
    }

    fn import_fence(&mut self, device: &mut D, snapshot: &Snapshot) -> Result<(), ImportFault> {
        let fence = device.import_fence(snapshot.producer, snapshot.fence)?;
        self.stats.fence_imports += 1;
        tracing::debug!(handle = snapshot.fence.0, "imported shared fence");
        self.fence = Some(FenceEntry {
            producer: snapshot.producer,
            handle: snapshot.fence,
            fence: Owned::new(fence, "imported fence"),
        });
        Ok(())
    }

    fn release_fence(&mut self, device: &mut D) {
        if let Some(entry) = self.fence.take() {
            entry.fence.release(|fence| device.release_fence(fence));
            self.stats.fence_releases += 1;
            tracing::debug!(handle = entry.handle.0, "released shared fence");
        }
    }

    /// Release everything cached. The next resolve imports from scratch.
    pub fn clear(&mut self, device: &mut D) {
        if let Some(entry) = self.texture.take() {
            entry.texture.release(|texture| device.release_texture(texture));
            self.stats.texture_releases += 1;
            tracing::debug!(handle = entry.handle.0, "released shared texture");
        }
        self.release_fence(device);
    }

    /// Whether a texture is currently cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.texture.is_none()
    }

    /// Handle of the cached texture, if any.
    #[must_use]
    pub fn cached_texture(&self) -> Option<TextureHandle> {
        self.texture.as_ref().map(|entry| entry.handle)
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> ImportStats {
        self.stats
    }
}

impl<D: Device> Default for CachedImporter<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::software::{SharedHandles, SoftwareDevice};
    use crate::types::{Color, PixelFormat};

    struct Fixture {
        handles: SharedHandles,
        device: SoftwareDevice,
        cache: CachedImporter<SoftwareDevice>,
        fence: FenceHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let handles = SharedHandles::new();
            let fence = handles.create_fence(0);
            Self {
                device: SoftwareDevice::new(handles.clone()),
                handles,
                cache: CachedImporter::new(),
                fence,
            }
        }

        fn texture(&self) -> TextureHandle {
            let handle = self
                .handles
                .create_texture(PixelSize::new(800, 600), PixelFormat::Rgba8Unorm);
            self.handles.fill(handle, Color::WHITE);
            handle
        }

        fn snapshot(&self, sequence: u64, texture: TextureHandle) -> Snapshot {
            Snapshot {
                sequence,
                size: PixelSize::new(800, 600),
                format: PixelFormat::Rgba8Unorm,
                producer: ProducerKind::Software,
                texture,
                fence: self.fence,
                fence_value: sequence,
            }
        }
    }

    #[test]
    fn unchanged_handle_is_imported_once() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = fx.snapshot(5, h1);

        let first = fx.cache.resolve(&mut fx.device, &snap).unwrap();
        assert!(first.imported);
        let view = first.view;
        let again = fx.cache.resolve(&mut fx.device, &snap).unwrap();
        assert!(!again.imported);
        assert_eq!(again.view, view);

        let stats = fx.cache.stats();
        assert_eq!(stats.texture_imports, 1);
        assert_eq!(stats.fence_imports, 1);
        assert_eq!(stats.texture_releases, 0);
    }

    #[test]
    fn new_handle_releases_previous_import_first() {
        let mut fx = Fixture::new();
        let (h1, h2) = (fx.texture(), fx.texture());
        let snap1 = fx.snapshot(5, h1);
        let snap2 = fx.snapshot(6, h2);
        fx.cache.resolve(&mut fx.device, &snap1).unwrap();
        fx.cache.resolve(&mut fx.device, &snap2).unwrap();

        let stats = fx.cache.stats();
        assert_eq!(stats.texture_imports, 2);
        assert_eq!(stats.texture_releases, 1);
        assert_eq!(fx.cache.cached_texture(), Some(h2));
        assert_eq!(fx.device.live_imports(), 2);
    }

    #[test]
    fn fence_only_change_keeps_texture() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = fx.snapshot(1, h1);
        fx.cache.resolve(&mut fx.device, &snap).unwrap();

        let other_fence = fx.handles.create_fence(0);
        let snap = Snapshot {
            sequence: 2,
            fence: other_fence,
            ..snap
        };
        let frame = fx.cache.resolve(&mut fx.device, &snap).unwrap();
        assert!(!frame.imported);

        let stats = fx.cache.stats();
        assert_eq!(stats.texture_imports, 1);
        assert_eq!(stats.fence_imports, 2);
        assert_eq!(stats.fence_releases, 1);
    }

    #[test]
    fn failed_import_leaves_cache_empty() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = fx.snapshot(1, h1);
        fx.cache.resolve(&mut fx.device, &snap).unwrap();

        let stale = fx.snapshot(2, TextureHandle(9_999));
        assert_eq!(
            fx.cache.resolve(&mut fx.device, &stale).unwrap_err(),
            ImportFault::InvalidTexture(TextureHandle(9_999))
        );
        assert!(fx.cache.is_empty());
        assert_eq!(fx.cache.stats().texture_releases, 1);
        assert_eq!(fx.device.live_imports(), 0);
    }

    #[test]
    fn failed_fence_import_releases_new_texture() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = Snapshot {
            fence: FenceHandle(4_242),
            ..fx.snapshot(1, h1)
        };
        assert_eq!(
            fx.cache.resolve(&mut fx.device, &snap).unwrap_err(),
            ImportFault::InvalidFence(FenceHandle(4_242))
        );
        assert!(fx.cache.is_empty());
        assert_eq!(fx.device.live_imports(), 0);
    }

    #[test]
    fn foreign_producer_is_a_device_mismatch() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = Snapshot {
            producer: ProducerKind::D3D12,
            ..fx.snapshot(1, h1)
        };
        assert!(matches!(
            fx.cache.resolve(&mut fx.device, &snap),
            Err(ImportFault::DeviceMismatch {
                producer: ProducerKind::D3D12,
                ..
            })
        ));
    }

    #[test]
    fn clear_forces_reimport() {
        let mut fx = Fixture::new();
        let h1 = fx.texture();
        let snap = fx.snapshot(1, h1);
        fx.cache.resolve(&mut fx.device, &snap).unwrap();
        fx.cache.clear(&mut fx.device);
        assert!(fx.cache.resolve(&mut fx.device, &snap).unwrap().imported);
        assert_eq!(fx.cache.stats().texture_imports, 2);
        fx.cache.clear(&mut fx.device);
    }
}

//! Cross-process GPU frame transport.
//!
//! A producer process renders into a shared texture, then publishes a small
//! [`Snapshot`] (sequence number, size, format, texture handle, fence handle
//! and fence value) through a seqlock-protected shared-memory block. Each
//! consumer polls that block once per tick and, when the sequence advanced,
//! composites the frame into its own surface:
//!
//! - [`channel`]: the shared [`ChannelLayout`], its [`ChannelWriter`] and
//!   non-blocking [`ChannelReader`], and a POSIX [`ShmRegion`] mapping.
//! - [`cache`]: [`CachedImporter`] turns a snapshot into imported device
//!   objects, re-importing only when the published handles change.
//! - [`sprite_batch`]: [`SpriteBatch`] groups textured quads into draw calls
//!   of up to [`MAX_SPRITES_PER_BATCH`] distinct sources.
//! - [`pump`]: [`FramePump`] wires the three together behind a single
//!   [`tick`](FramePump::tick).
//!
//! The GPU sits behind the [`Device`] trait. [`backend::software`] is a CPU
//! reference implementation; [`backend::gl`] (feature `glow`, on by default)
//! targets OpenGL 3.3 through [glow].
//!
//! # Synchronization
//!
//! Consumers never block on the producer. A tick queues a device-side wait on
//! the producer's fence at the published value before sampling the texture,
//! and optionally signals a completion fence once the composited work
//! finishes. Misusing the compositor state machine is a contract violation
//! and aborts through [`fatal`](fatal::fatal); everything else is reported as
//! an error value.
//!
//! [glow]: https://docs.rs/glow

pub mod backend;
pub mod cache;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod fatal;
pub mod owned;
pub mod pump;
#[cfg(feature = "glow")]
pub mod shaders;
pub mod sprite_batch;
pub mod types;

pub use cache::{CachedImporter, ImportStats, ImportedFrame};
#[cfg(all(unix, not(all(feature = "loom", test))))]
pub use channel::ShmRegion;
pub use channel::{ChannelLayout, ChannelReader, ChannelWriter, Snapshot};
pub use config::RelayConfig;
pub use device::{BatchSubmission, Device, TextureDesc};
pub use error::{ConfigError, FrameError, ImportFault, SynchronizationFault, TransportFault};
pub use owned::Owned;
pub use pump::{FramePump, TickOutcome, TickRequest};
pub use sprite_batch::{BatchStats, Sprite, SpriteBatch, MAX_SPRITES_PER_BATCH};
pub use types::{
    Color, FenceHandle, PixelFormat, PixelRect, PixelSize, ProducerKind, TargetHandle,
    TextureHandle, Vertex,
};

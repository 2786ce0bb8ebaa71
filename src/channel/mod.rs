//! The shared snapshot channel.
//!
//! A fixed-layout block of atomics, owned by the producer and mapped
//! read-only by any number of consumers. The producer publishes one
//! [`Snapshot`] per finished frame; consumers poll without ever blocking.
//!
//! # Consistency protocol
//!
//! The block starts with a generation counter used as a seqlock:
//!
//! 1. The writer makes `generation` odd, then stores the metadata fields.
//! 2. The writer makes `generation` even again as the final publish step.
//! 3. A reader loads `generation`, the fields, then `generation` again. If the
//!    two loads differ, or the first was odd, the read raced a writer and is
//!    retried.
//!
//! Retries are bounded. A reader that keeps losing the race reports
//! [`TransportFault::Contended`] instead of spinning forever, and the frame
//! pump treats that the same as "no new frame".
//!
//! # Layout
//!
//! | Offset | Field            | Type  |
//! |--------|------------------|-------|
//! | 0      | `generation`     | `u64` |
//! | 8      | `sequence`       | `u64` |
//! | 16     | `width`          | `u32` |
//! | 20     | `height`         | `u32` |
//! | 24     | `pixel_format`   | `u32` |
//! | 28     | `producer_kind`  | `u32` |
//! | 32     | `texture_handle` | `u64` |
//! | 40     | `fence_handle`   | `u64` |
//! | 48     | `fence_value`    | `u64` |
//!
//! All zeroes is the valid "never published" state, so a freshly truncated
//! shared-memory object needs no initialization.

#[cfg(all(unix, not(all(feature = "loom", test))))]
mod region;

#[cfg(all(unix, not(all(feature = "loom", test))))]
pub use region::ShmRegion;

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{fence, AtomicU32, AtomicU64};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{fence, AtomicU32, AtomicU64};

use std::ops::Deref;
use std::sync::atomic::Ordering;

use crate::error::TransportFault;
use crate::types::{FenceHandle, PixelFormat, PixelSize, ProducerKind, TextureHandle};

/// Size of [`ChannelLayout`] in bytes. Part of the cross-process contract.
pub const CHANNEL_LAYOUT_BYTES: usize = 56;

/// Default bound on consistent-read attempts per poll.
pub const DEFAULT_READ_ATTEMPTS: u32 = 8;

/// Attempts after which the reader yields its time slice between retries
/// instead of spinning.
const SPIN_ATTEMPTS: u32 = 4;

/// One published frame: its metadata and the handles of its resources.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Strictly increasing per published frame; `0` is never published.
    pub sequence: u64,
    /// Size of the shared texture.
    pub size: PixelSize,
    /// Format of the shared texture.
    pub format: PixelFormat,
    /// API the producer rendered with; the namespace of the handles below.
    pub producer: ProducerKind,
    /// Shared texture holding the frame.
    pub texture: TextureHandle,
    /// Shared fence the producer signals when the texture is complete.
    pub fence: FenceHandle,
    /// Value `fence` reaches once rendering into `texture` has completed.
    pub fence_value: u64,
}

/// The shared-memory block. See the [module docs](self) for the layout.
#[repr(C)]
#[derive(Debug)]
pub struct ChannelLayout {
    generation: AtomicU64,
    sequence: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
    pixel_format: AtomicU32,
    producer_kind: AtomicU32,
    texture_handle: AtomicU64,
    fence_handle: AtomicU64,
    fence_value: AtomicU64,
}

/// Field values exactly as stored, before tag validation.
#[derive(Copy, Clone, Debug)]
struct RawFields {
    sequence: u64,
    width: u32,
    height: u32,
    pixel_format: u32,
    producer_kind: u32,
    texture_handle: u64,
    fence_handle: u64,
    fence_value: u64,
}

impl RawFields {
    fn decode(self) -> Result<Snapshot, TransportFault> {
        if self.sequence == 0 {
            return Err(TransportFault::NeverPublished);
        }
        let format =
            PixelFormat::from_tag(self.pixel_format).ok_or(TransportFault::LayoutMismatch {
                field: "pixel_format",
                found: self.pixel_format,
            })?;
        let producer =
            ProducerKind::from_tag(self.producer_kind).ok_or(TransportFault::LayoutMismatch {
                field: "producer_kind",
                found: self.producer_kind,
            })?;
        Ok(Snapshot {
            sequence: self.sequence,
            size: PixelSize::new(self.width, self.height),
            format,
            producer,
            texture: TextureHandle(self.texture_handle),
            fence: FenceHandle(self.fence_handle),
            fence_value: self.fence_value,
        })
    }
}

impl ChannelLayout {
    /// An unpublished channel (all zeroes).
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            pixel_format: AtomicU32::new(0),
            producer_kind: AtomicU32::new(0),
            texture_handle: AtomicU64::new(0),
            fence_handle: AtomicU64::new(0),
            fence_value: AtomicU64::new(0),
        }
    }

    /// Current generation counter. Odd while a write is in progress.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Mark a write as in progress and return the odd generation.
    fn begin_write(&self) -> u64 {
        // An odd value here means a previous writer died mid-write; the
        // counter stays odd and the next store completes it.
        let odd = self.generation.load(Ordering::Relaxed) | 1;
        self.generation.store(odd, Ordering::Relaxed);
        fence(Ordering::Release);
        odd
    }

    fn store_fields(&self, snapshot: &Snapshot) {
        self.sequence.store(snapshot.sequence, Ordering::Relaxed);
        self.width.store(snapshot.size.width, Ordering::Relaxed);
        self.height.store(snapshot.size.height, Ordering::Relaxed);
        self.pixel_format
            .store(snapshot.format.tag(), Ordering::Relaxed);
        self.producer_kind
            .store(snapshot.producer.tag(), Ordering::Relaxed);
        self.texture_handle
            .store(snapshot.texture.0, Ordering::Relaxed);
        self.fence_handle.store(snapshot.fence.0, Ordering::Relaxed);
        self.fence_value
            .store(snapshot.fence_value, Ordering::Relaxed);
    }

    /// Make the generation even again, publishing the stored fields.
    fn end_write(&self, odd: u64) {
        self.generation
            .store(odd.wrapping_add(1), Ordering::Release);
    }

    fn load_fields(&self) -> RawFields {
        RawFields {
            sequence: self.sequence.load(Ordering::Relaxed),
            width: self.width.load(Ordering::Relaxed),
            height: self.height.load(Ordering::Relaxed),
            pixel_format: self.pixel_format.load(Ordering::Relaxed),
            producer_kind: self.producer_kind.load(Ordering::Relaxed),
            texture_handle: self.texture_handle.load(Ordering::Relaxed),
            fence_handle: self.fence_handle.load(Ordering::Relaxed),
            fence_value: self.fence_value.load(Ordering::Relaxed),
        }
    }

    /// One consistent-read attempt. `None` means the read raced a writer.
    fn try_load(&self) -> Option<RawFields> {
        let before = self.generation.load(Ordering::Acquire);
        if before & 1 != 0 {
            return None;
        }
        let fields = self.load_fields();
        fence(Ordering::Acquire);
        let after = self.generation.load(Ordering::Relaxed);
        (before == after).then_some(fields)
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::new()
    }
}

/// The producer's end of a channel.
///
/// There must be at most one writer per channel; the seqlock does not
/// arbitrate between concurrent writers.
pub struct ChannelWriter<M> {
    memory: M,
    last_sequence: u64,
}

impl<M: Deref<Target = ChannelLayout>> ChannelWriter<M> {
    /// Wrap the producer's mapping of the channel.
    pub fn new(memory: M) -> Self {
        let last_sequence = memory.sequence.load(Ordering::Relaxed);
        Self {
            memory,
            last_sequence,
        }
    }

    /// Publish `snapshot`, replacing the previous one.
    ///
    /// Sequence numbers must strictly increase; anything else is a contract
    /// violation and aborts the process.
    pub fn publish(&mut self, snapshot: &Snapshot) {
        if snapshot.sequence <= self.last_sequence {
            crate::fatal!(
                "snapshot sequence {} does not follow {}",
                snapshot.sequence,
                self.last_sequence
            );
        }

        let layout = &*self.memory;
        let odd = layout.begin_write();
        layout.store_fields(snapshot);
        layout.end_write(odd);
        self.last_sequence = snapshot.sequence;

        tracing::trace!(
            sequence = snapshot.sequence,
            texture = snapshot.texture.0,
            "published snapshot"
        );
    }

    /// Sequence number of the most recent publish, `0` if none.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

/// A consumer's end of a channel.
///
/// Tracks the last sequence number handed out by [`try_read`](Self::try_read)
/// so each published frame is reported as new exactly once.
pub struct ChannelReader<M> {
    memory: M,
    max_attempts: u32,
    last_consumed: u64,
}

impl<M: Deref<Target = ChannelLayout>> ChannelReader<M> {
    /// Wrap a consumer mapping with the default retry bound.
    pub fn new(memory: M) -> Self {
        Self::with_attempts(memory, DEFAULT_READ_ATTEMPTS)
    }

    /// Wrap a consumer mapping, allowing up to `max_attempts` consistent-read
    /// attempts per poll (at least one is always made).
    pub fn with_attempts(memory: M, max_attempts: u32) -> Self {
        Self {
            memory,
            max_attempts: max_attempts.max(1),
            last_consumed: 0,
        }
    }

    /// Read the current snapshot, retrying while a writer is active.
    ///
    /// # Errors
    ///
    /// - [`TransportFault::NeverPublished`] if nothing was published yet.
    /// - [`TransportFault::Contended`] if every attempt raced a writer.
    /// - [`TransportFault::LayoutMismatch`] if a tag is unrecognized.
    pub fn read_consistent(&self) -> Result<Snapshot, TransportFault> {
        for attempt in 1..=self.max_attempts {
            if let Some(fields) = self.memory.try_load() {
                return fields.decode();
            }
            if attempt < SPIN_ATTEMPTS {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        Err(TransportFault::Contended {
            attempts: self.max_attempts,
        })
    }

    /// The most recent complete snapshot, whether or not it was consumed.
    ///
    /// Transport faults are absorbed and reported as `None`.
    #[must_use]
    pub fn latest(&self) -> Option<Snapshot> {
        match self.read_consistent() {
            Ok(snapshot) => Some(snapshot),
            Err(TransportFault::NeverPublished) => None,
            Err(fault) => {
                tracing::warn!(%fault, "snapshot read absorbed");
                None
            }
        }
    }

    /// The most recent snapshot if it is newer than the last one returned
    /// from this method, otherwise `None`.
    pub fn try_read(&mut self) -> Option<Snapshot> {
        let snapshot = self.latest()?;
        if snapshot.sequence <= self.last_consumed {
            return None;
        }
        self.last_consumed = snapshot.sequence;
        Some(snapshot)
    }

    /// Sequence number of the last snapshot returned by
    /// [`try_read`](Self::try_read), if any.
    #[must_use]
    pub fn last_consumed(&self) -> Option<u64> {
        (self.last_consumed != 0).then_some(self.last_consumed)
    }

    /// Forget what was consumed, so the current snapshot is reported as new
    /// on the next [`try_read`](Self::try_read).
    pub fn rewind(&mut self) {
        self.last_consumed = 0;
    }
}

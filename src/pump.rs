//! The per-tick composition root.
//!
//! A [`FramePump`] owns one consumer's device, channel reader, import cache
//! and compositor. Each [`tick`](FramePump::tick) polls the channel and, when
//! a new frame was published, draws it into the caller's destination:
//!
//! 1. open the destination and completion fence (cached by handle),
//! 2. resolve the snapshot through the [`CachedImporter`],
//! 3. queue a GPU-side wait on the producer's fence at the published value,
//! 4. draw the whole frame into the destination rectangle,
//! 5. submit, then signal the completion fence at the next value.
//!
//! No step blocks the calling thread on the producer.

use std::ops::Deref;

use crate::cache::{CachedImporter, ImportStats};
use crate::channel::{ChannelLayout, ChannelReader};
use crate::config::RelayConfig;
use crate::device::Device;
use crate::error::{ConfigError, FrameError, ImportFault};
use crate::owned::Owned;
use crate::sprite_batch::{BatchStats, Sprite, SpriteBatch};
use crate::types::{Color, FenceHandle, PixelRect, PixelSize, TargetHandle};

/// Where and how to present this tick's frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TickRequest {
    /// Destination surface, in the device's own handle namespace.
    pub target: TargetHandle,
    /// Size of the destination surface.
    pub target_size: PixelSize,
    /// Region of the destination the frame is scaled into.
    pub dest_rect: PixelRect,
    /// Fence to signal once the composited work completes.
    pub completion_fence: Option<FenceHandle>,
}

/// What a tick did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing new was published; the destination was left untouched.
    NoNewFrame,
    /// A new frame was drawn into the destination.
    Composited {
        /// Sequence number of the drawn snapshot.
        sequence: u64,
        /// Whether the shared texture had to be imported this tick.
        imported: bool,
        /// Value the completion fence will reach, if one was supplied.
        completion_value: Option<u64>,
    },
}

struct OpenTarget<D: Device> {
    handle: TargetHandle,
    size: PixelSize,
    target: Owned<D::Target>,
    view: D::TargetView,
}

struct CompletionFence<D: Device> {
    handle: FenceHandle,
    fence: Owned<D::Fence>,
}

/// One consumer's frame pump. See the [module docs](self).
pub struct FramePump<D: Device, M> {
    device: D,
    reader: ChannelReader<M>,
    cache: CachedImporter<D>,
    batch: SpriteBatch<D>,
    clear_color: Option<Color>,
    target: Option<OpenTarget<D>>,
    completion: Option<CompletionFence<D>>,
    completion_value: u64,
}

impl<D: Device, M: Deref<Target = ChannelLayout>> FramePump<D, M> {
    /// Build a pump reading the channel mapped at `memory`. The device's
    /// fence waits are bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` does not validate.
    pub fn new(mut device: D, memory: M, config: &RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        device.set_fence_timeout(config.fence_timeout());
        tracing::debug!(
            device = device.name(),
            read_retries = config.read_retries,
            fence_timeout_ms = config.fence_timeout_ms,
            "frame pump created"
        );
        Ok(Self {
            device,
            reader: ChannelReader::with_attempts(memory, config.read_retries),
            cache: CachedImporter::new(),
            batch: SpriteBatch::new(),
            clear_color: config.clear_color,
            target: None,
            completion: None,
            completion_value: 0,
        })
    }

    /// Poll for a new frame and composite it.
    ///
    /// Transport faults are absorbed and reported as
    /// [`TickOutcome::NoNewFrame`]. On error the frame is not consumed, so
    /// the next tick retries it.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Import`] if the destination, the completion
    /// fence or the snapshot's resources cannot be opened, and
    /// [`FrameError::Synchronization`] if the GPU work cannot be submitted.
    #[tracing::instrument(level = "trace", skip_all, fields(target = request.target.0))]
    pub fn tick(&mut self, request: &TickRequest) -> Result<TickOutcome, FrameError> {
        let Some(snapshot) = self.reader.try_read() else {
            tracing::trace!("no new frame");
            return Ok(TickOutcome::NoNewFrame);
        };
        if snapshot.size.is_empty() {
            tracing::warn!(sequence = snapshot.sequence, "skipping empty snapshot");
            return Ok(TickOutcome::NoNewFrame);
        }

        let outcome = self.composite(request, &snapshot);
        match &outcome {
            Ok(outcome) => tracing::trace!(?outcome, "tick complete"),
            Err(error) => {
                tracing::debug!(%error, sequence = snapshot.sequence, "tick failed");
                self.reader.rewind();
            }
        }
        outcome
    }

    fn composite(
        &mut self,
        request: &TickRequest,
        snapshot: &crate::channel::Snapshot,
    ) -> Result<TickOutcome, FrameError> {
        let target = self.open_target(request.target, request.target_size)?;
        self.open_completion(request.completion_fence)?;

        let frame = self.cache.resolve(&mut self.device, snapshot)?;
        self.device.queue_wait(frame.fence, frame.fence_value)?;

        self.batch.begin(target, request.target_size);
        if self.clear_color.is_some() {
            self.batch.clear(self.clear_color);
        }
        let drawn = self.batch.draw(
            &mut self.device,
            &Sprite {
                source: frame.view,
                source_size: frame.size,
                source_rect: frame.size.to_rect(),
                dest_rect: request.dest_rect,
                tint: Color::WHITE,
            },
        );
        let sequence = frame.sequence;
        let imported = frame.imported;

        let next_value = self.completion_value + 1;
        let completion = self
            .completion
            .as_mut()
            .map(|completion| (completion.fence.get_mut(), next_value));
        let signaled = completion.is_some();
        let ended = self.batch.end(&mut self.device, completion);
        drawn?;
        ended?;

        let completion_value = signaled.then(|| {
            self.completion_value = next_value;
            next_value
        });
        Ok(TickOutcome::Composited {
            sequence,
            imported,
            completion_value,
        })
    }

    fn open_target(
        &mut self,
        handle: TargetHandle,
        size: PixelSize,
    ) -> Result<D::TargetView, ImportFault> {
        if let Some(open) = &self.target {
            if open.handle == handle && open.size == size {
                return Ok(open.view);
            }
        }
        self.release_target();

        let target = self.device.open_target(handle, size)?;
        let view = self.device.target_view(&target);
        tracing::debug!(
            handle = handle.0,
            width = size.width,
            height = size.height,
            "opened destination"
        );
        self.target = Some(OpenTarget {
            handle,
            size,
            target: Owned::new(target, "destination target"),
            view,
        });
        Ok(view)
    }

    fn open_completion(&mut self, handle: Option<FenceHandle>) -> Result<(), ImportFault> {
        if self.completion.as_ref().map(|c| c.handle) == handle {
            return Ok(());
        }
        self.release_completion();

        let Some(handle) = handle else {
            return Ok(());
        };
        let kind = self.device.native_kind();
        let fence = self.device.import_fence(kind, handle)?;
        tracing::debug!(handle = handle.0, "opened completion fence");
        self.completion = Some(CompletionFence {
            handle,
            fence: Owned::new(fence, "completion fence"),
        });
        Ok(())
    }

    fn release_target(&mut self) {
        if let Some(open) = self.target.take() {
            open.target
                .release(|target| self.device.release_target(target));
            tracing::debug!(handle = open.handle.0, "released destination");
        }
    }

    fn release_completion(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion
                .fence
                .release(|fence| self.device.release_fence(fence));
            tracing::debug!(handle = completion.handle.0, "released completion fence");
        }
    }

    /// Release every import and forget what was consumed, so the next tick
    /// re-imports and recomposites the current frame.
    pub fn reset(&mut self) {
        self.cache.clear(&mut self.device);
        self.release_target();
        self.release_completion();
        self.reader.rewind();
        tracing::debug!("frame pump reset");
    }

    /// The device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The device, mutably. Work recorded here is submitted with the next
    /// composited frame.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The channel reader.
    #[must_use]
    pub fn reader(&self) -> &ChannelReader<M> {
        &self.reader
    }

    /// Import counters.
    #[must_use]
    pub fn import_stats(&self) -> ImportStats {
        self.cache.stats()
    }

    /// Compositor counters.
    #[must_use]
    pub fn batch_stats(&self) -> BatchStats {
        self.batch.stats()
    }

    /// The last value signaled on a completion fence, `0` if none.
    #[must_use]
    pub fn completion_value(&self) -> u64 {
        self.completion_value
    }
}

impl<D: Device, M> Drop for FramePump<D, M> {
    fn drop(&mut self) {
        self.cache.clear(&mut self.device);
        if let Some(open) = self.target.take() {
            open.target
                .release(|target| self.device.release_target(target));
        }
        if let Some(completion) = self.completion.take() {
            completion
                .fence
                .release(|fence| self.device.release_fence(fence));
        }
    }
}

//! The GPU seam.
//!
//! Everything above this trait (the import cache, the sprite batch, the frame
//! pump) is API-agnostic. A [`Device`] turns native handles into GPU objects,
//! records sprite batches against a bound target, and orders work on its
//! queue with value-based fences.
//!
//! Queue semantics: [`queue_wait`](Device::queue_wait) and
//! [`queue_signal`](Device::queue_signal) are GPU-side operations. They are
//! ordered with respect to work recorded before and after them and must not
//! block the calling thread indefinitely.

use std::fmt;
use std::time::Duration;

use crate::error::{ImportFault, SynchronizationFault};
use crate::types::{
    Color, FenceHandle, PixelFormat, PixelSize, ProducerKind, TargetHandle, TextureHandle, Vertex,
};

/// What a snapshot claims about a shared texture; checked at import time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    /// API the handle belongs to.
    pub producer: ProducerKind,
    /// Expected size.
    pub size: PixelSize,
    /// Expected format.
    pub format: PixelFormat,
}

/// One flush of the sprite batch.
#[derive(Debug)]
pub struct BatchSubmission<'a, V, T> {
    /// Render target the batch draws into.
    pub target: T,
    /// Size of `target`.
    pub target_size: PixelSize,
    /// Clear applied to the whole target before drawing, if requested.
    pub clear: Option<Color>,
    /// Source views; `Vertex::texture_index` indexes into this slice.
    pub sources: &'a [V],
    /// Six vertices per sprite, in draw order.
    pub vertices: &'a [Vertex],
}

/// A GPU API able to import producer resources and composite sprites.
pub trait Device {
    /// An imported shared texture.
    type Texture;
    /// An imported or locally created fence.
    type Fence;
    /// An opened destination surface.
    type Target;
    /// Cheap, copyable reference to a texture for sampling.
    type View: Copy + PartialEq + fmt::Debug;
    /// Cheap, copyable reference to a target for rendering.
    type TargetView: Copy + PartialEq + fmt::Debug;

    /// Short name used in logs and faults.
    fn name(&self) -> &'static str;

    /// The namespace of handles this device itself hands out, such as the
    /// caller's destination surface and completion fence.
    fn native_kind(&self) -> ProducerKind;

    /// Whether handles published by `producer` can be imported.
    fn can_import(&self, producer: ProducerKind) -> bool;

    /// Bound every fence wait this device performs on the CPU by `timeout`.
    ///
    /// Devices whose waits are purely GPU-side have nothing to bound and
    /// keep the default, which ignores it.
    fn set_fence_timeout(&mut self, _timeout: Duration) {}

    /// Open a shared texture.
    ///
    /// # Errors
    ///
    /// Returns an [`ImportFault`] if the handle is invalid or the resource
    /// does not match `desc`.
    fn import_texture(
        &mut self,
        handle: TextureHandle,
        desc: &TextureDesc,
    ) -> Result<Self::Texture, ImportFault>;

    /// A sampling view of an imported texture.
    fn texture_view(&self, texture: &Self::Texture) -> Self::View;

    /// Release an imported texture.
    fn release_texture(&mut self, texture: Self::Texture);

    /// Open a shared fence.
    ///
    /// # Errors
    ///
    /// Returns an [`ImportFault`] if the handle is invalid.
    fn import_fence(
        &mut self,
        producer: ProducerKind,
        handle: FenceHandle,
    ) -> Result<Self::Fence, ImportFault>;

    /// Release an imported fence.
    fn release_fence(&mut self, fence: Self::Fence);

    /// Open a caller-supplied destination surface.
    ///
    /// # Errors
    ///
    /// Returns an [`ImportFault`] if the handle is invalid or `size` does not
    /// match the surface.
    fn open_target(
        &mut self,
        handle: TargetHandle,
        size: PixelSize,
    ) -> Result<Self::Target, ImportFault>;

    /// A rendering view of an opened target.
    fn target_view(&self, target: &Self::Target) -> Self::TargetView;

    /// Release an opened target.
    fn release_target(&mut self, target: Self::Target);

    /// Clear `target` without drawing anything.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if recording fails.
    fn clear_target(
        &mut self,
        target: Self::TargetView,
        target_size: PixelSize,
        color: Color,
    ) -> Result<(), SynchronizationFault>;

    /// Upload the batch's vertices and issue one draw call.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if recording fails.
    fn draw_batch(
        &mut self,
        batch: &BatchSubmission<'_, Self::View, Self::TargetView>,
    ) -> Result<(), SynchronizationFault>;

    /// Hand all recorded work to the GPU queue.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if submission fails or a queued
    /// wait cannot be satisfied within the device's bound.
    fn submit(&mut self) -> Result<(), SynchronizationFault>;

    /// Make subsequent queue work wait until `fence` reaches `value`.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if the wait cannot be queued.
    fn queue_wait(&mut self, fence: &Self::Fence, value: u64) -> Result<(), SynchronizationFault>;

    /// Signal `fence` to `value` once all previously recorded work completes.
    ///
    /// # Errors
    ///
    /// Returns a [`SynchronizationFault`] if the signal cannot be queued.
    fn queue_signal(
        &mut self,
        fence: &mut Self::Fence,
        value: u64,
    ) -> Result<(), SynchronizationFault>;
}

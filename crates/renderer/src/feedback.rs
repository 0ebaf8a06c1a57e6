//! Double-buffered render targets for shaders that read their previous frame.
//!
//! ```text
//!   frame n:    draw ─▶ [A: writable]     [B: previous] ─▶ sampled as texLastFrame*
//!   swap()
//!   frame n+1:  draw ─▶ [B: writable]     [A: previous] ─▶ sampled as texLastFrame*
//! ```
//!
//! Swapping only flips which slot is writable; image contents never move.

use tracing::debug;

use crate::gpu::{GpuApi, GpuError};
use crate::target::{RenderTarget, DEFAULT_ATTACHMENTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

#[derive(Debug)]
pub struct FeedbackSurface<G: GpuApi> {
    target_a: RenderTarget<G>,
    target_b: RenderTarget<G>,
    writable: Slot,
}

impl<G: GpuApi> FeedbackSurface<G> {
    /// Creates a 1x1 surface with slot A writable.
    pub fn new(gpu: &mut G) -> Result<Self, GpuError> {
        let (target_a, target_b) = allocate_pair(gpu, 1, 1)?;
        Ok(Self {
            target_a,
            target_b,
            writable: Slot::A,
        })
    }

    pub fn writable_slot(&self) -> Slot {
        self.writable
    }

    fn target(&self, slot: Slot) -> &RenderTarget<G> {
        match slot {
            Slot::A => &self.target_a,
            Slot::B => &self.target_b,
        }
    }

    /// Draws one full-screen quad into every attachment of the writable target.
    ///
    /// The target is deactivated again even when the draw fails.
    pub fn render(&self, gpu: &mut G) -> Result<(), GpuError> {
        let target = self.target(self.writable);
        target.activate(gpu);
        let result = gpu.draw_fullscreen_quad();
        target.deactivate(gpu);
        result
    }

    /// Primary image of the writable target.
    pub fn current_output(&self) -> &G::Texture {
        self.target(self.writable).primary()
    }

    /// Every attachment of the target written during the previous frame.
    pub fn previous_outputs(&self) -> &[G::Texture] {
        self.target(self.writable.other()).attachments()
    }

    pub fn swap(&mut self) {
        self.writable = self.writable.other();
    }

    pub fn size(&self) -> (u32, u32) {
        (self.target_a.width(), self.target_a.height())
    }

    /// Reallocates both targets at `width`x`height`.
    ///
    /// Returns `Ok(false)` without touching the GPU when either dimension is
    /// zero or the size is unchanged. The new pair is allocated before the
    /// old one is released, so a failed allocation leaves the surface intact.
    pub fn resize(&mut self, gpu: &mut G, width: u32, height: u32) -> Result<bool, GpuError> {
        if width == 0 || height == 0 || self.size() == (width, height) {
            return Ok(false);
        }

        let (target_a, target_b) = allocate_pair(gpu, width, height)?;
        let old_a = std::mem::replace(&mut self.target_a, target_a);
        let old_b = std::mem::replace(&mut self.target_b, target_b);
        old_a.destroy(gpu);
        old_b.destroy(gpu);
        debug!(width, height, writable = ?self.writable, "feedback surface resized");
        Ok(true)
    }

    pub fn destroy(self, gpu: &mut G) {
        self.target_a.destroy(gpu);
        self.target_b.destroy(gpu);
    }
}

fn allocate_pair<G: GpuApi>(
    gpu: &mut G,
    width: u32,
    height: u32,
) -> Result<(RenderTarget<G>, RenderTarget<G>), GpuError> {
    let first = RenderTarget::new(gpu, width, height, DEFAULT_ATTACHMENTS)?;
    match RenderTarget::new(gpu, width, height, DEFAULT_ATTACHMENTS) {
        Ok(second) => Ok((first, second)),
        Err(err) => {
            first.destroy(gpu);
            Err(err)
        }
    }
}

use crate::gpu::{GpuApi, GpuError};

/// Attachments per render target: primary colour plus one auxiliary output.
pub const DEFAULT_ATTACHMENTS: usize = 2;

/// Equally sized colour attachments drawn into together.
///
/// A target is never resized in place; owners destroy it and allocate a new
/// one when the requested size changes.
#[derive(Debug)]
pub struct RenderTarget<G: GpuApi> {
    attachments: Vec<G::Texture>,
    handle: G::RenderTarget,
    width: u32,
    height: u32,
}

impl<G: GpuApi> RenderTarget<G> {
    /// Allocates `attachment_count` textures of `width`x`height`.
    ///
    /// On failure every texture allocated so far is released again.
    pub fn new(
        gpu: &mut G,
        width: u32,
        height: u32,
        attachment_count: usize,
    ) -> Result<Self, GpuError> {
        if attachment_count == 0 {
            return Err(GpuError::EmptyRenderTarget);
        }
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize {
                width,
                height,
                max: u32::MAX,
            });
        }

        let mut attachments = Vec::with_capacity(attachment_count);
        for _ in 0..attachment_count {
            match gpu.create_texture(width, height) {
                Ok(texture) => attachments.push(texture),
                Err(err) => {
                    release_all(gpu, attachments);
                    return Err(err);
                }
            }
        }

        match gpu.create_render_target(&attachments) {
            Ok(handle) => Ok(Self {
                attachments,
                handle,
                width,
                height,
            }),
            Err(err) => {
                release_all(gpu, attachments);
                Err(err)
            }
        }
    }

    /// Routes draws into every attachment, in order, covering the whole target.
    pub fn activate(&self, gpu: &mut G) {
        gpu.bind_render_target(Some(&self.handle));
        gpu.set_viewport(0, 0, self.width, self.height);
    }

    /// Restores the visible framebuffer as the draw destination.
    pub fn deactivate(&self, gpu: &mut G) {
        gpu.bind_render_target(None);
    }

    pub fn primary(&self) -> &G::Texture {
        &self.attachments[0]
    }

    pub fn attachments(&self) -> &[G::Texture] {
        &self.attachments
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Releases the target and then its attachments.
    pub fn destroy(self, gpu: &mut G) {
        gpu.delete_render_target(self.handle);
        release_all(gpu, self.attachments);
    }
}

fn release_all<G: GpuApi>(gpu: &mut G, textures: Vec<G::Texture>) {
    for texture in textures {
        gpu.delete_texture(texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{GpuEvent, RecordingGpu};

    #[test]
    fn allocates_equal_sized_attachments() {
        let mut gpu = RecordingGpu::new();
        let target = RenderTarget::new(&mut gpu, 64, 32, DEFAULT_ATTACHMENTS).unwrap();
        assert_eq!(target.attachments().len(), 2);
        for texture in target.attachments() {
            assert_eq!(gpu.texture_size(texture), Some((64, 32)));
        }
        assert_eq!(target.primary(), &target.attachments()[0]);
        assert_eq!(gpu.live_targets(), 1);
    }

    #[test]
    fn activation_binds_target_and_full_viewport() {
        let mut gpu = RecordingGpu::new();
        let target = RenderTarget::new(&mut gpu, 10, 20, 1).unwrap();
        gpu.clear_events();
        target.activate(&mut gpu);
        assert!(gpu.current_target().is_some());
        assert_eq!(gpu.events.last(), Some(&GpuEvent::Viewport(0, 0, 10, 20)));
        target.deactivate(&mut gpu);
        assert_eq!(gpu.current_target(), None);
    }

    #[test]
    fn failed_allocation_releases_partial_attachments() {
        let mut gpu = RecordingGpu::new();
        gpu.texture_budget = Some(1);
        assert!(RenderTarget::new(&mut gpu, 8, 8, 2).is_err());
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_targets(), 0);
    }

    #[test]
    fn rejects_empty_or_zero_sized_targets() {
        let mut gpu = RecordingGpu::new();
        assert!(matches!(
            RenderTarget::new(&mut gpu, 8, 8, 0),
            Err(GpuError::EmptyRenderTarget)
        ));
        assert!(RenderTarget::new(&mut gpu, 0, 8, 2).is_err());
        assert_eq!(gpu.texture_allocations, 0);
    }

    #[test]
    fn destroy_releases_everything() {
        let mut gpu = RecordingGpu::new();
        let target = RenderTarget::new(&mut gpu, 4, 4, DEFAULT_ATTACHMENTS).unwrap();
        target.destroy(&mut gpu);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_targets(), 0);
    }
}

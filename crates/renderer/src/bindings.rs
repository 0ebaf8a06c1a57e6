//! User textures plus the feedback images, assigned to texture units per draw.
//!
//! Units are numbered fresh every frame: user textures take `0..N` in
//! insertion order and are exposed to the shader as `tex0..`, the previous
//! frame's attachments follow on `N..N+M` as `texLastFrame0..`.

use std::fmt::Display;
use std::path::Path;

use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::gpu::{GpuApi, GpuError, UniformValue};

struct TextureSlot<G: GpuApi, K> {
    identity: K,
    texture: G::Texture,
}

/// Units bound by one [`TextureBindingSet::bind_all_for_draw`] call, in bind order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BoundUnits {
    units: Vec<u32>,
}

impl BoundUnits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &[u32] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

pub struct TextureBindingSet<G: GpuApi, K = String> {
    slots: Vec<TextureSlot<G, K>>,
}

impl<G: GpuApi, K> Default for TextureBindingSet<G, K> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<G, K> TextureBindingSet<G, K>
where
    G: GpuApi,
    K: PartialEq + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an image file under `identity`.
    ///
    /// Returns `false` and leaves the set unchanged when the file cannot be
    /// read or decoded.
    pub fn add_or_update(&mut self, gpu: &mut G, identity: K, path: &Path) -> bool {
        match image::open(path) {
            Ok(decoded) => self.add_or_update_image(gpu, identity, &decoded.to_rgba8()),
            Err(err) => {
                warn!(identity = %identity, path = %path.display(), error = %err, "texture load failed");
                false
            }
        }
    }

    /// Decodes an in-memory encoded image under `identity`.
    pub fn add_or_update_bytes(&mut self, gpu: &mut G, identity: K, bytes: &[u8]) -> bool {
        match image::load_from_memory(bytes) {
            Ok(decoded) => self.add_or_update_image(gpu, identity, &decoded.to_rgba8()),
            Err(err) => {
                warn!(identity = %identity, error = %err, "texture decode failed");
                false
            }
        }
    }

    /// Uploads decoded pixels; an existing identity keeps its position.
    pub fn add_or_update_image(&mut self, gpu: &mut G, identity: K, image: &RgbaImage) -> bool {
        let texture = match gpu.upload_texture(image) {
            Ok(texture) => texture,
            Err(err) => {
                warn!(identity = %identity, error = %err, "texture upload failed");
                return false;
            }
        };

        let (width, height) = image.dimensions();
        match self.slots.iter_mut().find(|slot| slot.identity == identity) {
            Some(slot) => {
                let previous = std::mem::replace(&mut slot.texture, texture);
                gpu.delete_texture(previous);
                info!(identity = %identity, width, height, "texture replaced");
            }
            None => {
                info!(identity = %identity, width, height, "texture added");
                self.slots.push(TextureSlot { identity, texture });
            }
        }
        true
    }

    pub fn remove(&mut self, gpu: &mut G, identity: &K) -> bool {
        let Some(index) = self.slots.iter().position(|slot| slot.identity == *identity) else {
            return false;
        };
        let slot = self.slots.remove(index);
        gpu.delete_texture(slot.texture);
        debug!(identity = %identity, "texture removed");
        true
    }

    /// Identities in insertion order.
    pub fn identities(&self) -> impl Iterator<Item = &K> {
        self.slots.iter().map(|slot| &slot.identity)
    }

    pub fn texture(&self, identity: &K) -> Option<&G::Texture> {
        self.slots
            .iter()
            .find(|slot| slot.identity == *identity)
            .map(|slot| &slot.texture)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Binds user textures, then `previous_outputs`, to consecutive units.
    ///
    /// Every successfully bound unit is recorded in `bound` before the next
    /// one is attempted, so a failure part way still leaves `bound` exact.
    /// Returns the number of units consumed.
    pub fn bind_all_for_draw(
        &self,
        gpu: &mut G,
        program: &G::Program,
        previous_outputs: &[G::Texture],
        bound: &mut BoundUnits,
    ) -> Result<usize, GpuError> {
        let user = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (format!("tex{index}"), &slot.texture));
        let feedback = previous_outputs
            .iter()
            .enumerate()
            .map(|(index, texture)| (format!("texLastFrame{index}"), texture));

        for (unit, (name, texture)) in (0u32..).zip(user.chain(feedback)) {
            gpu.active_texture(unit)?;
            gpu.bind_texture(Some(texture))?;
            bound.units.push(unit);
            gpu.set_uniform(program, &name, UniformValue::Int(unit as i32));
        }
        Ok(bound.len())
    }

    /// Releases the units recorded in `bound`, in the order they were bound,
    /// and leaves unit 0 active.
    pub fn unbind_all_for_draw(&self, gpu: &mut G, bound: &mut BoundUnits) -> Result<(), GpuError> {
        let mut first_error = None;
        for unit in bound.units.drain(..) {
            let released = gpu
                .active_texture(unit)
                .and_then(|()| gpu.bind_texture(None));
            if let Err(err) = released {
                first_error.get_or_insert(err);
            }
        }
        let restored = gpu.active_texture(0);
        match first_error {
            Some(err) => Err(err),
            None => restored,
        }
    }

    /// Releases every texture in insertion order.
    pub fn teardown(self, gpu: &mut G) {
        for slot in self.slots {
            gpu.delete_texture(slot.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::MAX_TEXTURE_UNITS;
    use crate::testing::{GpuEvent, RecordingGpu};

    fn pixels(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba([255, 0, 0, 255]))
    }

    fn set_with(gpu: &mut RecordingGpu, names: &[&str]) -> TextureBindingSet<RecordingGpu> {
        let mut set = TextureBindingSet::new();
        for name in names {
            assert!(set.add_or_update_image(gpu, name.to_string(), &pixels(2, 2)));
        }
        set
    }

    fn feedback(gpu: &mut RecordingGpu, count: usize) -> Vec<u64> {
        (0..count).map(|_| gpu.create_texture(4, 4).unwrap()).collect()
    }

    #[test]
    fn keeps_insertion_order() {
        let mut gpu = RecordingGpu::new();
        let set = set_with(&mut gpu, &["b.png", "a.png", "c.png"]);
        let order: Vec<&String> = set.identities().collect();
        assert_eq!(order, ["b.png", "a.png", "c.png"]);
    }

    #[test]
    fn update_replaces_in_place_and_releases_old_texture() {
        let mut gpu = RecordingGpu::new();
        let mut set = set_with(&mut gpu, &["a", "b", "c"]);
        let old = *set.texture(&"b".to_string()).unwrap();

        assert!(set.add_or_update_image(&mut gpu, "b".to_string(), &pixels(8, 8)));
        let new = *set.texture(&"b".to_string()).unwrap();
        assert_ne!(old, new);
        assert_eq!(gpu.release_count(old), 1);
        assert_eq!(set.len(), 3);
        assert_eq!(set.identities().nth(1).map(String::as_str), Some("b"));
        assert_eq!(gpu.live_textures(), 3);
    }

    #[test]
    fn unreadable_sources_leave_set_unchanged() {
        let mut gpu = RecordingGpu::new();
        let mut set = set_with(&mut gpu, &["a"]);
        let dir = tempfile::tempdir().unwrap();

        assert!(!set.add_or_update(&mut gpu, "missing".into(), &dir.path().join("nope.png")));
        assert!(!set.add_or_update_bytes(&mut gpu, "garbage".into(), b"not an image"));
        gpu.fail_uploads = true;
        assert!(!set.add_or_update_image(&mut gpu, "a".into(), &pixels(1, 1)));

        assert_eq!(set.len(), 1);
        assert_eq!(gpu.live_textures(), 1);
    }

    #[test]
    fn loads_png_files_from_disk() {
        let mut gpu = RecordingGpu::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.png");
        pixels(3, 5).save(&path).unwrap();

        let mut set = TextureBindingSet::new();
        assert!(set.add_or_update(&mut gpu, path.display().to_string(), &path));
        let texture = set.texture(&path.display().to_string()).unwrap();
        assert_eq!(gpu.texture_size(texture), Some((3, 5)));

        let bytes = std::fs::read(&path).unwrap();
        assert!(set.add_or_update_bytes(&mut gpu, "copy".into(), &bytes));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_releases_texture() {
        let mut gpu = RecordingGpu::new();
        let mut set = set_with(&mut gpu, &["a", "b"]);
        let texture = *set.texture(&"a".to_string()).unwrap();
        assert!(set.remove(&mut gpu, &"a".to_string()));
        assert!(!set.remove(&mut gpu, &"a".to_string()));
        assert_eq!(gpu.release_count(texture), 1);
        assert_eq!(set.identities().collect::<Vec<_>>(), ["b"]);
    }

    #[test]
    fn bind_and_unbind_are_symmetric() {
        let mut gpu = RecordingGpu::new();
        let set = set_with(&mut gpu, &["a", "b"]);
        let previous = feedback(&mut gpu, 2);
        let program = 99;
        gpu.clear_events();

        let mut bound = BoundUnits::new();
        let count = set
            .bind_all_for_draw(&mut gpu, &program, &previous, &mut bound)
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(bound.units(), &[0, 1, 2, 3]);
        assert_eq!(gpu.occupied_units(), vec![0, 1, 2, 3]);
        assert_eq!(gpu.last_uniform(program, "tex0"), Some(UniformValue::Int(0)));
        assert_eq!(gpu.last_uniform(program, "tex1"), Some(UniformValue::Int(1)));
        assert_eq!(gpu.last_uniform(program, "texLastFrame0"), Some(UniformValue::Int(2)));
        assert_eq!(gpu.last_uniform(program, "texLastFrame1"), Some(UniformValue::Int(3)));

        let bound_order: Vec<u32> = gpu
            .events
            .iter()
            .filter_map(|event| match event {
                GpuEvent::BindTexture { unit, texture: Some(_) } => Some(*unit),
                _ => None,
            })
            .collect();
        gpu.clear_events();

        set.unbind_all_for_draw(&mut gpu, &mut bound).unwrap();
        let released_order: Vec<u32> = gpu
            .events
            .iter()
            .filter_map(|event| match event {
                GpuEvent::BindTexture { unit, texture: None } => Some(*unit),
                _ => None,
            })
            .collect();
        assert_eq!(bound_order, released_order);
        assert!(gpu.occupied_units().is_empty());
        assert_eq!(gpu.active_unit(), 0);
        assert!(bound.is_empty());
    }

    #[test]
    fn partial_bind_failure_unbinds_exactly_what_was_bound() {
        let mut gpu = RecordingGpu::new();
        let names: Vec<String> = (0..MAX_TEXTURE_UNITS - 1).map(|i| format!("t{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let set = set_with(&mut gpu, &names);
        let previous = feedback(&mut gpu, 2);

        let mut bound = BoundUnits::new();
        let err = set
            .bind_all_for_draw(&mut gpu, &1, &previous, &mut bound)
            .unwrap_err();
        assert!(matches!(err, GpuError::UnitOutOfRange { unit, .. } if unit == MAX_TEXTURE_UNITS));
        assert_eq!(bound.len(), MAX_TEXTURE_UNITS as usize);

        set.unbind_all_for_draw(&mut gpu, &mut bound).unwrap();
        assert!(gpu.occupied_units().is_empty());
        assert_eq!(gpu.active_unit(), 0);
    }

    #[test]
    fn unit_numbering_follows_current_contents() {
        let mut gpu = RecordingGpu::new();
        let mut set = set_with(&mut gpu, &["a", "b"]);
        let previous = feedback(&mut gpu, 1);
        let mut bound = BoundUnits::new();

        set.bind_all_for_draw(&mut gpu, &7, &previous, &mut bound).unwrap();
        set.unbind_all_for_draw(&mut gpu, &mut bound).unwrap();
        assert_eq!(gpu.last_uniform(7, "texLastFrame0"), Some(UniformValue::Int(2)));

        set.remove(&mut gpu, &"a".to_string());
        set.bind_all_for_draw(&mut gpu, &7, &previous, &mut bound).unwrap();
        assert_eq!(bound.units(), &[0, 1]);
        assert_eq!(gpu.last_uniform(7, "texLastFrame0"), Some(UniformValue::Int(1)));
        set.unbind_all_for_draw(&mut gpu, &mut bound).unwrap();
    }

    #[test]
    fn teardown_releases_all_textures() {
        let mut gpu = RecordingGpu::new();
        let set = set_with(&mut gpu, &["a", "b"]);
        set.teardown(&mut gpu);
        assert_eq!(gpu.live_textures(), 0);
    }
}

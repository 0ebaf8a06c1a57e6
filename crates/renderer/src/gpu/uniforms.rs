use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::compile::{WrappedFragment, MAX_SAMPLER_SLOTS, MAX_UNIFORM_SLOTS};

use super::{UniformValue, MAX_TEXTURE_UNITS};

/// CPU mirror of the `LoopUniforms` block declared by the fragment prelude.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct UniformSlots {
    slots: [[f32; 4]; MAX_UNIFORM_SLOTS],
}

pub(crate) const UNIFORM_BLOCK_SIZE: u64 = std::mem::size_of::<UniformSlots>() as u64;

/// Named uniform state of one linked program.
///
/// Values are written by name into their reflected slot; sampler names record
/// the texture unit they read from, resolved against bound units at draw time.
#[derive(Clone)]
pub(crate) struct UniformTable {
    slots_by_name: HashMap<String, usize>,
    samplers_by_name: HashMap<String, usize>,
    sampler_units: [u32; MAX_SAMPLER_SLOTS],
    sampler_count: usize,
    data: UniformSlots,
    dirty: bool,
}

impl UniformTable {
    pub fn from_reflection(fragment: &WrappedFragment) -> Self {
        let slots_by_name = fragment
            .uniforms
            .iter()
            .map(|uniform| (uniform.name.clone(), uniform.slot))
            .collect();
        let samplers_by_name = fragment
            .samplers
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();
        Self {
            slots_by_name,
            samplers_by_name,
            sampler_units: [0; MAX_SAMPLER_SLOTS],
            sampler_count: fragment.samplers.len(),
            data: UniformSlots::zeroed(),
            dirty: true,
        }
    }

    /// Stores `value` under `name`; returns `false` for names the program lacks.
    pub fn set(&mut self, name: &str, value: UniformValue) -> bool {
        if let Some(&index) = self.samplers_by_name.get(name) {
            return match value {
                UniformValue::Int(unit) if unit >= 0 && (unit as u32) < MAX_TEXTURE_UNITS => {
                    self.sampler_units[index] = unit as u32;
                    true
                }
                other => {
                    tracing::debug!(name, value = ?other, "ignoring non-unit value for sampler uniform");
                    false
                }
            };
        }

        match self.slots_by_name.get(name) {
            Some(&slot) => {
                self.data.slots[slot] = value.to_slot();
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Texture unit for each reflected sampler, in binding order.
    pub fn sampler_units(&self) -> &[u32] {
        &self.sampler_units[..self.sampler_count]
    }

    /// Returns the block bytes when they changed since the last upload.
    pub fn take_dirty_bytes(&mut self) -> Option<&[u8]> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(bytemuck::bytes_of(&self.data))
    }
}

use std::fmt;

/// Adapter preference forwarded to `wgpu` when the headless backend starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    /// Prefer an integrated or otherwise power-saving adapter.
    #[default]
    Low,
    /// Prefer the fastest discrete adapter available.
    High,
}

/// Summary of the adapter the backend ended up on.
#[derive(Debug, Clone)]
pub struct AdapterProfile {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub max_texture_dimension: u32,
}

impl AdapterProfile {
    pub(crate) fn from_wgpu(info: &wgpu::AdapterInfo, limits: &wgpu::Limits) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
            max_texture_dimension: limits.max_texture_dimension_2d,
        }
    }

    /// True for CPU rasterisers such as llvmpipe or WARP.
    pub fn is_software(&self) -> bool {
        matches!(self.device_type, wgpu::DeviceType::Cpu)
    }
}

impl fmt::Display for AdapterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Checks a user-supplied uniform name before it is forwarded to a program.
///
/// A valid name is non-empty, starts with an alphabetic character, and
/// contains only alphanumeric characters.
pub fn is_name_valid(name: Option<&str>) -> bool {
    let Some(name) = name else {
        return false;
    };
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() => chars.all(char::is_alphanumeric),
        _ => false,
    }
}

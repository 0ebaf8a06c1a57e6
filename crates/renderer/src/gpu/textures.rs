use image::imageops::flip_vertical_in_place;
use image::RgbaImage;
use wgpu::util::{DeviceExt, TextureDataOrder};

use super::GpuError;

/// Every image the backend allocates uses this format, render targets included.
pub(crate) const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const BYTES_PER_PIXEL: u32 = 4;

pub(crate) struct TextureResource {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl TextureResource {
    fn from_texture(texture: wgpu::Texture, width: u32, height: u32) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }
}

fn usages() -> wgpu::TextureUsages {
    wgpu::TextureUsages::RENDER_ATTACHMENT
        | wgpu::TextureUsages::TEXTURE_BINDING
        | wgpu::TextureUsages::COPY_SRC
        | wgpu::TextureUsages::COPY_DST
}

fn descriptor(label: &str, width: u32, height: u32) -> wgpu::TextureDescriptor<'_> {
    wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage: usages(),
        view_formats: &[],
    }
}

pub(crate) fn create_render_texture(
    device: &wgpu::Device,
    id: u64,
    width: u32,
    height: u32,
) -> TextureResource {
    let label = format!("render texture #{id}");
    let texture = device.create_texture(&descriptor(&label, width, height));
    TextureResource::from_texture(texture, width, height)
}

/// Uploads decoded pixels, flipping rows so row 0 holds the bottom of the image.
pub(crate) fn upload_image(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    id: u64,
    image: &RgbaImage,
) -> TextureResource {
    let (width, height) = image.dimensions();
    let mut rgba = image.clone();
    flip_vertical_in_place(&mut rgba);

    let label = format!("input texture #{id}");
    let texture = device.create_texture_with_data(
        queue,
        &descriptor(&label, width, height),
        TextureDataOrder::LayerMajor,
        &rgba,
    );
    TextureResource::from_texture(texture, width, height)
}

/// 1x1 opaque black image bound to sampler slots whose unit holds nothing.
pub(crate) fn create_placeholder(device: &wgpu::Device, queue: &wgpu::Queue) -> TextureResource {
    let data = [0u8, 0, 0, 255];
    let texture = device.create_texture_with_data(
        queue,
        &descriptor("placeholder texture", 1, 1),
        TextureDataOrder::LayerMajor,
        &data,
    );
    TextureResource::from_texture(texture, 1, 1)
}

pub(crate) fn create_sampler(device: &wgpu::Device) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("shared linear sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    })
}

/// Bytes per row of a read-back buffer, padded to the copy alignment.
pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Copies a texture into host memory as a top-row-first image.
pub(crate) fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    resource: &TextureResource,
) -> Result<RgbaImage, GpuError> {
    let TextureResource { width, height, .. } = *resource;
    let padded = padded_bytes_per_row(width);
    let unpadded = (width * BYTES_PER_PIXEL) as usize;

    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("read-back buffer"),
        size: u64::from(padded) * u64::from(height),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("read-back encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture: &resource.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(std::iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| GpuError::Readback(err.to_string()))?;
    receiver
        .recv()
        .map_err(|err| GpuError::Readback(err.to_string()))?
        .map_err(|err| GpuError::Readback(err.to_string()))?;

    let mut pixels = Vec::with_capacity(unpadded * height as usize);
    {
        let data = slice.get_mapped_range();
        for row in data.chunks(padded as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..unpadded]);
        }
    }
    buffer.unmap();

    let mut image = RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| GpuError::Readback("read-back buffer size mismatch".into()))?;
    flip_vertical_in_place(&mut image);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(800), 3328);
    }
}

use image::{imageops, RgbaImage};

use crate::renderer::backend::TextureSampling;

/// Uploaded texture with the bind group draws use to sample it.
pub(crate) struct GpuTexture {
    pub(crate) bind_group: wgpu::BindGroup,
    _texture: wgpu::Texture,
}

/// Number of mip levels for a given texture size.
pub(crate) fn calculate_mip_levels(width: u32, height: u32) -> u32 {
    let max_dimension = width.max(height).max(1);
    u32::BITS - max_dimension.leading_zeros()
}

/// Box-filtered chain down to 1x1, base level first.
pub(crate) fn mip_chain(image: &RgbaImage) -> Vec<RgbaImage> {
    let levels = calculate_mip_levels(image.width(), image.height());
    let mut chain = vec![image.clone()];
    for level in 1..levels {
        let width = (image.width() >> level).max(1);
        let height = (image.height() >> level).max(1);
        let previous = &chain[chain.len() - 1];
        chain.push(imageops::resize(previous, width, height, imageops::FilterType::Triangle));
    }
    chain
}

impl GpuTexture {
    pub(crate) fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
        image: &RgbaImage,
        sampling: TextureSampling,
    ) -> Self {
        let levels = match sampling {
            TextureSampling::Mipmapped => mip_chain(image),
            TextureSampling::Clamped => vec![image.clone()],
        };
        let size = wgpu::Extent3d {
            width: image.width(),
            height: image.height(),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Canvas3D Texture"),
            size,
            mip_level_count: levels.len() as u32,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        for (mip_level, level) in levels.iter().enumerate() {
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: mip_level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                level.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * level.width()),
                    rows_per_image: Some(level.height()),
                },
                wgpu::Extent3d {
                    width: level.width(),
                    height: level.height(),
                    depth_or_array_layers: 1,
                },
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&sampler_descriptor(sampling));
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Canvas3D Texture BindGroup"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        Self {
            bind_group,
            _texture: texture,
        }
    }
}

fn sampler_descriptor(sampling: TextureSampling) -> wgpu::SamplerDescriptor<'static> {
    match sampling {
        TextureSampling::Mipmapped => wgpu::SamplerDescriptor {
            label: Some("Mipmapped Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        },
        TextureSampling::Clamped => wgpu::SamplerDescriptor {
            label: Some("Clamped Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_cover_the_largest_side() {
        assert_eq!(calculate_mip_levels(1, 1), 1);
        assert_eq!(calculate_mip_levels(256, 64), 9);
        assert_eq!(calculate_mip_levels(0, 0), 1);
    }

    #[test]
    fn mip_chain_halves_down_to_one_pixel() {
        let chain = mip_chain(&RgbaImage::new(8, 2));
        let sizes: Vec<_> = chain.iter().map(|level| level.dimensions()).collect();
        assert_eq!(sizes, vec![(8, 2), (4, 1), (2, 1), (1, 1)]);
    }

    #[test]
    fn clamped_sampler_does_not_wrap() {
        let descriptor = sampler_descriptor(TextureSampling::Clamped);
        assert_eq!(descriptor.address_mode_u, wgpu::AddressMode::ClampToEdge);
        assert_eq!(
            sampler_descriptor(TextureSampling::Mipmapped).address_mode_v,
            wgpu::AddressMode::Repeat
        );
    }
}

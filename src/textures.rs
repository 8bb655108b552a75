//! Texture data for sampler-typed uniforms.
//!
//! A [`TextureConfig`] is host-side RGBA8 pixels plus sampling options. Hand
//! it to [`GraphicsContext::create_texture`] (or [`Engine::create_texture`])
//! and store the returned handle in a `texture_2d` uniform:
//!
//! ```ignore
//! let gradient = engine.create_texture(&TextureConfig::gradient(256, [0, 0, 0, 255], [255, 200, 50, 255]))?;
//! engine.add_uniform("palette", gradient)?;
//! // in WGSL: textureSampleLevel(palette, palette_sampler, vec2<f32>(t, 0.5), 0.0)
//! ```
//!
//! [`GraphicsContext::create_texture`]: crate::context::GraphicsContext::create_texture
//! [`Engine::create_texture`]: crate::engine::Engine::create_texture

use std::path::Path;

use crate::error::TextureError;

/// Filter mode for texture sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Smooth linear filtering (default). Good for gradients and noise.
    #[default]
    Linear,
    /// Sharp nearest-neighbor filtering. Good for lookup tables.
    Nearest,
}

impl FilterMode {
    pub(crate) fn to_wgpu(self) -> wgpu::FilterMode {
        match self {
            FilterMode::Linear => wgpu::FilterMode::Linear,
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
        }
    }
}

/// Address mode for coordinates outside 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

impl AddressMode {
    pub(crate) fn to_wgpu(self) -> wgpu::AddressMode {
        match self {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }
}

/// Pixels and sampling options for one texture.
#[derive(Debug, Clone)]
pub struct TextureConfig {
    /// Raw RGBA pixel data (width * height * 4 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

impl TextureConfig {
    /// Wrap raw RGBA data, checking it matches the dimensions.
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Result<Self, TextureError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected || expected == 0 {
            return Err(TextureError::SizeMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        })
    }

    /// Load a PNG or JPEG file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TextureError> {
        let bytes = std::fs::read(path.as_ref())?;
        let img = image::load_from_memory(&bytes)?.into_rgba8();
        let (width, height) = img.dimensions();
        Self::from_rgba(img.into_raw(), width, height)
    }

    pub fn with_filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode = mode;
        self
    }

    /// A 1x1 texture of one colour.
    pub fn solid(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            data: vec![r, g, b, a],
            width: 1,
            height: 1,
            filter: FilterMode::Nearest,
            address_mode: AddressMode::ClampToEdge,
        }
    }

    /// A horizontal `width`x1 gradient, handy as a colour lookup table.
    pub fn gradient(width: u32, start: [u8; 4], end: [u8; 4]) -> Self {
        let width = width.max(1);
        let mut data = Vec::with_capacity((width * 4) as usize);
        for x in 0..width {
            let t = x as f32 / (width - 1).max(1) as f32;
            for c in 0..4 {
                data.push(lerp_u8(start[c], end[c], t));
            }
        }
        Self {
            data,
            width,
            height: 1,
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }

    pub fn checkerboard(size: u32, cell_size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let size = size.max(1);
        let cell_size = cell_size.max(1);
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let color = if (x / cell_size + y / cell_size) % 2 == 0 {
                    color1
                } else {
                    color2
                };
                data.extend_from_slice(&color);
            }
        }
        Self {
            data,
            width: size,
            height: size,
            filter: FilterMode::Nearest,
            address_mode: AddressMode::Repeat,
        }
    }

    /// Greyscale value noise from an integer hash.
    pub fn noise(size: u32, seed: u32) -> Self {
        let size = size.max(1);
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let v = hash_noise(x, y, seed);
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        Self {
            data,
            width: size,
            height: size,
            filter: FilterMode::Linear,
            address_mode: AddressMode::Repeat,
        }
    }
}

fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let a = a as f32;
    let b = b as f32;
    (a + (b - a) * t).round() as u8
}

fn hash_noise(x: u32, y: u32, seed: u32) -> u8 {
    let mut n = x
        .wrapping_mul(374761393)
        .wrapping_add(y.wrapping_mul(668265263))
        .wrapping_add(seed.wrapping_mul(1013904223));
    n = (n ^ (n >> 13)).wrapping_mul(1274126177);
    n ^= n >> 16;
    (n & 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgba_checks_size() {
        assert!(TextureConfig::from_rgba(vec![0; 16], 2, 2).is_ok());
        assert!(matches!(
            TextureConfig::from_rgba(vec![0; 15], 2, 2),
            Err(TextureError::SizeMismatch { expected: 16, found: 15 })
        ));
    }

    #[test]
    fn test_gradient_endpoints() {
        let g = TextureConfig::gradient(3, [0, 0, 0, 255], [255, 100, 50, 255]);
        assert_eq!(&g.data[..4], &[0, 0, 0, 255]);
        assert_eq!(&g.data[8..], &[255, 100, 50, 255]);
        assert_eq!(&g.data[4..8], &[128, 50, 25, 255]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            TextureConfig::from_file("does/not/exist.png"),
            Err(TextureError::Io(_))
        ));
    }

    #[test]
    fn test_noise_is_deterministic() {
        assert_eq!(TextureConfig::noise(8, 7).data, TextureConfig::noise(8, 7).data);
        assert_ne!(TextureConfig::noise(8, 7).data, TextureConfig::noise(8, 8).data);
    }
}

//! Descriptor snapshots handed to shader stages.

use crate::sampler::SamplerState;
use crate::surface::Surface;
use hashbrown::HashMap;

/// A sampled image paired with its sampler.
#[derive(Clone, Debug)]
pub struct BoundTexture {
    pub surface: Surface,
    pub sampler: SamplerState,
}

/// Resources visible to the stages of one draw, keyed by `(set, binding)`.
#[derive(Clone, Debug, Default)]
pub struct DescriptorBindings {
    buffers: HashMap<(u32, u32), Vec<u8>>,
    textures: HashMap<(u32, u32), BoundTexture>,
    texel_buffers: HashMap<(u32, u32), Surface>,
}

impl DescriptorBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_buffer(&mut self, set: u32, binding: u32, bytes: Vec<u8>) {
        self.buffers.insert((set, binding), bytes);
    }

    pub fn insert_texture(&mut self, set: u32, binding: u32, texture: BoundTexture) {
        self.textures.insert((set, binding), texture);
    }

    pub fn insert_texel_buffer(&mut self, set: u32, binding: u32, surface: Surface) {
        self.texel_buffers.insert((set, binding), surface);
    }

    pub fn buffer(&self, set: u32, binding: u32) -> Option<&[u8]> {
        self.buffers.get(&(set, binding)).map(Vec::as_slice)
    }

    pub fn texture(&self, set: u32, binding: u32) -> Option<&BoundTexture> {
        self.textures.get(&(set, binding))
    }

    pub fn texel_buffer(&self, set: u32, binding: u32) -> Option<&Surface> {
        self.texel_buffers.get(&(set, binding))
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty() && self.texel_buffers.is_empty()
    }
}

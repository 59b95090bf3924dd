//! Tightly packed 2D texel storage.
//!
//! Attachments and sampled textures are both surfaces: a format, an extent
//! and a byte buffer with rows of `width * texel_size` bytes. Every read and
//! write goes through the format's bit-exact codec.

use crate::error::Result;
use tessera_core::{Error, Extent2D, Format, Rect2D, Texel};

/// A 2D array of encoded texels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Surface {
    format: Format,
    extent: Extent2D,
    data: Vec<u8>,
}

impl Surface {
    /// Zero-filled surface.
    pub fn new(format: Format, extent: Extent2D) -> Self {
        let len = extent.area() as usize * format.texel_size() as usize;
        Self {
            format,
            extent,
            data: vec![0; len],
        }
    }

    /// Wrap existing bytes. Extra trailing bytes are dropped.
    pub fn from_bytes(format: Format, extent: Extent2D, mut data: Vec<u8>) -> Result<Self> {
        let len = extent.area() as usize * format.texel_size() as usize;
        if data.len() < len {
            return Err(Error::OutOfBounds(format!(
                "{format:?} surface of {}x{} needs {len} bytes, got {}",
                extent.width,
                extent.height,
                data.len()
            ))
            .into());
        }
        data.truncate(len);
        Ok(Self {
            format,
            extent,
            data,
        })
    }

    #[inline]
    pub const fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub const fn extent(&self) -> Extent2D {
        self.extent
    }

    #[inline]
    pub const fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub const fn height(&self) -> u32 {
        self.extent.height
    }

    /// Rectangle covering the whole surface.
    pub const fn bounds(&self) -> Rect2D {
        Rect2D::from_extent(self.extent)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, x: u32, y: u32) -> Result<std::ops::Range<usize>> {
        if x >= self.extent.width || y >= self.extent.height {
            return Err(Error::OutOfBounds(format!(
                "texel ({x}, {y}) outside {}x{} surface",
                self.extent.width, self.extent.height
            ))
            .into());
        }
        let size = self.format.texel_size() as usize;
        let start = (y as usize * self.extent.width as usize + x as usize) * size;
        Ok(start..start + size)
    }

    /// Raw bytes of one texel.
    pub fn texel_bytes(&self, x: u32, y: u32) -> Result<&[u8]> {
        let range = self.range(x, y)?;
        Ok(&self.data[range])
    }

    pub fn read(&self, x: u32, y: u32) -> Result<Texel> {
        Ok(self.format.decode(self.texel_bytes(x, y)?)?)
    }

    pub fn write(&mut self, x: u32, y: u32, texel: Texel) -> Result<()> {
        let range = self.range(x, y)?;
        Ok(self.format.encode(texel, &mut self.data[range])?)
    }

    pub fn read_depth(&self, x: u32, y: u32) -> Result<f32> {
        Ok(self.format.read_depth(self.texel_bytes(x, y)?)?)
    }

    pub fn write_depth(&mut self, x: u32, y: u32, depth: f32) -> Result<()> {
        let range = self.range(x, y)?;
        Ok(self.format.write_depth(&mut self.data[range], depth)?)
    }

    pub fn read_stencil(&self, x: u32, y: u32) -> Result<u8> {
        Ok(self.format.read_stencil(self.texel_bytes(x, y)?)?)
    }

    pub fn write_stencil(&mut self, x: u32, y: u32, stencil: u8) -> Result<()> {
        let range = self.range(x, y)?;
        Ok(self.format.write_stencil(&mut self.data[range], stencil)?)
    }

    /// Fill `rect` (clipped to the surface) with one color.
    pub fn clear_color(&mut self, rect: Rect2D, texel: Texel) -> Result<()> {
        let encoded = self.format.encode_to_vec(texel)?;
        let rect = rect.intersect(self.bounds());
        let size = encoded.len();
        for y in 0..rect.extent.height {
            for x in 0..rect.extent.width {
                let start = self
                    .range(rect.offset.x as u32 + x, rect.offset.y as u32 + y)?
                    .start;
                self.data[start..start + size].copy_from_slice(&encoded);
            }
        }
        Ok(())
    }

    /// Fill the depth and/or stencil aspect of `rect` (clipped to the surface).
    pub fn clear_depth_stencil(
        &mut self,
        rect: Rect2D,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<()> {
        let rect = rect.intersect(self.bounds());
        for y in 0..rect.extent.height {
            for x in 0..rect.extent.width {
                let (px, py) = (rect.offset.x as u32 + x, rect.offset.y as u32 + y);
                if let Some(depth) = depth.filter(|_| self.format.has_depth()) {
                    self.write_depth(px, py, depth)?;
                }
                if let Some(stencil) = stencil.filter(|_| self.format.has_stencil()) {
                    self.write_stencil(px, py, stencil)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn write_read_round_trip() {
        let mut surface = Surface::new(Format::R8G8B8A8Unorm, Extent2D::new(4, 2));
        surface
            .write(3, 1, Texel::Float(Vec4::new(1.0, 0.0, 0.0, 1.0)))
            .unwrap();

        assert_eq!(surface.texel_bytes(3, 1).unwrap(), &[255, 0, 0, 255]);
        assert_eq!(surface.texel_bytes(0, 0).unwrap(), &[0, 0, 0, 0]);
        assert!(surface.read(4, 0).is_err());
    }

    #[test]
    fn clear_is_clipped_to_rect() {
        let mut surface = Surface::new(Format::R8Unorm, Extent2D::new(4, 4));
        surface
            .clear_color(Rect2D::new(2, 2, 10, 10), Texel::Float(Vec4::ONE))
            .unwrap();

        let covered = surface.as_bytes().iter().filter(|&&b| b == 255).count();
        assert_eq!(covered, 4);
        assert_eq!(surface.texel_bytes(1, 1).unwrap(), &[0]);
    }

    #[test]
    fn depth_stencil_clear_respects_aspects() {
        let mut surface = Surface::new(Format::D24UnormS8Uint, Extent2D::new(2, 2));
        surface
            .clear_depth_stencil(surface.bounds(), Some(1.0), None)
            .unwrap();
        surface
            .clear_depth_stencil(Rect2D::new(0, 0, 1, 1), None, Some(7))
            .unwrap();

        assert_eq!(surface.read_depth(0, 0).unwrap(), 1.0);
        assert_eq!(surface.read_stencil(0, 0).unwrap(), 7);
        assert_eq!(surface.read_stencil(1, 1).unwrap(), 0);
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Surface::from_bytes(Format::R32Sfloat, Extent2D::new(2, 2), vec![0; 15]).is_err());
        let surface =
            Surface::from_bytes(Format::R32Sfloat, Extent2D::new(2, 2), vec![0; 20]).unwrap();
        assert_eq!(surface.as_bytes().len(), 16);
    }
}

//! Swapchain readback for frame dumps.
//!
//! The copy into the staging buffer is recorded on the same encoder as the
//! display pass, so the dump always captures exactly what was presented. The
//! map/depad happens after submit, once the GPU has finished the frame.

use anyhow::{anyhow, bail, Context, Result};

/// Rounds a row stride up to wgpu's buffer copy alignment (256 bytes).
fn align_bytes_per_row(value: usize) -> usize {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    value.div_ceil(align) * align
}

/// A recorded texture-to-buffer copy awaiting resolution.
pub(crate) struct PendingReadback {
    staging: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_bytes_per_row: usize,
    format: wgpu::TextureFormat,
}

impl PendingReadback {
    /// Records a full-texture copy into a fresh staging buffer.
    ///
    /// The texture must have `COPY_SRC` usage and one of the 8-bit BGRA/RGBA
    /// formats the swapchain is configured with.
    pub(crate) fn record(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("readback size must be positive, got {width}x{height}");
        }
        let format = texture.format();
        if !matches!(
            format,
            wgpu::TextureFormat::Bgra8Unorm
                | wgpu::TextureFormat::Bgra8UnormSrgb
                | wgpu::TextureFormat::Rgba8Unorm
                | wgpu::TextureFormat::Rgba8UnormSrgb
        ) {
            bail!("unsupported readback format {format:?}");
        }

        let tight_bytes_per_row = 4 * width as usize;
        let padded_bytes_per_row = align_bytes_per_row(tight_bytes_per_row);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame readback staging"),
            size: (padded_bytes_per_row * height as usize) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row as u32),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );

        Ok(Self {
            staging,
            width,
            height,
            padded_bytes_per_row,
            format,
        })
    }

    /// Blocks until the copy finished and returns tight BGR rows in
    /// bottom-to-top order, ready for the TGA writer.
    pub(crate) fn resolve_bgr(self, device: &wgpu::Device) -> Result<Vec<u8>> {
        let slice = self.staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::wait())
            .context("device poll failed while mapping readback buffer")?;
        pollster::block_on(receiver.receive())
            .ok_or_else(|| anyhow!("readback map callback dropped"))?
            .context("failed to map readback buffer")?;

        let data = slice.get_mapped_range();
        let width = self.width as usize;
        let height = self.height as usize;
        // Swapchain memory is BGRA or RGBA; TGA wants tight BGR.
        let bgra = matches!(
            self.format,
            wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
        );

        let mut bgr = vec![0u8; 3 * width * height];
        for row in 0..height {
            // Flip vertically: TGA's zero descriptor byte means bottom-left origin.
            let src_row = &data[row * self.padded_bytes_per_row..];
            let dst_row = &mut bgr[(height - 1 - row) * 3 * width..][..3 * width];
            for col in 0..width {
                let px = &src_row[col * 4..col * 4 + 4];
                let dst = &mut dst_row[col * 3..col * 3 + 3];
                if bgra {
                    dst.copy_from_slice(&px[..3]);
                } else {
                    dst[0] = px[2];
                    dst[1] = px[1];
                    dst[2] = px[0];
                }
            }
        }
        drop(data);
        self.staging.unmap();

        Ok(bgr)
    }
}

#[cfg(test)]
mod tests {
    use super::align_bytes_per_row;

    #[test]
    fn row_alignment_rounds_up_to_256() {
        assert_eq!(align_bytes_per_row(1), 256);
        assert_eq!(align_bytes_per_row(256), 256);
        assert_eq!(align_bytes_per_row(257), 512);
        // 4 bytes per pixel at 1920 wide is already aligned.
        assert_eq!(align_bytes_per_row(4 * 1920), 4 * 1920);
    }

    #[test]
    fn resolve_polls_with_an_unbounded_wait() {
        // The map callback fires during the poll, so the poll must block
        // until all submitted work is done rather than return immediately.
        let poll: wgpu::PollType = wgpu::PollType::wait();
        assert!(matches!(poll, wgpu::PollType::Wait));
    }
}

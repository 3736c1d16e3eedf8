//! Frame export as uncompressed truecolor TGA.
//!
//! The on-disk format is the minimal 18-byte TGA header (image type 2,
//! 24 bits per pixel, all origin/descriptor fields zero) followed by raw BGR
//! pixel data. With a zero descriptor byte the payload is interpreted
//! bottom-to-top, so callers hand rows in bottom-up order to get an upright
//! image.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Size of the fixed TGA header preceding the pixel payload.
pub const TGA_HEADER_LEN: usize = 18;

/// Bytes per pixel in the BGR payload.
pub const BYTES_PER_PIXEL: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("frame {width}x{height} exceeds the 16-bit TGA dimension limit")]
    Oversize { width: u32, height: u32 },
    #[error("pixel payload is {actual} bytes, expected {expected} for {width}x{height} BGR")]
    PayloadMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Encodes a BGR frame as a complete TGA file image.
///
/// `bgr` must hold exactly `3 * width * height` bytes in bottom-to-top row
/// order. The payload bytes are copied verbatim, no swizzling or flipping.
pub fn encode_tga(width: u32, height: u32, bgr: &[u8]) -> Result<Vec<u8>, CaptureError> {
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(CaptureError::Oversize { width, height });
    }
    let expected = BYTES_PER_PIXEL * width as usize * height as usize;
    if bgr.len() != expected {
        return Err(CaptureError::PayloadMismatch {
            width,
            height,
            expected,
            actual: bgr.len(),
        });
    }

    let mut out = Vec::with_capacity(TGA_HEADER_LEN + bgr.len());
    out.push(0); // no image id
    out.push(0); // no color map
    out.push(2); // uncompressed truecolor
    out.extend_from_slice(&[0; 5]); // color map specification, unused
    out.extend_from_slice(&[0; 4]); // x/y origin
    out.extend_from_slice(&(width as u16).to_le_bytes());
    out.extend_from_slice(&(height as u16).to_le_bytes());
    out.push(24); // bits per pixel
    out.push(0); // descriptor: bottom-left origin, no alpha bits
    out.extend_from_slice(bgr);
    Ok(out)
}

/// Writes numbered frame dumps into a fixed directory.
///
/// Paths are deterministic: `<dir>/frame_0001.tga`, `<dir>/frame_0002.tga`
/// and so on. Dump failures are surfaced as errors for the caller to log and
/// skip; a failed frame never aborts the render loop.
#[derive(Debug, Clone)]
pub struct FrameSink {
    dir: PathBuf,
}

impl FrameSink {
    /// Creates the dump directory (and parents) if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, CaptureError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CaptureError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Zero-padded path for the given frame index.
    pub fn frame_path(&self, frame: u32) -> PathBuf {
        self.dir.join(format!("frame_{frame:04}.tga"))
    }

    /// Encodes and writes one frame, returning the path written.
    pub fn write_frame(
        &self,
        frame: u32,
        width: u32,
        height: u32,
        bgr: &[u8],
    ) -> Result<PathBuf, CaptureError> {
        let encoded = encode_tga(width, height, bgr)?;
        let path = self.frame_path(frame);
        let io_err = |source| CaptureError::Io {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&encoded).map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        tracing::debug!(path = %path.display(), width, height, "wrote frame dump");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker_bgr(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(BYTES_PER_PIXEL * (width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = (((x + y) % 2) * 255) as u8;
                data.extend_from_slice(&[v, 128, x as u8]);
            }
        }
        data
    }

    #[test]
    fn header_round_trips_dimensions() {
        let (w, h) = (640u32, 360u32);
        let encoded = encode_tga(w, h, &checker_bgr(w, h)).unwrap();

        assert_eq!(encoded.len(), TGA_HEADER_LEN + 3 * (w * h) as usize);
        assert_eq!(&encoded[..3], &[0, 0, 2]);
        assert!(encoded[3..12].iter().all(|&b| b == 0));
        let width = u16::from_le_bytes([encoded[12], encoded[13]]);
        let height = u16::from_le_bytes([encoded[14], encoded[15]]);
        assert_eq!(width as u32, w);
        assert_eq!(height as u32, h);
        assert_eq!(encoded[16], 24);
        assert_eq!(encoded[17], 0);
    }

    #[test]
    fn payload_bytes_are_preserved_in_order() {
        let (w, h) = (7u32, 3u32);
        let pixels = checker_bgr(w, h);
        let encoded = encode_tga(w, h, &pixels).unwrap();
        assert_eq!(&encoded[TGA_HEADER_LEN..], pixels.as_slice());
    }

    #[test]
    fn payload_length_is_validated() {
        let err = encode_tga(4, 4, &[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::PayloadMismatch {
                expected: 48,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn oversize_dimensions_are_rejected() {
        let err = encode_tga(70_000, 2, &[]).unwrap_err();
        assert!(matches!(err, CaptureError::Oversize { .. }));
    }

    #[test]
    fn sink_writes_deterministic_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::create(dir.path().join("dump")).unwrap();

        assert_eq!(
            sink.frame_path(7).file_name().unwrap().to_str().unwrap(),
            "frame_0007.tga"
        );
        assert_eq!(
            sink.frame_path(1234).file_name().unwrap().to_str().unwrap(),
            "frame_1234.tga"
        );

        let (w, h) = (8u32, 4u32);
        let path = sink.write_frame(1, w, h, &checker_bgr(w, h)).unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), TGA_HEADER_LEN + 3 * (w * h) as usize);
    }

    #[test]
    fn sink_surfaces_unwritable_directory() {
        // A file standing where the directory should be makes creation fail.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("dump");
        std::fs::write(&blocker, b"not a directory").unwrap();
        assert!(matches!(
            FrameSink::create(&blocker),
            Err(CaptureError::Io { .. })
        ));
    }
}

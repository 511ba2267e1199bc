//! Destinations for frames read back from the GPU.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::imageops::flip_vertical_in_place;
use image::RgbaImage;
use thiserror::Error;

use crate::types::OutputSpec;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("frame is {width}x{height} with row stride {row_stride}, but only {len} bytes were supplied")]
    ShortBuffer {
        width: u32,
        height: u32,
        row_stride: usize,
        len: usize,
    },

    #[error("failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: png::EncodingError,
    },
}

/// Mapped pixels of one frame, bottom row first, rows `row_stride` bytes apart.
#[derive(Debug, Clone, Copy)]
pub struct FramePixels<'a> {
    pub width: u32,
    pub height: u32,
    pub row_stride: usize,
    pub data: &'a [u8],
}

impl FramePixels<'_> {
    fn tight_row_bytes(&self) -> usize {
        self.width as usize * 4
    }

    /// Copies the rows out without padding, preserving their order.
    pub fn to_tight(&self) -> Result<Vec<u8>, SinkError> {
        let row_bytes = self.tight_row_bytes();
        let needed = match self.height {
            0 => 0,
            rows => self.row_stride * (rows as usize - 1) + row_bytes,
        };
        if self.row_stride < row_bytes || self.data.len() < needed {
            return Err(SinkError::ShortBuffer {
                width: self.width,
                height: self.height,
                row_stride: self.row_stride,
                len: self.data.len(),
            });
        }

        let mut tight = Vec::with_capacity(row_bytes * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * self.row_stride;
            tight.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(tight)
    }

    /// Top-row-first image, i.e. the captured rows in reverse.
    pub fn to_image(&self) -> Result<RgbaImage, SinkError> {
        let tight = self.to_tight()?;
        let mut image = RgbaImage::from_raw(self.width, self.height, tight).ok_or(
            SinkError::ShortBuffer {
                width: self.width,
                height: self.height,
                row_stride: self.row_stride,
                len: self.data.len(),
            },
        )?;
        flip_vertical_in_place(&mut image);
        Ok(image)
    }
}

/// Receives every collected frame, tagged with the frame it was rendered at.
pub trait FrameSink {
    fn write_frame(&mut self, frame: u64, pixels: &FramePixels<'_>) -> Result<(), SinkError>;
}

/// Writes `<stem>_NNNN.png` files into one directory.
#[derive(Debug, Clone)]
pub struct PngSequenceSink {
    directory: PathBuf,
    stem: String,
    written: u64,
}

impl PngSequenceSink {
    pub fn new(spec: &OutputSpec) -> Self {
        Self {
            directory: spec.directory.clone(),
            stem: spec.stem.clone(),
            written: 0,
        }
    }

    pub fn path_for(&self, frame: u64) -> PathBuf {
        self.directory.join(frame_file_name(&self.stem, frame))
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for PngSequenceSink {
    fn write_frame(&mut self, frame: u64, pixels: &FramePixels<'_>) -> Result<(), SinkError> {
        let path = self.path_for(frame);
        let image = pixels.to_image()?;
        write_linear_png(&path, &image)?;
        self.written += 1;
        tracing::debug!(frame, path = %path.display(), "wrote frame");
        Ok(())
    }
}

/// File name for `frame`, zero-padded to four digits.
pub fn frame_file_name(stem: &str, frame: u64) -> String {
    format!("{stem}_{frame:04}.png")
}

/// Encodes 8-bit RGBA with a `gAMA` chunk of 1.0 so viewers treat the
/// values as linear.
pub fn write_linear_png(path: &Path, image: &RgbaImage) -> Result<(), SinkError> {
    let file = File::create(path).map_err(|source| SinkError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    let encode_error = |source| SinkError::Encode {
        path: path.to_path_buf(),
        source,
    };

    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_source_gamma(png::ScaledFloat::new(1.0));
    let mut writer = encoder.write_header().map_err(encode_error)?;
    writer.write_image_data(image.as_raw()).map_err(encode_error)?;
    writer.finish().map_err(encode_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Two rows of 2 pixels with 4 bytes of padding per row.
    fn padded_frame() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[255, 0, 0, 255, 255, 0, 0, 255]);
        data.extend_from_slice(&[0xAA; 4]);
        data.extend_from_slice(&[0, 0, 255, 255, 0, 0, 255, 255]);
        data.extend_from_slice(&[0xAA; 4]);
        data
    }

    #[test]
    fn tight_copy_drops_row_padding() {
        let data = padded_frame();
        let pixels = FramePixels {
            width: 2,
            height: 2,
            row_stride: 12,
            data: &data,
        };
        let tight = pixels.to_tight().unwrap();
        assert_eq!(tight.len(), 16);
        assert!(!tight.contains(&0xAA));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let data = [0u8; 10];
        let pixels = FramePixels {
            width: 2,
            height: 2,
            row_stride: 8,
            data: &data,
        };
        assert!(matches!(
            pixels.to_tight(),
            Err(SinkError::ShortBuffer { len: 10, .. })
        ));
    }

    #[test]
    fn first_image_row_is_last_captured_row() {
        let data = padded_frame();
        let pixels = FramePixels {
            width: 2,
            height: 2,
            row_stride: 12,
            data: &data,
        };
        let image = pixels.to_image().unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(image.get_pixel(1, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(frame_file_name("plasma", 1), "plasma_0001.png");
        assert_eq!(frame_file_name("frame", 12345), "frame_12345.png");
    }

    #[test]
    fn sink_writes_linear_png_named_by_frame() {
        let dir = tempdir().unwrap();
        let mut sink = PngSequenceSink::new(&OutputSpec {
            directory: dir.path().to_path_buf(),
            stem: "wave".to_string(),
        });
        let data = padded_frame();
        let pixels = FramePixels {
            width: 2,
            height: 2,
            row_stride: 12,
            data: &data,
        };
        sink.write_frame(7, &pixels).unwrap();
        assert_eq!(sink.written(), 1);

        let path = dir.path().join("wave_0007.png");
        let reader = png::Decoder::new(File::open(&path).unwrap())
            .read_info()
            .unwrap();
        let info = reader.info();
        assert_eq!((info.width, info.height), (2, 2));
        assert_eq!(info.color_type, png::ColorType::Rgba);
        let gamma = info.source_gamma.expect("gAMA chunk");
        assert_eq!(gamma.into_scaled(), 100_000);

        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(decoded.get_pixel(0, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn missing_directory_reports_create_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("x.png");
        let image = RgbaImage::new(1, 1);
        assert!(matches!(
            write_linear_png(&path, &image),
            Err(SinkError::Create { .. })
        ));
    }
}

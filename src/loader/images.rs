//! Raster image compression.
//!
//! Images are copied to the output tree as they are by a plain pipeline; in
//! production a second pass re-encodes PNG and JPEG files and overwrites the
//! copy whenever that makes the file smaller. No remote service is involved,
//! so no credential is needed.

#[cfg(feature = "image")]
pub use self::compress::{Compress, ImageError};

#[cfg(feature = "image")]
mod compress {
    use image::codecs::jpeg::JpegEncoder;
    use image::codecs::png::{CompressionType, FilterType, PngEncoder};
    use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};
    use thiserror::Error;

    use crate::error::StageError;
    use crate::pipeline::{ErrorPolicy, FileRecord, Stage};

    /// Errors that can occur when re-encoding images.
    #[derive(Debug, Error)]
    pub enum ImageError {
        /// An error occurred during image decoding or encoding.
        #[error("Image processing error: {0}")]
        Image(#[from] image::ImageError),

        #[error("Unsupported image format: {0:?}")]
        Format(ImageFormat),
    }

    impl From<ImageError> for StageError {
        fn from(err: ImageError) -> Self {
            StageError::content(err.to_string())
        }
    }

    /// Lossless PNG recompression and lossy JPEG re-encoding.
    ///
    /// Files that can't be decoded, or don't get smaller, are skipped so the
    /// plain copy stays in place.
    #[derive(Debug, Clone, Copy)]
    pub struct Compress {
        /// JPEG quality, 1 to 100.
        pub quality: u8,
    }

    impl Default for Compress {
        fn default() -> Self {
            Self { quality: 80 }
        }
    }

    impl Compress {
        fn encode(&self, bytes: &[u8]) -> Result<Vec<u8>, ImageError> {
            let format = image::guess_format(bytes)?;
            let img = image::load_from_memory_with_format(bytes, format)?;

            let mut out = Vec::new();
            match format {
                ImageFormat::Png => {
                    let encoder = PngEncoder::new_with_quality(
                        &mut out,
                        CompressionType::Best,
                        FilterType::Adaptive,
                    );
                    encoder.write_image(
                        img.as_bytes(),
                        img.width(),
                        img.height(),
                        img.color().into(),
                    )?;
                }
                ImageFormat::Jpeg => {
                    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
                    JpegEncoder::new_with_quality(&mut out, self.quality).write_image(
                        rgb.as_bytes(),
                        rgb.width(),
                        rgb.height(),
                        ExtendedColorType::Rgb8,
                    )?;
                }
                other => return Err(ImageError::Format(other)),
            }

            Ok(out)
        }
    }

    impl Stage for Compress {
        fn name(&self) -> &str {
            "compress"
        }

        fn policy(&self) -> ErrorPolicy {
            ErrorPolicy::SkipRecord
        }

        fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
            let compressed = self.encode(&record.contents)?;

            if compressed.len() >= record.contents.len() {
                tracing::debug!("{}: no gain from recompression", record.source);
                return Ok(Vec::new());
            }

            tracing::debug!(
                "{}: {} -> {} bytes",
                record.source,
                record.contents.len(),
                compressed.len()
            );

            record.contents = compressed;
            Ok(vec![record])
        }
    }

}

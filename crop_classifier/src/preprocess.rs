use crate::{config::PreprocessConfig, error::ClassifierResult};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array, Ix4};

/// Batched `1×3×H×W` input for the classifier, normalized per channel.
pub type InputTensor = Array<f32, Ix4>;

pub fn decode_image(image_data: &[u8]) -> ClassifierResult<DynamicImage> {
    let image_reader = image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;
    let img = image_reader.decode()?;

    Ok(DynamicImage::ImageRgb8(img.into_rgb8()))
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            image_size: config.image_size,
            mean: config.mean,
            std: config.std,
        }
    }

    /// Decodes raw upload bytes and turns them into a model input.
    pub fn transform(&self, image_data: &[u8]) -> ClassifierResult<InputTensor> {
        let img = decode_image(image_data)?;
        Ok(self.transform_image(&img))
    }

    pub fn transform_image(&self, img: &DynamicImage) -> InputTensor {
        let size = self.image_size;
        // Aspect ratio is not preserved.
        let rgb = img
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let side = size as usize;
        let mut input = Array::zeros((1, 3, side, side));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.;
                input[[0, c, y, x]] = (value - self.mean[c]) / self.std[c];
            }
        }

        input
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(&PreprocessConfig::default())
    }
}

/// Image preprocessing: resize, center crop, normalise
use candle_core::{DType, Device, Result, Tensor};

/// Deterministic preprocessing applied to every radiograph
#[derive(Debug, Clone)]
pub struct ImageTransform {
    /// Output resolution (square)
    pub size: usize,
    /// Per-channel mean
    pub mean: [f32; 3],
    /// Per-channel std
    pub std: [f32; 3],
}

impl ImageTransform {
    pub fn new(size: usize, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { size, mean, std }
    }

    /// Transform a grayscale image into a normalised 3-channel tensor
    ///
    /// # Arguments
    /// * `pixels` - Row-major 8-bit grayscale pixels
    /// * `height`, `width` - Source dimensions
    ///
    /// # Returns
    /// Tensor of shape [3, size, size]
    pub fn apply(&self, pixels: &[u8], height: usize, width: usize, device: &Device) -> Result<Tensor> {
        if height == 0 || width == 0 {
            candle_core::bail!("empty image: {}x{}", height, width);
        }
        if pixels.len() != height * width {
            candle_core::bail!(
                "expected {}x{} pixels, got {}",
                height,
                width,
                pixels.len()
            );
        }

        let image = Tensor::from_slice(pixels, (1, 1, height, width), device)?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;

        // Shorter side to `size`, keeping aspect ratio
        let (new_h, new_w) = if height <= width {
            (self.size, (width * self.size + height / 2) / height)
        } else {
            ((height * self.size + width / 2) / width, self.size)
        };
        let image = image.upsample_nearest2d(new_h.max(self.size), new_w.max(self.size))?;

        let (_, _, h, w) = image.dims4()?;
        let top = (h - self.size) / 2;
        let left = (w - self.size) / 2;
        let image = image
            .narrow(2, top, self.size)?
            .narrow(3, left, self.size)?;

        let image = image.broadcast_as((1, 3, self.size, self.size))?.contiguous()?;

        let mean = Tensor::from_slice(&self.mean, (1, 3, 1, 1), device)?;
        let std = Tensor::from_slice(&self.std, (1, 3, 1, 1), device)?;
        image.broadcast_sub(&mean)?.broadcast_div(&std)?.squeeze(0)
    }
}

/// Mirror a [channels, height, width] image along its width
pub fn flip_horizontal(image: &Tensor) -> Result<Tensor> {
    let width = image.dim(candle_core::D::Minus1)?;
    let reversed: Vec<u32> = (0..width as u32).rev().collect();
    let index = Tensor::from_vec(reversed, width, image.device())?;
    image.index_select(&index, image.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IMAGENET_MEAN, IMAGENET_STD};

    #[test]
    fn test_transform_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let transform = ImageTransform::new(8, IMAGENET_MEAN, IMAGENET_STD);

        let pixels = vec![128u8; 12 * 16];
        let out = transform.apply(&pixels, 12, 16, &device)?;

        assert_eq!(out.dims(), &[3, 8, 8]);

        Ok(())
    }

    #[test]
    fn test_transform_normalises_per_channel() -> Result<()> {
        let device = Device::Cpu;
        let transform = ImageTransform::new(4, IMAGENET_MEAN, IMAGENET_STD);

        let pixels = vec![255u8; 4 * 4];
        let out = transform.apply(&pixels, 4, 4, &device)?;

        for c in 0..3 {
            let value = out.get(c)?.mean_all()?.to_scalar::<f32>()?;
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((value - expected).abs() < 1e-5, "channel {}: {} vs {}", c, value, expected);
        }

        Ok(())
    }

    #[test]
    fn test_transform_rejects_wrong_pixel_count() {
        let transform = ImageTransform::new(4, IMAGENET_MEAN, IMAGENET_STD);
        assert!(transform.apply(&[0u8; 10], 4, 4, &Device::Cpu).is_err());
    }

    #[test]
    fn test_transform_rejects_empty_image() {
        let transform = ImageTransform::new(4, IMAGENET_MEAN, IMAGENET_STD);
        assert!(transform.apply(&[], 0, 16, &Device::Cpu).is_err());
        assert!(transform.apply(&[], 16, 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_flip_horizontal() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::new(&[[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]]], &device)?;

        let flipped = flip_horizontal(&image)?;

        assert_eq!(
            flipped.to_vec3::<f32>()?,
            vec![vec![vec![3.0, 2.0, 1.0], vec![6.0, 5.0, 4.0]]]
        );

        Ok(())
    }
}

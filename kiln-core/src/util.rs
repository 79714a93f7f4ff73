use anyhow::{anyhow, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Maps a pixel in `[0, 1]` to `[0, 255]`, clamping out-of-range values.
pub fn unit_to_u8(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

/// Converts a float tensor with shape (height, width, 3) and values in `[0, 1]`
/// into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (height, width, channels) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let pixels = img
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(unit_to_u8)
        .collect();
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("error converting tensor to image buffer"))
}

/// Resizes an image and converts it to a (1, 3, height, width) tensor in `[-1, 1]`.
pub fn image_to_tensor(img: &RgbImage, width: usize, height: usize) -> Result<Tensor> {
    let img = image::imageops::resize(img, width as u32, height as u32, FilterType::CatmullRom);
    let tensor = Tensor::from_vec(img.into_raw(), (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Resizes a mask and converts it to a (1, 1, height, width) tensor holding 1.0 where
/// the mask is set and 0.0 elsewhere.
pub fn mask_to_tensor(mask: &GrayImage, width: usize, height: usize) -> Result<Tensor> {
    let mask = image::imageops::resize(mask, width as u32, height as u32, FilterType::Nearest);
    let values: Vec<f32> = mask
        .into_raw()
        .into_iter()
        .map(|v| if v >= 128 { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(values, (1, 1, height, width), &Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_to_u8_clamps_and_truncates() {
        assert_eq!(unit_to_u8(-0.5), 0);
        assert_eq!(unit_to_u8(0.0), 0);
        assert_eq!(unit_to_u8(0.5), 127);
        assert_eq!(unit_to_u8(1.0), 255);
        assert_eq!(unit_to_u8(1.7), 255);
        assert_eq!(unit_to_u8(f32::NAN), 0);
    }

    #[test]
    fn tensor_to_image_keeps_layout() -> Result<()> {
        let values = vec![0.0f32, 0.5, 1.0, 2.0, -1.0, 0.25];
        let tensor = Tensor::from_vec(values, (1, 2, 3), &Device::Cpu)?;
        let img = tensor_to_image(&tensor)?;
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [0, 127, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 0, 63]);
        Ok(())
    }

    #[test]
    fn tensor_to_image_rejects_non_rgb() -> Result<()> {
        let tensor = Tensor::zeros((4, 4, 1), DType::F32, &Device::Cpu)?;
        assert!(tensor_to_image(&tensor).is_err());
        Ok(())
    }

    #[test]
    fn image_to_tensor_scales_to_signed_unit_range() -> Result<()> {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([0, 255, 0]));
        let tensor = image_to_tensor(&img, 8, 8)?;
        assert_eq!(tensor.dims(), &[1, 3, 8, 8]);
        let channels = tensor.mean_keepdim(3)?.mean_keepdim(2)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = [-1.0f32, 1.0, -1.0];
        for (got, want) in channels.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{got} != {want}");
        }
        Ok(())
    }

    #[test]
    fn mask_to_tensor_binarizes() -> Result<()> {
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(0, 0, image::Luma([255]));
        mask.put_pixel(1, 0, image::Luma([100]));
        let tensor = mask_to_tensor(&mask, 4, 4)?;
        assert_eq!(tensor.dims(), &[1, 1, 4, 4]);
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], 0.0);
        assert_eq!(values.iter().sum::<f32>(), 1.0);
        Ok(())
    }
}

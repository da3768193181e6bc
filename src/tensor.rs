//! Pixel buffers <-> NCHW float tensors.

use image::{GrayImage, Rgb, RgbImage};
use ndarray::Array4;

use crate::error::{InpaintError, Result};

/// RGB8 -> `[1, 3, H, W]` with values in `[0, 1]`.
pub fn image_to_tensor(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}

/// L8 mask -> `[1, 1, H, W]` holding exactly 0.0 or 1.0 (any non-zero pixel is hole).
pub fn mask_to_tensor(mask: &GrayImage) -> Array4<f32> {
    let (width, height) = mask.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 1, height as usize, width as usize));

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] > 0 {
            tensor[[0, 0, y as usize, x as usize]] = 1.0;
        }
    }

    tensor
}

/// `[1, 3, H, W]` in `[0, 1]` -> RGB8, clipping out-of-range values.
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<RgbImage> {
    let shape = tensor.shape();
    if shape[0] < 1 || shape[1] != 3 {
        return Err(InpaintError::Model(format!(
            "expected output of shape [1, 3, H, W], got {:?}",
            shape
        )));
    }

    let (height, width) = (shape[2], shape[3]);
    let mut image = RgbImage::new(width as u32, height as u32);

    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let (xi, yi) = (x as usize, y as usize);
        let channel = |c: usize| (tensor[[0, c, yi, xi]] * 255.0).clamp(0.0, 255.0) as u8;
        *pixel = Rgb([channel(0), channel(1), channel(2)]);
    }

    Ok(image)
}

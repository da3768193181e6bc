//! Resize step ahead of the forward pass.
//!
//! The generator downsamples three times, so both spatial dimensions must be
//! multiples of 8. Large inputs are also capped to bound memory use.

use image::{imageops::FilterType, GrayImage, RgbImage};
use tracing::{debug, info};

use crate::error::{InpaintError, Result};

/// Spatial dimensions fed to the network must be multiples of this.
pub const SIZE_MULTIPLE: u32 = 8;

/// Compute the working size for an input of `width` x `height`.
///
/// When the longer side exceeds `max_size` both sides are scaled by
/// `max_size / longer` and truncated; each side is then rounded down to a
/// multiple of [`SIZE_MULTIPLE`].
pub fn target_dimensions(width: u32, height: u32, max_size: u32) -> Result<(u32, u32)> {
    let longer = width.max(height);
    let (w, h) = if longer > max_size {
        let ratio = max_size as f64 / longer as f64;
        (
            (width as f64 * ratio) as u32,
            (height as f64 * ratio) as u32,
        )
    } else {
        (width, height)
    };

    let w = (w / SIZE_MULTIPLE) * SIZE_MULTIPLE;
    let h = (h / SIZE_MULTIPLE) * SIZE_MULTIPLE;

    if w == 0 || h == 0 {
        return Err(InpaintError::InvalidInput(format!(
            "image {}x{} is too small: both sides must be at least {} pixels after resizing",
            width, height, SIZE_MULTIPLE
        )));
    }
    Ok((w, h))
}

/// Image and mask at the working resolution
#[derive(Debug, Clone)]
pub struct Prepared {
    pub image: RgbImage,
    pub mask: GrayImage,
    pub original_size: (u32, u32),
    pub resized: bool,
}

/// Resize image (Lanczos3) and mask (nearest-neighbour) to the working size.
pub fn resize_pair(image: RgbImage, mask: GrayImage, max_size: u32) -> Result<Prepared> {
    let original_size = image.dimensions();
    if mask.dimensions() != original_size {
        return Err(InpaintError::InvalidInput(format!(
            "mask size {:?} does not match image size {:?}",
            mask.dimensions(),
            original_size
        )));
    }

    let (new_w, new_h) = target_dimensions(original_size.0, original_size.1, max_size)?;
    info!(
        input = ?original_size,
        adjusted = ?(new_w, new_h),
        "Adjusted size to multiples of {}",
        SIZE_MULTIPLE
    );

    if (new_w, new_h) == original_size {
        debug!("No resize needed");
        return Ok(Prepared {
            image,
            mask,
            original_size,
            resized: false,
        });
    }

    let image = image::imageops::resize(&image, new_w, new_h, FilterType::Lanczos3);
    let mask = image::imageops::resize(&mask, new_w, new_h, FilterType::Nearest);

    Ok(Prepared {
        image,
        mask,
        original_size,
        resized: true,
    })
}

use std::io::Cursor;

use image::imageops;
use image::{DynamicImage, ImageFormat, RgbaImage};

use super::{CompositeResult, OverlayLayer};
use crate::error::FatalError;

/// Alpha-composite overlays onto a still image and flatten the result to JPEG.
///
/// Every layer is placed unscaled at the top-left corner and clipped to the main image.
/// Any decode or encode failure ends the run.
pub fn composite_image(
    main_name: &str,
    main_extension: &str,
    main_bytes: &[u8],
    overlays: &[OverlayLayer],
) -> Result<CompositeResult, FatalError> {
    let mut canvas = image::load_from_memory(main_bytes)
        .map_err(|e| FatalError::ImageComposite {
            member: main_name.to_string(),
            reason: e.to_string(),
        })?
        .to_rgba8();

    for overlay in overlays {
        apply_overlay(&mut canvas, overlay)?;
    }

    let bytes = encode_jpeg(canvas).map_err(|e| FatalError::ImageComposite {
        member: main_name.to_string(),
        reason: format!("jpeg encode: {}", e),
    })?;

    let extension = match main_extension {
        "jpg" | "jpeg" => format!(".{}", main_extension),
        _ => ".jpg".to_string(),
    };
    Ok(CompositeResult { bytes, extension })
}

fn apply_overlay(canvas: &mut RgbaImage, overlay: &OverlayLayer) -> Result<(), FatalError> {
    let layer = image::load_from_memory(&overlay.bytes)
        .map_err(|e| FatalError::OverlayComposite {
            member: overlay.name.clone(),
            reason: e.to_string(),
        })?
        .to_rgba8();

    imageops::overlay(canvas, &layer, 0, 0);
    Ok(())
}

fn encode_jpeg(canvas: RgbaImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

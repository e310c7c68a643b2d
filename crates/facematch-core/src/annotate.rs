//! Marked copies of query images.
//!
//! The winning face is outlined in red, every other detection in blue.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

pub const WINNER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const OTHER_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const BOX_THICKNESS: i32 = 3;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("image codec: {0}")]
    Image(#[from] image::ImageError),
}

/// Encoded annotated image ready for upload.
#[derive(Debug, Clone)]
pub struct Annotated {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl Annotated {
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("png")
    }
}

/// Draw `boxes` (`[x1, y1, x2, y2]`) onto a copy of `image`.
///
/// The output keeps the source encoding when it is JPEG or PNG and falls
/// back to PNG otherwise.
pub fn annotate(image: &[u8], boxes: &[[i32; 4]], winner: Option<usize>) -> Result<Annotated, AnnotateError> {
    let source_format = image::guess_format(image).ok();
    let mut canvas = image::load_from_memory(image)?.to_rgb8();

    for (i, corners) in boxes.iter().enumerate() {
        if Some(i) != winner {
            draw_box(&mut canvas, *corners, OTHER_COLOR);
        }
    }
    // Winner last so it stays visible where boxes overlap.
    if let Some(corners) = winner.and_then(|w| boxes.get(w)) {
        draw_box(&mut canvas, *corners, WINNER_COLOR);
    }

    let format = match source_format {
        Some(ImageFormat::Jpeg) => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    };
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(canvas).write_to(&mut Cursor::new(&mut bytes), format)?;

    Ok(Annotated { bytes, format })
}

/// Hollow rectangle clipped to the canvas.
fn draw_box(canvas: &mut RgbImage, [x1, y1, x2, y2]: [i32; 4], color: Rgb<u8>) {
    let (w, h) = (canvas.width() as i32, canvas.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));

    let mut plot = |x: i32, y: i32| {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            canvas.put_pixel(x as u32, y as u32, color);
        }
    };

    for t in 0..BOX_THICKNESS {
        for x in left..=right {
            plot(x, top + t);
            plot(x, bottom - t);
        }
        for y in top..=bottom {
            plot(left + t, y);
            plot(right - t, y);
        }
    }
}

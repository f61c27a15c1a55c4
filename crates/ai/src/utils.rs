use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// Shrinks `image` so that it fits inside `max_size` (width, height), keeping the
/// aspect ratio. Images that already fit are returned as they are; nothing is ever
/// enlarged.
pub fn scale_to_fit(image: &DynamicImage, max_size: (u32, u32)) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (max_width, max_height) = max_size;

    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return image.clone();
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let new_height = ((height as f64 * scale).round() as u32).clamp(1, max_height);

    tracing::debug!(
        "scaling image from {}x{} to {}x{}",
        width,
        height,
        new_width,
        new_height
    );

    image.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    const MAX: (u32, u32) = (1536, 1024);

    fn blank(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
    }

    #[test]
    fn small_images_are_untouched() {
        for (w, h) in [(10, 10), (1536, 1024), (800, 1024), (1536, 3)] {
            let scaled = scale_to_fit(&blank(w, h), MAX);
            assert_eq!(scaled.dimensions(), (w, h));
        }
    }

    #[test]
    fn large_images_fit_and_keep_aspect() {
        for (w, h) in [(3072, 2048), (4000, 1000), (1000, 4000), (1537, 1024), (2480, 3508)] {
            let (nw, nh) = scale_to_fit(&blank(w, h), MAX).dimensions();
            assert!(nw <= MAX.0 && nh <= MAX.1, "{w}x{h} -> {nw}x{nh}");

            let before = w as f64 / h as f64;
            let after = nw as f64 / nh as f64;
            // one pixel of rounding on the shorter side
            let tolerance = before / nh.min(nw) as f64 + 1.0 / nh as f64;
            assert!((before - after).abs() <= tolerance, "{w}x{h} -> {nw}x{nh}");
        }
    }

    #[test]
    fn binding_side_hits_the_limit() {
        assert_eq!(scale_to_fit(&blank(3072, 2048), MAX).dimensions(), (1536, 1024));
        assert_eq!(scale_to_fit(&blank(3072, 1024), MAX).dimensions(), (1536, 512));
        assert_eq!(scale_to_fit(&blank(1024, 4096), MAX).dimensions(), (256, 1024));
    }
}

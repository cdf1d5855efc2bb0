use crate::{Dims, Error};
use std::path::Path;

/// Per-channel means of the network's training set, in BGR order
pub const BGR_MEANS: [f64; 3] = [103.939, 116.779, 123.68];

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Keeps the aspect ratio of `original` at a fixed output height
pub fn scaled_dims(original: Dims, target_height: u32) -> Dims {
    let width = f64::from(original.width) * f64::from(target_height)
        / f64::from(original.height.max(1));

    Dims::new((width.round() as u32).max(1), target_height)
}

/// Converts an image to RGB at exactly `size`, ignoring its aspect ratio
pub(crate) fn resize_exact(img: &image::DynamicImage, size: Dims) -> image::RgbImage {
    use image::GenericImageView;

    if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img.to_rgb8(),
            size.width,
            size.height,
            image::imageops::Nearest,
        )
    } else {
        img.to_rgb8()
    }
}

/// Converts an RGB image into the network's input convention: BGR channel
/// order with the per-channel means subtracted, flattened channels-last
pub fn preprocess(img: &image::RgbImage) -> Vec<f64> {
    let mut out = Vec::with_capacity(img.width() as usize * img.height() as usize * 3);

    for pixel in img.pixels() {
        let [r, g, b] = pixel.0;
        out.push(f64::from(b) - BGR_MEANS[0]);
        out.push(f64::from(g) - BGR_MEANS[1]);
        out.push(f64::from(r) - BGR_MEANS[2]);
    }

    out
}

/// Inverse of `preprocess`: adds the means back, restores RGB order, clips to
/// `[0, 255]` and truncates to 8 bits
pub fn postprocess(x: &[f64], dims: Dims) -> image::RgbImage {
    debug_assert_eq!(x.len(), dims.width as usize * dims.height as usize * 3);

    let mut img = image::RgbImage::new(dims.width, dims.height);
    for (pixel, bgr) in img.pixels_mut().zip(x.chunks_exact(3)) {
        let channel = |i: usize| (bgr[i] + BGR_MEANS[i]).max(0.0).min(255.0) as u8;
        *pixel = image::Rgb([channel(2), channel(1), channel(0)]);
    }

    img
}

/// `<content>_by_<style>.png`, where each name is the file name up to its
/// first `.`
pub fn output_file_name(content: &Path, style: &Path) -> String {
    fn prefix(path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        name.split('.').next().unwrap_or_default().to_owned()
    }

    format!("{}_by_{}.png", prefix(content), prefix(style))
}

/// Loads `src` and converts it to the network's input convention at `size`
pub(crate) fn load_preprocessed(src: ImageSource<'_>, size: Dims) -> Result<Vec<f64>, Error> {
    let img = load_dynamic_image(src)?;
    Ok(preprocess(&resize_exact(&img, size)))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn keeps_aspect_ratio_at_fixed_height() {
        assert_eq!(scaled_dims(Dims::new(300, 200), 400), Dims::new(600, 400));
        assert_eq!(scaled_dims(Dims::new(200, 300), 400), Dims::new(267, 400));
        assert_eq!(scaled_dims(Dims::new(1, 4000), 400), Dims::new(1, 400));
    }

    #[test]
    fn output_name_uses_prefixes() {
        assert_eq!(
            output_file_name(
                Path::new("/x/content_image/freegodness.jpeg"),
                Path::new("style_reference/d1.jpeg")
            ),
            "freegodness_by_d1.png"
        );
        assert_eq!(
            output_file_name(Path::new("a.b.jpg"), Path::new("noext")),
            "a_by_noext.png"
        );
    }

    #[test]
    fn channels_are_swapped_and_centered() {
        let mut img = image::RgbImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgb([10, 20, 30]));

        let x = preprocess(&img);
        assert_eq!(x.len(), 3);
        assert!((x[0] - (30.0 - 103.939)).abs() < 1e-9);
        assert!((x[1] - (20.0 - 116.779)).abs() < 1e-9);
        assert!((x[2] - (10.0 - 123.68)).abs() < 1e-9);
    }

    #[test]
    fn postprocess_inverts_preprocess_up_to_rounding() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(3);
        let dims = Dims::new(13, 7);
        let mut img = image::RgbImage::new(dims.width, dims.height);
        for p in img.pixels_mut() {
            *p = image::Rgb([rng.gen(), rng.gen(), rng.gen()]);
        }

        let restored = postprocess(&preprocess(&img), dims);
        assert_eq!(restored.dimensions(), img.dimensions());

        for (a, b) in img.pixels().zip(restored.pixels()) {
            for c in 0..3 {
                assert!((i16::from(a[c]) - i16::from(b[c])).abs() <= 1);
            }
        }
    }

    #[test]
    fn postprocess_clips() {
        let dims = Dims::new(2, 1);
        let x = [-1000.0, 0.0, 1000.0, 500.0, -500.0, 0.5];
        let img = postprocess(&x, dims);

        // first pixel: B clipped low, R clipped high
        assert_eq!(img.get_pixel(0, 0).0, [255, 116, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [124, 0, 255]);
    }

    #[test]
    fn resize_ignores_aspect_ratio() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(30, 20));
        let resized = resize_exact(&img, Dims::new(10, 40));
        assert_eq!(resized.dimensions(), (10, 40));
    }
}

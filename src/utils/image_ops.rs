// Pixel-level helpers shared by the pipeline stages.
//
// Colour conversions produce OpenCV 8-bit conventions (H in 0..180, Lab with
// L stretched to 0..255 and a/b offset by 128) so calibrated thresholds keep
// their meaning.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GrayImage, ImageResult, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3};
use palette::{FromColor, Hsv, Lab, LinSrgb, Srgb};
use rayon::prelude::*;

pub const JPEG_QUALITY: u8 = 95;

fn to_srgb(p: &Rgb<u8>) -> Srgb<f32> {
    Srgb::new(p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0)
}

/// HSV in OpenCV 8-bit units.
pub fn rgb_to_hsv(p: &Rgb<u8>) -> [u8; 3] {
    let hsv: Hsv = Hsv::from_color(to_srgb(p));
    let mut h = (hsv.hue.into_positive_degrees() / 2.0).round();
    if h >= 180.0 {
        h -= 180.0;
    }
    [
        h as u8,
        (hsv.saturation * 255.0).round().clamp(0.0, 255.0) as u8,
        (hsv.value * 255.0).round().clamp(0.0, 255.0) as u8,
    ]
}

/// CIE Lab (D65) on the OpenCV 8-bit scale, kept in f32.
pub fn rgb_to_lab(p: &Rgb<u8>) -> [f32; 3] {
    let lin: LinSrgb<f32> = to_srgb(p).into_linear();
    let lab: Lab = Lab::from_color(lin);
    [lab.l * 255.0 / 100.0, lab.a + 128.0, lab.b + 128.0]
}

/// Row-major HSV and Lab planes for a whole image.
pub fn color_planes(img: &RgbImage) -> (Vec<[u8; 3]>, Vec<[f32; 3]>) {
    img.as_raw()
        .par_chunks_exact(3)
        .map(|c| {
            let p = Rgb([c[0], c[1], c[2]]);
            (rgb_to_hsv(&p), rgb_to_lab(&p))
        })
        .unzip()
}

/// OpenCV COLORMAP_JET, returned as RGB.
pub fn jet(value: u8) -> Rgb<u8> {
    let x = value as f32 / 255.0;
    let channel = |offset: f32| ((1.5 - (4.0 * x - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

pub fn apply_jet(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| jet(gray.get_pixel(x, y)[0]))
}

/// `a * alpha + b * beta`, rounded and saturated. Images must share dimensions.
pub fn blend(a: &RgbImage, b: &RgbImage, alpha: f32, beta: f32) -> RgbImage {
    RgbImage::from_fn(a.width(), a.height(), |x, y| {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        Rgb(std::array::from_fn(|c| {
            (pa[c] as f32 * alpha + pb[c] as f32 * beta).round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Half-pixel source coordinate for bilinear sampling (align_corners = false).
fn source_index(dst: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, src - i0 as f32)
}

/// Bilinear resize of a channels x height x width grid.
pub fn resize_bilinear_chw(input: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    let mut output = Array3::<f32>::zeros((channels, out_h, out_w));
    if in_h == 0 || in_w == 0 {
        return output;
    }

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    for oy in 0..out_h {
        let (y0, y1, ly) = source_index(oy, scale_y, in_h);
        for ox in 0..out_w {
            let (x0, x1, lx) = source_index(ox, scale_x, in_w);
            for c in 0..channels {
                let top = input[[c, y0, x0]] * (1.0 - lx) + input[[c, y0, x1]] * lx;
                let bottom = input[[c, y1, x0]] * (1.0 - lx) + input[[c, y1, x1]] * lx;
                output[[c, oy, ox]] = top * (1.0 - ly) + bottom * ly;
            }
        }
    }
    output
}

/// Min-max normalise a grid to 0..255 (epsilon keeps flat maps at zero).
pub fn normalize_to_gray(map: &Array2<f32>) -> GrayImage {
    let (h, w) = map.dim();
    let min = map.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = map.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min + 1e-8;
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = (map[[y as usize, x as usize]] - min) / range;
        Luma([(v * 255.0).clamp(0.0, 255.0) as u8])
    })
}

pub fn resize_gray(gray: &GrayImage, width: u32, height: u32) -> GrayImage {
    image::imageops::resize(gray, width, height, FilterType::Triangle)
}

pub fn encode_jpeg(img: &RgbImage) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    img.write_with_encoder(encoder)?;
    Ok(bytes)
}

pub fn decode_rgb(bytes: &[u8]) -> ImageResult<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Count of non-zero mask pixels.
pub fn count_set(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

use image::{Rgb, RgbImage};

use crate::error::VrError;

pub const MIN_OBJECT_SIZE: u32 = 8;

pub const COLORS: [(&str, [u8; 3]); 8] = [
    ("red", [255, 0, 0]),
    ("green", [0, 255, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("cyan", [0, 255, 255]),
    ("purple", [128, 0, 128]),
    ("brown", [165, 42, 42]),
    ("gray", [128, 128, 128]),
];

pub const SHAPES: [&str; 7] = [
    "square",
    "empty_square",
    "circle",
    "triangle",
    "empty_triangle",
    "cross",
    "bar",
];

pub fn color_rgb(color: &str) -> Option<[u8; 3]> {
    COLORS.iter().find(|(name, _)| *name == color).map(|(_, rgb)| *rgb)
}

/// Signed distance from `(px, py)` to the line through `a` and `b`, positive on the left.
fn edge(a: (f32, f32), b: (f32, f32), px: f32, py: f32) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    ((px - a.0) * dy - (py - a.1) * dx) / (dx * dx + dy * dy).sqrt()
}

fn distance_to_segment(a: (f32, f32), b: (f32, f32), px: f32, py: f32) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let t = (((px - a.0) * dx + (py - a.1) * dy) / (dx * dx + dy * dy)).clamp(0.0, 1.0);
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Whether pixel `(x, y)` of a `size`-wide cell belongs to `shape`.
fn covers(shape: &str, size: u32, x: u32, y: u32) -> Result<bool, VrError> {
    let s = size as f32;
    let (px, py) = (x as f32, y as f32);
    let quarter = (size / 4) as f32;
    let triangle = [(0.0, 0.0), (s / 2.0, s - 1.0), (s - 1.0, 0.0)];
    let inside_triangle = || {
        let d = [
            edge(triangle[0], triangle[1], px, py),
            edge(triangle[1], triangle[2], px, py),
            edge(triangle[2], triangle[0], px, py),
        ];
        (d.iter().all(|&v| v >= -0.5) || d.iter().all(|&v| v <= 0.5), d)
    };

    Ok(match shape {
        "square" => true,
        "circle" => {
            let c = (size / 2) as f32;
            (px - c).powi(2) + (py - c).powi(2) <= c * c
        }
        "triangle" => inside_triangle().0,
        "empty_triangle" => {
            let (inside, d) = inside_triangle();
            let thickness = (quarter - 1.0).max(1.0);
            inside && d.iter().any(|v| v.abs() < thickness)
        }
        "empty_square" => {
            let thickness = (size / 4).saturating_sub(1).max(1);
            let border = x.min(y).min(size - 1 - x).min(size - 1 - y);
            border < thickness
        }
        "cross" => {
            let far = s - 1.0;
            distance_to_segment((0.0, 0.0), (far, far), px, py) <= quarter / 2.0
                || distance_to_segment((far, 0.0), (0.0, far), px, py) <= quarter / 2.0
        }
        "bar" => (py - (size / 2) as f32).abs() <= quarter / 2.0,
        other => return Err(VrError::UnknownToken(other.to_string())),
    })
}

/// A `size`x`size` cell with the object drawn over a black background.
pub fn object_bitmap(shape: &str, color: &str, size: u32) -> Result<RgbImage, VrError> {
    if size < MIN_OBJECT_SIZE {
        return Err(VrError::Shape(format!("object size {} is below {}", size, MIN_OBJECT_SIZE)));
    }
    let rgb = color_rgb(color).ok_or_else(|| VrError::UnknownToken(color.to_string()))?;
    let mut cell = RgbImage::new(size, size);
    for y in 0..size {
        for x in 0..size {
            if covers(shape, size, x, y)? {
                cell.put_pixel(x, y, Rgb(rgb));
            }
        }
    }
    Ok(cell)
}

/// Copy `cell` onto `canvas` with its top-left corner at `(left, top)`, clipping at the edges.
pub fn blit(canvas: &mut RgbImage, cell: &RgbImage, left: i64, top: i64) {
    for (x, y, pixel) in cell.enumerate_pixels() {
        let (cx, cy) = (left + i64::from(x), top + i64::from(y));
        if cx >= 0 && cy >= 0 && cx < i64::from(canvas.width()) && cy < i64::from(canvas.height()) {
            canvas.put_pixel(cx as u32, cy as u32, *pixel);
        }
    }
}

/// `[3, H, W]` features in `[0, 1]`, with image rows in bottom-to-top order.
pub fn image_to_features(canvas: &RgbImage) -> Vec<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    let mut out = vec![0f32; 3 * h * w];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let row = h - 1 - y as usize;
        for ch in 0..3 {
            out[(ch * h + row) * w + x as usize] = f32::from(pixel[ch]) / 255.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(shape: &str, size: u32) -> usize {
        let cell = object_bitmap(shape, "red", size).unwrap();
        cell.pixels().filter(|p| p[0] == 255).count()
    }

    #[test]
    fn test_every_shape_draws_inside_its_cell() {
        for shape in SHAPES {
            let covered = coverage(shape, 12);
            assert!(covered > 0, "{} drew nothing", shape);
            assert!(covered <= 144);
        }
        assert_eq!(coverage("square", 12), 144);
        assert!(coverage("empty_square", 12) < coverage("square", 12));
        assert!(coverage("empty_triangle", 16) < coverage("triangle", 16));
    }

    #[test]
    fn test_bad_objects() {
        assert!(object_bitmap("hexagon", "red", 10).is_err());
        assert!(object_bitmap("square", "pink", 10).is_err());
        assert!(object_bitmap("square", "red", 4).is_err());
    }

    #[test]
    fn test_blit_clips_and_features_flip_rows() {
        let mut canvas = RgbImage::new(4, 4);
        let cell = object_bitmap("square", "blue", 8).unwrap();
        blit(&mut canvas, &cell, 2, -6);
        // only rows 0..2 and columns 2..4 are covered
        assert_eq!(canvas.get_pixel(3, 1)[2], 255);
        assert_eq!(canvas.get_pixel(1, 1)[2], 0);
        assert_eq!(canvas.get_pixel(3, 2)[2], 0);

        let features = image_to_features(&canvas);
        assert_eq!(features.len(), 48);
        // canvas row 0 becomes the last feature row of the blue channel
        assert_eq!(features[(2 * 4 + 3) * 4 + 3], 1.0);
        assert_eq!(features[(2 * 4) * 4 + 3], 0.0);
    }
}

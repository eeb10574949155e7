use crate::config::GeometrySettings;
use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage, Rgb, RgbImage};
use imageproc::{
    contours::find_contours,
    distance_transform::Norm,
    edges::canny,
    filter::gaussian_blur_f32,
    geometric_transformations::{warp_into, Interpolation, Projection},
    geometry::{approximate_polygon_dp, arc_length},
    morphology::dilate,
    point::Point,
};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Corner order used throughout: top-left, top-right, bottom-right, bottom-left.
pub type Quad = [(f32, f32); 4];

/// Smallest corrected page we accept; anything below is a detection artefact.
const MIN_OUTPUT_SIDE: f32 = 32.0;

/// Locate the page outline and warp it upright so it fills the frame.
///
/// This step never fails: when no quadrilateral is found, or anything in the
/// image stack goes wrong, the original image is returned unchanged.
pub fn normalize(image: &DynamicImage, settings: &GeometrySettings) -> DynamicImage {
    if !settings.enabled {
        return image.clone();
    }

    let attempt = panic::catch_unwind(AssertUnwindSafe(|| correct_perspective(image, settings)));
    match attempt {
        Ok(Some(corrected)) => {
            debug!(
                from = ?image.dimensions(),
                to = ?corrected.dimensions(),
                "Perspective corrected"
            );
            corrected
        }
        Ok(None) => {
            debug!("No page quadrilateral found; keeping original");
            image.clone()
        }
        Err(_) => {
            warn!("Geometry correction aborted; keeping original");
            image.clone()
        }
    }
}

fn correct_perspective(image: &DynamicImage, settings: &GeometrySettings) -> Option<DynamicImage> {
    let (w, h) = image.dimensions();
    if w < 16 || h < 16 {
        return None;
    }

    // Bound detection cost on large scans; corners are scaled back afterwards.
    let longest = w.max(h);
    let scale = if settings.max_dimension > 0 && longest > settings.max_dimension {
        settings.max_dimension as f32 / longest as f32
    } else {
        1.0
    };
    let gray = if scale < 1.0 {
        let sw = ((w as f32 * scale).round() as u32).max(1);
        let sh = ((h as f32 * scale).round() as u32).max(1);
        image.resize_exact(sw, sh, FilterType::Triangle).to_luma8()
    } else {
        image.to_luma8()
    };

    let quad = find_page_quad(&gray, settings)?;
    let quad = quad.map(|(x, y)| (x / scale, y / scale));
    warp_to_rectangle(image, &quad)
}

/// Find the largest four-sided contour in `gray`, corners ordered.
pub fn find_page_quad(gray: &GrayImage, settings: &GeometrySettings) -> Option<Quad> {
    let blurred = if settings.blur_sigma > 0.0 {
        gaussian_blur_f32(gray, settings.blur_sigma)
    } else {
        gray.clone()
    };
    // Thicken edges so small gaps in the page border do not split the contour.
    let edges = dilate(&canny(&blurred, settings.canny_low, settings.canny_high), Norm::LInf, 1);

    let contours = find_contours::<i32>(&edges);
    let mut candidates: Vec<(f64, &[Point<i32>])> = contours
        .iter()
        .filter(|c| c.points.len() >= 4)
        .map(|c| (polygon_area(&c.points), c.points.as_slice()))
        .collect();
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let page_area = gray.width() as f64 * gray.height() as f64;
    for (area, points) in candidates.into_iter().take(settings.candidate_contours) {
        if area < page_area * settings.min_area_ratio {
            // Sorted by area: everything after this is smaller still.
            break;
        }
        let perimeter = arc_length(points, true);
        if perimeter <= 0.0 {
            continue;
        }
        let approx = dedupe_vertices(approximate_polygon_dp(
            points,
            settings.approx_epsilon * perimeter,
            true,
        ));
        if approx.len() == 4 {
            let corners: Vec<(f32, f32)> =
                approx.iter().map(|p| (p.x as f32, p.y as f32)).collect();
            if let Some(quad) = order_corners(&corners) {
                debug!(area, perimeter, ?quad, "Page quadrilateral found");
                return Some(quad);
            }
        }
    }
    None
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    twice.abs() as f64 / 2.0
}

/// Drop vertices that sit on top of their neighbour (closing point included).
fn dedupe_vertices(mut points: Vec<Point<i32>>) -> Vec<Point<i32>> {
    let close = |a: &Point<i32>, b: &Point<i32>| (a.x - b.x).abs() <= 2 && (a.y - b.y).abs() <= 2;
    points.dedup_by(|a, b| close(&*a, &*b));
    while points.len() > 1 && close(&points[0], &points[points.len() - 1]) {
        points.pop();
    }
    points
}

/// Order four corners as TL, TR, BR, BL.
///
/// The top-left corner has the smallest `x + y`, bottom-right the largest;
/// top-right has the smallest `y - x`, bottom-left the largest. Returns `None`
/// when two roles land on the same point.
pub fn order_corners(points: &[(f32, f32)]) -> Option<Quad> {
    if points.len() != 4 {
        return None;
    }
    let pick = |key: &dyn Fn(&(f32, f32)) -> f32, largest: bool| -> usize {
        let mut best = 0;
        for i in 1..points.len() {
            let (cur, top) = (key(&points[i]), key(&points[best]));
            if (largest && cur > top) || (!largest && cur < top) {
                best = i;
            }
        }
        best
    };
    let sum = |p: &(f32, f32)| p.0 + p.1;
    let diff = |p: &(f32, f32)| p.1 - p.0;

    let tl = pick(&sum, false);
    let br = pick(&sum, true);
    let tr = pick(&diff, false);
    let bl = pick(&diff, true);

    let mut roles = [tl, tr, br, bl];
    roles.sort_unstable();
    if roles.windows(2).any(|w| w[0] == w[1]) {
        return None;
    }
    Some([points[tl], points[tr], points[br], points[bl]])
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Map `quad` onto an axis-aligned rectangle sized by its longer edges.
fn warp_to_rectangle(image: &DynamicImage, quad: &Quad) -> Option<DynamicImage> {
    let [tl, tr, br, bl] = *quad;
    let width = distance(tl, tr).max(distance(bl, br)).round();
    let height = distance(tl, bl).max(distance(tr, br)).round();
    if width < MIN_OUTPUT_SIDE || height < MIN_OUTPUT_SIDE {
        return None;
    }

    let target = [
        (0.0, 0.0),
        (width - 1.0, 0.0),
        (width - 1.0, height - 1.0),
        (0.0, height - 1.0),
    ];
    let projection = Projection::from_control_points(*quad, target)?;

    let source = image.to_rgb8();
    let mut out = RgbImage::new(width as u32, height as u32);
    warp_into(
        &source,
        &projection,
        Interpolation::Bilinear,
        Rgb([255, 255, 255]),
        &mut out,
    );
    Some(DynamicImage::ImageRgb8(out))
}

use edgewatch_common::frame::BoundingBox;
use image::GrayImage;

/// Bounding boxes of the outermost foreground components of `mask`.
///
/// Foreground (any non-zero pixel) is 8-connected; background is
/// 4-connected. A component counts as outermost when it touches the image
/// border or the background reachable from the border, so shapes nested in
/// another component's hole are skipped. Boxes come out in raster order of
/// each component's first pixel.
pub fn external_boxes(mask: &GrayImage) -> Vec<BoundingBox> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let fg: Vec<bool> = mask.as_raw().iter().map(|&p| p != 0).collect();
    let outside = outer_background(&fg, w, h);

    let mut seen = vec![false; fg.len()];
    let mut stack = Vec::new();
    let mut boxes = Vec::new();

    for start in 0..fg.len() {
        if !fg[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);

        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut external = false;

        while let Some(i) = stack.pop() {
            let (x, y) = (i % w, i / w);
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            if !external {
                external = x == 0
                    || y == 0
                    || x == w - 1
                    || y == h - 1
                    || outside[i - 1]
                    || outside[i + 1]
                    || outside[i - w]
                    || outside[i + w];
            }

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let j = ny * w + nx;
                    if fg[j] && !seen[j] {
                        seen[j] = true;
                        stack.push(j);
                    }
                }
            }
        }

        if external {
            boxes.push(BoundingBox::from_extents(
                min_x as u32,
                min_y as u32,
                max_x as u32,
                max_y as u32,
            ));
        }
    }
    boxes
}

/// Background pixels 4-connected to the image border.
fn outer_background(fg: &[bool], w: usize, h: usize) -> Vec<bool> {
    let mut outside = vec![false; fg.len()];
    let mut stack = Vec::new();

    let border = (0..w)
        .flat_map(|x| [x, (h - 1) * w + x])
        .chain((0..h).flat_map(|y| [y * w, y * w + w - 1]));
    for i in border {
        if !fg[i] && !outside[i] {
            outside[i] = true;
            stack.push(i);
        }
    }

    while let Some(i) = stack.pop() {
        let (x, y) = (i % w, i / w);
        let mut visit = |j: usize| {
            if !fg[j] && !outside[j] {
                outside[j] = true;
                stack.push(j);
            }
        };
        if x > 0 {
            visit(i - 1);
        }
        if x + 1 < w {
            visit(i + 1);
        }
        if y > 0 {
            visit(i - w);
        }
        if y + 1 < h {
            visit(i + w);
        }
    }
    outside
}

use edgewatch_common::config::RegionConfig;
use edgewatch_common::frame::BoundingBox;

/// Predicate over candidate region boxes.
///
/// Implementations decide whether a detected box is worth reporting.
pub trait BoxFilter: Send + Sync {
    /// Returns `true` to keep the box.
    fn accept(&self, bbox: &BoundingBox) -> bool;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Inclusive minimum width and height.
pub struct MinSize {
    pub min_width: u32,
    pub min_height: u32,
}

impl BoxFilter for MinSize {
    fn accept(&self, bbox: &BoundingBox) -> bool {
        bbox.width >= self.min_width && bbox.height >= self.min_height
    }

    fn name(&self) -> &str {
        "min-size"
    }
}

/// width / height must fall inside `[low, high]`.
pub struct AspectBand {
    pub low: f64,
    pub high: f64,
}

impl BoxFilter for AspectBand {
    fn accept(&self, bbox: &BoundingBox) -> bool {
        let ratio = bbox.aspect_ratio();
        ratio >= self.low && ratio <= self.high
    }

    fn name(&self) -> &str {
        "aspect-band"
    }
}

pub fn filters_from_config(config: &RegionConfig) -> Vec<Box<dyn BoxFilter>> {
    vec![
        Box::new(MinSize {
            min_width: config.min_width,
            min_height: config.min_height,
        }),
        Box::new(AspectBand {
            low: config.aspect_min,
            high: config.aspect_max,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_size_is_inclusive() {
        let filter = MinSize {
            min_width: 10,
            min_height: 10,
        };
        assert!(filter.accept(&BoundingBox::new(0, 0, 10, 10)));
        assert!(!filter.accept(&BoundingBox::new(0, 0, 9, 40)));
        assert!(!filter.accept(&BoundingBox::new(0, 0, 40, 9)));
    }

    #[test]
    fn aspect_band_bounds() {
        let filter = AspectBand {
            low: 0.1,
            high: 10.0,
        };
        assert!(filter.accept(&BoundingBox::new(0, 0, 100, 10)));
        assert!(!filter.accept(&BoundingBox::new(0, 0, 101, 10)));
        assert!(filter.accept(&BoundingBox::new(0, 0, 10, 100)));
        assert!(!filter.accept(&BoundingBox::new(0, 0, 10, 0)));
    }

    #[test]
    fn defaults_build_both_filters() {
        let filters = filters_from_config(&RegionConfig::default());
        let names: Vec<&str> = filters.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["min-size", "aspect-band"]);
    }
}

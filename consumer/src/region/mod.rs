//! Candidate text/object regions of a frame.
//!
//! Two detection strategies share one tail: find outermost connected
//! components, box them, filter by size and aspect ratio, de-duplicate, and
//! order top-to-bottom then left-to-right.

pub mod contours;
pub mod filter;
pub mod threshold;

use edgewatch_common::config::{DetectionMode, EdgeConfig, RegionConfig};
use edgewatch_common::frame::{BoundingBox, Frame};
use image::GrayImage;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::edge::EdgeExtractor;
use filter::{filters_from_config, BoxFilter};

/// A detected region, optionally carrying recognised text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Component {
    pub fn new(bbox: BoundingBox) -> Self {
        Self { bbox, text: None }
    }
}

pub struct RegionExtractor {
    mode: DetectionMode,
    block_size: u32,
    c: i32,
    dilate: (u32, u32),
    invert_pass: bool,
    edges: EdgeExtractor,
    filters: Vec<Box<dyn BoxFilter>>,
}

impl RegionExtractor {
    pub fn new(region: &RegionConfig, edge: &EdgeConfig) -> Self {
        Self {
            mode: region.mode,
            block_size: region.adaptive_block_size,
            c: region.adaptive_c,
            dilate: (region.dilate_width, region.dilate_height),
            invert_pass: region.invert_pass,
            edges: EdgeExtractor::new(edge),
            filters: filters_from_config(region),
        }
    }

    /// Replace the default size and aspect filters.
    pub fn with_filters(mut self, filters: Vec<Box<dyn BoxFilter>>) -> Self {
        self.filters = filters;
        self
    }

    /// Ordered, de-duplicated components of `frame`. Text is left unset.
    pub fn extract(&self, frame: &Frame) -> Vec<Component> {
        let gray = frame.to_luma();
        let mut passes = vec![self.detect(&gray)];
        if self.invert_pass {
            let mut inverted = gray.into_owned();
            image::imageops::invert(&mut inverted);
            passes.push(self.detect(&inverted));
        }

        dedup_and_order(passes)
            .into_iter()
            .map(Component::new)
            .collect()
    }

    /// One polarity: detection, outermost boxes, filters.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let mask = match self.mode {
            DetectionMode::Threshold => {
                let binary = threshold::adaptive_threshold_inv(gray, self.block_size, self.c);
                threshold::dilate_rect(&binary, self.dilate.0, self.dilate.1)
            }
            DetectionMode::Edge => self.edges.edges(gray),
        };

        contours::external_boxes(&mask)
            .into_iter()
            .filter(|bbox| match self.filters.iter().find(|f| !f.accept(bbox)) {
                Some(rejected_by) => {
                    debug!(?bbox, filter = rejected_by.name(), "region rejected");
                    false
                }
                None => true,
            })
            .collect()
    }
}

/// Merge detection passes: identical boxes are reported once, and the
/// result is sorted by top edge, then left edge.
pub fn dedup_and_order<I>(passes: I) -> Vec<BoundingBox>
where
    I: IntoIterator<Item = Vec<BoundingBox>>,
{
    let mut seen = HashSet::new();
    let mut boxes: Vec<BoundingBox> = passes
        .into_iter()
        .flatten()
        .filter(|bbox| seen.insert(bbox.key()))
        .collect();
    boxes.sort_by_key(|b| (b.y, b.x));
    boxes
}

//! Analysis side of the pipeline: edge maps, change scoring, region
//! extraction and the loop that drives them.

pub mod change;
pub mod edge;
pub mod pipeline;
pub mod recognition;
pub mod region;
pub mod render;
pub mod view;

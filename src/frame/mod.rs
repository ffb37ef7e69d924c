//! Conditioning image preparation and audio-to-region routing.

mod composite;
mod routing;

pub use composite::{BBox, CompositeFrame, CompositeFramePreparer};
pub use routing::{AudioRoutingPolicy, BboxOverlapRouting};

pub mod v4l2;

pub use v4l2::V4l2Camera;

use crate::common::Result;
use image::DynamicImage;

/// A source of camera frames, pulled one at a time by the recognition loop.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<DynamicImage>;
}

use crate::camera::FrameSource;
use crate::common::{Config, FaceLockError, Result, StartupFailure};
use image::{DynamicImage, ImageBuffer, Luma};
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const STREAM_BUFFERS: u32 = 4;

/// Continuous capture from a V4L2 device. The stream stays open for the
/// lifetime of the camera.
pub struct V4l2Camera {
    stream: Stream<'static>,
    format: v4l::Format,
    index: u32,
    _device: Device,
}

impl V4l2Camera {
    pub fn open(config: &Config) -> std::result::Result<Self, StartupFailure> {
        let index = config.camera.device_index;
        let camera_err = |what: &str, e: std::io::Error| {
            StartupFailure::Camera(format!("{} on /dev/video{}: {}", what, index, e))
        };

        let device = Device::new(index as usize).map_err(|e| camera_err("failed to open", e))?;
        let caps = device
            .query_caps()
            .map_err(|e| camera_err("failed to query capabilities", e))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} ({}) may not support video capture", index, caps.card);
        }

        let mut fmt = device
            .format()
            .map_err(|e| camera_err("failed to get format", e))?;
        fmt.width = config.camera.width;
        fmt.height = config.camera.height;

        // IR sensors stay on GREY, everything else is asked for MJPG
        if fmt.fourcc != FourCC::new(b"GREY") {
            fmt.fourcc = FourCC::new(b"MJPG");
        }
        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set {}x{} {}: {}", fmt.width, fmt.height, fmt.fourcc, e);
        }

        let format = device
            .format()
            .map_err(|e| camera_err("failed to read back format", e))?;
        if format.width != config.camera.width || format.height != config.camera.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                format.width, format.height, config.camera.width, config.camera.height
            );
        }

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| camera_err("failed to start stream", e))?;

        for i in 0..config.camera.warmup_frames {
            stream
                .next()
                .map_err(|e| camera_err(&format!("warmup frame {} failed", i), e))?;
            std::thread::sleep(Duration::from_millis(config.camera.warmup_delay_ms));
        }

        tracing::info!(
            "Camera /dev/video{} ({}) streaming {}x{} {}",
            index, caps.card, format.width, format.height, format.fourcc
        );
        Ok(Self {
            stream,
            format,
            index,
            _device: device,
        })
    }

    pub fn device_index(&self) -> u32 {
        self.index
    }
}

impl FrameSource for V4l2Camera {
    fn next_frame(&mut self) -> Result<DynamicImage> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| FaceLockError::Camera(format!("capture failed: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        decode_frame(self.format.fourcc, data, self.format.width, self.format.height)
    }
}

pub(crate) fn decode_frame(fourcc: FourCC, data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    match &fourcc.repr {
        b"GREY" => grey_to_image(data, width, height),
        b"YUYV" => {
            // luma is every other byte
            let luma: Vec<u8> = data.iter().step_by(2).copied().collect();
            grey_to_image(&luma, width, height)
        }
        b"MJPG" => Ok(image::load_from_memory(data)?),
        other => Err(FaceLockError::Camera(format!(
            "unsupported pixel format {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn grey_to_image(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let needed = (width * height) as usize;
    if data.len() < needed {
        return Err(FaceLockError::Camera(format!(
            "short frame: {} bytes for {}x{}", data.len(), width, height
        )));
    }
    let img_buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data[..needed].to_vec())
        .ok_or_else(|| FaceLockError::Camera("failed to create grayscale image buffer".into()))?;

    Ok(DynamicImage::ImageLuma8(img_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_grey_and_yuyv() {
        let grey = decode_frame(FourCC::new(b"GREY"), &[7u8; 12], 4, 3).unwrap();
        assert_eq!((grey.width(), grey.height()), (4, 3));

        let yuyv: Vec<u8> = (0..24).map(|i| if i % 2 == 0 { 200 } else { 128 }).collect();
        let frame = decode_frame(FourCC::new(b"YUYV"), &yuyv, 4, 3).unwrap();
        assert!(frame.to_luma8().pixels().all(|p| p[0] == 200));
    }

    #[test]
    fn short_or_unknown_frames_are_camera_errors() {
        assert!(matches!(
            decode_frame(FourCC::new(b"GREY"), &[0u8; 5], 4, 3),
            Err(FaceLockError::Camera(_))
        ));
        assert!(matches!(
            decode_frame(FourCC::new(b"RGB3"), &[0u8; 36], 4, 3),
            Err(FaceLockError::Camera(_))
        ));
    }
}

//! Local V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{SourceError, VideoSource};
use image::RgbImage;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 1280;
const REQUESTED_HEIGHT: u32 = 720;
const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB per frame.
    Yuyv,
    /// 24-bit packed RGB, used as-is.
    Rgb3,
}

/// An open V4L2 capture stream.
///
/// Field order matters: the mmap stream is dropped (STREAMOFF, unmap)
/// before the device handle is closed.
pub struct V4l2Source {
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    sequence: u64,
}

impl V4l2Source {
    pub fn open(device_path: &str) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::Unavailable(format!("device not found: {device_path}")));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| SourceError::Unavailable(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::Unavailable(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::Unavailable(format!(
                "{device_path} is not a capture device"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::Unavailable(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::Unavailable(format!("set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb3
        } else {
            return Err(SourceError::Unavailable(format!(
                "unsupported pixel format {:?} (need YUYV or RGB3)",
                negotiated.fourcc
            )));
        };

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| SourceError::Unavailable(format!("mmap stream: {e}")))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "V4L2 camera opened"
        );

        Ok(Self {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            sequence: 0,
        })
    }

    fn to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, SourceError> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| SourceError::ReadFailed(format!("YUYV conversion: {e}"))),
            PixelFormat::Rgb3 => {
                let expected = (self.width * self.height * 3) as usize;
                buf.get(..expected).map(<[u8]>::to_vec).ok_or_else(|| {
                    SourceError::ReadFailed(format!(
                        "RGB3 buffer too short: expected {expected}, got {}",
                        buf.len()
                    ))
                })
            }
        }
    }
}

impl VideoSource for V4l2Source {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| SourceError::ReadFailed(format!("dequeue buffer: {e}")))?;
        let data = buf.to_vec();

        let rgb = self.to_rgb(&data)?;
        let image = RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| SourceError::ReadFailed("frame buffer size mismatch".into()))?;
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }
}

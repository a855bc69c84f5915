//! presence-hw: Video source abstraction for the stream workers.
//!
//! Network cameras and files are decoded through an `ffmpeg` child process;
//! local cameras are read directly over V4L2.

pub mod camera;
pub mod ffmpeg;
pub mod frame;
pub mod source;

pub use camera::V4l2Source;
pub use ffmpeg::{FfmpegOptions, FfmpegSource};
pub use frame::{Frame, FrameError};
pub use source::{redact_uri, SourceError, SourceKind, SourceOpener, UriOpener, VideoSource};

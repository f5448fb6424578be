//! External collaborators: mirror sources, extraction, transcoding, delivery.

pub mod error;
pub mod ffmpeg;
pub mod http;
pub mod traits;

pub use error::ExternalError;
pub use ffmpeg::{FfmpegConfig, FfmpegTranscoder};
pub use http::{HttpDeliveryChannel, HttpExtractor, HttpMirrorSource};
pub use traits::{
    ConvertedAsset, DeliveryChannel, Extractor, MirrorSource, RawStream, SubtitleTrack, Transcoder,
};

//! Media backends and RTP/RTCP packet handling.
//!
//! The relay never decodes media. Three pluggable backends sit at its
//! boundary:
//!
//! - [`SourceResolver`]: maps a request URI to a [`ContentSource`].
//! - [`Describer`]: probes a source and produces its SDP plus per-track
//!   metadata ([`MediaDescription`]).
//! - [`Producer`]: starts a process that emits RTP (and RTCP) for one track
//!   to a loopback port ([`ProduceJob`]).
//!
//! The default implementations shell out to ffmpeg/ffprobe ([`ffmpeg`]) and
//! resolve paths under a media directory ([`source`]).
//!
//! ## Packet handling
//!
//! | Module | RFC | Purpose |
//! |--------|-----|---------|
//! | [`rtp`] | [RFC 3550 §5.1](https://tools.ietf.org/html/rfc3550#section-5.1) | Header fields, timestamp rewriting |
//! | [`rtcp`] | [RFC 3550 §6.4.1](https://tools.ietf.org/html/rfc3550#section-6.4.1) | Sender-report timestamp |

pub mod ffmpeg;
pub mod rtcp;
pub mod rtp;
pub mod source;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::RtspRequest;

/// Payload type announced for video tracks.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
/// Payload type announced for audio tracks.
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

/// A resolved piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSource {
    /// Path or URL handed to the producer.
    pub path: String,
    /// Temporary/live content: no seeking, no pausing, no duration.
    pub live: bool,
}

impl ContentSource {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            live: false,
        }
    }

    pub fn live(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            live: true,
        }
    }
}

/// Maps DESCRIBE requests to content.
pub trait SourceResolver: Send + Sync {
    /// `None` answers the DESCRIBE with 404.
    fn resolve(&self, request: &RtspRequest) -> Option<ContentSource>;
}

/// Input to a [`Describer`].
#[derive(Debug, Clone)]
pub struct DescribeRequest<'a> {
    pub source: &'a ContentSource,
    /// Address placed in the SDP connection lines.
    pub target: &'a str,
    /// Scratch port leased for the duration of the call.
    pub port: u16,
    pub live: bool,
    pub compat: bool,
}

/// Session description and per-track metadata.
///
/// Tracks are numbered video first: `0..video_tracks` are video,
/// `video_tracks..video_tracks + audio_tracks` are audio. `ssrcs` and
/// `clock_rates` are indexed by that track number.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub sdp: String,
    pub video_tracks: usize,
    pub audio_tracks: usize,
    pub ssrcs: Vec<u32>,
    pub clock_rates: Vec<u32>,
    pub duration: Option<f64>,
}

/// Produces session descriptions.
pub trait Describer: Send + Sync {
    fn describe(&self, request: &DescribeRequest<'_>) -> Result<MediaDescription>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Which elementary stream of the source a track carries. The stream is
/// passed through without transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSelector {
    pub kind: MediaKind,
    /// Index among streams of the same kind.
    pub index: usize,
    pub payload_type: u8,
}

impl MediaSelector {
    /// Selector for a track number given the source's video track count.
    pub fn for_track(track_id: u32, video_tracks: usize) -> Self {
        let track = track_id as usize;
        if track < video_tracks {
            Self {
                kind: MediaKind::Video,
                index: track,
                payload_type: VIDEO_PAYLOAD_TYPE,
            }
        } else {
            Self {
                kind: MediaKind::Audio,
                index: track - video_tracks,
                payload_type: AUDIO_PAYLOAD_TYPE,
            }
        }
    }
}

/// Everything a producer needs to emit one track.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceJob {
    pub content: String,
    pub ssrc: u32,
    pub first_seq: u16,
    /// Seek position in seconds.
    pub start: f64,
    pub end: Option<f64>,
    pub looping: bool,
    pub selector: MediaSelector,
    /// Loopback address the relay listens on (RTCP at port + 1).
    pub destination: SocketAddr,
    /// Source port the producer sends from.
    pub local_port: u16,
}

/// Starts media producers.
pub trait Producer: Send + Sync {
    fn spawn(&self, job: &ProduceJob) -> Result<Box<dyn ProducerHandle>>;
}

/// A running producer.
pub trait ProducerHandle: Send {
    /// Ask the producer to exit, waiting at most `grace` before forcing it.
    fn stop(&mut self, grace: Duration);
}

/// The set of backends a server uses.
#[derive(Clone)]
pub struct MediaBackends {
    pub resolver: Arc<dyn SourceResolver>,
    pub describer: Arc<dyn Describer>,
    pub producer: Arc<dyn Producer>,
}

impl MediaBackends {
    /// Files under `media_root`, probed and streamed with ffmpeg.
    pub fn ffmpeg(config: &ServerConfig) -> Self {
        Self {
            resolver: Arc::new(source::FileSourceResolver::new(&config.media_root)),
            describer: Arc::new(ffmpeg::FfmpegDescriber::new(
                &config.ffmpeg_path,
                &config.ffprobe_path,
            )),
            producer: Arc::new(ffmpeg::FfmpegProducer::new(&config.ffmpeg_path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_splits_video_then_audio() {
        let v = MediaSelector::for_track(1, 2);
        assert_eq!(v.kind, MediaKind::Video);
        assert_eq!(v.index, 1);
        assert_eq!(v.payload_type, 96);

        let a = MediaSelector::for_track(3, 2);
        assert_eq!(a.kind, MediaKind::Audio);
        assert_eq!(a.index, 1);
        assert_eq!(a.payload_type, 97);
    }

    #[test]
    fn audio_only_source() {
        let a = MediaSelector::for_track(0, 0);
        assert_eq!(a.kind, MediaKind::Audio);
        assert_eq!(a.index, 0);
    }
}

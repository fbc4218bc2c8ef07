//! ffmpeg/ffprobe backends.
//!
//! [`FfmpegDescriber`] probes a source with ffprobe, then runs a short RTP
//! mux per track to obtain each media section. [`FfmpegProducer`] runs one
//! `ffmpeg -f rtp` process per track, copying the selected stream without
//! transcoding.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{
    AUDIO_PAYLOAD_TYPE, DescribeRequest, Describer, MediaDescription, MediaKind, MediaSelector,
    ProduceJob, Producer, ProducerHandle,
};
use crate::error::{Result, RtspError};
use crate::protocol::sdp;

/// Clock rate announced for video when the muxer omits one.
const VIDEO_CLOCK_RATE: u32 = 90_000;

const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default, Deserialize)]
struct Probe {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl Probe {
    fn parse(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).map_err(|e| RtspError::Describe(format!("ffprobe output: {e}")))
    }

    fn of_kind(&self, kind: &str) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(move |s| s.codec_type == kind)
    }

    fn duration(&self) -> Option<f64> {
        self.format.duration.as_deref()?.trim().parse().ok()
    }
}

/// Describes sources by shelling out to ffprobe and ffmpeg.
pub struct FfmpegDescriber {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegDescriber {
    pub fn new(ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
        }
    }

    fn probe(&self, path: &str) -> Result<Probe> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries"])
            .arg("stream=codec_type,codec_name,sample_rate,channels:format=duration")
            .args(["-of", "json", path])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RtspError::Describe(format!(
                "ffprobe exited with {} for {path}",
                output.status
            )));
        }
        Probe::parse(&output.stdout)
    }

    /// One-second RTP mux of a single stream; ffmpeg prints its SDP on stdout.
    fn mux_sdp(&self, path: &str, selector: MediaSelector, port: u16) -> Result<String> {
        let output = Command::new(&self.ffmpeg)
            .args(["-loglevel", "error", "-re", "-t", "1", "-i", path])
            .args(selector_args(selector))
            .args(["-f", "rtp"])
            .arg(format!("rtp://127.0.0.1:{port}"))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RtspError::Describe(format!(
                "ffmpeg exited with {} muxing {:?} stream {} of {path}",
                output.status, selector.kind, selector.index
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Describer for FfmpegDescriber {
    fn describe(&self, request: &DescribeRequest<'_>) -> Result<MediaDescription> {
        let path = request.source.path.as_str();
        let probe = self.probe(path)?;

        let audio: Vec<&ProbeStream> = probe.of_kind("audio").collect();
        let mut video_tracks = probe.of_kind("video").count();
        let mut audio_tracks = audio.len();
        if request.compat {
            video_tracks = video_tracks.min(1);
            audio_tracks = audio_tracks.min(1);
        }

        let total = video_tracks + audio_tracks;
        let mut sections = Vec::with_capacity(total);
        let mut ssrcs = Vec::with_capacity(total);
        let mut clock_rates = Vec::with_capacity(total);

        for track_id in 0..total {
            let selector = MediaSelector::for_track(track_id as u32, video_tracks);
            let raw = self.mux_sdp(path, selector, request.port)?;

            let mut extra = Vec::new();
            let clock_rate = match (rtpmap_clock_rate(&raw), selector.kind) {
                (Some(rate), _) => rate,
                (None, MediaKind::Video) => VIDEO_CLOCK_RATE,
                (None, MediaKind::Audio) => {
                    let stream = audio.get(selector.index).copied();
                    let (line, rate) = audio_rtpmap(stream);
                    extra.push(line);
                    rate
                }
            };

            let ssrc = rand::random_range(0..(1u32 << 31));
            sections.push(sdp::extract_media(&raw, track_id, ssrc, &extra));
            ssrcs.push(ssrc);
            clock_rates.push(clock_rate);
        }

        let duration = if request.live || request.compat {
            None
        } else {
            probe.duration()
        };

        tracing::debug!(
            path,
            video_tracks,
            audio_tracks,
            ?duration,
            "described source"
        );

        Ok(MediaDescription {
            sdp: sdp::generate_sdp(request.target, duration, &sections),
            video_tracks,
            audio_tracks,
            ssrcs,
            clock_rates,
            duration,
        })
    }
}

/// Clock rate from the first `a=rtpmap:<pt> <codec>/<rate>[/<channels>]` line.
fn rtpmap_clock_rate(sdp: &str) -> Option<u32> {
    let line = sdp.lines().map(str::trim).find(|l| l.starts_with("a=rtpmap:"))?;
    let encoding = line.split_whitespace().nth(1)?;
    encoding.split('/').nth(1)?.parse().ok()
}

/// `a=rtpmap` line for audio the RTP muxer leaves unmapped, and its clock rate.
fn audio_rtpmap(stream: Option<&ProbeStream>) -> (String, u32) {
    let (codec, rate, channels) = match stream {
        Some(s) => (
            s.codec_name.as_str(),
            s.sample_rate
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or(8000),
            s.channels.unwrap_or(1),
        ),
        None => ("", 8000, 1),
    };
    let encoding = match codec {
        "mp3" => "MPA".to_string(),
        "pcm_mulaw" => "PCMU".to_string(),
        other => other.to_uppercase(),
    };
    (
        format!("a=rtpmap:{AUDIO_PAYLOAD_TYPE} {encoding}/{rate}/{channels}"),
        rate,
    )
}

/// ffmpeg options selecting one stream for passthrough.
fn selector_args(selector: MediaSelector) -> Vec<String> {
    let (drop, spec, codec) = match selector.kind {
        MediaKind::Video => ("-an", "v", "-c:v"),
        MediaKind::Audio => ("-vn", "a", "-c:a"),
    };
    vec![
        drop.to_string(),
        "-map".to_string(),
        format!("0:{spec}:{}", selector.index),
        codec.to_string(),
        "copy".to_string(),
        "-payload_type".to_string(),
        selector.payload_type.to_string(),
    ]
}

/// Full argument list for a producer process.
fn producer_args(job: &ProduceJob) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{:.3}", job.start),
    ];
    if let Some(end) = job.end {
        args.push("-to".into());
        args.push(format!("{end:.3}"));
    }
    if job.looping {
        args.push("-stream_loop".into());
        args.push("-1".into());
    }
    args.push("-re".into());
    args.push("-i".into());
    args.push(job.content.clone());
    args.push("-ssrc".into());
    args.push(job.ssrc.to_string());
    args.push("-seq".into());
    args.push(job.first_seq.to_string());
    args.extend(selector_args(job.selector));
    args.push("-f".into());
    args.push("rtp".into());
    // RTCP goes to destination port + 1.
    args.push(format!(
        "rtp://{}/?localport={}",
        job.destination, job.local_port
    ));
    args
}

/// Starts one ffmpeg RTP muxer per track.
pub struct FfmpegProducer {
    ffmpeg: String,
}

impl FfmpegProducer {
    pub fn new(ffmpeg: &str) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
        }
    }
}

impl Producer for FfmpegProducer {
    fn spawn(&self, job: &ProduceJob) -> Result<Box<dyn ProducerHandle>> {
        let child = Command::new(&self.ffmpeg)
            .args(producer_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| RtspError::Producer(format!("{}: {e}", self.ffmpeg)))?;
        tracing::debug!(pid = child.id(), ssrc = job.ssrc, destination = %job.destination, "producer started");
        Ok(Box::new(ChildHandle { child }))
    }
}

/// A producer subprocess.
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    fn exited_within(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() >= deadline => return false,
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(_) => return false,
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
            tracing::trace!(pid = self.child.id(), error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&self) {}
}

impl ProducerHandle for ChildHandle {
    fn stop(&mut self, grace: Duration) {
        let pid = self.child.id();
        self.request_exit();
        if self.exited_within(grace) {
            tracing::trace!(pid, "producer exited");
            return;
        }
        tracing::warn!(pid, "producer ignored termination, killing");
        if let Err(e) = self.child.kill() {
            tracing::warn!(pid, error = %e, "failed to kill producer");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const PROBE: &str = r#"{
        "programs": [],
        "streams": [
            { "codec_name": "h264", "codec_type": "video" },
            { "codec_name": "aac", "codec_type": "audio", "sample_rate": "48000", "channels": 2 },
            { "codec_name": "mp3", "codec_type": "audio", "sample_rate": "44100", "channels": 1 }
        ],
        "format": { "duration": "62.500000" }
    }"#;

    #[test]
    fn probe_counts_streams_and_duration() {
        let probe = Probe::parse(PROBE.as_bytes()).unwrap();
        assert_eq!(probe.of_kind("video").count(), 1);
        assert_eq!(probe.of_kind("audio").count(), 2);
        assert_eq!(probe.duration(), Some(62.5));
    }

    #[test]
    fn probe_without_format_has_no_duration() {
        let probe = Probe::parse(br#"{"streams": []}"#).unwrap();
        assert_eq!(probe.duration(), None);
    }

    #[test]
    fn bad_probe_output_is_describe_error() {
        assert!(matches!(
            Probe::parse(b"not json"),
            Err(RtspError::Describe(_))
        ));
    }

    #[test]
    fn clock_rate_from_rtpmap() {
        let sdp = "m=audio 0 RTP/AVP 97\na=rtpmap:97 MPEG4-GENERIC/48000/2\n";
        assert_eq!(rtpmap_clock_rate(sdp), Some(48000));
        assert_eq!(rtpmap_clock_rate("m=audio 0 RTP/AVP 14\n"), None);
    }

    #[test]
    fn audio_rtpmap_fallbacks() {
        let probe = Probe::parse(PROBE.as_bytes()).unwrap();
        let mp3 = probe.of_kind("audio").nth(1);
        assert_eq!(
            audio_rtpmap(mp3),
            ("a=rtpmap:97 MPA/44100/1".to_string(), 44100)
        );
        let aac = probe.of_kind("audio").next();
        assert_eq!(
            audio_rtpmap(aac),
            ("a=rtpmap:97 AAC/48000/2".to_string(), 48000)
        );
    }

    #[test]
    fn producer_command_line() {
        let job = ProduceJob {
            content: "media/clip.mp4".into(),
            ssrc: 1234,
            first_seq: 100,
            start: 30.0,
            end: Some(45.5),
            looping: true,
            selector: MediaSelector::for_track(1, 1),
            destination: SocketAddr::from(([127, 0, 0, 1], 20000)),
            local_port: 20002,
        };
        let args = producer_args(&job);
        let joined = args.join(" ");
        assert!(joined.starts_with("-loglevel error -ss 30.000 -to 45.500 -stream_loop -1 -re"));
        assert!(joined.contains("-i media/clip.mp4 -ssrc 1234 -seq 100"));
        assert!(joined.contains("-vn -map 0:a:0 -c:a copy -payload_type 97"));
        assert!(joined.ends_with("-f rtp rtp://127.0.0.1:20000/?localport=20002"));
    }

    #[test]
    fn producer_command_line_without_end_or_loop() {
        let job = ProduceJob {
            content: "clip.ts".into(),
            ssrc: 1,
            first_seq: 1,
            start: 0.0,
            end: None,
            looping: false,
            selector: MediaSelector::for_track(0, 1),
            destination: SocketAddr::from(([127, 0, 0, 1], 20000)),
            local_port: 20002,
        };
        let args = producer_args(&job);
        assert!(!args.iter().any(|a| a == "-to" || a == "-stream_loop"));
        assert!(args.join(" ").contains("-an -map 0:v:0 -c:v copy -payload_type 96"));
    }
}

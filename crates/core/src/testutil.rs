//! Fakes shared by unit tests.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::Result;
use crate::media::source::content_path;
use crate::media::{
    ContentSource, DescribeRequest, Describer, MediaBackends, MediaDescription, ProduceJob,
    Producer, ProducerHandle, SourceResolver,
};
use crate::ports::PortRange;
use crate::protocol::{RtspRequest, sdp};

/// Writer whose contents can be inspected while it is shared.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Resolves any non-empty path; paths starting with `live` are live.
pub struct FakeResolver;

impl SourceResolver for FakeResolver {
    fn resolve(&self, request: &RtspRequest) -> Option<ContentSource> {
        let path = content_path(&request.uri);
        if path.is_empty() || path.starts_with("missing") {
            return None;
        }
        Some(ContentSource {
            path: path.to_string(),
            live: path.starts_with("live"),
        })
    }
}

/// One H.264 video track and one 8 kHz audio track, 120 s long.
#[derive(Default)]
pub struct FakeDescriber {
    calls: AtomicUsize,
}

impl Describer for FakeDescriber {
    fn describe(&self, request: &DescribeRequest<'_>) -> Result<MediaDescription> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
        let ssrcs = vec![1000 + call * 10, 1001 + call * 10];
        let video = sdp::extract_media(
            "m=video 9 RTP/AVP 96\na=rtpmap:96 H264/90000\n",
            0,
            ssrcs[0],
            &[],
        );
        let audio = sdp::extract_media(
            "m=audio 9 RTP/AVP 97\na=rtpmap:97 PCMU/8000/1\n",
            1,
            ssrcs[1],
            &[],
        );
        let duration = (!request.live && !request.compat).then_some(120.0);
        Ok(MediaDescription {
            sdp: sdp::generate_sdp(request.target, duration, &[video, audio]),
            video_tracks: 1,
            audio_tracks: 1,
            ssrcs,
            clock_rates: vec![90_000, 8_000],
            duration,
        })
    }
}

/// Records jobs instead of starting processes.
#[derive(Default)]
pub struct FakeProducer {
    jobs: Mutex<Vec<ProduceJob>>,
    stops: Arc<StopLog>,
}

#[derive(Default)]
struct StopLog {
    count: AtomicUsize,
    watched: Mutex<Option<SharedBuf>>,
    seen: Mutex<Vec<String>>,
}

impl FakeProducer {
    pub fn jobs(&self) -> Vec<ProduceJob> {
        self.jobs.lock().clone()
    }

    pub fn last_job(&self) -> Option<ProduceJob> {
        self.jobs.lock().last().cloned()
    }

    pub fn stopped(&self) -> usize {
        self.stops.count.load(Ordering::SeqCst)
    }

    /// Snapshot `buf` every time a producer is stopped.
    pub fn watch_on_stop(&self, buf: SharedBuf) {
        *self.stops.watched.lock() = Some(buf);
    }

    /// Contents of the watched buffer at each stop.
    pub fn seen_at_stop(&self) -> Vec<String> {
        self.stops.seen.lock().clone()
    }
}

struct FakeHandle(Arc<StopLog>);

impl ProducerHandle for FakeHandle {
    fn stop(&mut self, _grace: Duration) {
        self.0.count.fetch_add(1, Ordering::SeqCst);
        if let Some(buf) = self.0.watched.lock().as_ref() {
            self.0.seen.lock().push(buf.text());
        }
    }
}

impl Producer for FakeProducer {
    fn spawn(&self, job: &ProduceJob) -> Result<Box<dyn ProducerHandle>> {
        self.jobs.lock().push(job.clone());
        Ok(Box::new(FakeHandle(self.stops.clone())))
    }
}

static NEXT_BASE: AtomicU16 = AtomicU16::new(0);

/// Context with fake backends and port ranges no other test uses.
pub fn context(configure: impl FnOnce(&mut ServerConfig)) -> (Arc<ServerContext>, Arc<FakeProducer>) {
    let base = 45_000 + NEXT_BASE.fetch_add(1, Ordering::SeqCst) * 30;
    let mut config = ServerConfig {
        relay_ports: PortRange::new(base, base + 10),
        unicast_ports: PortRange::new(base + 10, base + 20),
        describe_ports: PortRange::new(base + 20, base + 30),
        session_timeout_secs: 30,
        producer_stop_grace_ms: 10,
        relay_recv_timeout_ms: 20,
        ..ServerConfig::default()
    };
    configure(&mut config);
    let producer = Arc::new(FakeProducer::default());
    let media = MediaBackends {
        resolver: Arc::new(FakeResolver),
        describer: Arc::new(FakeDescriber::default()),
        producer: producer.clone(),
    };
    (ServerContext::new(config, media), producer)
}

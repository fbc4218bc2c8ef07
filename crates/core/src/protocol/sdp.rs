//! SDP (Session Description Protocol) assembly (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses. Per-track media
//! sections come from the prober; this module stitches them under one
//! session header:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- 0 0 IN IP4 <addr>                        ← origin
//! s=Stream                                     ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing
//! a=tool:rtsp-relay                            ← server software (§6)
//! a=control:*                                  ← aggregate control
//! a=range:npt=0-<duration>                     ← only for seekable sources
//! m=video 0 RTP/AVP 96                         ← media description
//! c=IN IP4 <addr>
//! a=control:trackID=0                          ← track control URL
//! a=ssrc:<ssrc> cname:rtsp-relay
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! ```

/// Canonical name advertised in `a=ssrc` lines.
pub const CNAME: &str = "rtsp-relay";

/// Extract the media section of a single-stream SDP (as printed by an RTP
/// muxer) and label it as track `track_id`.
///
/// The `m=` port is replaced with 0 (the transport is negotiated in SETUP),
/// `extra` lines are inserted right after `m=`, and session-level lines are
/// dropped. `a=tool` lines never survive.
pub fn extract_media(raw: &str, track_id: usize, ssrc: u32, extra: &[String]) -> Vec<String> {
    let mut media = Vec::new();
    let mut in_media = false;

    for line in raw.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("m=") {
            in_media = true;
            let mut fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() >= 2 {
                fields[1] = "0";
            }
            media.push(format!("m={}", fields.join(" ")));
            media.extend(extra.iter().cloned());
            media.push("c=IN IP4 0.0.0.0".to_string());
            media.push(format!("a=control:trackID={}", track_id));
            media.push(format!("a=ssrc:{} cname:{}", ssrc, CNAME));
        } else if in_media && line.starts_with("a=") && !line.starts_with("a=tool") {
            media.push(line.to_string());
        }
    }

    media
}

/// Generate the full session description.
///
/// `duration` is announced as an `a=range` only when present; callers pass
/// `None` for live sources. Every connection line uses `ip`.
pub fn generate_sdp(ip: &str, duration: Option<f64>, media_sections: &[Vec<String>]) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 0 IN IP4 {}", ip));
    sdp.push("s=Stream".to_string());
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push(format!("a=tool:{}", CNAME));
    sdp.push("a=control:*".to_string());
    if let Some(duration) = duration {
        sdp.push(format!("a=range:npt=0-{:.3}", duration));
    }
    for section in media_sections {
        for line in section {
            if line.starts_with("c=") {
                sdp.push(format!("c=IN IP4 {}", ip));
            } else {
                sdp.push(line.clone());
            }
        }
    }

    tracing::trace!(sdp = %sdp.join("\r\n"), "generated SDP");

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFMPEG_VIDEO: &str = "SDP:\n\
        v=0\n\
        o=- 0 0 IN IP4 127.0.0.1\n\
        s=No Name\n\
        c=IN IP4 127.0.0.1\n\
        t=0 0\n\
        a=tool:libavformat 61.1.100\n\
        m=video 40000 RTP/AVP 96\n\
        b=AS:1200\n\
        a=rtpmap:96 H264/90000\n\
        a=fmtp:96 packetization-mode=1\n";

    #[test]
    fn extracts_and_labels_media() {
        let media = extract_media(FFMPEG_VIDEO, 0, 1234, &[]);
        assert_eq!(media[0], "m=video 0 RTP/AVP 96");
        assert!(media.contains(&"a=control:trackID=0".to_string()));
        assert!(media.contains(&"a=ssrc:1234 cname:rtsp-relay".to_string()));
        assert!(media.contains(&"a=rtpmap:96 H264/90000".to_string()));
        assert!(media.iter().all(|l| !l.starts_with("a=tool")));
        assert!(media.iter().all(|l| !l.starts_with("b=")));
    }

    #[test]
    fn extra_lines_follow_m_line() {
        let raw = "m=audio 40002 RTP/AVP 97\n";
        let media = extract_media(raw, 1, 7, &["a=rtpmap:97 MPA/44100/2".to_string()]);
        assert_eq!(media[1], "a=rtpmap:97 MPA/44100/2");
    }

    #[test]
    fn generates_session_with_range() {
        let video = extract_media(FFMPEG_VIDEO, 0, 1, &[]);
        let sdp = generate_sdp("192.168.1.100", Some(60.0), &[video]);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("o=- 0 0 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("a=control:*\r\n"));
        assert!(sdp.contains("a=range:npt=0-60.000\r\n"));
        assert!(!sdp.contains("127.0.0.1"));
        assert!(!sdp.contains("0.0.0.0"));

        let control_idx = sdp.find("a=control:*").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(control_idx < m_idx, "session-level attrs must precede m= line");
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn live_session_has_no_range() {
        let sdp = generate_sdp("10.0.0.1", None, &[]);
        assert!(!sdp.contains("a=range"));
    }
}

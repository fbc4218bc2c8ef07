/// Delivery mode requested in a SETUP `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// RTP/AVP/TCP;unicast;interleaved=0-1        → Interleaved
/// RTP/AVP;unicast;client_port=8000-8001      → Unicast
/// RTP/AVP;multicast                          → Multicast
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP and RTCP multiplexed onto the RTSP connection.
    Interleaved { channels: Option<(u8, u8)> },
    /// RTP/RTCP to the client's own UDP ports.
    Unicast { client_ports: Option<(u16, u16)> },
    /// RTP/RTCP to a shared multicast group.
    Multicast,
}

impl TransportSpec {
    /// Parse the `Transport` header value.
    ///
    /// Only the first transport of a comma-separated list is considered.
    /// Returns `None` for non-RTP profiles.
    ///
    /// ## Examples
    ///
    /// ```
    /// use rtsp_relay::protocol::TransportSpec;
    ///
    /// let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(spec, TransportSpec::Unicast { client_ports: Some((8000, 8001)) });
    ///
    /// let spec = TransportSpec::parse("RTP/AVP/TCP;interleaved=2-3").unwrap();
    /// assert_eq!(spec, TransportSpec::Interleaved { channels: Some((2, 3)) });
    ///
    /// assert!(TransportSpec::parse("RAW/RAW/UDP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let first = header.split(',').next()?.trim();
        let mut parts = first.split(';').map(str::trim);
        let profile = parts.next()?.to_ascii_uppercase();
        let params: Vec<&str> = parts.collect();

        if profile == "RTP/AVP/TCP" {
            let channels = params
                .iter()
                .find_map(|p| p.strip_prefix("interleaved="))
                .and_then(parse_pair::<u8>);
            return Some(TransportSpec::Interleaved { channels });
        }

        if profile != "RTP/AVP" && profile != "RTP/AVP/UDP" {
            return None;
        }

        if params.iter().any(|p| p.eq_ignore_ascii_case("multicast")) {
            return Some(TransportSpec::Multicast);
        }

        let client_ports = params
            .iter()
            .find_map(|p| p.strip_prefix("client_port="))
            .and_then(parse_pair::<u16>);
        Some(TransportSpec::Unicast { client_ports })
    }
}

/// Parse `a-b`, or a single `a` meaning `a-(a+1)`.
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unicast_with_ports() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP;unicast;client_port=5000-5001"),
            Some(TransportSpec::Unicast {
                client_ports: Some((5000, 5001))
            })
        );
    }

    #[test]
    fn parse_unicast_without_ports() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP;unicast"),
            Some(TransportSpec::Unicast { client_ports: None })
        );
    }

    #[test]
    fn parse_interleaved_default_channels() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP/TCP;unicast"),
            Some(TransportSpec::Interleaved { channels: None })
        );
    }

    #[test]
    fn parse_multicast_variants() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP;multicast;destination=239.0.0.1;port=3456-3457"),
            Some(TransportSpec::Multicast)
        );
        assert_eq!(
            TransportSpec::parse("RTP/AVP/UDP;multicast"),
            Some(TransportSpec::Multicast)
        );
    }

    #[test]
    fn first_alternative_wins() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP/TCP;interleaved=4-5,RTP/AVP;unicast;client_port=1-2"),
            Some(TransportSpec::Interleaved {
                channels: Some((4, 5))
            })
        );
    }

    #[test]
    fn single_port_implies_pair() {
        assert_eq!(
            TransportSpec::parse("RTP/AVP;unicast;client_port=6970"),
            Some(TransportSpec::Unicast {
                client_ports: Some((6970, 6971))
            })
        );
        assert_eq!(
            TransportSpec::parse("RTP/AVP/TCP;interleaved=255"),
            Some(TransportSpec::Interleaved { channels: None })
        );
    }
}

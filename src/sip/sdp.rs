//! Just enough SDP for one audio stream.
//!
//! The media plane lives outside this client, so offers advertise PCMU and
//! PCMA on the discard port and answers echo the first codec both sides
//! share. Listen-only calls (silent capture fallback) advertise a=recvonly.

use uuid::Uuid;

use super::SipError;

const PCMU: u8 = 0;
const PCMA: u8 = 8;

/// What the session needs to know about a peer's SDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInfo {
    /// Payload types on the audio m line, in offer order.
    pub payload_types: Vec<u8>,
}

impl AudioInfo {
    /// First payload type we also support.
    pub fn shared_codec(&self) -> Option<u8> {
        self.payload_types
            .iter()
            .copied()
            .find(|pt| *pt == PCMU || *pt == PCMA)
    }
}

/// Parses peer SDP far enough to confirm a usable audio section.
pub fn parse_audio(sdp: &str) -> Result<AudioInfo, SipError> {
    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("m=audio ") {
            let mut parts = rest.split_whitespace();
            let _port = parts.next();
            let _proto = parts.next();
            let payload_types: Vec<u8> = parts.filter_map(|p| p.parse().ok()).collect();
            if payload_types.is_empty() {
                return Err(SipError::Malformed("audio stream with no codecs".into()));
            }
            return Ok(AudioInfo { payload_types });
        }
    }
    Err(SipError::Malformed("no audio stream in SDP".into()))
}

/// SDP offer for a new outbound call.
pub fn offer(listen_only: bool) -> String {
    build(&[PCMU, PCMA], listen_only)
}

/// SDP answer echoing the first codec shared with `peer` (PCMU when the
/// offer carries nothing we know).
pub fn answer(peer: &AudioInfo, listen_only: bool) -> String {
    let codec = peer.shared_codec().unwrap_or(PCMU);
    build(&[codec], listen_only)
}

fn build(codecs: &[u8], listen_only: bool) -> String {
    let sess_id = session_id();
    let fmt_list = codecs
        .iter()
        .map(|pt| pt.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- {sess_id} {sess_id} IN IP4 0.0.0.0"),
        "s=softphone".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        "t=0 0".to_string(),
        format!("m=audio 9 RTP/AVP {fmt_list}"),
    ];
    for pt in codecs {
        lines.push(match *pt {
            PCMA => "a=rtpmap:8 PCMA/8000".to_string(),
            _ => "a=rtpmap:0 PCMU/8000".to_string(),
        });
    }
    lines.push("a=ptime:20".to_string());
    lines.push(if listen_only { "a=recvonly" } else { "a=sendrecv" }.to_string());
    lines.join("\r\n") + "\r\n"
}

fn session_id() -> u64 {
    // The o= line wants an integer; uniqueness is all that matters.
    (Uuid::new_v4().as_u128() & 0x7fff_ffff_ffff_ffff) as u64
}

use std::io::Cursor;

use webrtc::sdp::description::common::Attribute;
use webrtc::sdp::SessionDescription;

use super::engine::IceCandidate;
use crate::error::NegotiationError;

const CANDIDATE_TYPES: [&str; 4] = ["host", "srflx", "prflx", "relay"];

/// Checks `candidate:<foundation> <component> <transport> <priority>
/// <address> <port> typ <type> ...` and returns it in `candidate:` form.
/// A leading `a=` is accepted.
pub fn parse_candidate(
    line: &str,
    sdp_mid: Option<String>,
    sdp_mline_index: Option<u16>,
) -> Result<IceCandidate, NegotiationError> {
    let malformed = |why: &str| NegotiationError::MalformedCandidate(format!("{}: {}", why, line));

    let line = line.trim();
    let line = line.strip_prefix("a=").unwrap_or(line);
    let body = line
        .strip_prefix("candidate:")
        .ok_or_else(|| malformed("missing candidate: prefix"))?;

    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(malformed("too few fields"));
    }
    if fields[1].parse::<u16>().is_err() {
        return Err(malformed("bad component"));
    }
    if !matches!(fields[2].to_ascii_lowercase().as_str(), "udp" | "tcp") {
        return Err(malformed("bad transport"));
    }
    if fields[3].parse::<u32>().is_err() {
        return Err(malformed("bad priority"));
    }
    if fields[5].parse::<u16>().is_err() {
        return Err(malformed("bad port"));
    }
    if fields[6] != "typ" || !CANDIDATE_TYPES.contains(&fields[7]) {
        return Err(malformed("bad candidate type"));
    }

    Ok(IceCandidate {
        candidate: line.to_string(),
        sdp_mid,
        sdp_mline_index,
        username_fragment: None,
    })
}

/// Candidates from an `application/trickle-ice-sdpfrag` body.
pub fn parse_sdpfrag(body: &str) -> Result<Vec<IceCandidate>, NegotiationError> {
    let content = format!("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n{}", body);
    let mut reader = Cursor::new(content);
    let session = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| NegotiationError::MalformedCandidate(e.to_string()))?;

    let session_ufrag = ufrag(&session.attributes);
    let mut candidates = Vec::new();
    for (index, media) in session.media_descriptions.iter().enumerate() {
        let mid = media
            .attributes
            .iter()
            .filter(|attr| attr.key == "mid")
            .filter_map(|attr| attr.value.clone())
            .last();
        let ufrag = ufrag(&media.attributes).or_else(|| session_ufrag.clone());
        for attr in media.attributes.iter().filter(|a| a.is_ice_candidate()) {
            if let Some(value) = &attr.value {
                let mut candidate = parse_candidate(
                    &format!("candidate:{}", value),
                    mid.clone(),
                    u16::try_from(index).ok(),
                )?;
                candidate.username_fragment = ufrag.clone();
                candidates.push(candidate);
            }
        }
    }
    Ok(candidates)
}

fn ufrag(attributes: &[Attribute]) -> Option<String> {
    attributes
        .iter()
        .find(|attr| attr.key == "ice-ufrag")
        .and_then(|attr| attr.value.clone())
}

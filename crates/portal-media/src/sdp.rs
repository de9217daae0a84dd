//! Session-description and ICE-candidate payloads.
//!
//! Only the subset a data-only connection needs is checked: a version line
//! and an application media section for SDP, and the standard
//! `candidate:` attribute shape for ICE.

use serde::{Deserialize, Serialize};

use portal_shared::constants::PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// `{type: "offer"|"answer", sdp: string}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Build a data-only offer declaring each requested channel.
    pub fn data_offer(session_version: u64, channels: &[String]) -> Self {
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!("o=- {session_version} 2 IN IP4 127.0.0.1\r\n"));
        sdp.push_str("s=-\r\n");
        sdp.push_str("t=0 0\r\n");
        sdp.push_str("a=group:BUNDLE 0\r\n");
        sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=mid:0\r\n");
        sdp.push_str("a=sctp-port:5000\r\n");
        sdp.push_str(&format!("a=x-portal-protocol:{PROTOCOL_VERSION}\r\n"));
        for name in channels {
            sdp.push_str(&format!("a=x-data-channel:{name}\r\n"));
        }

        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Data channel names declared in the body.
    pub fn data_channels(&self) -> Vec<String> {
        self.lines()
            .filter_map(|l| l.strip_prefix("a=x-data-channel:"))
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self, expected: SdpType) -> Result<(), String> {
        if self.sdp_type != expected {
            return Err(format!(
                "expected {expected:?} description, got {:?}",
                self.sdp_type
            ));
        }
        if !self.lines().any(|l| l == "v=0") {
            return Err("missing version line (v=0)".into());
        }
        if !self.lines().any(|l| l.starts_with("m=application ")) {
            return Err("missing application media line (m=application)".into());
        }
        Ok(())
    }

    fn lines(&self) -> impl Iterator<Item = &str> {
        self.sdp.lines().map(str::trim)
    }
}

/// `{candidate, sdp_mid, sdp_mline_index}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }

    /// `candidate:<foundation> <component> <protocol> <priority> <address> <port> typ <type> ...`
    pub fn validate(&self) -> Result<(), String> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let rest = line
            .strip_prefix("candidate:")
            .ok_or_else(|| "missing candidate: prefix".to_string())?;

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(format!("expected at least 8 fields, got {}", fields.len()));
        }

        let foundation = fields[0];
        if foundation.is_empty() || foundation.len() > 32 {
            return Err("invalid foundation".into());
        }
        fields[1]
            .parse::<u16>()
            .map_err(|_| format!("invalid component: {}", fields[1]))?;
        if !matches!(fields[2].to_ascii_lowercase().as_str(), "udp" | "tcp") {
            return Err(format!("invalid transport: {}", fields[2]));
        }
        fields[3]
            .parse::<u32>()
            .map_err(|_| format!("invalid priority: {}", fields[3]))?;
        if fields[4].is_empty() {
            return Err("missing address".into());
        }
        fields[5]
            .parse::<u16>()
            .map_err(|_| format!("invalid port: {}", fields[5]))?;
        if fields[6] != "typ" {
            return Err("missing typ keyword".into());
        }
        if !matches!(fields[7], "host" | "srflx" | "prflx" | "relay") {
            return Err(format!("invalid candidate type: {}", fields[7]));
        }
        Ok(())
    }
}

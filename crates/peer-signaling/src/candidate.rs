use std::fmt;

use crate::error::InvalidCandidate;

/// Media section every remote candidate is attached to.
pub const CANDIDATE_SDP_MID: &str = "0";
pub const CANDIDATE_MLINE_INDEX: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

/// A remote ICE candidate line that passed structural validation.
///
/// Only the grammar of the `candidate:` attribute is checked; whether the
/// address is reachable is left to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    line: String,
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
}

impl IceCandidate {
    pub fn parse(raw: &str) -> Result<Self, InvalidCandidate> {
        let invalid = |reason: &str| InvalidCandidate {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };
        let line = raw.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix("candidate:")
            .ok_or_else(|| invalid("missing 'candidate:' prefix"))?;

        let fields: Vec<&str> = body.split_ascii_whitespace().collect();
        if fields.len() < 8 {
            return Err(invalid("too few fields"));
        }
        let foundation = fields[0];
        if foundation.is_empty()
            || foundation.len() > 32
            || !foundation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
        {
            return Err(invalid("bad foundation"));
        }
        let component: u16 = fields[1]
            .parse()
            .ok()
            .filter(|c| (1..=256).contains(c))
            .ok_or_else(|| invalid("bad component id"))?;
        let protocol = fields[2];
        if !protocol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("bad transport"));
        }
        let priority: u32 = fields[3].parse().map_err(|_| invalid("bad priority"))?;
        let address = fields[4];
        if address.is_empty() {
            return Err(invalid("missing address"));
        }
        let port: u16 = fields[5].parse().map_err(|_| invalid("bad port"))?;
        if fields[6] != "typ" {
            return Err(invalid("missing 'typ'"));
        }
        let kind = CandidateType::parse(fields[7]).ok_or_else(|| invalid("unknown candidate type"))?;

        Ok(Self {
            line: line.to_string(),
            foundation: foundation.to_string(),
            component,
            protocol: protocol.to_ascii_lowercase(),
            priority,
            address: address.to_string(),
            port,
            kind,
        })
    }

    /// The attribute value without any `a=` prefix, as handed to the transport.
    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

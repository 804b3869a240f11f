/*!
 * Wire codec for the LuxLink device protocol.
 *
 * Devices speak compact JSON documents over TCP, each terminated by `\r\n`.
 * Every frame carries a protocol version (`pv`), a command code (`cmd`), a
 * correlating sequence number (`sn`, a decimal string) and a body (`msg`);
 * responses additionally carry a result code (`res`).
 *
 * Encoding and decoding are pure transforms with no I/O.
 */
use serde::{Deserialize, Serialize};

use luxlink_core::types::{DpId, DpState};

use crate::error::{DeviceError, Result};

/// Frame delimiter: every document ends with CRLF
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Protocol version carried in every frame
pub const PROTOCOL_VERSION: u8 = 0;

/// Command codes of the device protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Command {
    /// Identity query; the handshake command
    Info,
    /// Query current data-point state
    Query,
    /// Set data-point values
    Set,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Info => 0,
            Command::Query => 2,
            Command::Set => 3,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        match code {
            0 => Ok(Command::Info),
            2 => Ok(Command::Query),
            3 => Ok(Command::Set),
            other => Err(format!("unknown command code {}", other)),
        }
    }
}

/// Frame body.
///
/// The populated fields depend on the command: requests carry `attr`/`data`,
/// INFO responses carry the identity fields. Everything is optional so one
/// shape covers requests and responses; unknown peer fields are ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Body {
    /// Data-point ids addressed by the command (`[0]` means all)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<Vec<DpId>>,

    /// Data-point values (SET requests, QUERY responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DpState>,

    /// Device id (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,

    /// Device type code, a decimal string on the wire (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtp: Option<String>,

    /// Product/model id (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,

    /// Device-reported IP address (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// MAC address (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Software version (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sv: Option<String>,

    /// Hardware version (INFO responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hv: Option<String>,
}

/// One protocol frame, request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version, always 0
    pub pv: u8,
    /// Command code
    pub cmd: Command,
    /// Correlating sequence number, a decimal string
    pub sn: String,
    /// Frame body
    #[serde(default)]
    pub msg: Body,
    /// Result code, present on responses (0 = ok)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<i64>,
}

impl Frame {
    /// Build an INFO request (empty body)
    pub fn info(sn: u64) -> Self {
        Self {
            pv: PROTOCOL_VERSION,
            cmd: Command::Info,
            sn: sn.to_string(),
            msg: Body::default(),
            res: None,
        }
    }

    /// Build a QUERY request for all data points
    pub fn query(sn: u64) -> Self {
        Self {
            pv: PROTOCOL_VERSION,
            cmd: Command::Query,
            sn: sn.to_string(),
            msg: Body {
                attr: Some(vec![0]),
                ..Body::default()
            },
            res: None,
        }
    }

    /// Build a SET request carrying data-point values
    pub fn set(sn: u64, payload: DpState) -> Self {
        let mut attr: Vec<DpId> = payload.keys().copied().collect();
        attr.sort_unstable();
        Self {
            pv: PROTOCOL_VERSION,
            cmd: Command::Set,
            sn: sn.to_string(),
            msg: Body {
                attr: Some(attr),
                data: Some(payload),
                ..Body::default()
            },
            res: None,
        }
    }

    /// Serialize the frame to wire bytes: compact JSON plus the delimiter
    pub fn encode(&self) -> Vec<u8> {
        // Frame is always serializable; its fields are plain data.
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.extend_from_slice(FRAME_DELIMITER);
        bytes
    }

    /// Parse wire bytes back into a frame.
    ///
    /// The input must include the trailing delimiter; anything else is a
    /// decode failure.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let body = bytes
            .strip_suffix(FRAME_DELIMITER)
            .ok_or_else(|| DeviceError::Decode("missing frame delimiter".to_string()))?;
        serde_json::from_slice(body).map_err(|e| DeviceError::Decode(e.to_string()))
    }
}

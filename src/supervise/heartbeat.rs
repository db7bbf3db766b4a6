//! Agent <-> guardian heartbeat protocol
//!
//! Length-framed tagged messages over the duplex pipe: a 4-byte
//! little-endian length followed by a JSON body, frames capped at 4 KiB.

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cadence of the agent pulse
pub const PULSE_INTERVAL: Duration = Duration::from_secs(1);

/// Silence longer than this is treated as tamper
pub const PULSE_DEADLINE: Duration = Duration::from_secs(5);

/// Delay before the launcher respawns a dead agent
pub const RESPAWN_DELAY: Duration = Duration::from_secs(3);

const MAX_FRAME_BYTES: u32 = 4096;

/// Messages exchanged over the heartbeat pipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "snake_case")]
pub enum Heartbeat {
    AgentPulse,
    AgentDied(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("heartbeat I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("heartbeat encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("heartbeat frame too large: {0} bytes")]
    Oversized(u32),
}

/// Encode a message into a length-prefixed frame.
pub fn encode(message: &Heartbeat) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame to a blocking writer.
pub fn write_frame(writer: &mut impl Write, message: &Heartbeat) -> Result<(), FrameError> {
    writer.write_all(&encode(message)?)?;
    Ok(())
}

/// Read one frame from a blocking reader.
pub fn read_frame(reader: &mut impl Read) -> Result<Heartbeat, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

//! Message serialization and the framing used between a worker and its children

use crate::{Error, ProcessingResult, Result, TaskActivation};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Largest frame accepted on a child pipe
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialization format for messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    /// JSON format (human-readable, larger)
    Json,
    /// MessagePack format (binary, compact, fast)
    #[default]
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl Serializer {
    /// Serialize a value
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Json => Ok(serde_json::to_vec(value)?),
            // named encoding keeps optional fields readable across versions
            Serializer::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Deserialize a value
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serializer::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Deserialization(e.to_string())),
            Serializer::MessagePack => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

impl std::str::FromStr for Serializer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Serializer::Json),
            "msgpack" | "messagepack" => Ok(Serializer::MessagePack),
            _ => Err(format!("Unknown serializer: {}", s)),
        }
    }
}

/// Sent by the worker to a child process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Execute this activation
    Activation(TaskActivation),
    /// Stop after the current task
    Shutdown,
}

/// Sent by a child process to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// The child is idle and wants one activation
    Ready,
    /// Outcome of the last activation
    Result(ProcessingResult),
}

/// Length-prefixed frames: a big-endian `u32` length followed by the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    serializer: Serializer,
}

impl FrameCodec {
    pub fn new(serializer: Serializer) -> Self {
        Self { serializer }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Write one message and flush
    pub fn write_frame<W: Write, T: Serialize>(&self, writer: &mut W, message: &T) -> Result<()> {
        let payload = self.serializer.serialize(message)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one message. `Ok(None)` means the peer closed the pipe between frames.
    pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(
        &self,
        reader: &mut R,
    ) -> Result<Option<T>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("frame of {} bytes exceeds limit", len)));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::Protocol("pipe closed mid-frame".into())
            } else {
                Error::Io(e)
            }
        })?;

        self.serializer.deserialize(&payload).map(Some)
    }
}

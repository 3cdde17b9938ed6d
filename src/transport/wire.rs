//! Binary wire formats and topic names for inter-partition traffic.
//!
//! All integers are little-endian. Variable-length fields carry a u32
//! length prefix.
//!
//! Push request:
//! ```text
//! ┌──────────────────┬──────────────┬─────────────┬─────────┐
//! │ deployment_key 8 │ partition 4  │ payload len │ payload │
//! └──────────────────┴──────────────┴─────────────┴─────────┘
//! ```
//!
//! Push response:
//! ```text
//! tag 0: ┌───┬──────────────────┬─────────────┐
//!        │ 0 │ deployment_key 8 │ partition 4 │
//!        └───┴──────────────────┴─────────────┘
//! tag 1: ┌───┬────────────┬──────────┬──────┐
//!        │ 1 │ error code │ data len │ data │
//!        └───┴────────────┴──────────┴──────┘
//! ```

use crate::distribution::DistributionKey;
use crate::topology::PartitionId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Request/response subject served by every broker.
pub const PUSH_DEPLOYMENT_SUBJECT: &str = "push-deployment";

/// Shared topic for cross-partition subscription commands.
pub const SUBSCRIPTION_TOPIC: &str = "subscription";

pub fn replication_topic(partition: PartitionId) -> String {
    format!("replication-{}", partition)
}

pub fn deployment_response_topic(key: DistributionKey, partition: PartitionId) -> String {
    format!("deployment-response-{}-{}", key, partition)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short for {0}")]
    Truncated(&'static str),
    #[error("unknown response tag {0}")]
    UnknownTag(u8),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PartitionLeaderMismatch,
    ResourceExhausted,
    MalformedRequest,
    InternalError,
    Unknown(u16),
}

impl ErrorCode {
    pub fn to_u16(self) -> u16 {
        match self {
            ErrorCode::PartitionLeaderMismatch => 1,
            ErrorCode::ResourceExhausted => 2,
            ErrorCode::MalformedRequest => 3,
            ErrorCode::InternalError => 4,
            ErrorCode::Unknown(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::PartitionLeaderMismatch,
            2 => ErrorCode::ResourceExhausted,
            3 => ErrorCode::MalformedRequest,
            4 => ErrorCode::InternalError,
            other => ErrorCode::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushDeploymentRequest {
    pub deployment_key: DistributionKey,
    pub partition_id: PartitionId,
    pub payload: Bytes,
}

impl PushDeploymentRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.payload.len());
        buf.put_u64_le(self.deployment_key);
        buf.put_u32_le(self.partition_id);
        put_bytes(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let deployment_key = get_u64(&mut buf, "deployment key")?;
        let partition_id = get_u32(&mut buf, "partition id")?;
        let payload = get_bytes(&mut buf, "payload")?;
        ensure_consumed(&buf)?;
        Ok(PushDeploymentRequest {
            deployment_key,
            partition_id,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushDeploymentResponse {
    Success {
        deployment_key: DistributionKey,
        partition_id: PartitionId,
    },
    Error {
        code: ErrorCode,
        data: Bytes,
    },
}

impl PushDeploymentResponse {
    pub fn leader_mismatch(partition: PartitionId) -> Self {
        PushDeploymentResponse::Error {
            code: ErrorCode::PartitionLeaderMismatch,
            data: Bytes::copy_from_slice(&partition.to_le_bytes()),
        }
    }

    pub fn error(code: ErrorCode, message: &str) -> Self {
        PushDeploymentResponse::Error {
            code,
            data: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            PushDeploymentResponse::Success {
                deployment_key,
                partition_id,
            } => {
                buf.put_u8(0);
                buf.put_u64_le(*deployment_key);
                buf.put_u32_le(*partition_id);
            }
            PushDeploymentResponse::Error { code, data } => {
                buf.put_u8(1);
                buf.put_u16_le(code.to_u16());
                put_bytes(&mut buf, data);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated("response tag"));
        }
        let response = match buf.get_u8() {
            0 => PushDeploymentResponse::Success {
                deployment_key: get_u64(&mut buf, "deployment key")?,
                partition_id: get_u32(&mut buf, "partition id")?,
            },
            1 => PushDeploymentResponse::Error {
                code: ErrorCode::from_u16(get_u16(&mut buf, "error code")?),
                data: get_bytes(&mut buf, "error data")?,
            },
            tag => return Err(WireError::UnknownTag(tag)),
        };
        ensure_consumed(&buf)?;
        Ok(response)
    }

    /// Partition named in a `PARTITION_LEADER_MISMATCH` error.
    pub fn mismatch_partition(&self) -> Option<PartitionId> {
        match self {
            PushDeploymentResponse::Error {
                code: ErrorCode::PartitionLeaderMismatch,
                data,
            } => data
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes),
            _ => None,
        }
    }
}

// =============================================================================
// Primitive readers
// =============================================================================

pub(crate) fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u32::MAX as usize, "Precondition: field fits u32 length");
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn get_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut Bytes, field: &'static str) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn get_i32(buf: &mut Bytes, field: &'static str) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_i32_le())
}

pub(crate) fn get_i64(buf: &mut Bytes, field: &'static str) -> Result<i64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_i64_le())
}

pub(crate) fn get_bytes(buf: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    let len = get_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len))
}

pub(crate) fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let bytes = get_bytes(buf, field)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

pub(crate) fn ensure_consumed(buf: &Bytes) -> Result<(), WireError> {
    if buf.has_remaining() {
        return Err(WireError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}

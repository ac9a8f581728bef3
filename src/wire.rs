//! Message types exchanged between managers, runners, and clients.
//!
//! All traffic is length-prefixed frames carrying one encoded message. Requests
//! and responses are correlated by a [RequestId] so a single connection can
//! serve many requests concurrently.

use crate::{
    shard::{ShardId, MAX_SHARDS},
    EntityId, RunnerId,
};
use bytes::{Buf, BufMut};
use commonware_codec::{
    EncodeSize, Error as CodecError, Read, ReadExt, ReadRangeExt as _, Write,
};
use std::{
    mem::size_of,
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU64, Ordering},
};

/// Maximum message size in bytes (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum length of a method name in bytes.
pub const MAX_METHOD: usize = 64;

/// Maximum length of a fault message in bytes.
const MAX_FAULT_MESSAGE: usize = 4096;

/// Unique identifier for correlating requests with responses.
pub type RequestId = u64;

/// Generates monotonically increasing request IDs.
#[derive(Debug)]
pub struct Requester {
    counter: AtomicU64,
}

impl Default for Requester {
    fn default() -> Self {
        Self::new()
    }
}

impl Requester {
    pub fn new() -> Self {
        Requester {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> RequestId {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) fn write_string(s: &str, buf: &mut impl BufMut) {
    s.as_bytes().to_vec().write(buf);
}

pub(crate) fn string_encode_size(s: &str) -> usize {
    s.as_bytes().to_vec().encode_size()
}

pub(crate) fn read_string(
    buf: &mut impl Buf,
    max: usize,
    context: &'static str,
) -> Result<String, CodecError> {
    let bytes = Vec::<u8>::read_range(buf, 0..=max)?;
    String::from_utf8(bytes).map_err(|_| CodecError::Invalid(context, "invalid UTF-8"))
}

// [SocketAddr] is written as a tagged address (0 = IPv4, 1 = IPv6) followed by
// the port. Helper functions rather than trait impls since both sides are
// foreign types.
pub(crate) fn write_addr(addr: &SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            0u8.write(buf);
            u32::from(ip).write(buf);
        }
        IpAddr::V6(ip) => {
            1u8.write(buf);
            u128::from(ip).write(buf);
        }
    }
    addr.port().write(buf);
}

pub(crate) fn addr_encode_size(addr: &SocketAddr) -> usize {
    let ip = match addr.ip() {
        IpAddr::V4(_) => size_of::<u32>(),
        IpAddr::V6(_) => size_of::<u128>(),
    };
    size_of::<u8>() + ip + size_of::<u16>()
}

pub(crate) fn read_addr(buf: &mut impl Buf) -> Result<SocketAddr, CodecError> {
    let tag = u8::read(buf)?;
    let ip = match tag {
        0 => IpAddr::V4(u32::read(buf)?.into()),
        1 => IpAddr::V6(u128::read(buf)?.into()),
        _ => return Err(CodecError::InvalidEnum(tag)),
    };
    let port = u16::read(buf)?;
    Ok(SocketAddr::new(ip, port))
}

/// Messages exchanged with the manager.
///
/// Runners use [ManagerMessage::Register], [ManagerMessage::Heartbeat], and
/// [ManagerMessage::Deregister]; clients use [ManagerMessage::Locate]. The
/// remaining variants are manager responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerMessage {
    /// Announce a new runner serving entities at `addr`.
    Register {
        request_id: RequestId,
        addr: SocketAddr,
    },
    /// The runner was admitted under `runner`. Carries the cluster's shard
    /// count so the runner can map entity ids to shards.
    Registered {
        request_id: RequestId,
        runner: RunnerId,
        shard_count: u32,
    },
    /// Periodic liveness report from a registered runner.
    Heartbeat {
        request_id: RequestId,
        runner: RunnerId,
    },
    /// Heartbeat acknowledgement carrying the runner's current assignment.
    Lease {
        request_id: RequestId,
        version: u64,
        shards: Vec<ShardId>,
    },
    /// The heartbeating runner is not in the registry and must re-register.
    UnknownRunner { request_id: RequestId },
    /// Ask which runner owns the shard for `entity`.
    Locate {
        request_id: RequestId,
        entity: EntityId,
    },
    /// The entity's shard is owned by `runner` at `addr`.
    Located {
        request_id: RequestId,
        version: u64,
        runner: RunnerId,
        addr: SocketAddr,
    },
    /// The entity's shard has no owner (no active runners).
    Unassigned { request_id: RequestId },
    /// Graceful departure of a runner.
    Deregister {
        request_id: RequestId,
        runner: RunnerId,
    },
    /// Departure acknowledged and the runner's shards reassigned.
    Deregistered { request_id: RequestId },
}

impl ManagerMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            ManagerMessage::Register { request_id, .. } => *request_id,
            ManagerMessage::Registered { request_id, .. } => *request_id,
            ManagerMessage::Heartbeat { request_id, .. } => *request_id,
            ManagerMessage::Lease { request_id, .. } => *request_id,
            ManagerMessage::UnknownRunner { request_id } => *request_id,
            ManagerMessage::Locate { request_id, .. } => *request_id,
            ManagerMessage::Located { request_id, .. } => *request_id,
            ManagerMessage::Unassigned { request_id } => *request_id,
            ManagerMessage::Deregister { request_id, .. } => *request_id,
            ManagerMessage::Deregistered { request_id } => *request_id,
        }
    }
}

impl Write for ManagerMessage {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            ManagerMessage::Register { request_id, addr } => {
                0u8.write(buf);
                request_id.write(buf);
                write_addr(addr, buf);
            }
            ManagerMessage::Registered {
                request_id,
                runner,
                shard_count,
            } => {
                1u8.write(buf);
                request_id.write(buf);
                runner.write(buf);
                shard_count.write(buf);
            }
            ManagerMessage::Heartbeat { request_id, runner } => {
                2u8.write(buf);
                request_id.write(buf);
                runner.write(buf);
            }
            ManagerMessage::Lease {
                request_id,
                version,
                shards,
            } => {
                3u8.write(buf);
                request_id.write(buf);
                version.write(buf);
                shards.write(buf);
            }
            ManagerMessage::UnknownRunner { request_id } => {
                4u8.write(buf);
                request_id.write(buf);
            }
            ManagerMessage::Locate { request_id, entity } => {
                5u8.write(buf);
                request_id.write(buf);
                entity.write(buf);
            }
            ManagerMessage::Located {
                request_id,
                version,
                runner,
                addr,
            } => {
                6u8.write(buf);
                request_id.write(buf);
                version.write(buf);
                runner.write(buf);
                write_addr(addr, buf);
            }
            ManagerMessage::Unassigned { request_id } => {
                7u8.write(buf);
                request_id.write(buf);
            }
            ManagerMessage::Deregister { request_id, runner } => {
                8u8.write(buf);
                request_id.write(buf);
                runner.write(buf);
            }
            ManagerMessage::Deregistered { request_id } => {
                9u8.write(buf);
                request_id.write(buf);
            }
        }
    }
}

impl EncodeSize for ManagerMessage {
    fn encode_size(&self) -> usize {
        // 1 byte for the discriminant
        1 + match self {
            ManagerMessage::Register { request_id, addr } => {
                request_id.encode_size() + addr_encode_size(addr)
            }
            ManagerMessage::Registered {
                request_id,
                runner,
                shard_count,
            } => request_id.encode_size() + runner.encode_size() + shard_count.encode_size(),
            ManagerMessage::Heartbeat { request_id, runner } => {
                request_id.encode_size() + runner.encode_size()
            }
            ManagerMessage::Lease {
                request_id,
                version,
                shards,
            } => request_id.encode_size() + version.encode_size() + shards.encode_size(),
            ManagerMessage::UnknownRunner { request_id } => request_id.encode_size(),
            ManagerMessage::Locate { request_id, entity } => {
                request_id.encode_size() + entity.encode_size()
            }
            ManagerMessage::Located {
                request_id,
                version,
                runner,
                addr,
            } => {
                request_id.encode_size()
                    + version.encode_size()
                    + runner.encode_size()
                    + addr_encode_size(addr)
            }
            ManagerMessage::Unassigned { request_id } => request_id.encode_size(),
            ManagerMessage::Deregister { request_id, runner } => {
                request_id.encode_size() + runner.encode_size()
            }
            ManagerMessage::Deregistered { request_id } => request_id.encode_size(),
        }
    }
}

impl Read for ManagerMessage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let discriminant = u8::read(buf)?;
        match discriminant {
            0 => Ok(ManagerMessage::Register {
                request_id: RequestId::read(buf)?,
                addr: read_addr(buf)?,
            }),
            1 => Ok(ManagerMessage::Registered {
                request_id: RequestId::read(buf)?,
                runner: RunnerId::read(buf)?,
                shard_count: u32::read(buf)?,
            }),
            2 => Ok(ManagerMessage::Heartbeat {
                request_id: RequestId::read(buf)?,
                runner: RunnerId::read(buf)?,
            }),
            3 => Ok(ManagerMessage::Lease {
                request_id: RequestId::read(buf)?,
                version: u64::read(buf)?,
                shards: Vec::<ShardId>::read_range(buf, 0..=MAX_SHARDS)?,
            }),
            4 => Ok(ManagerMessage::UnknownRunner {
                request_id: RequestId::read(buf)?,
            }),
            5 => Ok(ManagerMessage::Locate {
                request_id: RequestId::read(buf)?,
                entity: EntityId::read(buf)?,
            }),
            6 => Ok(ManagerMessage::Located {
                request_id: RequestId::read(buf)?,
                version: u64::read(buf)?,
                runner: RunnerId::read(buf)?,
                addr: read_addr(buf)?,
            }),
            7 => Ok(ManagerMessage::Unassigned {
                request_id: RequestId::read(buf)?,
            }),
            8 => Ok(ManagerMessage::Deregister {
                request_id: RequestId::read(buf)?,
                runner: RunnerId::read(buf)?,
            }),
            9 => Ok(ManagerMessage::Deregistered {
                request_id: RequestId::read(buf)?,
            }),
            _ => Err(CodecError::InvalidEnum(discriminant)),
        }
    }
}

/// Messages exchanged with a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerMessage {
    /// Invoke `method` on the entity identified by `entity`.
    Request {
        request_id: RequestId,
        entity: EntityId,
        method: String,
        payload: Vec<u8>,
    },
    /// Result of a previously issued request.
    Response {
        request_id: RequestId,
        outcome: Outcome,
    },
}

impl RunnerMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            RunnerMessage::Request { request_id, .. } => *request_id,
            RunnerMessage::Response { request_id, .. } => *request_id,
        }
    }
}

impl Write for RunnerMessage {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            RunnerMessage::Request {
                request_id,
                entity,
                method,
                payload,
            } => {
                0u8.write(buf);
                request_id.write(buf);
                entity.write(buf);
                write_string(method, buf);
                payload.write(buf);
            }
            RunnerMessage::Response {
                request_id,
                outcome,
            } => {
                1u8.write(buf);
                request_id.write(buf);
                outcome.write(buf);
            }
        }
    }
}

impl EncodeSize for RunnerMessage {
    fn encode_size(&self) -> usize {
        1 + match self {
            RunnerMessage::Request {
                request_id,
                entity,
                method,
                payload,
            } => {
                request_id.encode_size()
                    + entity.encode_size()
                    + string_encode_size(method)
                    + payload.encode_size()
            }
            RunnerMessage::Response {
                request_id,
                outcome,
            } => request_id.encode_size() + outcome.encode_size(),
        }
    }
}

impl Read for RunnerMessage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let discriminant = u8::read(buf)?;
        match discriminant {
            0 => Ok(RunnerMessage::Request {
                request_id: RequestId::read(buf)?,
                entity: EntityId::read(buf)?,
                method: read_string(buf, MAX_METHOD, "RunnerMessage")?,
                payload: Vec::<u8>::read_range(buf, 0..=MAX_MESSAGE_SIZE)?,
            }),
            1 => Ok(RunnerMessage::Response {
                request_id: RequestId::read(buf)?,
                outcome: Outcome::read(buf)?,
            }),
            _ => Err(CodecError::InvalidEnum(discriminant)),
        }
    }
}

/// Result of dispatching a request to a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The entity handled the request and produced a response payload.
    Ok(Vec<u8>),
    /// The entity rejected or failed the request.
    Fault(Fault),
    /// The runner does not own the entity's shard. The caller should refresh
    /// its routing information and retry elsewhere.
    NotOwner,
}

impl Write for Outcome {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Outcome::Ok(payload) => {
                0u8.write(buf);
                payload.write(buf);
            }
            Outcome::Fault(fault) => {
                1u8.write(buf);
                fault.write(buf);
            }
            Outcome::NotOwner => {
                2u8.write(buf);
            }
        }
    }
}

impl EncodeSize for Outcome {
    fn encode_size(&self) -> usize {
        1 + match self {
            Outcome::Ok(payload) => payload.encode_size(),
            Outcome::Fault(fault) => fault.encode_size(),
            Outcome::NotOwner => 0,
        }
    }
}

impl Read for Outcome {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let discriminant = u8::read(buf)?;
        match discriminant {
            0 => Ok(Outcome::Ok(Vec::<u8>::read_range(
                buf,
                0..=MAX_MESSAGE_SIZE,
            )?)),
            1 => Ok(Outcome::Fault(Fault::read(buf)?)),
            2 => Ok(Outcome::NotOwner),
            _ => Err(CodecError::InvalidEnum(discriminant)),
        }
    }
}

/// Entity-level failure carried across the wire.
///
/// Faults preserve their kind end-to-end so callers can distinguish permanent
/// rejections from failures worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The requested computation exceeds the entity's limit.
    InputTooLarge,
    /// Redundant computations of the same value disagreed.
    VerificationMismatch,
    /// A passing failure. Retrying may succeed.
    Transient,
    /// An unexpected internal failure.
    Internal(String),
}

impl Write for Fault {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Fault::InputTooLarge => 0u8.write(buf),
            Fault::VerificationMismatch => 1u8.write(buf),
            Fault::Transient => 2u8.write(buf),
            Fault::Internal(message) => {
                3u8.write(buf);
                write_string(message, buf);
            }
        }
    }
}

impl EncodeSize for Fault {
    fn encode_size(&self) -> usize {
        1 + match self {
            Fault::Internal(message) => string_encode_size(message),
            _ => 0,
        }
    }
}

impl Read for Fault {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let discriminant = u8::read(buf)?;
        match discriminant {
            0 => Ok(Fault::InputTooLarge),
            1 => Ok(Fault::VerificationMismatch),
            2 => Ok(Fault::Transient),
            3 => Ok(Fault::Internal(read_string(
                buf,
                MAX_FAULT_MESSAGE,
                "Fault",
            )?)),
            _ => Err(CodecError::InvalidEnum(discriminant)),
        }
    }
}

//! Bookkeeping for the set of known runners.

use crate::{
    wire::{addr_encode_size, read_addr, write_addr},
    RunnerId,
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, SystemTime},
};

/// Upper bound on persisted runner records.
const MAX_RUNNERS: usize = 1 << 16;

/// Liveness state of a runner.
///
/// A runner joins as [Status::Joining] and is promoted to [Status::Active] by
/// its first heartbeat. Missed heartbeats demote it to [Status::Unresponsive],
/// at which point its shards are reassigned; a further grace period without
/// recovery removes the record entirely. An unresponsive runner that resumes
/// heartbeating is promoted back to [Status::Active].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Joining,
    Active,
    Unresponsive,
}

impl Write for Status {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Status::Joining => 0u8.write(buf),
            Status::Active => 1u8.write(buf),
            Status::Unresponsive => 2u8.write(buf),
        }
    }
}

impl EncodeSize for Status {
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for Status {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let discriminant = u8::read(buf)?;
        match discriminant {
            0 => Ok(Status::Joining),
            1 => Ok(Status::Active),
            2 => Ok(Status::Unresponsive),
            _ => Err(CodecError::InvalidEnum(discriminant)),
        }
    }
}

/// A registered runner.
#[derive(Debug, Clone)]
pub struct Record {
    /// Address at which the runner serves entity requests.
    pub addr: SocketAddr,

    /// Current liveness state.
    pub status: Status,

    /// When the runner last heartbeated (or was registered or restored).
    ///
    /// Not persisted. A restored record starts a fresh liveness window.
    pub last_heartbeat: SystemTime,
}

/// Result of a liveness sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Runners newly demoted to [Status::Unresponsive].
    pub demoted: Vec<RunnerId>,

    /// Runners whose records were dropped.
    pub removed: Vec<RunnerId>,
}

impl Sweep {
    pub fn is_empty(&self) -> bool {
        self.demoted.is_empty() && self.removed.is_empty()
    }
}

/// The set of known runners, keyed by id.
///
/// Iteration order is stable (ascending id) so that assignment decisions made
/// from the registry are deterministic.
#[derive(Debug, Clone)]
pub struct Registry {
    next: RunnerId,
    runners: BTreeMap<RunnerId, Record>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next: 0,
            runners: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// Admit a new runner, returning its assigned id.
    pub fn register(&mut self, addr: SocketAddr, now: SystemTime) -> RunnerId {
        let id = self.next;
        self.next += 1;
        self.runners.insert(
            id,
            Record {
                addr,
                status: Status::Joining,
                last_heartbeat: now,
            },
        );
        id
    }

    /// Record a heartbeat from `id`, returning the runner's prior status.
    ///
    /// Returns None if the runner is unknown (its record expired or the
    /// registry was reset), in which case the runner must register again.
    pub fn heartbeat(&mut self, id: RunnerId, now: SystemTime) -> Option<Status> {
        let record = self.runners.get_mut(&id)?;
        let previous = record.status;
        record.status = Status::Active;
        record.last_heartbeat = now;
        Some(previous)
    }

    /// Remove a runner's record, returning it if present.
    pub fn deregister(&mut self, id: RunnerId) -> Option<Record> {
        self.runners.remove(&id)
    }

    pub fn get(&self, id: RunnerId) -> Option<&Record> {
        self.runners.get(&id)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Runners currently eligible to own shards (ascending id).
    pub fn eligible(&self) -> Vec<RunnerId> {
        self.runners
            .iter()
            .filter(|(_, record)| record.status == Status::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Demote runners that stopped heartbeating and drop those that stayed
    /// unresponsive past the removal grace.
    ///
    /// A runner is demoted once `unresponsive_after` elapses without a
    /// heartbeat and removed once a further `removal_grace` elapses. Joining
    /// runners that never heartbeat age out on the same schedule.
    pub fn sweep(
        &mut self,
        now: SystemTime,
        unresponsive_after: Duration,
        removal_grace: Duration,
    ) -> Sweep {
        let mut sweep = Sweep::default();
        for (id, record) in self.runners.iter_mut() {
            let elapsed = now
                .duration_since(record.last_heartbeat)
                .unwrap_or_default();
            match record.status {
                Status::Joining | Status::Active => {
                    if elapsed >= unresponsive_after {
                        record.status = Status::Unresponsive;
                        sweep.demoted.push(*id);
                    }
                }
                Status::Unresponsive => {
                    if elapsed >= unresponsive_after + removal_grace {
                        sweep.removed.push(*id);
                    }
                }
            }
        }
        for id in &sweep.removed {
            self.runners.remove(id);
        }
        sweep
    }

    /// Reset all liveness windows, e.g. after restoring persisted records.
    pub fn reset_liveness(&mut self, now: SystemTime) {
        for record in self.runners.values_mut() {
            record.last_heartbeat = now;
        }
    }
}

// Persistence omits `last_heartbeat`; restored records are given a fresh
// window via [Registry::reset_liveness].
impl Write for Registry {
    fn write(&self, buf: &mut impl BufMut) {
        self.next.write(buf);
        (self.runners.len() as u32).write(buf);
        for (id, record) in &self.runners {
            id.write(buf);
            write_addr(&record.addr, buf);
            record.status.write(buf);
        }
    }
}

impl EncodeSize for Registry {
    fn encode_size(&self) -> usize {
        self.next.encode_size()
            + 4
            + self
                .runners
                .iter()
                .map(|(id, record)| {
                    id.encode_size()
                        + addr_encode_size(&record.addr)
                        + record.status.encode_size()
                })
                .sum::<usize>()
    }
}

impl Read for Registry {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let next = RunnerId::read(buf)?;
        let len = u32::read(buf)? as usize;
        if len > MAX_RUNNERS {
            return Err(CodecError::Invalid("Registry", "too many runners"));
        }
        let mut runners = BTreeMap::new();
        for _ in 0..len {
            let id = RunnerId::read(buf)?;
            let addr = read_addr(buf)?;
            let status = Status::read(buf)?;
            runners.insert(
                id,
                Record {
                    addr,
                    status,
                    last_heartbeat: SystemTime::UNIX_EPOCH,
                },
            );
        }
        Ok(Self { next, runners })
    }
}

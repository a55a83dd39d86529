//! Stream Registry (§4.1): a bounded table of open streams, each with a
//! type, a partial-line read buffer, and a next-deadline.

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use std::os::fd::RawFd;

use crate::parser::LINE_BUFFER_SIZE;

/// One of the nine stream types the engine recognizes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    InputStream,
    OutputStream,
    OutputCopy,
    OutputSink,
    ServerJson,
    ServerNmea0183,
    ClientSnapshot,
    ClientJsonStream,
    ClientNmea0183Stream,
}

impl StreamKind {
    /// Whether `register` should arm the read-interest bit (§4.1).
    pub fn has_read_handler(self) -> bool {
        matches!(
            self,
            StreamKind::InputStream
                | StreamKind::ServerJson
                | StreamKind::ServerNmea0183
                | StreamKind::ClientSnapshot
                | StreamKind::ClientJsonStream
        )
    }

    /// Whether `register` should arm the write-interest bit (§4.1).
    pub fn has_write_handler(self) -> bool {
        matches!(
            self,
            StreamKind::ClientSnapshot
                | StreamKind::ClientJsonStream
                | StreamKind::OutputStream
                | StreamKind::OutputCopy
        )
    }
}

/// The underlying OS resource behind a stream slot.
pub enum Transport {
    Listener(TcpListener),
    Stream(TcpStream),
    /// stdin/stdout, addressed by raw fd rather than owned by mio's TCP
    /// types (§3: "fd: OS handle (or equivalent)").
    RawFd(RawFd),
}

impl Source for Transport {
    /// `SourceFd` is a zero-cost wrapper constructed fresh each call; it
    /// does not own the fd, so registering a `RawFd` transport never closes
    /// stdin/stdout.
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> std::io::Result<()> {
        match self {
            Transport::Listener(l) => l.register(registry, token, interests),
            Transport::Stream(s) => s.register(registry, token, interests),
            Transport::RawFd(fd) => SourceFd(fd).register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> std::io::Result<()> {
        match self {
            Transport::Listener(l) => l.reregister(registry, token, interests),
            Transport::Stream(s) => s.reregister(registry, token, interests),
            Transport::RawFd(fd) => SourceFd(fd).reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        match self {
            Transport::Listener(l) => l.deregister(registry),
            Transport::Stream(s) => s.deregister(registry),
            Transport::RawFd(fd) => SourceFd(fd).deregister(registry),
        }
    }
}

/// advisory pacing deadline for snapshot refresh / new-stream grace (§4.1).
pub const DEADLINE_PACING_MS: i64 = 500;

pub struct StreamSlot {
    pub kind: StreamKind,
    pub transport: Transport,
    pub read_buffer: Vec<u8>,
    pub deadline: i64,
}

impl StreamSlot {
    fn new(kind: StreamKind, transport: Transport, now_millis: i64) -> Self {
        StreamSlot {
            kind,
            transport,
            read_buffer: Vec::with_capacity(LINE_BUFFER_SIZE),
            deadline: now_millis + DEADLINE_PACING_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("too many open streams")]
    TooManyStreams,
}

/// A fixed-capacity table of stream slots, indexed by `mio::Token`.
pub struct StreamTable {
    slots: Vec<Option<StreamSlot>>,
}

impl StreamTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        StreamTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Finds the first free slot and installs `transport` there (§4.1
    /// `register`).
    pub fn register(
        &mut self,
        kind: StreamKind,
        transport: Transport,
        now_millis: i64,
    ) -> Result<usize, RegistryError> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(RegistryError::TooManyStreams)?;
        self.slots[idx] = Some(StreamSlot::new(kind, transport, now_millis));
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&StreamSlot> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut StreamSlot> {
        self.slots.get_mut(idx)?.as_mut()
    }

    /// Frees a slot (§4.1 `close`). Returns the removed slot so the caller
    /// (the engine) can deregister it from the reactor and let it drop.
    pub fn close(&mut self, idx: usize) -> Option<StreamSlot> {
        self.slots.get_mut(idx).and_then(|s| s.take())
    }

    /// Iterates all occupied slots with their indices (§4.1 `forEach`).
    pub fn iter(&self) -> impl Iterator<Item = (usize, &StreamSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut StreamSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
    }
}

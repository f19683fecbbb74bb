//! Framing shared by the vendor protocols and the seam the connection loop drives them through.

use crate::snapshot::{BatterySnapshot, DataClass};
use crate::transport::GattProfile;
use crate::{Error, Result};

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}

pub mod jbd;
pub mod jk;

/// Reassembles notification fragments into complete frames.
pub trait FrameAssembler {
    /// Feeds one fragment, returning a frame once its declared length is reached.
    fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>>;
    /// Drops any partial frame.
    fn reset(&mut self);
}

/// Partial frame of one link.
#[derive(Debug, Default)]
pub struct AssemblyState {
    expected_total_length: usize,
    active_command: Option<u8>,
    buffer: Vec<u8>,
}

impl AssemblyState {
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn active_command(&self) -> Option<u8> {
        self.active_command
    }

    pub fn bytes_received(&self) -> usize {
        self.buffer.len()
    }

    pub fn expected_total_length(&self) -> usize {
        self.expected_total_length
    }

    pub fn reset(&mut self) {
        self.expected_total_length = 0;
        self.active_command = None;
        self.buffer.clear();
    }

    /// Starts a new frame from a header fragment, abandoning whatever was in progress.
    pub fn start(
        &mut self,
        command: Option<u8>,
        expected_total_length: usize,
        fragment: &[u8],
    ) -> Option<Vec<u8>> {
        if !self.is_idle() {
            log::debug!(
                "Abandoning partial frame - command={:02X?} received={} expected={}",
                self.active_command,
                self.buffer.len(),
                self.expected_total_length
            );
        }
        self.reset();
        self.active_command = command;
        self.expected_total_length = expected_total_length;
        self.append(fragment)
    }

    /// Adds a continuation fragment to the active frame.
    pub fn append(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(fragment);
        if self.buffer.len() < self.expected_total_length {
            return None;
        }
        if self.buffer.len() > self.expected_total_length {
            log::debug!(
                "Frame overrun - command={:02X?} received={} expected={}",
                self.active_command,
                self.buffer.len(),
                self.expected_total_length
            );
            self.reset();
            return None;
        }
        let frame = std::mem::take(&mut self.buffer);
        self.reset();
        Some(frame)
    }
}

/// What the connection loop waits for after writing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Data(DataClass),
    Info,
    Ack,
}

impl Expect {
    pub fn is_satisfied_by(&self, reply: &Reply) -> bool {
        match (self, reply) {
            (Expect::Data(class), Reply::Refreshed(classes)) => classes.contains(class),
            (Expect::Info, Reply::Info) => true,
            (Expect::Ack, Reply::Ack | Reply::Nack) => true,
            _ => false,
        }
    }
}

/// Classification of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The frame refreshed these data classes of the snapshot.
    Refreshed(&'static [DataClass]),
    /// Static device information.
    Info,
    Ack,
    Nack,
}

impl Reply {
    pub fn refreshed(&self) -> &'static [DataClass] {
        match self {
            Reply::Refreshed(classes) => classes,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub frame: Vec<u8>,
    pub expect: Expect,
    pub with_response: bool,
}

impl Request {
    pub fn new(frame: Vec<u8>, expect: Expect) -> Self {
        Self {
            frame,
            expect,
            with_response: true,
        }
    }
}

/// One BMS vendor: its GATT layout, requests, assembler and decoder.
pub trait BmsProtocol: Send {
    type Update: Send + std::fmt::Debug;

    /// Label stored in the snapshot, e.g. "JBD BT".
    fn battery_type(&self) -> &'static str;

    fn gatt_profile(&self) -> GattProfile;

    /// Forgets partial frames; called on every (re)connect.
    fn reset(&mut self);

    /// Requests written once right after connecting.
    fn connect_requests(&self) -> Vec<Request>;

    /// Requests written on every poll cycle, in order.
    fn poll_requests(&self) -> Vec<Request>;

    fn on_request_sent(&mut self, _request: &Request) {}

    /// Feeds one notification fragment; returns the update a completed frame carried.
    fn on_fragment(&mut self, fragment: &[u8]) -> Result<Option<Self::Update>>;

    fn reply(update: &Self::Update) -> Reply;

    /// Writes the update into the snapshot. Must leave it untouched on error.
    fn apply(&self, update: Self::Update, snapshot: &mut BatterySnapshot) -> Result<()>;
}

/// CRC8 as used by JK: sum of all bytes modulo 256.
pub fn sum_crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn require_len(data: &[u8], declared: usize) -> Result<()> {
    if data.len() < declared {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            declared,
            data.len()
        );
        return Err(Error::ShortFrame {
            declared,
            available: data.len(),
        });
    }
    Ok(())
}

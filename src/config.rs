//! Connection and polling configuration.

use fugit::MillisDurationU32;

use crate::codec::Request;
use crate::error::{Error, Result};

/// Baud rates commonly offered by RS-485 sensor modules.
pub const SUPPORTED_BAUD_RATES: [u32; 7] = [4800, 9600, 19200, 38400, 57600, 115200, 230400];
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Factory unit address of many serial sensors.
pub const DEFAULT_UNIT_ID: u8 = 0x50;

/// How to reach one device. Fixed once handed to a [`Device`](crate::device::Device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    name: String,
    port: String,
    baud_rate: u32,
    unit_id: u8,
    timeout: MillisDurationU32,
}

impl ConnectionConfig {
    /// `name` is only used for display and logging.
    pub fn new(
        name: impl Into<String>,
        port: impl Into<String>,
        baud_rate: u32,
        unit_id: u8,
    ) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            baud_rate,
            unit_id,
            timeout: MillisDurationU32::millis(200),
        }
    }

    /// Bound on a synchronous read or write, including the device's reply.
    pub fn with_timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn timeout(&self) -> MillisDurationU32 {
        self.timeout
    }

    pub fn is_standard_baud_rate(&self) -> bool {
        SUPPORTED_BAUD_RATES.contains(&self.baud_rate)
    }
}

/// A contiguous run of registers read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
    /// Drop the block from the plan after its first successful read.
    pub once: bool,
}

impl ReadBlock {
    pub fn request(&self) -> Result<Request> {
        Request::read(self.start, self.count)
    }
}

/// The register blocks read on every poll cycle, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollPlan {
    blocks: Vec<ReadBlock>,
}

impl PollPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan that reads a single register.
    pub fn register(address: u16) -> Self {
        Self {
            blocks: vec![ReadBlock {
                start: address,
                count: 1,
                once: false,
            }],
        }
    }

    /// Add a block read on every cycle.
    pub fn read(self, start: u16, count: u16) -> Result<Self> {
        self.push(start, count, false)
    }

    /// Add a block read until it has been answered once, e.g. a version or serial number.
    pub fn read_once(self, start: u16, count: u16) -> Result<Self> {
        self.push(start, count, true)
    }

    fn push(mut self, start: u16, count: u16, once: bool) -> Result<Self> {
        Request::read(start, count)?;
        self.blocks.push(ReadBlock { start, count, once });
        Ok(self)
    }

    pub fn blocks(&self) -> &[ReadBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Background polling parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub plan: PollPlan,
    /// Pause between the end of one cycle and the start of the next.
    pub interval: MillisDurationU32,
    /// How long to wait for each reply.
    pub response_timeout: MillisDurationU32,
    /// Extra attempts per block after a timeout or bad frame.
    pub retries: u32,
    /// Consecutive failed cycles before a failure is reported.
    pub failure_threshold: u32,
    /// Quiet time between requests within one cycle.
    pub request_gap: MillisDurationU32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            plan: PollPlan::default(),
            interval: MillisDurationU32::millis(100),
            response_timeout: MillisDurationU32::millis(200),
            retries: 3,
            failure_threshold: 1,
            request_gap: MillisDurationU32::millis(0),
        }
    }
}

impl PollConfig {
    pub fn new(plan: PollPlan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: MillisDurationU32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_response_timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_request_gap(mut self, gap: MillisDurationU32) -> Self {
        self.request_gap = gap;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.plan.is_empty() || self.response_timeout.to_millis() == 0 {
            return Err(Error::InvalidRange);
        }
        Ok(())
    }
}

pub(crate) fn std_duration(duration: MillisDurationU32) -> core::time::Duration {
    core::time::Duration::from_millis(duration.to_millis() as u64)
}

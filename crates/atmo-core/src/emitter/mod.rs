//! StatsD gauge emitter.
//!
//! Every reading becomes one plaintext line `<prefix>.<name>:<value>|g`. Lines
//! are batched newline-separated into as few datagrams as fit under
//! [`MAX_DATAGRAM_SIZE`] and handed to a [`Transport`]. All datagrams of one
//! emit share a single deadline of `GRAPHITE_TIMEOUT`. Delivery is
//! best-effort: a failed send is returned to the caller and never retried.

mod transport;

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub use transport::{LogTransport, Transport, UdpTransport};

use crate::config::EmitterConfig;
use crate::sample::SampleSet;

/// Largest payload that fits a 1500-byte MTU after IP and UDP headers.
pub const MAX_DATAGRAM_SIZE: usize = 1432;

/// Transmission failure. The sample set of the tick is dropped.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {host}")]
    NoAddress { host: String },

    #[error("cannot open UDP socket: {0}")]
    Socket(#[source] io::Error),

    #[error("sending to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("sending to {target} failed: {source}")]
    Send {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a successful emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Gauge lines sent.
    pub metrics: usize,
    /// Datagrams sent.
    pub datagrams: usize,
    /// Readings that could not be represented (NaN or infinite).
    pub skipped: usize,
}

/// Formats a gauge value. Integral values keep one decimal (`45.0`).
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Groups lines into newline-separated payloads of at most `max_size` bytes.
/// A line longer than `max_size` is sent alone.
pub fn pack_datagrams(lines: &[String], max_size: usize) -> Vec<String> {
    let mut datagrams = Vec::new();
    let mut current = String::new();

    for line in lines {
        if !current.is_empty() && current.len() + 1 + line.len() > max_size {
            datagrams.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

/// Serializes sample sets and transmits them to the collector.
pub struct Emitter<T: Transport> {
    config: EmitterConfig,
    transport: T,
}

impl<T: Transport> Emitter<T> {
    pub fn new(config: &EmitterConfig, transport: T) -> Self {
        Self {
            config: config.clone(),
            transport,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Renders the gauge lines for `set`, in sample order.
    ///
    /// Returns the lines and the number of readings skipped because their
    /// value has no textual form in the protocol.
    pub fn render(&self, set: &SampleSet) -> (Vec<String>, usize) {
        let mut lines = Vec::with_capacity(set.len());
        let mut skipped = 0;

        for reading in &set.readings {
            let name = self.config.metric_name(reading.quantity);
            if !reading.value.is_finite() {
                warn!("Skipping {}: non-finite value {}", name, reading.value);
                skipped += 1;
                continue;
            }
            lines.push(format!("{}:{}|g", name, format_value(reading.value)));
        }

        (lines, skipped)
    }

    /// Sends every reading of `set`. An empty set sends nothing.
    pub fn emit(&mut self, set: &SampleSet) -> Result<EmitReport, EmitError> {
        let (lines, skipped) = self.render(set);
        if lines.is_empty() {
            debug!("Nothing to emit");
            return Ok(EmitReport {
                skipped,
                ..EmitReport::default()
            });
        }

        let deadline = Instant::now() + self.config.timeout;
        let datagrams = pack_datagrams(&lines, MAX_DATAGRAM_SIZE);
        for datagram in &datagrams {
            self.transport.send(datagram.as_bytes(), deadline)?;
        }

        Ok(EmitReport {
            metrics: lines.len(),
            datagrams: datagrams.len(),
            skipped,
        })
    }
}

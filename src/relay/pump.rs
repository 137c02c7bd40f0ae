//! Directional Pump
//!
//! Forwards one direction of a session: read a chunk, run it through the
//! transform pipeline, write the result, repeat until EOF or an error.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use super::engine::RelaySettings;
use super::session::SessionLink;
use super::Direction;
use crate::error::RelayError;
use crate::logging;
use crate::transform::TransformPipeline;

/// Behaviour switches copied from the relay settings
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub buffer_size: usize,
    pub hex: bool,
    pub color: bool,
    /// Keep the opposite direction open after a clean EOF
    pub half_close: bool,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            buffer_size: 0xffff,
            hex: false,
            color: false,
            half_close: true,
        }
    }
}

impl From<&RelaySettings> for PumpOptions {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            hex: settings.hex,
            color: settings.color,
            half_close: settings.half_close,
        }
    }
}

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpEnd {
    /// Source closed cleanly
    Eof,
    /// The session was closed by the opposite pump
    Cancelled,
    ReadError(RelayError),
    WriteError(RelayError),
}

impl PumpEnd {
    pub fn is_error(&self) -> bool {
        matches!(self, PumpEnd::ReadError(_) | PumpEnd::WriteError(_))
    }
}

impl std::fmt::Display for PumpEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpEnd::Eof => f.write_str("EOF"),
            PumpEnd::Cancelled => f.write_str("session closed"),
            PumpEnd::ReadError(e) => write!(f, "read failed: {}", e),
            PumpEnd::WriteError(e) => write!(f, "write failed: {}", e),
        }
    }
}

/// Result of a finished pump
#[derive(Debug)]
pub struct PumpOutcome {
    pub direction: Direction,
    /// Bytes written to the destination
    pub bytes: u64,
    pub end: PumpEnd,
}

/// Unidirectional forwarder for one half of a session
pub struct DirectionalPump<R, W> {
    direction: Direction,
    source: R,
    destination: W,
    pipeline: Arc<TransformPipeline>,
    link: Arc<SessionLink>,
    options: PumpOptions,
}

impl<R, W> DirectionalPump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        direction: Direction,
        source: R,
        destination: W,
        pipeline: Arc<TransformPipeline>,
        link: Arc<SessionLink>,
        options: PumpOptions,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
            pipeline,
            link,
            options,
        }
    }

    /// Forward until the source ends, an I/O error occurs or the session is
    /// closed, then propagate the end downstream.
    pub async fn run(mut self) -> PumpOutcome {
        let direction = self.direction;
        let mut closed = self.link.subscribe();
        let mut buf = BytesMut::with_capacity(self.options.buffer_size.max(1));
        let mut forwarded: u64 = 0;

        let end = loop {
            buf.clear();

            let read = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break PumpEnd::Cancelled,
                read = self.source.read_buf(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break PumpEnd::Eof,
                Ok(n) => n,
                Err(e) => break PumpEnd::ReadError(RelayError::Transport(e)),
            };

            let chunk = self.pipeline.apply(&buf[..n]);
            self.log_chunk(n, &chunk);

            let destination = &mut self.destination;
            let written = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break PumpEnd::Cancelled,
                written = async {
                    destination.write_all(&chunk).await?;
                    destination.flush().await
                } => written,
            };

            if let Err(e) = written {
                break PumpEnd::WriteError(RelayError::Transport(e));
            }

            forwarded += chunk.len() as u64;
            self.link.record(direction, chunk.len());
        };

        match &end {
            PumpEnd::Eof => info!("{} {} closed the connection", direction, direction.source()),
            PumpEnd::Cancelled => debug!("{} stopped, session closed", direction),
            PumpEnd::ReadError(e) => warn!("{} Read from {} failed: {}", direction, direction.source(), e),
            PumpEnd::WriteError(e) => warn!("{} Write to {} failed: {}", direction, direction.destination(), e),
        }

        if end.is_error() || !self.options.half_close {
            // Full teardown: the streams close once both pumps drop their halves.
            self.link.close();
        } else if matches!(end, PumpEnd::Eof) {
            // Half-close: propagate EOF and let the other direction drain.
            let destination = &mut self.destination;
            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => {}
                result = destination.shutdown() => {
                    if let Err(e) = result {
                        debug!("{} shutdown of {} failed: {}", direction, direction.destination(), e);
                    }
                }
            }
        }

        PumpOutcome {
            direction,
            bytes: forwarded,
            end,
        }
    }

    fn log_chunk(&self, read: usize, chunk: &[u8]) {
        let direction = self.direction;
        if chunk.len() == read {
            debug!("{} {} bytes {}", direction, read, direction.verb());
        } else {
            debug!(
                "{} {} bytes {} ({} after replacement)",
                direction,
                read,
                direction.verb(),
                chunk.len()
            );
        }

        if self.options.hex {
            info!(
                "{}\n{}",
                logging::dump_header(direction, chunk.len(), self.options.color),
                logging::hex_dump(chunk)
            );
        } else {
            trace!("{}", String::from_utf8_lossy(chunk));
        }
    }
}

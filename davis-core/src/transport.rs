//! Source of raw data transfers.
//!
//! On hardware this is the bulk-transfer pool of the USB data endpoint. The
//! session only needs "give me the next completed transfer", so recordings
//! and in-memory streams plug in the same way.

use std::collections::VecDeque;
use std::io::{self, Read};
use thiserror::Error;

/// Errors raised while waiting for a transfer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// A stream of completed data transfers.
pub trait Transport: Send {
    /// Copies the next completed transfer into `buffer` and returns its
    /// length, or `None` once the stream has ended.
    fn next_transfer(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// Changes the number and size of transfers kept in flight.
    fn reconfigure(&mut self, transfers: u32, transfer_size: u32) -> Result<(), TransportError>;

    /// Releases all in-flight transfers. Called when acquisition stops.
    fn cancel(&mut self);
}

/// Replays a byte stream as fixed-size transfers.
#[derive(Debug)]
pub struct ReaderTransport<R> {
    reader: R,
    transfers: u32,
    transfer_size: usize,
    finished: bool,
}

impl<R: Read + Send> ReaderTransport<R> {
    pub fn new(reader: R, transfer_size: usize) -> Self {
        Self {
            reader,
            transfers: 1,
            transfer_size: transfer_size.max(1),
            finished: false,
        }
    }

    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    pub fn transfers(&self) -> u32 {
        self.transfers
    }
}

impl<R: Read + Send> Transport for ReaderTransport<R> {
    fn next_transfer(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, TransportError> {
        if self.finished {
            return Ok(None);
        }

        let want = self.transfer_size.min(buffer.len());
        let mut filled = 0;

        // Fill the whole transfer unless the stream ends first.
        while filled < want {
            match self.reader.read(&mut buffer[filled..want]) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(filled))
        }
    }

    fn reconfigure(&mut self, transfers: u32, transfer_size: u32) -> Result<(), TransportError> {
        if transfers == 0 || transfer_size == 0 {
            return Err(TransportError::Transfer(format!(
                "invalid transfer setup: {} x {} bytes",
                transfers, transfer_size
            )));
        }
        self.transfers = transfers;
        self.transfer_size = transfer_size as usize;
        Ok(())
    }

    fn cancel(&mut self) {
        self.finished = true;
    }
}

/// Hands out pre-recorded transfers with their original boundaries.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    transfers: VecDeque<Vec<u8>>,
    reconfigured: Vec<(u32, u32)>,
}

impl MemoryTransport {
    pub fn new<I>(transfers: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            transfers: transfers.into_iter().collect(),
            reconfigured: Vec::new(),
        }
    }

    /// Transfers not yet consumed.
    pub fn remaining(&self) -> usize {
        self.transfers.len()
    }

    /// Every `(transfers, size)` pair applied through `reconfigure`.
    pub fn reconfigurations(&self) -> &[(u32, u32)] {
        &self.reconfigured
    }
}

impl Transport for MemoryTransport {
    fn next_transfer(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let Some(transfer) = self.transfers.pop_front() else {
            return Ok(None);
        };

        if transfer.len() > buffer.len() {
            return Err(TransportError::Transfer(format!(
                "transfer of {} bytes exceeds buffer of {} bytes",
                transfer.len(),
                buffer.len()
            )));
        }

        buffer[..transfer.len()].copy_from_slice(&transfer);
        Ok(Some(transfer.len()))
    }

    fn reconfigure(&mut self, transfers: u32, transfer_size: u32) -> Result<(), TransportError> {
        self.reconfigured.push((transfers, transfer_size));
        Ok(())
    }

    fn cancel(&mut self) {
        self.transfers.clear();
    }
}

//! Windowed chunk-transfer state machines.
//!
//! The sender keeps at most `window` unacknowledged chunks in flight so
//! `chunk_size * window` bounds the data buffered inside the channel; the
//! receiver acknowledges once per window, which is the only flow-control
//! mechanism in the protocol.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use peerdrop_core::{TransferConfig, calc_progress};

use crate::PeerError;

/// Send-side window accounting. Pure state; the caller performs the
/// actual reads and channel writes.
#[derive(Debug)]
pub struct SendWindow {
    chunk_size: usize,
    window: u32,
    total: u64,
    read_offset: u64,
    outstanding: u32,
}

impl SendWindow {
    pub fn new(config: &TransferConfig, total: u64) -> Self {
        Self {
            chunk_size: config.chunk_size,
            window: config.window,
            total,
            read_offset: 0,
            outstanding: 0,
        }
    }

    /// The next `(offset, len)` slice to read and send, or `None` while
    /// the window is full or the file is exhausted.
    pub fn next_slice(&self) -> Option<(u64, usize)> {
        if self.read_offset >= self.total || self.outstanding >= self.window {
            return None;
        }
        let remaining = self.total - self.read_offset;
        let len = remaining.min(self.chunk_size as u64) as usize;
        Some((self.read_offset, len))
    }

    pub fn record_sent(&mut self, len: usize) {
        self.read_offset += len as u64;
        self.outstanding += 1;
    }

    /// Receiver acknowledgment: the whole window is released.
    pub fn acknowledge(&mut self) {
        self.outstanding = 0;
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn bytes_sent(&self) -> u64 {
        self.read_offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.read_offset >= self.total
    }

    pub fn progress(&self) -> u8 {
        calc_progress(self.read_offset, self.total)
    }
}

/// What one received chunk produced. On a window-aligned final chunk both
/// fields are set: the window's progress acknowledgment goes out before
/// the finished acknowledgment.
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    pub progress_ack: Option<u8>,
    pub finished: Option<Bytes>,
}

/// Receive-side reassembly buffer and acknowledgment cadence.
#[derive(Debug)]
pub struct ReceiveBuffer {
    window: u32,
    total: u64,
    slice_counter: u32,
    received_size: u64,
    chunks: Vec<Bytes>,
}

impl ReceiveBuffer {
    pub fn new(config: &TransferConfig, total: u64) -> Self {
        Self {
            window: config.window,
            total,
            slice_counter: 0,
            received_size: 0,
            chunks: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<ReceiveOutcome, PeerError> {
        let new_size = self.received_size + chunk.len() as u64;
        if new_size > self.total {
            return Err(PeerError::ProtocolViolation(format!(
                "received {new_size} bytes for a {} byte file",
                self.total
            )));
        }

        self.received_size = new_size;
        self.chunks.push(chunk);
        self.slice_counter += 1;

        let mut outcome = ReceiveOutcome::default();
        if self.slice_counter == self.window {
            self.slice_counter = 0;
            outcome.progress_ack = Some(calc_progress(self.received_size, self.total));
        }
        if self.received_size == self.total {
            outcome.finished = Some(self.assemble());
        }
        Ok(outcome)
    }

    pub fn received_size(&self) -> u64 {
        self.received_size
    }

    fn assemble(&mut self) -> Bytes {
        let mut assembled = BytesMut::with_capacity(self.received_size as usize);
        for chunk in self.chunks.drain(..) {
            assembled.extend_from_slice(&chunk);
        }
        assembled.freeze()
    }
}

/// Transfer speed estimate, sampled once per acknowledgment window: a full
/// window's bytes divided by the time since the previous sample. The first
/// sample has no baseline and reports zero.
#[derive(Debug)]
pub struct SpeedGauge {
    window_bytes: u64,
    last_sample: Option<Instant>,
}

impl SpeedGauge {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            window_bytes: config.window_bytes(),
            last_sample: None,
        }
    }

    pub fn sample(&mut self, now: Instant) -> u64 {
        let speed = match self.last_sample {
            None => 0,
            Some(previous) => {
                let elapsed_ms = now.duration_since(previous).as_millis().max(1) as u64;
                self.window_bytes * 1000 / elapsed_ms
            }
        };
        self.last_sample = Some(now);
        speed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(chunk_size: usize, window: u32) -> TransferConfig {
        TransferConfig::new(chunk_size, window).unwrap()
    }

    #[test]
    fn window_bound_is_never_exceeded() {
        let config = config(16 * 1024, 16);
        let mut window = SendWindow::new(&config, 2 * 1024 * 1024);

        let mut sent = 0;
        while let Some((offset, len)) = window.next_slice() {
            assert_eq!(offset, sent as u64 * 16 * 1024);
            assert_eq!(len, 16 * 1024);
            window.record_sent(len);
            sent += 1;
        }
        assert_eq!(sent, 16);
        assert_eq!(window.outstanding(), 16);
        assert!(window.next_slice().is_none());

        window.acknowledge();
        assert_eq!(window.outstanding(), 0);
        assert!(window.next_slice().is_some());
    }

    #[test]
    fn sender_resumes_from_read_offset_and_exhausts() {
        let config = config(1024, 4);
        let mut window = SendWindow::new(&config, 10 * 1024);

        let mut offsets = Vec::new();
        loop {
            while let Some((offset, len)) = window.next_slice() {
                offsets.push((offset, len));
                window.record_sent(len);
            }
            if window.is_exhausted() {
                break;
            }
            window.acknowledge();
        }

        assert_eq!(offsets.len(), 10);
        assert_eq!(offsets.last().copied(), Some((9 * 1024, 1024)));
        assert_eq!(window.progress(), 100);
        assert!(window.next_slice().is_none());
    }

    #[test]
    fn short_final_chunk() {
        let config = config(1024, 4);
        let mut window = SendWindow::new(&config, 2500);

        assert_eq!(window.next_slice(), Some((0, 1024)));
        window.record_sent(1024);
        assert_eq!(window.next_slice(), Some((1024, 1024)));
        window.record_sent(1024);
        assert_eq!(window.next_slice(), Some((2048, 452)));
        window.record_sent(452);
        assert!(window.is_exhausted());
    }

    #[test]
    fn two_mib_file_yields_eight_progress_acks_then_finished() {
        let config = config(16 * 1024, 16);
        let total = 2 * 1024 * 1024_u64;
        let mut buffer = ReceiveBuffer::new(&config, total);

        let chunk = Bytes::from(vec![7_u8; 16 * 1024]);
        let mut progress_acks = Vec::new();
        let mut finished = None;
        for _ in 0..128 {
            let outcome = buffer.push(chunk.clone()).unwrap();
            if let Some(progress) = outcome.progress_ack {
                progress_acks.push(progress);
            }
            if let Some(data) = outcome.finished {
                finished = Some(data);
            }
        }

        assert_eq!(progress_acks.len(), 8);
        assert_eq!(progress_acks.first().copied(), Some(13)); // 256 KiB of 2 MiB
        assert_eq!(progress_acks.last().copied(), Some(100));
        let finished = finished.expect("transfer finished");
        assert_eq!(finished.len() as u64, total);

        // Progress is monotone non-decreasing.
        assert!(progress_acks.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn reassembly_preserves_content_and_length() {
        let config = config(7, 3);
        let payload: Vec<u8> = (0..100_u8).collect();
        let mut buffer = ReceiveBuffer::new(&config, payload.len() as u64);

        let mut finished = None;
        for chunk in payload.chunks(7) {
            let outcome = buffer.push(Bytes::copy_from_slice(chunk)).unwrap();
            if let Some(data) = outcome.finished {
                finished = Some(data);
            }
        }

        let assembled = finished.expect("all chunks delivered");
        assert_eq!(assembled.as_ref(), payload.as_slice());
    }

    #[test]
    fn oversized_delivery_is_a_protocol_violation() {
        let config = config(8, 2);
        let mut buffer = ReceiveBuffer::new(&config, 10);

        buffer.push(Bytes::from_static(b"12345678")).unwrap();
        let err = buffer.push(Bytes::from_static(b"too much")).unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation(_)));
    }

    #[test]
    fn sub_window_file_finishes_without_progress_ack() {
        let config = config(16 * 1024, 16);
        let mut buffer = ReceiveBuffer::new(&config, 10 * 1024);

        let outcome = buffer.push(Bytes::from(vec![1_u8; 10 * 1024])).unwrap();
        assert!(outcome.progress_ack.is_none());
        assert!(outcome.finished.is_some());
    }

    #[test]
    fn first_speed_sample_is_zero() {
        let config = config(16 * 1024, 16);
        let mut gauge = SpeedGauge::new(&config);

        let start = Instant::now();
        assert_eq!(gauge.sample(start), 0);

        // 256 KiB window over 500 ms is 512 KiB/s.
        let speed = gauge.sample(start + Duration::from_millis(500));
        assert_eq!(speed, 256 * 1024 * 2);
    }
}

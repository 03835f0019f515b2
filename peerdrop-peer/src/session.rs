//! Per-peer transfer session: the bundle of negotiation, channel and
//! engine state that lives from commit/accept until the transfer ends.

use bytes::{Bytes, BytesMut};
use peerdrop_core::{FileMeta, PeerId, TransferConfig};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::channel::{ByteChannel, ChannelEvents};
use crate::engine::{ReceiveBuffer, SendWindow, SpeedGauge};
use crate::negotiation::Negotiation;
use crate::task::{Direction, TaskId};
use crate::transport::Transport;

/// Random-access chunk reads over an open file.
#[derive(Debug)]
pub struct ChunkFile {
    file: File,
}

impl ChunkFile {
    pub async fn open(path: &std::path::Path) -> std::io::Result<(Self, u64)> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((Self { file }, size))
    }

    pub async fn read_chunk(&mut self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }
}

/// Where the transfer's bytes come from.
pub enum FileSource {
    /// Send side: an opened local file.
    LocalFile(ChunkFile),
    /// Receive side: only the announced metadata until bytes arrive.
    RemoteDescriptor(FileMeta),
}

pub struct TransferSession<T: Transport> {
    pub remote_peer_id: PeerId,
    pub direction: Direction,
    pub file_meta: FileMeta,
    pub source: FileSource,
    pub task_id: TaskId,
    pub negotiation: Option<Negotiation<T>>,
    pub channel: Option<ByteChannel>,
    pub events: Option<ChannelEvents>,
    pub send_window: Option<SendWindow>,
    pub receive: Option<ReceiveBuffer>,
    pub speed: SpeedGauge,
}

impl<T: Transport> TransferSession<T> {
    pub fn new_send(
        remote_peer_id: PeerId,
        file_meta: FileMeta,
        file: ChunkFile,
        task_id: TaskId,
        config: &TransferConfig,
    ) -> Self {
        Self {
            remote_peer_id,
            direction: Direction::Send,
            send_window: Some(SendWindow::new(config, file_meta.size)),
            receive: None,
            source: FileSource::LocalFile(file),
            speed: SpeedGauge::new(config),
            file_meta,
            task_id,
            negotiation: None,
            channel: None,
            events: None,
        }
    }

    pub fn new_receive(
        remote_peer_id: PeerId,
        file_meta: FileMeta,
        task_id: TaskId,
        config: &TransferConfig,
    ) -> Self {
        Self {
            remote_peer_id,
            direction: Direction::Receive,
            send_window: None,
            receive: Some(ReceiveBuffer::new(config, file_meta.size)),
            source: FileSource::RemoteDescriptor(file_meta.clone()),
            speed: SpeedGauge::new(config),
            file_meta,
            task_id,
            negotiation: None,
            channel: None,
            events: None,
        }
    }

    /// Pulls the channel out of the negotiation once the transport
    /// handshake has completed. Returns true when the channel attached.
    pub fn try_attach_channel(&mut self) -> bool {
        if self.channel.is_some() {
            return true;
        }
        let Some(negotiation) = self.negotiation.as_mut() else {
            return false;
        };
        match negotiation.take_channel() {
            Some((channel, events)) => {
                self.channel = Some(channel);
                self.events = Some(events);
                true
            }
            None => false,
        }
    }

    /// Tears down channel and transport. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.events = None;
        if let Some(negotiation) = self.negotiation.as_mut() {
            negotiation.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn chunk_file_reads_exact_slices() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..=255_u8).cycle().take(1000).collect();
        tmp.write_all(&payload).unwrap();
        tmp.flush().unwrap();

        let (mut file, size) = ChunkFile::open(tmp.path()).await.unwrap();
        assert_eq!(size, 1000);

        let head = file.read_chunk(0, 256).await.unwrap();
        assert_eq!(head.as_ref(), &payload[..256]);

        let tail = file.read_chunk(768, 256).await.unwrap();
        assert_eq!(tail.len(), 232);
        assert_eq!(tail.as_ref(), &payload[768..]);
    }

    #[tokio::test]
    async fn read_past_end_is_empty() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"short").unwrap();
        tmp.flush().unwrap();

        let (mut file, _size) = ChunkFile::open(tmp.path()).await.unwrap();
        let chunk = file.read_chunk(100, 16).await.unwrap();
        assert!(chunk.is_empty());
    }
}

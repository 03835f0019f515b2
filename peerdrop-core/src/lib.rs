use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bytes per chunk read from the source file.
pub const CHUNK_SIZE: usize = 256 * 1024;
/// Default chunks the sender may have in flight before an acknowledgment.
pub const WINDOW: u32 = 16;
/// The data channel buffers at most 16 MiB internally, so
/// `chunk_size * window` of any config must stay below this.
pub const MAX_CHANNEL_BUFFER_BYTES: usize = 16 * 1024 * 1024;
/// Signaling messages are small (roster, descriptors, acks); anything
/// larger is malformed or abusive.
pub const MAX_SIGNAL_MESSAGE_BYTES: usize = 64 * 1024;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_MIME_LEN: usize = 128;

pub type PeerId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NameAnnouncement {
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub remote_peer_id: PeerId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// A relayed [`SendRequest`]: `remote_peer_id` has been rewritten to the
/// sender's id and the sender's display name attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingOffer {
    pub remote_peer_id: PeerId,
    pub remote_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

impl IncomingOffer {
    pub fn file_meta(&self) -> FileMeta {
        FileMeta {
            name: self.file_name.clone(),
            size: self.file_size,
            mime_type: self.mime_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveReply {
    pub remote_peer_id: PeerId,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DescPayload {
    pub remote_peer_id: PeerId,
    pub desc: SessionDescription,
}

/// A `candidate` of `None` is a no-op end-of-candidates signal, not an
/// error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub remote_peer_id: PeerId,
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferPhase {
    Finished,
    InProgress,
}

/// Receiver acknowledgment driving the sender's window: `InProgress`
/// releases the next window, `Finished` completes the transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub remote_peer_id: PeerId,
    pub state: TransferPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AbortPayload {
    pub remote_peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub reason: String,
}

/// Messages a peer sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Name(NameAnnouncement),
    Send(SendRequest),
    Receive(ReceiveReply),
    Desc(DescPayload),
    Candidate(CandidatePayload),
    ReceiveState(TransferStatus),
    Abort(AbortPayload),
}

impl ClientMessage {
    /// Target peer of a relayed message; `None` for registration.
    pub fn remote_peer_id(&self) -> Option<&PeerId> {
        match self {
            ClientMessage::Name(_) => None,
            ClientMessage::Send(payload) => Some(&payload.remote_peer_id),
            ClientMessage::Receive(payload) => Some(&payload.remote_peer_id),
            ClientMessage::Desc(payload) => Some(&payload.remote_peer_id),
            ClientMessage::Candidate(payload) => Some(&payload.remote_peer_id),
            ClientMessage::ReceiveState(payload) => Some(&payload.remote_peer_id),
            ClientMessage::Abort(payload) => Some(&payload.remote_peer_id),
        }
    }
}

/// Messages the relay sends to a peer. Relayed variants always carry the
/// originating peer's id in `remote_peer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Users(Vec<PeerInfo>),
    ConfirmReceive(IncomingOffer),
    ConfirmSend(ReceiveReply),
    Desc(DescPayload),
    Candidate(CandidatePayload),
    ReceiveState(TransferStatus),
    Abort(AbortPayload),
    Error(ErrorInfo),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("display name must be non-empty and <= {MAX_DISPLAY_NAME_LEN} chars")]
    InvalidDisplayName,
    #[error("invalid file metadata: {0}")]
    InvalidFileMeta(String),
    #[error("invalid transfer config: {0}")]
    InvalidTransferConfig(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Chunking parameters for one transfer. The product of the two must stay
/// under the channel's 16 MiB internal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub window: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            window: WINDOW,
        }
    }
}

impl TransferConfig {
    pub fn new(chunk_size: usize, window: u32) -> Result<Self, CoreError> {
        let config = Self { chunk_size, window };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.chunk_size == 0 {
            return Err(CoreError::InvalidTransferConfig(
                "chunk size must be non-zero".to_owned(),
            ));
        }
        if self.window == 0 {
            return Err(CoreError::InvalidTransferConfig(
                "window must be non-zero".to_owned(),
            ));
        }
        let in_flight = self
            .chunk_size
            .checked_mul(self.window as usize)
            .filter(|bytes| *bytes <= MAX_CHANNEL_BUFFER_BYTES);
        if in_flight.is_none() {
            return Err(CoreError::InvalidTransferConfig(format!(
                "chunk_size * window exceeds the {MAX_CHANNEL_BUFFER_BYTES} byte channel buffer"
            )));
        }
        Ok(())
    }

    /// Bytes acknowledged per full window, the basis for speed sampling.
    pub fn window_bytes(&self) -> u64 {
        self.chunk_size as u64 * u64::from(self.window)
    }
}

pub fn encode_client(message: &ClientMessage) -> Result<String, CoreError> {
    serde_json::to_string(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_client(text: &str) -> Result<ClientMessage, CoreError> {
    serde_json::from_str(text).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn encode_server(message: &ServerMessage) -> Result<String, CoreError> {
    serde_json::to_string(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_server(text: &str) -> Result<ServerMessage, CoreError> {
    serde_json::from_str(text).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Integer transfer progress, `round(current / total * 100)` clamped to
/// [0, 100].
pub fn calc_progress(current_bytes: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let percent = (current_bytes as f64 / total_bytes as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

pub fn validate_display_name(name: &str) -> Result<(), CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_DISPLAY_NAME_LEN {
        return Err(CoreError::InvalidDisplayName);
    }
    Ok(())
}

pub fn validate_file_meta(meta: &FileMeta) -> Result<(), CoreError> {
    if meta.name.trim().is_empty() {
        return Err(CoreError::InvalidFileMeta(
            "file name must be non-empty".to_owned(),
        ));
    }
    if meta.size == 0 {
        return Err(CoreError::InvalidFileMeta(
            "empty files cannot be transferred".to_owned(),
        ));
    }
    if meta.mime_type.len() > MAX_MIME_LEN {
        return Err(CoreError::InvalidFileMeta(format!(
            "MIME type exceeds {MAX_MIME_LEN} chars"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_wire_shape() {
        let message = ClientMessage::Send(SendRequest {
            remote_peer_id: "peer-b".to_owned(),
            file_name: "notes.txt".to_owned(),
            file_size: 1024,
            mime_type: "text/plain".to_owned(),
        });
        let text = encode_client(&message).unwrap();
        assert!(text.contains("\"type\":\"send\""));
        assert!(text.contains("\"remotePeerId\":\"peer-b\""));
        assert!(text.contains("\"fileName\":\"notes.txt\""));
        assert_eq!(decode_client(&text).unwrap(), message);
    }

    #[test]
    fn receive_state_wire_shape() {
        let message = ServerMessage::ReceiveState(TransferStatus {
            remote_peer_id: "peer-a".to_owned(),
            state: TransferPhase::InProgress,
            progress: Some(42),
        });
        let text = encode_server(&message).unwrap();
        assert!(text.contains("\"type\":\"receiveState\""));
        assert!(text.contains("\"state\":\"inProgress\""));
        assert_eq!(decode_server(&text).unwrap(), message);

        let finished = ServerMessage::ReceiveState(TransferStatus {
            remote_peer_id: "peer-a".to_owned(),
            state: TransferPhase::Finished,
            progress: None,
        });
        let text = encode_server(&finished).unwrap();
        assert!(text.contains("\"state\":\"finished\""));
        assert!(!text.contains("progress"));
    }

    #[test]
    fn null_candidate_roundtrip() {
        let message = ClientMessage::Candidate(CandidatePayload {
            remote_peer_id: "peer-b".to_owned(),
            candidate: None,
        });
        let text = encode_client(&message).unwrap();
        assert!(text.contains("\"candidate\":null"));
        assert_eq!(decode_client(&text).unwrap(), message);
    }

    #[test]
    fn remote_peer_id_extraction() {
        let name = ClientMessage::Name(NameAnnouncement {
            display_name: "alice".to_owned(),
        });
        assert_eq!(name.remote_peer_id(), None);

        let abort = ClientMessage::Abort(AbortPayload {
            remote_peer_id: "peer-b".to_owned(),
        });
        assert_eq!(abort.remote_peer_id().map(String::as_str), Some("peer-b"));
    }

    #[test]
    fn progress_rounds_and_clamps() {
        assert_eq!(calc_progress(0, 200), 0);
        assert_eq!(calc_progress(1, 200), 1); // 0.5 rounds up
        assert_eq!(calc_progress(100, 200), 50);
        assert_eq!(calc_progress(199, 200), 100); // 99.5 rounds up
        assert_eq!(calc_progress(200, 200), 100);
        assert_eq!(calc_progress(300, 200), 100);
    }

    #[test]
    fn default_config_fits_channel_buffer() {
        let config = TransferConfig::default();
        config.validate().unwrap();
        assert!(config.window_bytes() <= MAX_CHANNEL_BUFFER_BYTES as u64);
    }

    #[test]
    fn oversized_config_is_rejected() {
        let err = TransferConfig::new(2 * 1024 * 1024, 16).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransferConfig(_)));
        assert!(TransferConfig::new(0, 16).is_err());
        assert!(TransferConfig::new(1024, 0).is_err());
    }

    #[test]
    fn file_meta_validation() {
        let mut meta = FileMeta {
            name: "photo.jpg".to_owned(),
            size: 10,
            mime_type: "image/jpeg".to_owned(),
        };
        validate_file_meta(&meta).unwrap();

        meta.size = 0;
        assert!(validate_file_meta(&meta).is_err());

        meta.size = 10;
        meta.name = "  ".to_owned();
        assert!(validate_file_meta(&meta).is_err());
    }

    #[test]
    fn display_name_validation() {
        validate_display_name("alice").unwrap();
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_DISPLAY_NAME_LEN + 1)).is_err());
    }
}

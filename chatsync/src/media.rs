//! Media pipeline: file attachments, voice capture, and duration probing.
//!
//! Two capture paths feed one shared send sequence. A file attachment gets a
//! local, network-free preview and is uploaded only when the user sends; a
//! voice clip flows from the recorder straight into the same upload step with
//! no review stage. Upload failure aborts the whole send -- no text-only
//! fallback message is ever emitted for a send that had media attached.

use tokio::time::Duration;

use chatsync_proto::api::{content_kind_for_extension, file_extension};
use chatsync_proto::message::{ClientTag, ContentKind};

/// Errors raised by the media pipeline.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The single upload attempt failed; the send is aborted.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The file extension maps to no supported content kind.
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    /// The recorder produced no audio.
    #[error("voice capture is empty")]
    EmptyCapture,

    /// A recorder operation was invalid in the current state.
    #[error("recorder is not in the required state for this operation")]
    InvalidState,
}

/// A file selected by the user, held locally until send.
#[derive(Debug, Clone)]
pub struct FileAttachment {
    /// Original filename.
    pub filename: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
}

/// Local preview descriptor, generated without any network traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPreview {
    /// Original filename.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Content kind the file would be sent as, if supported.
    pub kind: Option<ContentKind>,
}

impl FileAttachment {
    /// Wraps a selected file.
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// The content kind implied by the file extension.
    #[must_use]
    pub fn kind(&self) -> Option<ContentKind> {
        file_extension(&self.filename).and_then(|ext| content_kind_for_extension(&ext))
    }

    /// Builds the local preview. No message exists yet at this point.
    #[must_use]
    pub fn preview(&self) -> AttachmentPreview {
        AttachmentPreview {
            filename: self.filename.clone(),
            size: self.bytes.len() as u64,
            kind: self.kind(),
        }
    }
}

/// Voice recorder state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Not recording.
    Idle,
    /// Capturing audio.
    Recording,
    /// Capture finished; the clip has been handed off.
    Stopped,
}

/// Three-state voice capture: `Idle -> Recording -> Stopped`.
///
/// Stopping hands the clip to the shared upload-then-emit sequence without a
/// user-mediated review step. Starting again from `Stopped` begins a fresh
/// capture.
#[derive(Debug)]
pub struct VoiceRecorder {
    state: RecorderState,
    buffer: Vec<u8>,
}

impl VoiceRecorder {
    /// Creates an idle recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RecorderState::Idle,
            buffer: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RecorderState {
        self.state
    }

    /// Begins capturing. Valid from `Idle` or `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::InvalidState`] if already recording.
    pub fn start(&mut self) -> Result<(), MediaError> {
        if self.state == RecorderState::Recording {
            return Err(MediaError::InvalidState);
        }
        self.buffer.clear();
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Appends captured audio bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::InvalidState`] when not recording.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        if self.state != RecorderState::Recording {
            return Err(MediaError::InvalidState);
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Stops capturing and returns the clip as a voice-note attachment.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::InvalidState`] when not recording, or
    /// [`MediaError::EmptyCapture`] if nothing was captured.
    pub fn stop(&mut self) -> Result<FileAttachment, MediaError> {
        if self.state != RecorderState::Recording {
            return Err(MediaError::InvalidState);
        }
        self.state = RecorderState::Stopped;
        if self.buffer.is_empty() {
            return Err(MediaError::EmptyCapture);
        }
        Ok(FileAttachment::new(
            "voice-note.wav",
            std::mem::take(&mut self.buffer),
        ))
    }
}

impl Default for VoiceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the duration of a captured clip from its encoded bytes.
///
/// Probing can be arbitrarily slow (decoding), so callers race it against a
/// deadline via [`resolve_duration`] -- a send is never blocked indefinitely
/// on this field.
pub trait DurationProbe: Send + Sync {
    /// Attempts to determine the clip duration in milliseconds.
    fn probe(&self, bytes: &[u8]) -> impl std::future::Future<Output = Option<u64>> + Send;
}

/// Duration probe for PCM WAV clips, reading the RIFF header.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDurationProbe;

impl DurationProbe for WavDurationProbe {
    async fn probe(&self, bytes: &[u8]) -> Option<u64> {
        // Canonical 44-byte PCM WAV header: byte rate at offset 28.
        if bytes.len() < 44 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return None;
        }
        let byte_rate = u32::from_le_bytes(bytes[28..32].try_into().ok()?);
        if byte_rate == 0 {
            return None;
        }
        let data_len = (bytes.len() - 44) as u64;
        Some(data_len * 1000 / u64::from(byte_rate))
    }
}

/// Runs a duration probe under a deadline.
///
/// On timeout the clip is sent with no duration rather than stalling the
/// send.
pub async fn resolve_duration<P: DurationProbe>(
    probe: &P,
    bytes: &[u8],
    deadline: Duration,
) -> Option<u64> {
    match tokio::time::timeout(deadline, probe.probe(bytes)).await {
        Ok(duration) => duration,
        Err(_) => {
            tracing::warn!("duration probe exceeded deadline, sending without duration");
            None
        }
    }
}

/// Lifecycle of a single upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Created, not yet started.
    Pending,
    /// Request in flight.
    Uploading,
    /// Upload succeeded; the media reference is available.
    Uploaded,
    /// Upload failed; the associated send was aborted.
    Failed,
}

/// Tracks one upload, keyed by the correlation tag of the send it backs.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Correlation tag of the send this upload belongs to.
    pub tag: ClientTag,
    /// Filename being uploaded.
    pub filename: String,
    /// Current status.
    pub status: UploadStatus,
}

impl UploadJob {
    /// Creates a pending job.
    pub fn new(tag: ClientTag, filename: impl Into<String>) -> Self {
        Self {
            tag,
            filename: filename.into(),
            status: UploadStatus::Pending,
        }
    }
}

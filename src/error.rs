use thiserror::Error;

/// Failure taxonomy for the voice session core. Room-lifecycle variants are
/// surfaced to the presentation layer verbatim; media variants each carry a
/// distinct remediation path and must never be collapsed into one another.
#[derive(Debug, Error)]
pub enum Error {
    #[error("signaling store error: {0}")]
    Transport(String),

    #[error("a room with that name already exists")]
    NameTaken,

    #[error("could not create the room, please try again")]
    CreateFailed,

    #[error("room not found")]
    NotFound,

    #[error("incorrect password")]
    WrongPassword,

    #[error("room is full ({0}/{0} participants)")]
    RoomFull(usize),

    #[error("only the room owner can delete the room")]
    NotOwner,

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no microphone found")]
    DeviceNotFound,

    #[error("microphone is busy")]
    DeviceBusy,

    #[error("audio capture is not supported on this system")]
    Unsupported,

    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error("voice session is closed")]
    Closed,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors worth another attempt against the backing store.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

//! Client and recording supervisor for HiEasy network DVRs.
//!
//! The device speaks a framed TCP protocol on two ports: an XML command
//! channel (36-byte binary headers, null-terminated bodies) and a media
//! channel delivering H.264 wrapped in a vendor NAL dialect. This crate
//! covers the whole session runtime — login, stream negotiation, heartbeat
//! servicing, media demuxing — plus the segmented on-disk recorder with
//! its upload queue. The HTTP dashboard and the OAuth device flow live
//! outside this crate and consume it as a library.

// Library modules
pub mod auth;
pub mod config_client;
pub mod constants;
pub mod error;
pub mod media;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod uploader;

// Re-export commonly used types
pub use auth::{HashOracle, HelperHashOracle};
pub use config_client::{config_type, ConfigClient, ConfigRecord, NamedConfig, CONFIG_TYPES};
pub use error::{SessionError, SessionResult};
pub use media::{extract_h264, MediaStream, CODEC_H264};
pub use recorder::{
    DiskInfo, RecorderConfig, RecorderConfigUpdate, RecordingEntry, Supervisor, SupervisorStatus,
};
pub use session::{DvrSession, Frames, SessionConfig, SessionState};
pub use uploader::{DriveUploader, RemoteFile, Uploader};

//! Shared wire types for the tabsync replication protocol.
//!
//! This crate defines the JSON frames exchanged between the sync server and
//! its client replicas, plus the value types those frames carry: log sequence
//! numbers, table changes, and chunk sequencing metadata. Frames are plain
//! JSON objects with a common envelope (`type`, `messageId`, `timestamp`,
//! `clientId`) and a payload tagged by `type`.

#![warn(missing_docs)]

pub mod codec;
pub mod frames;
pub mod lsn;
pub mod types;

pub use codec::{FrameError, decode_frame, encode_frame};
pub use frames::{Frame, FrameKind, FramePayload};
pub use lsn::{Lsn, LsnParseError};
pub use types::*;

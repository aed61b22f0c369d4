// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt, string::FromUtf8Error};

/// An error that occurs while decoding a frame.
///
/// Decoding fails closed: a frame with a tag this version of the protocol
/// doesn't know is rejected rather than mapped onto a guess.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame isn't valid UTF-8.
    InvalidUtf8(FromUtf8Error),

    /// The frame isn't valid JSON.
    Json(serde_json::Error),

    /// The frame doesn't have a `type` tag.
    MissingType {
        /// The frame's sequence number, if it could be read.
        seq: Option<u64>,
    },

    /// The frame's `type` tag is not known.
    UnknownMessageType {
        /// The tag that was found.
        message_type: String,

        /// The frame's sequence number, if it could be read.
        seq: Option<u64>,
    },

    /// An outcome frame's `kind` tag is missing or not known.
    UnknownOutcomeKind {
        /// The tag that was found, or `None` if there wasn't one.
        kind: Option<String>,

        /// The frame's sequence number, if it could be read.
        seq: Option<u64>,
    },

    /// The tags were recognized, but the rest of the frame didn't match the
    /// schema.
    Malformed {
        /// The `type` tag of the frame.
        message_type: String,

        /// The frame's sequence number, if it could be read.
        seq: Option<u64>,

        /// The underlying error.
        error: serde_json::Error,
    },
}

impl DecodeError {
    /// Returns the sequence number of the rejected frame, if it could be
    /// read.
    ///
    /// This lets a receiver acknowledge a frame it could not decode.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::InvalidUtf8(_) | Self::Json(_) => None,
            Self::MissingType { seq }
            | Self::UnknownMessageType { seq, .. }
            | Self::UnknownOutcomeKind { seq, .. }
            | Self::Malformed { seq, .. } => *seq,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8(_) => write!(f, "frame is not valid UTF-8"),
            Self::Json(_) => write!(f, "frame is not valid JSON"),
            Self::MissingType { .. } => write!(f, "frame is missing a `type` tag"),
            Self::UnknownMessageType { message_type, .. } => {
                write!(f, "unknown message type `{message_type}`")
            }
            Self::UnknownOutcomeKind {
                kind: Some(kind), ..
            } => {
                write!(f, "unknown outcome kind `{kind}`")
            }
            Self::UnknownOutcomeKind { kind: None, .. } => {
                write!(f, "outcome frame is missing a `kind` tag")
            }
            Self::Malformed { message_type, .. } => {
                write!(f, "malformed `{message_type}` frame")
            }
        }
    }
}

impl error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::InvalidUtf8(error) => Some(error),
            Self::Json(error) | Self::Malformed { error, .. } => Some(error),
            Self::MissingType { .. }
            | Self::UnknownMessageType { .. }
            | Self::UnknownOutcomeKind { .. } => None,
        }
    }
}

/// An error that occurs while encoding a frame.
#[derive(Debug)]
pub struct EncodeError {
    message_type: &'static str,
    error: serde_json::Error,
}

impl EncodeError {
    pub(crate) fn new(message_type: &'static str, error: serde_json::Error) -> Self {
        Self {
            message_type,
            error,
        }
    }

    /// Returns the `type` tag of the message that failed to encode.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode `{}` frame", self.message_type)
    }
}

impl error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

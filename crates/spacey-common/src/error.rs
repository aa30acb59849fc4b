// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the CommonJS compatibility layer

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for CommonJS module operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Which half of a stream an operation waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The read side (`read`, `forEach`, `readInto`, ...)
    Read,
    /// The write side (`flush`, `close`)
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Coarse classification of a [`CommonError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid constructor or option arguments, raised at the call site
    Argument,
    /// Failures reported by the platform while a fiber was suspended
    Io,
    /// Operations that are invalid for the current state of an object
    State,
    /// Features that are deliberately not implemented
    Unsupported,
}

/// Errors that can occur in the CommonJS modules
///
/// Errors are `Clone` so that a single platform failure can be handed to
/// every fiber waiting on the same stream.
#[derive(Debug, Clone, Error)]
pub enum CommonError {
    /// Malformed arguments
    #[error("Illegal argument: {0}")]
    Argument(String),

    /// Charset name that could not be resolved
    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// Platform I/O failure
    #[error("{message}")]
    Io {
        /// Kind reported by the operating system
        kind: io::ErrorKind,
        /// Human readable description
        message: String,
    },

    /// An operation raced a timer and lost
    #[error("Operation timed out")]
    Timeout,

    /// Read attempted on a stream without a read side
    #[error("Stream is not readable")]
    NotReadable,

    /// Write attempted on a stream without a write side
    #[error("Stream is not writable")]
    NotWritable,

    /// Operation on a closed stream
    #[error("Stream has been closed")]
    Closed,

    /// A second fiber tried to wait on a stream direction that is taken
    #[error("Another fiber is already waiting on the {0} side of this stream")]
    Busy(Direction),

    /// Suspension requested outside of a spawned fiber
    #[error("Not running inside a fiber")]
    NoCurrentFiber,

    /// The event source went away without resuming the fiber
    #[error("Suspended fiber was abandoned before it was resumed")]
    Abandoned,

    /// Generic invalid state
    #[error("Illegal state: {0}")]
    State(String),

    /// Feature that is explicitly not finished
    #[error("Not implemented: {0}")]
    Unsupported(String),

    /// Child process finished unsuccessfully
    #[error("Process error: {0}")]
    Process(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommonError {
    /// Create a new argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a new "not implemented" error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a new state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create an I/O error of the given kind
    pub fn io(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: msg.into(),
        }
    }

    /// Which of the four error classes this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Argument(_) | Self::UnsupportedCharset(_) | Self::Config(_) => {
                ErrorCategory::Argument
            }
            Self::Io { .. } | Self::Timeout | Self::Process(_) => ErrorCategory::Io,
            Self::NotReadable
            | Self::NotWritable
            | Self::Closed
            | Self::Busy(_)
            | Self::NoCurrentFiber
            | Self::Abandoned
            | Self::State(_) => ErrorCategory::State,
            Self::Unsupported(_) => ErrorCategory::Unsupported,
        }
    }

    /// The platform error kind, if this is an I/O error
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { kind, .. } => Some(*kind),
            Self::Timeout => Some(io::ErrorKind::TimedOut),
            _ => None,
        }
    }
}

impl From<io::Error> for CommonError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<nix::Error> for CommonError {
    fn from(err: nix::Error) -> Self {
        Self::from(io::Error::from(err))
    }
}

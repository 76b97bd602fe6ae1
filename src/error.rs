// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Error types for htgs-rt.
//!
//! `Configuration` and `ProtocolViolation` both describe conditions the spec calls
//! fatal, but they differ in who can trigger them: a `Configuration` error is
//! something a graph builder caller did wrong (missing decomposition rule, a
//! zero-capacity pool) and is always returned, never panics. A `ProtocolViolation`
//! (double `producer_finished`, `produce` after termination) is unreachable through
//! the public builder surface — it indicates a bug inside this crate or in a
//! hand-rolled `Task`/`Rule` implementation that talked to a connector directly, so it
//! panics instead of being silently swallowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol violation on connector '{connector}': {detail}")]
    ProtocolViolation { connector: String, detail: String },

    #[error(transparent)]
    User(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Builds the message for a protocol violation and panics with it.
    ///
    /// Protocol violations are programming errors (spec.md §7), not conditions a
    /// caller can recover from, so this never returns.
    pub(crate) fn protocol_violation(connector: impl Into<String>, detail: impl Into<String>) -> ! {
        let err = Error::ProtocolViolation {
            connector: connector.into(),
            detail: detail.into(),
        };
        panic!("{err}");
    }
}

pub type Result<T> = std::result::Result<T, Error>;

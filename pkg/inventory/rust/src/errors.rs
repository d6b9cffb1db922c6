// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not parse socket info: {context}")]
    SocketParsingError { context: String },

    #[error("collection canceled or deadline exceeded")]
    Cancelled,

    #[error("{collector} collector unavailable: {reason}")]
    Unavailable {
        collector: &'static str,
        reason: String,
    },

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("no socket table could be opened under {}", .0.display())]
    SocketTables(PathBuf),

    #[error("request to {endpoint} failed: {reason}")]
    Http { endpoint: String, reason: String },

    #[error("could not decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unavailable(collector: &'static str, reason: impl ToString) -> Self {
        Error::Unavailable {
            collector,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn socket_parsing(context: impl Into<String>) -> Self {
        Error::SocketParsingError {
            context: context.into(),
        }
    }
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt;
use std::io;

/// Broad category of a broker-level error, used to decide its disposition
/// (log-and-continue vs. close-the-connection) at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Encode,
    Decode,
    Send,
    Config,
    Auth,
    Persistence,
    SessionNotFound,
    Bridge,
    Tls,
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn session_not_found(client_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("session not found: {client_id}"),
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::new(ErrorKind::Decode, format!("{err:?}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::new(ErrorKind::Encode, format!("{err:?}"))
    }
}

impl From<codec::VarIntError> for Error {
    fn from(err: codec::VarIntError) -> Self {
        Self::new(ErrorKind::Encode, format!("{err:?}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::new(ErrorKind::WebSocket, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::Config, err.to_string())
    }
}

/// Implements `From<mpsc::error::SendError<$cmd_type>>` for [`Error`], one
/// impl per inter-actor command enum.
#[macro_export]
macro_rules! convert_send_error {
    ($cmd_type: ty) => {
        impl From<tokio::sync::mpsc::error::SendError<$cmd_type>> for $crate::error::Error {
            fn from(err: tokio::sync::mpsc::error::SendError<$cmd_type>) -> Self {
                $crate::error::Error::new(
                    $crate::error::ErrorKind::Send,
                    format!("send failed: {err}"),
                )
            }
        }
    };
}

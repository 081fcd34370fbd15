// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::{DecodeError, EncodeError};

pub use crate::keep_alive::validate_keep_alive;

/// Generate a random alphanumeric string, used to synthesize a client id
/// when a `Fresh` connection requests a clean session with an empty one.
pub fn random_string(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).map(char::from).take(len).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Length of data exceeds 65535 bytes, the Two Byte Integer length limit.
    TooLong,

    /// Contains the NUL character U+0000, disallowed by \[MQTT-1.5.4-2\].
    ContainsNul,
}

/// Validate a string destined for the wire as a UTF-8 Encoded String.
///
/// # Errors
///
/// Returns an error if the string is too long to fit the 16-bit length
/// prefix, or contains the disallowed NUL character.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooLong);
    }
    if s.contains('\u{0}') {
        return Err(StringError::ContainsNul);
    }
    Ok(())
}

/// Validate a byte slice destined for the wire as Binary Data.
///
/// # Errors
///
/// Returns an error if the slice is too long to fit the 16-bit length prefix.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        return Err(EncodeError::TooManyData);
    }
    Ok(())
}

/// Validate a client identifier.
///
/// The wire format imposes no length limit beyond the 16-bit string prefix;
/// the 23-character cap only binds generated ids under MQTT 3.1 and is
/// enforced by the session layer, not here.
///
/// # Errors
///
/// Returns an error if the identifier contains the NUL character.
pub fn validate_client_id(client_id: &str) -> Result<(), DecodeError> {
    if client_id.contains('\u{0}') {
        return Err(DecodeError::InvalidClientId);
    }
    Ok(())
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Username/password authentication against a flat password file.
//!
//! Wire format: one `<user> <password-or-md5-hex>` pair per line. A client
//! authenticates if its presented password equals the stored value, or if
//! the stored value equals the 16-byte MD5 digest of the presented
//! password, hex-encoded.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use openssl::hash::{hash, MessageDigest};

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, Default)]
pub struct PasswordFile {
    entries: HashMap<String, String>,
}

impl PasswordFile {
    /// Load and parse a password file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)
            .map_err(|err| Error::new(ErrorKind::Auth, format!("read {path:?}: {err}")))?;
        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, secret)) = line.split_once(char::is_whitespace) else {
                log::warn!("auth: malformed password-file line {}: {line:?}", lineno + 1);
                continue;
            };
            entries.insert(user.to_string(), secret.trim().to_string());
        }
        Ok(Self { entries })
    }

    /// Check whether `username`/`password` is a valid credential pair.
    #[must_use]
    pub fn authenticate(&self, username: &str, password: &[u8]) -> bool {
        let Some(stored) = self.entries.get(username) else {
            return false;
        };
        if stored.as_bytes() == password {
            return true;
        }
        let Ok(digest) = hash(MessageDigest::md5(), password) else {
            return false;
        };
        let hex_digest = hex_encode(&digest);
        stored.eq_ignore_ascii_case(&hex_digest)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Result of an authentication attempt, driven by [`crate::config::Security`].
#[derive(Debug, Clone)]
pub struct Authenticator {
    allow_anonymous: bool,
    password_file: Option<PasswordFile>,
}

impl Authenticator {
    /// # Errors
    ///
    /// Returns an error if a configured password file cannot be loaded.
    pub fn new(allow_anonymous: bool, password_file_path: Option<&Path>) -> Result<Self, Error> {
        let password_file = password_file_path.map(PasswordFile::load).transpose()?;
        Ok(Self {
            allow_anonymous,
            password_file,
        })
    }

    /// Authenticate a CONNECT request.
    ///
    /// `username`/`password` are `None` when the client omitted them, which
    /// is only acceptable when `allow_anonymous` is set and no password
    /// file requires a username.
    #[must_use]
    pub fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        match (&self.password_file, username, password) {
            (Some(pf), Some(user), Some(pass)) => pf.authenticate(user, pass),
            (Some(_), _, _) => false,
            (None, _, _) => self.allow_anonymous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_file(content: &str) -> tempfile_path::TempPath {
        tempfile_path::TempPath::new(content)
    }

    mod tempfile_path {
        use std::io::Write;
        use std::path::{Path, PathBuf};
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempPath(PathBuf);

        impl TempPath {
            pub fn new(content: &str) -> Self {
                let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!("hebo-auth-test-{}-{unique}", std::process::id()));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(content.as_bytes()).unwrap();
                Self(path)
            }

            pub fn as_path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn test_plaintext_password_matches() {
        let path = write_temp_file("alice secret\n");
        let pf = PasswordFile::load(path.as_path()).unwrap();
        assert!(pf.authenticate("alice", b"secret"));
        assert!(!pf.authenticate("alice", b"wrong"));
        assert!(!pf.authenticate("bob", b"secret"));
    }

    #[test]
    fn test_md5_password_matches() {
        let digest = hash(MessageDigest::md5(), b"secret").unwrap();
        let hex_digest = hex_encode(&digest);
        let path = write_temp_file(&format!("alice {hex_digest}\n"));
        let pf = PasswordFile::load(path.as_path()).unwrap();
        assert!(pf.authenticate("alice", b"secret"));
    }

    #[test]
    fn test_allow_anonymous_without_password_file() {
        let auth = Authenticator::new(true, None).unwrap();
        assert!(auth.authenticate(None, None));
        let auth = Authenticator::new(false, None).unwrap();
        assert!(!auth.authenticate(None, None));
    }
}

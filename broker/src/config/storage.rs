// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Root of the hex-file key-value persistence tree.
///
/// Sessions, retained messages, shared-subscription state and each client's
/// pending-publish queue are stored as flat hex-encoded files rooted here;
/// see `PersistenceStores`.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    /// Persist sessions, retained messages and pending publishes to disk.
    ///
    /// Default is true.
    #[serde(default = "Storage::default_persistence")]
    persistence: bool,

    /// Root directory of the persistence tree.
    ///
    /// Default is "/var/lib/hebo".
    #[serde(default = "Storage::default_root_path")]
    root_path: PathBuf,
}

impl Storage {
    #[must_use]
    pub const fn default_persistence() -> bool {
        true
    }

    #[must_use]
    pub fn default_root_path() -> PathBuf {
        PathBuf::from("/var/lib/hebo")
    }

    #[must_use]
    pub const fn persistence(&self) -> bool {
        self.persistence
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        self.root_path.as_path()
    }

    /// Validate storage config.
    ///
    /// # Errors
    ///
    /// Returns error if `root_path` cannot be created.
    pub fn validate(&self) -> Result<(), Error> {
        if self.persistence {
            fs::create_dir_all(&self.root_path).map_err(|err| {
                Error::new(
                    ErrorKind::Config,
                    format!(
                        "Failed to create storage root_path {:?}, err: {err:?}",
                        &self.root_path
                    ),
                )
            })?;
        }
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            persistence: Self::default_persistence(),
            root_path: Self::default_root_path(),
        }
    }
}

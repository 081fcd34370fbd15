// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use hebo::error::{Error, ErrorKind};

pub struct Server {
    child: Child,
}

impl Server {
    pub fn start(config_file: &str) -> Result<Self, Error> {
        let exec_file = Self::get_exec_file()?;
        let child = Command::new(exec_file)
            .args(["-c", config_file])
            .spawn()
            .map_err(|err| Error::new(ErrorKind::Io, format!("failed to spawn hebo server: {err}")))?;
        // Give the listeners a moment to bind before the test starts connecting.
        std::thread::sleep(Duration::from_millis(500));
        Ok(Self { child })
    }

    pub fn terminate(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn get_exec_file() -> Result<PathBuf, Error> {
        const IN_CURR_DIR: &str = "./target/debug/hebo";
        const IN_PARENT_DIR: &str = "../target/debug/hebo";
        let path = PathBuf::from(IN_CURR_DIR);
        if path.exists() {
            return Ok(path);
        }
        let path = PathBuf::from(IN_PARENT_DIR);
        if path.exists() {
            return Ok(path);
        }
        Err(Error::new(
            ErrorKind::Io,
            "Make sure hebo binary is compiled!",
        ))
    }
}

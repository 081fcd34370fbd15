// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Manages `hebo`'s flat `<user> <password-or-md5-hex>` password file.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use openssl::hash::{hash, MessageDigest};

#[derive(Debug, Parser)]
#[command(name = "hebo-passwd", about = "Manage password files for hebo")]
struct Cli {
    /// Delete the username rather than adding/updating its password.
    #[arg(short, long)]
    delete: bool,

    /// Store the password as its MD5 hex digest rather than in plain text.
    #[arg(short = 'm', long)]
    hashed: bool,

    /// Password file to edit; created if it does not already exist.
    passwordfile: PathBuf,

    /// Username to add, update, or delete.
    username: String,

    /// New password. Required unless `--delete` is given.
    password: Option<String>,
}

fn md5_hex(password: &str) -> String {
    let digest = hash(MessageDigest::md5(), password.as_bytes()).expect("md5 is always available");
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn load_entries(path: &PathBuf) -> Vec<(String, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(user, secret)| (user.to_string(), secret.trim().to_string()))
        .collect()
}

fn save_entries(path: &PathBuf, entries: &[(String, String)]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    for (user, secret) in entries {
        writeln!(file, "{user} {secret}")?;
    }
    Ok(())
}

fn main() {
    std::env::set_var("RUST_LOG", "info");
    env_logger::init();

    let cli = Cli::parse();
    let mut entries = load_entries(&cli.passwordfile);

    if cli.delete {
        let before = entries.len();
        entries.retain(|(user, _)| user != &cli.username);
        if entries.len() == before {
            eprintln!("user {} not found in {}", cli.username, cli.passwordfile.display());
            std::process::exit(1);
        }
    } else {
        let Some(password) = cli.password.as_deref() else {
            eprintln!("a password is required unless --delete is given");
            std::process::exit(1);
        };
        let secret = if cli.hashed { md5_hex(password) } else { password.to_string() };
        if let Some(entry) = entries.iter_mut().find(|(user, _)| user == &cli.username) {
            entry.1 = secret;
        } else {
            entries.push((cli.username.clone(), secret));
        }
    }

    if let Err(err) = save_entries(&cli.passwordfile, &entries) {
        eprintln!("failed to write {}: {err}", cli.passwordfile.display());
        std::process::exit(1);
    }
}

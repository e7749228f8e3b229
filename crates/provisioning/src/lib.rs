// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # LUKS2 provisioning
//!
//! Creates and mutates LUKS2 volumes by driving `cryptsetup`. Every operation
//! is one invocation of the tool, with key material passed over pipes rather
//! than the command line. Use [`luks2::read_header`] to observe the result.
//!
//! The free functions in this crate use a default [`Cryptsetup`]; construct
//! one directly to pick another binary, runtime directory or executor.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use provisioning::{AddKeyOptions, FormatOptions, KdfOptions};
//!
//! let disk = Path::new("disk.img");
//! provisioning::sparsefile::create(disk, 20 * 1024 * 1024)?;
//!
//! let kdf = KdfOptions::default().with_memory_kib(32 * 1024).with_force_iterations(4);
//! provisioning::format(disk, "data", b"first key", &FormatOptions { kdf, ..Default::default() })?;
//! provisioning::add_key(disk, b"first key", b"second key", &AddKeyOptions { kdf, ..Default::default() })?;
//! # Ok::<(), provisioning::Error>(())
//! ```

use std::path::Path;

use luks2::{Priority, Token};

mod errors;
pub use errors::*;

pub mod exec;
pub mod kdf;
pub mod ops;
pub mod sparsefile;

pub use exec::{Executor, Output, Subprocess};
pub use kdf::{KdfOptions, KdfParams};
pub use ops::{AddKeyOptions, Cryptsetup, FormatOptions, ImportTokenOptions, Provisioning, Slot};

/// Create a new LUKS2 volume at `path` protected by `key`
pub fn format(path: impl AsRef<Path>, label: &str, key: &[u8], options: &FormatOptions) -> Result<(), Error> {
    Cryptsetup::new().format(path.as_ref(), label, key, options)
}

/// Add a keyslot for `key`, authenticating with `existing_key`
pub fn add_key(path: impl AsRef<Path>, existing_key: &[u8], key: &[u8], options: &AddKeyOptions) -> Result<(), Error> {
    Cryptsetup::new().add_key(path.as_ref(), existing_key, key, options)
}

/// Erase keyslot `slot`, authenticating with `key`
pub fn kill_slot(path: impl AsRef<Path>, slot: u32, key: &[u8]) -> Result<(), Error> {
    Cryptsetup::new().kill_slot(path.as_ref(), slot, key)
}

/// Change the order in which keyslot `slot` is tried
pub fn set_slot_priority(path: impl AsRef<Path>, slot: u32, priority: Priority) -> Result<(), Error> {
    Cryptsetup::new().set_slot_priority(path.as_ref(), slot, priority)
}

/// Store `token` under the lowest free token ID
pub fn import_token(path: impl AsRef<Path>, token: &Token) -> Result<(), Error> {
    Cryptsetup::new().import_token(path.as_ref(), token, &ImportTokenOptions::default())
}

/// Delete token `id`
pub fn remove_token(path: impl AsRef<Path>, id: u32) -> Result<(), Error> {
    Cryptsetup::new().remove_token(path.as_ref(), id)
}

/// Check that `key` unlocks the volume at `path`
pub fn test_passphrase(path: impl AsRef<Path>, key: &[u8]) -> Result<(), Error> {
    Cryptsetup::new().test_passphrase(path.as_ref(), key, None)
}

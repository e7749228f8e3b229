// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use log::debug;

const SECTOR_SIZE: u64 = 512;

/// Create an empty volume image of `size` bytes without allocating its blocks.
///
/// Existing content is discarded. The image is private to its owner, and can
/// stand in for a block device wherever `cryptsetup` accepts a file. `size`
/// must be a whole number of 512 byte sectors.
pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<File> {
    let path = path.as_ref();
    if size == 0 || size % SECTOR_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("image size {size} is not a whole number of {SECTOR_SIZE} byte sectors"),
        ));
    }

    let image = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    image.set_len(size)?;

    debug!("created {size} byte sparse image {path:?}");
    Ok(image)
}

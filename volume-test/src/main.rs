// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use log::{debug, info};
use std::{env, path::Path};

use luks2::{LockMode, Priority, Reader, Token};
use provisioning::{
    sparsefile, AddKeyOptions, Cryptsetup, FormatOptions, ImportTokenOptions, KdfOptions, Provisioning, Slot,
};

/// Prints a summary of the header currently on disk
fn describe(reader: &Reader, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let header = reader.read(path, LockMode::Blocking)?;
    info!("Header {} (seqid {}), label {:?}", header.uuid, header.sequence_id, header.label);
    for (id, keyslot) in &header.metadata.keyslots {
        let kdf = keyslot
            .kdf
            .as_ref()
            .map(|kdf| format!("{} time={:?} memory={:?}", kdf.kdf_type, kdf.time, kdf.memory))
            .unwrap_or_else(|| "unbound".to_owned());
        info!("  ├─keyslot {id}: {} bytes, priority {}, {kdf}", keyslot.key_size, keyslot.priority);
    }
    for (id, segment) in &header.metadata.segments {
        info!("  ├─segment {id}: {} at {}", segment.encryption, segment.offset);
    }
    for (id, token) in &header.metadata.tokens {
        info!("  └─token {id}: {} for keyslots {:?}", token.token_type, token.keyslots);
    }
    debug!("{}", serde_json::to_string_pretty(&header)?);
    Ok(())
}

/// Demonstrates every provisioning operation against a sparse image:
/// - Formatting with a cheap KDF
/// - Adding a second key
/// - Importing and removing a token
/// - Changing keyslot priority
/// - Killing a keyslot
fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    info!("Starting LUKS2 provisioning demo");

    let work_dir = env::temp_dir().join("volume-test");
    std::fs::create_dir_all(&work_dir)?;
    let image = work_dir.join("volume.img");

    info!("Creating 20MB sparse image file");
    sparsefile::create(&image, 20 * 1024 * 1024)?;

    let reader = Reader::new().with_run_dir(&work_dir);
    let cryptsetup = Cryptsetup::new().with_run_dir(&work_dir);
    let kdf = KdfOptions::default().with_memory_kib(32 * 1024).with_force_iterations(4);

    cryptsetup.format(&image, "volume-test", b"first key", &FormatOptions { kdf, ..Default::default() })?;
    cryptsetup.add_key(
        &image,
        b"first key",
        b"second key",
        &AddKeyOptions { kdf, slot: Slot::Id(3) },
    )?;

    let token = Token::new("volume-test", [0, 3])
        .with_param("generation", 1)?
        .with_bytes("nonce", b"\x00\x01\x02\x03");
    cryptsetup.import_token(&image, &token, &ImportTokenOptions::default())?;
    cryptsetup.set_slot_priority(&image, 3, Priority::High)?;
    describe(&reader, &image)?;

    cryptsetup.remove_token(&image, 0)?;
    cryptsetup.kill_slot(&image, 0, b"second key")?;
    cryptsetup.test_passphrase(&image, b"second key", None)?;
    describe(&reader, &image)?;

    // Clean up resources
    info!("Cleaning up resources");
    std::fs::remove_dir_all(&work_dir)?;

    info!("Demo completed successfully");
    Ok(())
}

// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Metadata mutations
//!
//! Every operation is a single `cryptsetup` invocation, so it either takes
//! effect completely or leaves the header untouched. Read the header again
//! with [`luks2::read_header`] to observe the result.

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use log::{debug, info, trace};
use luks2::{superblock::METADATA_AREA_SIZES, Priority, Token};
use nix::{fcntl::OFlag, sys::stat::Mode, unistd::mkfifo};

use crate::{
    exec::{Executor, Subprocess},
    kdf::{self, KdfOptions, KdfParams},
    Error, InvalidOptions,
};

/// Largest keyslots area `cryptsetup` will create
const MAX_KEYSLOTS_AREA_KIB: u32 = 128 * 1024;

/// Metadata area size used when none is requested
pub const DEFAULT_METADATA_KIB: u32 = 16;

/// Options for [`Provisioning::format`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Cost of the initial keyslot
    pub kdf: KdfOptions,
    /// Size of one metadata area in KiB, [`DEFAULT_METADATA_KIB`] when unset
    pub metadata_kib: Option<u32>,
    /// Size of the keyslots area in KiB. When unset the data segment starts at 16 MiB.
    pub keyslots_area_kib: Option<u32>,
}

impl FormatOptions {
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        self.kdf.validate()?;

        if let Some(kib) = self.metadata_kib {
            if !METADATA_AREA_SIZES.contains(&(u64::from(kib) * 1024)) {
                return Err(InvalidOptions::new("metadata_kib", format!("{kib} KiB is not a LUKS2 metadata size"))
                    .with_advice("use a power of two between 16 and 4096 KiB"));
            }
        }

        if let Some(kib) = self.keyslots_area_kib {
            if kib == 0 || kib % 4 != 0 || kib > MAX_KEYSLOTS_AREA_KIB {
                return Err(InvalidOptions::new("keyslots_area_kib", format!("{kib} KiB is not usable"))
                    .with_advice(format!("use a multiple of 4 KiB up to {MAX_KEYSLOTS_AREA_KIB} KiB")));
            }
        }

        Ok(())
    }
}

/// Keyslot selection for [`Provisioning::add_key`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Slot {
    /// The lowest free keyslot
    #[default]
    Any,
    Id(u32),
}

/// Options for [`Provisioning::add_key`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddKeyOptions {
    /// Cost of the new keyslot
    pub kdf: KdfOptions,
    pub slot: Slot,
}

/// Options for [`Provisioning::import_token`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportTokenOptions {
    /// Token ID to use, the lowest free one when unset
    pub id: Option<u32>,
    /// Overwrite an existing token with the same ID
    pub replace: bool,
}

/// Mutations of LUKS2 metadata, one method per operation
pub trait Provisioning {
    /// Create a new LUKS2 header with a single keyslot for `key`, destroying any prior content
    fn format(&self, path: &Path, label: &str, key: &[u8], options: &FormatOptions) -> Result<(), Error>;

    /// Add a keyslot for `key`, authenticating with `existing_key`
    fn add_key(&self, path: &Path, existing_key: &[u8], key: &[u8], options: &AddKeyOptions) -> Result<(), Error>;

    /// Erase keyslot `slot`, authenticating with `key`
    fn kill_slot(&self, path: &Path, slot: u32, key: &[u8]) -> Result<(), Error>;

    fn set_slot_priority(&self, path: &Path, slot: u32, priority: Priority) -> Result<(), Error>;

    fn import_token(&self, path: &Path, token: &Token, options: &ImportTokenOptions) -> Result<(), Error>;

    fn remove_token(&self, path: &Path, id: u32) -> Result<(), Error>;
}

/// [`Provisioning`] through the `cryptsetup` tool
#[derive(Clone, Debug)]
pub struct Cryptsetup<E = Subprocess> {
    executor: E,
    run_dir: PathBuf,
}

impl Default for Cryptsetup {
    fn default() -> Self {
        Self {
            executor: Subprocess::default(),
            run_dir: PathBuf::from("/run"),
        }
    }
}

impl Cryptsetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `cryptsetup` binary
    pub fn with_binary(self, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor: Subprocess::new(binary),
            ..self
        }
    }
}

impl<E: Executor> Cryptsetup<E> {
    /// Run invocations through another executor
    pub fn with_executor<F: Executor>(self, executor: F) -> Cryptsetup<F> {
        Cryptsetup {
            executor,
            run_dir: self.run_dir,
        }
    }

    /// Create private FIFOs below `run_dir`
    pub fn with_run_dir(self, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ..self
        }
    }

    /// Resolve requested costs into forced parameters
    pub fn calibrate(&self, options: &KdfOptions) -> Result<KdfParams, Error> {
        kdf::calibrate(&self.executor, options)
    }

    /// Check that `key` unlocks the volume, or a specific keyslot of it.
    ///
    /// Nothing is activated or written.
    pub fn test_passphrase(&self, path: &Path, key: &[u8], slot: Option<u32>) -> Result<(), Error> {
        let mut args = args(["open", "--test-passphrase", "--type", "luks2", "--key-file", "-"]);
        if let Some(slot) = slot {
            args.extend([OsString::from("--key-slot"), slot.to_string().into()]);
        }
        args.push(path.into());

        self.executor.run(&args, key)?;
        Ok(())
    }

    // The existing key travels through a FIFO while the new key goes to stdin
    fn run_with_fifo(&self, args: impl FnOnce(&Path) -> Vec<OsString>, fifo_input: &[u8], stdin: &[u8]) -> Result<(), Error> {
        let dir = tempfile::Builder::new().prefix("luks2-").tempdir_in(&self.run_dir)?;
        let fifo = dir.path().join("key");
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
        trace!("created fifo {fifo:?}");

        let args = args(&fifo);
        let (written, result) = thread::scope(|s| {
            let writer = s.spawn(|| write_fifo(&fifo, fifo_input));
            let result = self.executor.run(&args, stdin);

            // A tool that failed early never opened the FIFO; give the writer a reader
            // and discard whatever it still has to write
            if let Ok(mut unblock) = OpenOptions::new()
                .read(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(&fifo)
            {
                drain_fifo(&mut unblock, &writer);
            }
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("fifo writer panicked")));

            (written, result)
        });

        result?;
        written?;
        Ok(())
    }
}

fn write_fifo(fifo: &Path, input: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(fifo)?;
    match file.write_all(input) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        result => result,
    }
}

fn drain_fifo<T>(reader: &mut File, writer: &thread::ScopedJoinHandle<'_, T>) {
    let mut buf = [0u8; 4096];
    while !writer.is_finished() {
        match reader.read(&mut buf) {
            Ok(n) if n > 0 => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // No data yet, or the writer has not opened its end
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }
}

fn args<const N: usize>(fixed: [&str; N]) -> Vec<OsString> {
    fixed.into_iter().map(OsString::from).collect()
}

fn priority_arg(priority: Priority) -> &'static str {
    match priority {
        Priority::Ignore => "ignore",
        Priority::Normal => "normal",
        Priority::High => "prefer",
    }
}

impl<E: Executor> Provisioning for Cryptsetup<E> {
    fn format(&self, path: &Path, label: &str, key: &[u8], options: &FormatOptions) -> Result<(), Error> {
        options.validate()?;
        let params = self.calibrate(&options.kdf)?;
        let metadata_kib = options.metadata_kib.unwrap_or(DEFAULT_METADATA_KIB);

        let mut args = args([
            "-q",
            "luksFormat",
            "--type",
            "luks2",
            "--key-file",
            "-",
            "--cipher",
            "aes-xts-plain64",
            "--key-size",
            "512",
            "--label",
        ]);
        args.push(label.into());
        args.extend(params.args());
        args.extend([OsString::from("--luks2-metadata-size"), format!("{metadata_kib}k").into()]);
        if let Some(kib) = options.keyslots_area_kib {
            args.extend([OsString::from("--luks2-keyslots-size"), format!("{kib}k").into()]);
        }
        args.push(path.into());

        self.executor.run(&args, key)?;
        info!("formatted {path:?} as LUKS2 with label {label:?}");
        Ok(())
    }

    fn add_key(&self, path: &Path, existing_key: &[u8], key: &[u8], options: &AddKeyOptions) -> Result<(), Error> {
        let params = self.calibrate(&options.kdf)?;

        self.run_with_fifo(
            |fifo| {
                let mut args = args(["luksAddKey", "--type", "luks2", "--key-file"]);
                args.push(fifo.into());
                args.extend(params.args());
                if let Slot::Id(slot) = options.slot {
                    args.extend([OsString::from("--key-slot"), slot.to_string().into()]);
                }
                args.extend([OsString::from(path), "-".into()]);
                args
            },
            existing_key,
            key,
        )?;

        info!("added key to {path:?} in slot {:?}", options.slot);
        Ok(())
    }

    fn kill_slot(&self, path: &Path, slot: u32, key: &[u8]) -> Result<(), Error> {
        let mut args = args(["luksKillSlot", "--type", "luks2", "--key-file", "-"]);
        args.extend([OsString::from(path), slot.to_string().into()]);

        self.executor.run(&args, key)?;
        info!("killed keyslot {slot} of {path:?}");
        Ok(())
    }

    fn set_slot_priority(&self, path: &Path, slot: u32, priority: Priority) -> Result<(), Error> {
        let mut args = args(["config", "--priority", priority_arg(priority), "--key-slot"]);
        args.extend([OsString::from(slot.to_string()), path.into()]);

        self.executor.run(&args, &[])?;
        info!("set priority of keyslot {slot} of {path:?} to {priority}");
        Ok(())
    }

    fn import_token(&self, path: &Path, token: &Token, options: &ImportTokenOptions) -> Result<(), Error> {
        if options.replace && options.id.is_none() {
            return Err(InvalidOptions::new("replace", "a token can only be replaced by ID")
                .with_advice("set the token ID to replace")
                .into());
        }

        let json = serde_json::to_vec(token)
            .map_err(|e| InvalidOptions::new("token", format!("cannot encode token: {e}")))?;

        let mut args = args(["token", "import"]);
        if let Some(id) = options.id {
            args.extend([OsString::from("--token-id"), id.to_string().into()]);
        }
        if options.replace {
            args.push("--token-replace".into());
        }
        args.push(path.into());

        debug!("importing {} token for keyslots {:?}", token.token_type, token.keyslots);
        self.executor.run(&args, &json)?;
        info!("imported {} token into {path:?}", token.token_type);
        Ok(())
    }

    fn remove_token(&self, path: &Path, id: u32) -> Result<(), Error> {
        let mut args = args(["token", "remove", "--token-id"]);
        args.extend([OsString::from(id.to_string()), path.into()]);

        self.executor.run(&args, &[])?;
        info!("removed token {id} from {path:?}");
        Ok(())
    }
}

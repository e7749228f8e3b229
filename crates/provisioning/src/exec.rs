// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Invocation of the `cryptsetup` executable
//!
//! Secrets are only ever handed to the tool through its standard input (or a
//! private FIFO, see [`crate::ops`]), never through the argument vector.

use std::{
    ffi::OsString,
    io::{self, Write},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command, Stdio},
    sync::OnceLock,
    thread,
};

use itertools::Itertools;
use log::{debug, trace};
use regex::Regex;

use crate::Error;

/// Diagnostics naming a keyslot or token that does not exist
static NOT_FOUND_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Captured result of one tool invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, or `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// Signal that terminated the process
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs the provisioning tool.
///
/// The production implementation is [`Subprocess`]; anything else can stand
/// in for it, for example to record invocations.
pub trait Executor {
    /// Run the tool with `args`, feeding `stdin` to its standard input
    fn execute(&self, args: &[OsString], stdin: &[u8]) -> Result<Output, Error>;

    /// Run the tool and map a failure to a typed error, returning stdout on success
    fn run(&self, args: &[OsString], stdin: &[u8]) -> Result<String, Error> {
        debug!("cryptsetup {}", args.iter().map(|a| a.to_string_lossy()).join(" "));

        let output = self.execute(args, stdin)?;
        trace!("cryptsetup exited with {:?}, stderr: {:?}", output.code, output.stderr);

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify(&output))
        }
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, args: &[OsString], stdin: &[u8]) -> Result<Output, Error> {
        (**self).execute(args, stdin)
    }
}

/// Executes a real binary as a child process
#[derive(Clone, Debug)]
pub struct Subprocess {
    binary: PathBuf,
}

impl Default for Subprocess {
    fn default() -> Self {
        Self::new("cryptsetup")
    }
}

impl Subprocess {
    /// Execute `binary`, either a path or a name resolved through `PATH`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Executor for Subprocess {
    fn execute(&self, args: &[OsString], stdin: &[u8]) -> Result<Output, Error> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Exec {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let pipe = child.stdin.take();
        let (written, output) = thread::scope(|s| {
            let writer = pipe.map(|mut pipe| s.spawn(move || write_input(&mut pipe, stdin)));
            let output = child.wait_with_output();
            let written = match writer {
                Some(writer) => writer
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked"))),
                None => Ok(()),
            };
            (written, output)
        });
        let output = output?;
        written?;

        Ok(Output {
            code: output.status.code(),
            signal: output.status.signal(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// The tool may exit before consuming its input, the exit status decides then
fn write_input(pipe: &mut impl Write, input: &[u8]) -> io::Result<()> {
    match pipe.write_all(input) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            trace!("cryptsetup closed stdin early");
            Ok(())
        }
        result => result,
    }
}

/// Map a failed invocation to a typed error from its last diagnostic line
pub fn classify(output: &Output) -> Error {
    let message = match output.stderr.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
        Some(line) => line.to_owned(),
        None => match (output.code, output.signal) {
            (_, Some(signal)) => format!("terminated by signal {signal}"),
            (Some(code), None) => format!("exit status {code}"),
            (None, None) => "unknown failure".to_owned(),
        },
    };

    let not_found = NOT_FOUND_PATTERN.get_or_init(|| {
        Regex::new(r"Token \d+ is not in use|Keyslot \d+ is not active").expect("Failed to initialise known-working regex")
    });

    if message.contains("No key available with this passphrase") {
        Error::WrongKey { message }
    } else if not_found.is_match(&message) {
        Error::NotFound { message }
    } else {
        Error::ExternalToolFailed { message }
    }
}

// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Argon2i cost calibration
//!
//! Keyslots are always created with forced cost parameters. Either the caller
//! supplies the iteration count, or `cryptsetup benchmark` measures how many
//! iterations fit into the target unlock time for the given memory ceiling.

use std::{ffi::OsString, sync::OnceLock, time::Duration};

use log::{debug, info};
use luks2::KdfType;
use regex::Regex;

use crate::{exec::Executor, Error, InvalidOptions};

/// Memory cost used when none is requested: 1 GiB
pub const DEFAULT_MEMORY_KIB: u32 = 1024 * 1024;

/// Unlock time targeted when neither a duration nor an iteration count is requested
pub const DEFAULT_TARGET_DURATION: Duration = Duration::from_millis(2000);

const MIN_MEMORY_KIB: u32 = 32;
const MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;
const MIN_ITERATIONS: u32 = 4;
const MAX_PARALLEL: u32 = 4;

static BENCHMARK_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Requested key derivation cost
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KdfOptions {
    /// Target unlock time, defaults to [`DEFAULT_TARGET_DURATION`]
    pub target_duration: Option<Duration>,
    /// Memory ceiling in KiB, defaults to [`DEFAULT_MEMORY_KIB`]
    pub memory_kib: Option<u32>,
    /// Skip benchmarking and use exactly this many iterations
    pub force_iterations: Option<u32>,
    /// Number of parallel threads, chosen by `cryptsetup` when unset
    pub parallel: Option<u32>,
}

impl KdfOptions {
    pub fn with_target_duration(self, duration: Duration) -> Self {
        Self {
            target_duration: Some(duration),
            ..self
        }
    }

    pub fn with_memory_kib(self, memory_kib: u32) -> Self {
        Self {
            memory_kib: Some(memory_kib),
            ..self
        }
    }

    pub fn with_force_iterations(self, iterations: u32) -> Self {
        Self {
            force_iterations: Some(iterations),
            ..self
        }
    }

    pub fn with_parallel(self, parallel: u32) -> Self {
        Self {
            parallel: Some(parallel),
            ..self
        }
    }

    /// Check every requested value is within the range argon2i and `cryptsetup` accept
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        if let Some(memory) = self.memory_kib {
            if !(MIN_MEMORY_KIB..=MAX_MEMORY_KIB).contains(&memory) {
                return Err(InvalidOptions::new("memory_kib", format!("{memory} KiB is out of range"))
                    .with_advice(format!("use between {MIN_MEMORY_KIB} and {MAX_MEMORY_KIB} KiB")));
            }
        }

        if let Some(iterations) = self.force_iterations {
            if iterations < MIN_ITERATIONS {
                return Err(InvalidOptions::new("force_iterations", format!("{iterations} is too low"))
                    .with_advice(format!("argon2i needs at least {MIN_ITERATIONS} iterations")));
            }
        }

        if self.target_duration.is_some_and(|d| d.as_millis() == 0) {
            return Err(InvalidOptions::new("target_duration", "must be at least one millisecond"));
        }

        if let Some(parallel) = self.parallel {
            if !(1..=MAX_PARALLEL).contains(&parallel) {
                return Err(InvalidOptions::new("parallel", format!("{parallel} threads is out of range"))
                    .with_advice(format!("use between 1 and {MAX_PARALLEL} threads")));
            }
        }

        Ok(())
    }

    /// The memory ceiling in KiB
    pub fn memory_kib(&self) -> u32 {
        self.memory_kib.unwrap_or(DEFAULT_MEMORY_KIB)
    }

    /// The unlock time to benchmark for
    pub fn target_duration(&self) -> Duration {
        self.target_duration.unwrap_or(DEFAULT_TARGET_DURATION)
    }
}

/// Concrete cost parameters for a new keyslot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub kdf_type: KdfType,
    /// Iteration count
    pub time: u32,
    pub memory_kib: u32,
    pub parallel: Option<u32>,
}

impl KdfParams {
    /// Render as `cryptsetup` arguments forcing exactly these costs
    pub fn args(&self) -> Vec<OsString> {
        let mut args = vec![
            "--pbkdf".into(),
            self.kdf_type.to_string().into(),
            "--pbkdf-force-iterations".into(),
            self.time.to_string().into(),
            "--pbkdf-memory".into(),
            self.memory_kib.to_string().into(),
        ];
        if let Some(parallel) = self.parallel {
            args.extend([OsString::from("--pbkdf-parallel"), parallel.to_string().into()]);
        }
        args
    }
}

/// Turn requested costs into concrete parameters, benchmarking unless iterations are forced
pub fn calibrate<E: Executor + ?Sized>(executor: &E, options: &KdfOptions) -> Result<KdfParams, Error> {
    options.validate()?;

    let memory_kib = options.memory_kib();
    if let Some(time) = options.force_iterations {
        debug!("using forced argon2i cost: {time} iterations, {memory_kib} KiB");
        return Ok(KdfParams {
            kdf_type: KdfType::Argon2i,
            time,
            memory_kib,
            parallel: options.parallel,
        });
    }

    let target = options.target_duration();
    let mut args: Vec<OsString> = vec![
        "benchmark".into(),
        "--pbkdf".into(),
        "argon2i".into(),
        "--iter-time".into(),
        target.as_millis().to_string().into(),
        "--pbkdf-memory".into(),
        memory_kib.to_string().into(),
        "--key-size".into(),
        "512".into(),
    ];
    if let Some(parallel) = options.parallel {
        args.extend([OsString::from("--pbkdf-parallel"), parallel.to_string().into()]);
    }

    let output = executor.run(&args, &[])?;
    let params = parse_benchmark(&output).ok_or_else(|| Error::Benchmark { output: output.trim().to_owned() })?;

    if params.memory_kib > memory_kib {
        return Err(Error::Benchmark {
            output: format!(
                "benchmark chose {} KiB, above the {memory_kib} KiB ceiling",
                params.memory_kib
            ),
        });
    }

    info!(
        "calibrated argon2i for {}ms: {} iterations, {} KiB, {} threads",
        target.as_millis(),
        params.time,
        params.memory_kib,
        params.parallel.unwrap_or(1)
    );
    Ok(params)
}

/// Find the argon2i result line in `cryptsetup benchmark` output
pub(crate) fn parse_benchmark(output: &str) -> Option<KdfParams> {
    let pattern = BENCHMARK_PATTERN.get_or_init(|| {
        Regex::new(r"argon2i\s+(\d+) iterations, (\d+) memory, (\d+) parallel threads")
            .expect("Failed to initialise known-working regex")
    });

    let captures = output.lines().find_map(|line| pattern.captures(line))?;
    Some(KdfParams {
        kdf_type: KdfType::Argon2i,
        time: captures[1].parse().ok()?,
        memory_kib: captures[2].parse().ok()?,
        parallel: Some(captures[3].parse().ok()?),
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use test_log::test;

    use super::*;
    use crate::exec::Output;

    /// Replies to every invocation with fixed stdout
    struct Canned {
        stdout: &'static str,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl Canned {
        fn new(stdout: &'static str) -> Self {
            Self {
                stdout,
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl Executor for Canned {
        fn execute(&self, args: &[OsString], _stdin: &[u8]) -> Result<Output, Error> {
            self.calls
                .borrow_mut()
                .push(args.iter().map(|a| a.to_string_lossy().into_owned()).collect());
            Ok(Output {
                code: Some(0),
                stdout: self.stdout.to_owned(),
                ..Default::default()
            })
        }
    }

    const BENCHMARK: &str = "# Tests are approximate using memory only (no storage IO).\n\
        argon2i       5 iterations, 1048576 memory, 4 parallel threads (CPUs) for 512-bit key (requested 2000 ms time)\n";

    #[test]
    fn test_forced_iterations() {
        let executor = Canned::new("");
        let options = KdfOptions::default().with_memory_kib(32 * 1024).with_force_iterations(4);
        let params = calibrate(&executor, &options).unwrap();

        assert_eq!(
            params,
            KdfParams {
                kdf_type: KdfType::Argon2i,
                time: 4,
                memory_kib: 32 * 1024,
                parallel: None,
            }
        );
        assert!(executor.calls.borrow().is_empty());
        assert_eq!(
            params.args(),
            ["--pbkdf", "argon2i", "--pbkdf-force-iterations", "4", "--pbkdf-memory", "32768"].map(OsString::from)
        );
    }

    #[test]
    fn test_benchmark_defaults() {
        let executor = Canned::new(BENCHMARK);
        let params = calibrate(&executor, &KdfOptions::default()).unwrap();

        assert_eq!(params.time, 5);
        assert_eq!(params.memory_kib, DEFAULT_MEMORY_KIB);
        assert_eq!(params.parallel, Some(4));
        assert_eq!(
            executor.calls.borrow()[0],
            [
                "benchmark",
                "--pbkdf",
                "argon2i",
                "--iter-time",
                "2000",
                "--pbkdf-memory",
                "1048576",
                "--key-size",
                "512"
            ]
        );
        assert_eq!(params.args().last().unwrap(), "4");
    }

    #[test]
    fn test_benchmark_above_ceiling() {
        let executor = Canned::new(BENCHMARK);
        let options = KdfOptions::default()
            .with_memory_kib(32 * 1024)
            .with_target_duration(Duration::from_millis(100))
            .with_parallel(2);
        assert!(matches!(calibrate(&executor, &options), Err(Error::Benchmark { .. })));
        assert!(executor.calls.borrow()[0].ends_with(&["--pbkdf-parallel".to_owned(), "2".to_owned()]));
    }

    #[test]
    fn test_benchmark_garbage() {
        let executor = Canned::new("PBKDF2-sha1      1234 iterations per second for 256-bit key\n");
        assert!(matches!(
            calibrate(&executor, &KdfOptions::default()),
            Err(Error::Benchmark { .. })
        ));
    }

    #[test]
    fn test_validate() {
        let invalid = [
            KdfOptions::default().with_memory_kib(16),
            KdfOptions::default().with_memory_kib(8 * 1024 * 1024),
            KdfOptions::default().with_force_iterations(0),
            KdfOptions::default().with_target_duration(Duration::ZERO),
            KdfOptions::default().with_parallel(0),
            KdfOptions::default().with_parallel(16),
        ];
        for options in invalid {
            let executor = Canned::new(BENCHMARK);
            assert!(
                matches!(calibrate(&executor, &options), Err(Error::InvalidOptions(_))),
                "{options:?} was accepted"
            );
            assert!(executor.calls.borrow().is_empty());
        }

        assert!(KdfOptions::default().validate().is_ok());
    }
}

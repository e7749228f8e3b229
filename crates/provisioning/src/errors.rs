// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// Error type for the provisioning crate
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[diagnostic(code(provisioning::header))]
    #[error(transparent)]
    Header(#[from] luks2::Error),

    #[error(transparent)]
    IO(#[from] io::Error),

    #[diagnostic(transparent)]
    #[error(transparent)]
    InvalidOptions(#[from] InvalidOptions),

    /// The supplied key does not unlock any keyslot
    #[diagnostic(code(provisioning::wrong_key), help("check the passphrase or key file"))]
    #[error("cryptsetup failed with: {message}")]
    WrongKey { message: String },

    /// The referenced keyslot or token does not exist
    #[diagnostic(code(provisioning::not_found))]
    #[error("cryptsetup failed with: {message}")]
    NotFound { message: String },

    /// Any other failure reported by cryptsetup
    #[diagnostic(code(provisioning::external_tool))]
    #[error("cryptsetup failed with: {message}")]
    ExternalToolFailed { message: String },

    #[diagnostic(code(provisioning::exec), help("is cryptsetup installed and on PATH?"))]
    #[error("cannot execute {binary}")]
    Exec {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[diagnostic(code(provisioning::benchmark))]
    #[error("cannot interpret cryptsetup benchmark output: {output}")]
    Benchmark { output: String },
}

/// Error for caller supplied options that are out of range
#[derive(Debug, Diagnostic, Error)]
#[error("invalid {option}: {reason}")]
#[diagnostic(code(provisioning::invalid_options), severity(error))]
pub struct InvalidOptions {
    pub option: &'static str,

    pub reason: String,

    #[help]
    pub advice: Option<String>,
}

impl InvalidOptions {
    pub(crate) fn new(option: &'static str, reason: impl Into<String>) -> Self {
        Self {
            option,
            reason: reason.into(),
            advice: None,
        }
    }

    pub(crate) fn with_advice(self, advice: impl Into<String>) -> Self {
        Self {
            advice: Some(advice.into()),
            ..self
        }
    }
}

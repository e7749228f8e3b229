// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Selection between the two redundant metadata copies

use log::warn;

use crate::{superblock::Role, CopyError, Error};

/// Anything carrying the sequence ID of a metadata copy
pub trait Generation {
    fn generation(&self) -> u64;
}

/// Pick the authoritative metadata copy.
///
/// A valid copy always beats an invalid one. When both are valid the higher
/// generation wins, and the primary wins a tie. When neither is valid the
/// volume is either not LUKS2 at all, or corrupt.
pub fn select<T: Generation>(
    primary: Result<T, CopyError>,
    secondary: Result<T, CopyError>,
) -> Result<(Role, T), Error> {
    match (primary, secondary) {
        (Ok(p), Ok(s)) => {
            if s.generation() > p.generation() {
                warn!(
                    "primary header is stale (seqid {} < {}), using secondary",
                    p.generation(),
                    s.generation()
                );
                Ok((Role::Secondary, s))
            } else {
                Ok((Role::Primary, p))
            }
        }
        (Ok(p), Err(e)) => {
            warn!("ignoring secondary header: {e}");
            Ok((Role::Primary, p))
        }
        (Err(e), Ok(s)) => {
            warn!("ignoring primary header: {e}");
            Ok((Role::Secondary, s))
        }
        (Err(primary), Err(secondary)) if primary.is_foreign() && secondary.is_foreign() => Err(Error::NotLuks2),
        (Err(primary), Err(secondary)) => Err(Error::Corrupt { primary, secondary }),
    }
}

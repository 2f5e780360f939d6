// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Exit Code Management
//!
//! Standardized Unix exit codes following BSD `sysexits.h` conventions,
//! trimmed to the conditions the pipeline service can actually hit.

use std::fmt;

/// Exit codes following Unix conventions (BSD sysexits.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful termination (0)
    #[default]
    Success = 0,

    /// General error (1)
    Error = 1,

    /// Command line usage error (64)
    UsageError = 64,

    /// Data format error (65): malformed configuration values
    DataError = 65,

    /// Service unavailable (69): Redis or Postgres unreachable at startup
    Unavailable = 69,

    /// Configuration error (78): missing or invalid configuration
    ConfigError = 78,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Terminates the process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self.as_i32())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "success",
            ExitCode::Error => "error",
            ExitCode::UsageError => "usage error",
            ExitCode::DataError => "data error",
            ExitCode::Unavailable => "service unavailable",
            ExitCode::ConfigError => "configuration error",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_sysexits() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::UsageError.as_i32(), 64);
        assert_eq!(ExitCode::Unavailable.as_i32(), 69);
        assert_eq!(ExitCode::ConfigError.as_i32(), 78);
    }
}

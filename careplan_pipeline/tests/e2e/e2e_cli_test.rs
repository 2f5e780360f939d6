// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! CLI-level checks on the worker-host binary. Full `serve` runs need
//! Redis and Postgres and live behind the `REDIS_URL`/`DATABASE_URL`
//! environment gates used by the adapter tests; these cover the argument
//! surface and the configuration guard rails.

use std::process::Command;

fn pipeline_bin() -> String {
    env!("CARGO_BIN_EXE_careplan_pipeline").to_string()
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(pipeline_bin())
        .arg("--help")
        .output()
        .expect("binary runs");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["serve", "stats", "retry-dlq", "sweep"] {
        assert!(stdout.contains(subcommand), "--help mentions {subcommand}");
    }
}

#[test]
fn test_missing_encryption_key_fails_fast() {
    // No config file and no CAREPLAN_ENCRYPTION_KEY_HEX: the configuration
    // guard must reject before any connection is attempted.
    let output = Command::new(pipeline_bin())
        .arg("stats")
        .env_remove("CAREPLAN_ENCRYPTION_KEY_HEX")
        .env("CAREPLAN_DATABASE_URL", "postgres://127.0.0.1:1/unreachable")
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
}

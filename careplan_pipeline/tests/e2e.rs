// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! End-to-End Tests
//!
//! This module aggregates the E2E tests for the worker-host binary.

#[path = "e2e/e2e_cli_test.rs"]
mod e2e_cli_test;

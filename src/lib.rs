// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Idempotent provisioning of Arch Linux on a ZFS root.
//!
//! Installing Arch on ZFS is a long, fixed sequence of calls into system tools:
//! partition the disk, create the pool, lay out datasets, generate a hostid,
//! teach mkinitcpio about ZFS, write boot entries, enable services. Zprov
//! models each of those calls as a __step__ that can first _probe_ the current
//! state of the system, and then _apply_ only the mutation that is still
//! missing. Running the same phase twice is therefore harmless, which is
//! exactly what an operator needs after fixing whatever broke a prior run.
//!
//! # Phases
//!
//! Steps are grouped into two phases:
//!
//! 1. __install__: runs from the live medium against a blank disk.
//! 2. __configure__: runs inside the freshly installed system.
//!
//! Each phase executes as a single ordered [`Pipeline`](crate::pipeline::Pipeline).
//! The first failing step halts the run, and nothing is rolled back. Whatever
//! was applied stays applied, and the operator picks up from there.

pub mod config;
pub mod context;
pub mod drafter;
pub mod path;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod prompt;
pub mod steps;
pub mod summary;
pub mod system;

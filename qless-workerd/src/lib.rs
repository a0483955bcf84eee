// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! qless-workerd: a local pool of forked worker processes for a qless-style
//! job queue.
//!
//! A `Supervisor` starts one worker process per slot, each confined to its own
//! sandbox directory, replaces workers that die and passes shutdown and
//! reload signals on to all of them.

pub mod error;
pub mod global_config;
pub mod logging;
pub mod partition;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod signals;
pub mod supervisor;
pub mod worker;

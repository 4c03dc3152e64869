// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// inftprint-proxy — the standalone agent that registers a local output
// device with an Infrastructure Printer and relays its jobs.

pub mod agent;
pub mod client;
pub mod reconnect;

pub use agent::{run, AgentConfig};

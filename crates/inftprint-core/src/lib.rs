// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core types shared across the infrastructure printer and its proxy:
// the attribute engine, the process data model, configuration, and the
// error taxonomy they all report through.

pub mod attribute;
pub mod config;
pub mod error;
pub mod model;

pub use config::{PrinterConfig, ProxyConfig, ServerConfig};
pub use error::{InftError, Result};
pub use model::*;

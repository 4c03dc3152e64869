// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Object store, lifecycle engine, event engine, operation dispatcher, job
// processor, and HTTP/IPP framing for the infrastructure printer daemon.

pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod http;
pub mod job_processor;
pub mod lifecycle;
pub mod resource;
pub mod store;

pub use dispatcher::{dispatch, Context};
pub use store::Store;

/// Default cap on events retained per subscription before head-trimming.
pub const DEFAULT_SUBSCRIPTION_QUEUE_CAPACITY: usize = 1024;

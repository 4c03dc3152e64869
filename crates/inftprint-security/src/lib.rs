// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Access control, audit trail, document integrity, and device identity for
// the infrastructure printer and its proxies.

pub mod access;
pub mod audit;
pub mod identity;
pub mod integrity;

pub use access::{authorize_user, parse_basic_auth, resolve_identity, sees_private_attributes, Identity, Scope};
pub use audit::AuditLog;
pub use identity::{device_uuid, null_device_uri};
pub use integrity::{hash_bytes, verify_hash};

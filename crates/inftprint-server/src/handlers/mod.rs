// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operation handlers, grouped the way RFC 8011 and its extensions group
// them: job submission and control, query, printer lifecycle, subscriptions,
// output-device (proxy) callbacks, and system-wide operations.

pub mod job;
pub mod printer;
pub mod proxy;
pub mod query;
pub mod subscription;
pub mod system;

use inftprint_core::attribute;
use inftprint_security::Identity;
use ipp::model::DelimiterTag;
use ipp::request::IppRequestResponse;

/// The `requesting-user-name` operation attribute, falling back to an
/// authenticated identity's username, then to `"anonymous"`.
pub fn requesting_user(req: &IppRequestResponse, identity: &Option<Identity>) -> String {
    attribute::first_value(req.attributes(), DelimiterTag::OperationAttributes, "requesting-user-name")
        .and_then(attribute::as_text)
        .or_else(|| identity.as_ref().map(|i| i.username.clone()))
        .unwrap_or_else(|| "anonymous".to_string())
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device identity — derives the stable UUID a proxy advertises for its
// output device.

use sha2::{Digest, Sha256};
use uuid::{Builder, Variant, Version};

/// URI hashed when a proxy has no real device URI configured.
pub const NULL_DEVICE_URI_TEMPLATE: &str = "file://{host}/dev/null";

/// Derive a stable device UUID by hashing `device_uri` with SHA-256 and
/// formatting the first 16 bytes as an RFC 4122 version-3-shaped URN.
///
/// This departs from the traditional MD5-based UUIDv3 construction (RFC
/// 4122 §4.3) only in the hash function; the version and variant bits are
/// set identically so the result is a syntactically valid UUID.
pub fn device_uuid(device_uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_uri.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);

    let uuid = Builder::from_bytes(bytes)
        .with_variant(Variant::RFC4122)
        .with_version(Version::Md5)
        .into_uuid();

    format!("urn:uuid:{uuid}")
}

/// Build the URI hashed for a proxy that advertises no real device, per
/// `NULL_DEVICE_URI_TEMPLATE`.
pub fn null_device_uri(host: &str) -> String {
    format!("file://{host}/dev/null")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_uuid_is_deterministic() {
        let a = device_uuid("usb://Example/Printer?serial=123");
        let b = device_uuid("usb://Example/Printer?serial=123");
        assert_eq!(a, b);
    }

    #[test]
    fn device_uuid_differs_by_uri() {
        let a = device_uuid("usb://Example/Printer?serial=123");
        let b = device_uuid("usb://Example/Printer?serial=456");
        assert_ne!(a, b);
    }

    #[test]
    fn device_uuid_is_urn_formatted() {
        let uuid = device_uuid("socket://printer.local:9100");
        assert!(uuid.starts_with("urn:uuid:"));
        assert_eq!(uuid.len(), "urn:uuid:".len() + 36);
    }

    #[test]
    fn null_device_uri_embeds_host() {
        assert_eq!(null_device_uri("myhost"), "file://myhost/dev/null");
    }
}

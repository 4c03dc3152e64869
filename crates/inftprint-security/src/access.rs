// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Access control — maps an authenticated identity and the operation it is
// attempting onto an allow/deny decision, plus the attribute redaction
// applied to denied-but-visible object descriptions.

use std::collections::HashSet;
use std::ffi::{CStr, CString};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use inftprint_core::error::InftError;

/// The scope an operation is gated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Requires membership in the configured admin group.
    Admin,
    /// Requires membership in the configured operator group, or admin.
    Operator,
    /// Requires the caller to be the object's owner, or operator/admin.
    Owner,
    /// No gate; any authenticated (or anonymous, per server policy) caller.
    Public,
}

/// The authenticated caller, as resolved by the HTTP layer before the
/// dispatcher runs. `None` means no credentials were presented.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub groups: HashSet<String>,
}

impl Identity {
    pub fn is_member(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Decode an HTTP `Authorization: Basic <credentials>` header value into a
/// `(username, password)` pair. Returns `None` if the header is absent,
/// not the `Basic` scheme, or not validly encoded.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Resolve an authenticated username into an `Identity` by looking up its
/// OS group memberships. This mirrors the traditional print-server
/// convention of gating admin/operator/proxy operations on membership in a
/// named system group (e.g. `lpadmin`), rather than maintaining a
/// separate user database.
///
/// Any failure (unknown user, no groups, platform lookup error) resolves
/// to an identity with an empty group set rather than an error — an
/// unrecognized username simply fails the group checks downstream.
pub fn resolve_identity(username: &str) -> Identity {
    Identity {
        username: username.to_string(),
        groups: system_group_names(username),
    }
}

fn system_group_names(username: &str) -> HashSet<String> {
    let Ok(cname) = CString::new(username) else {
        return HashSet::new();
    };

    // SAFETY: `cname` is a valid NUL-terminated C string for the lifetime of
    // this call; `pwd`/`pwbuf` are zero-initialized and only read once
    // `getpwnam_r` reports success by returning a non-null `result`.
    let (uid, gid) = unsafe {
        let mut pwd: libc::passwd = std::mem::zeroed();
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc != 0 || result.is_null() {
            return HashSet::new();
        }
        (pwd.pw_uid, pwd.pw_gid)
    };

    // SAFETY: `groups` is sized generously and re-queried if `getgrouplist`
    // reports it was too small; `ngroups` is only trusted after a
    // successful (non-negative) return.
    let gids = unsafe {
        let mut ngroups: libc::c_int = 64;
        let mut groups = vec![0 as libc::gid_t; ngroups as usize];
        let rc = libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut ngroups);
        if rc < 0 {
            groups.resize(ngroups as usize, 0);
            let rc2 = libc::getgrouplist(cname.as_ptr(), gid, groups.as_mut_ptr(), &mut ngroups);
            if rc2 < 0 {
                return HashSet::new();
            }
        }
        groups.truncate(ngroups.max(0) as usize);
        groups
    };

    gids.into_iter().filter_map(group_name).collect()
}

fn group_name(gid: libc::gid_t) -> Option<String> {
    // SAFETY: `grp`/`buf` are zero-initialized and only read once
    // `getgrgid_r` reports success by returning a non-null `result`.
    unsafe {
        let mut grp: libc::group = std::mem::zeroed();
        let mut buf = vec![0_i8; 16 * 1024];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc != 0 || result.is_null() || grp.gr_name.is_null() {
            return None;
        }
        Some(CStr::from_ptr(grp.gr_name).to_string_lossy().into_owned())
    }
}

/// Decide whether `caller` may perform an operation gated by `scope`
/// against an object owned by `owner` (meaningful only for `Scope::Owner`).
///
/// Returns `Ok(())` when authorized. `Scope::Admin` failures should be
/// surfaced as HTTP 403; `Scope::Owner` failures as IPP
/// `client-error-not-authorized`, per the operation handler.
pub fn authorize_user(
    caller: Option<&Identity>,
    scope: Scope,
    owner: Option<&str>,
    admin_group: &str,
    operator_group: &str,
) -> Result<(), InftError> {
    let caller = match (scope, caller) {
        (Scope::Public, None) => return Ok(()),
        (_, None) => return Err(InftError::AuthenticationRequired),
        (_, Some(identity)) => identity,
    };

    match scope {
        Scope::Public => Ok(()),
        Scope::Admin => {
            if caller.is_member(admin_group) {
                Ok(())
            } else {
                Err(InftError::Forbidden(format!(
                    "{} is not a member of {admin_group}",
                    caller.username
                )))
            }
        }
        Scope::Operator => {
            if caller.is_member(operator_group) || caller.is_member(admin_group) {
                Ok(())
            } else {
                Err(InftError::Forbidden(format!(
                    "{} is not a member of {operator_group} or {admin_group}",
                    caller.username
                )))
            }
        }
        Scope::Owner => {
            let is_owner = owner.is_some_and(|o| o == caller.username);
            if is_owner || caller.is_member(operator_group) || caller.is_member(admin_group) {
                Ok(())
            } else {
                Err(InftError::NotAuthorized(format!(
                    "{} does not own this object",
                    caller.username
                )))
            }
        }
    }
}

/// Whether `caller` is authorized to see attributes redacted from an
/// unauthorized reader's view of an object owned by `owner`.
pub fn sees_private_attributes(
    caller: Option<&Identity>,
    owner: Option<&str>,
    admin_group: &str,
    operator_group: &str,
) -> bool {
    let Some(caller) = caller else {
        return false;
    };
    owner.is_some_and(|o| o == caller.username)
        || caller.is_member(operator_group)
        || caller.is_member(admin_group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(username: &str, groups: &[&str]) -> Identity {
        Identity {
            username: username.to_string(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn admin_scope_allows_admin_group_member() {
        let alice = identity("alice", &["lpadmin"]);
        assert!(authorize_user(Some(&alice), Scope::Admin, None, "lpadmin", "lpoperator").is_ok());
    }

    #[test]
    fn admin_scope_denies_non_member() {
        let bob = identity("bob", &["lpoperator"]);
        let result = authorize_user(Some(&bob), Scope::Admin, None, "lpadmin", "lpoperator");
        assert!(matches!(result, Err(InftError::Forbidden(_))));
    }

    #[test]
    fn owner_scope_allows_owner() {
        let alice = identity("alice", &[]);
        assert!(authorize_user(Some(&alice), Scope::Owner, Some("alice"), "lpadmin", "lpoperator").is_ok());
    }

    #[test]
    fn owner_scope_denies_non_owner_non_operator() {
        let eve = identity("eve", &[]);
        let result = authorize_user(Some(&eve), Scope::Owner, Some("alice"), "lpadmin", "lpoperator");
        assert!(matches!(result, Err(InftError::NotAuthorized(_))));
    }

    #[test]
    fn owner_scope_allows_operator_override() {
        let ops = identity("ops", &["lpoperator"]);
        assert!(authorize_user(Some(&ops), Scope::Owner, Some("alice"), "lpadmin", "lpoperator").is_ok());
    }

    #[test]
    fn public_scope_allows_anonymous() {
        assert!(authorize_user(None, Scope::Public, None, "lpadmin", "lpoperator").is_ok());
    }

    #[test]
    fn non_public_scope_requires_authentication() {
        let result = authorize_user(None, Scope::Owner, Some("alice"), "lpadmin", "lpoperator");
        assert!(matches!(result, Err(InftError::AuthenticationRequired)));
    }

    #[test]
    fn parse_basic_auth_decodes_user_and_password() {
        // "alice:secret" base64-encoded
        let header = "Basic YWxpY2U6c2VjcmV0";
        assert_eq!(parse_basic_auth(header), Some(("alice".to_string(), "secret".to_string())));
    }

    #[test]
    fn parse_basic_auth_rejects_other_schemes() {
        assert_eq!(parse_basic_auth("Bearer abcdef"), None);
    }

    #[test]
    fn parse_basic_auth_rejects_garbage() {
        assert_eq!(parse_basic_auth("Basic not-valid-base64!!"), None);
    }

    #[test]
    fn private_attributes_hidden_from_strangers() {
        let eve = identity("eve", &[]);
        assert!(!sees_private_attributes(Some(&eve), Some("alice"), "lpadmin", "lpoperator"));
        assert!(!sees_private_attributes(None, Some("alice"), "lpadmin", "lpoperator"));
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the infrastructure printer and proxy.

use thiserror::Error;

/// Top-level error type for all infrastructure-printer operations.
#[derive(Debug, Error)]
pub enum InftError {
    // -- Envelope / protocol errors --
    #[error("malformed IPP request: {0}")]
    MalformedRequest(String),

    #[error("IPP version not supported")]
    VersionNotSupported,

    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("attribute not supported: {0}")]
    AttributesNotSupported(String),

    // -- Object lookup --
    #[error("printer not found: {0}")]
    PrinterNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(i32),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(i32),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(i32),

    // -- Authorization --
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    // -- State machine --
    #[error("operation not possible in current state: {0}")]
    NotPossible(String),

    #[error("printer is not accepting jobs")]
    NotAcceptingJobs,

    #[error("too many jobs")]
    TooManyJobs,

    #[error("printer unavailable: {0}")]
    ServiceUnavailable(String),

    // -- Document access --
    #[error("document access error: {0}")]
    DocumentAccess(String),

    // -- I/O and transport --
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("proxy connection error: {0}")]
    ProxyConnection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, InftError>;

impl InftError {
    /// Map this error onto the IPP status code that the dispatcher must put
    /// in the response's operation attributes.
    pub fn status_code(&self) -> ipp::model::StatusCode {
        use ipp::model::StatusCode::*;
        match self {
            InftError::MalformedRequest(_) => ClientErrorBadRequest,
            InftError::VersionNotSupported => ServerErrorVersionNotSupported,
            InftError::OperationNotSupported(_) => ServerErrorOperationNotSupported,
            InftError::AttributesNotSupported(_) => ClientErrorAttributesOrValuesNotSupported,
            InftError::PrinterNotFound(_)
            | InftError::JobNotFound(_)
            | InftError::SubscriptionNotFound(_)
            | InftError::DeviceNotFound(_)
            | InftError::ResourceNotFound(_) => ClientErrorNotFound,
            InftError::AuthenticationRequired => ClientErrorNotAuthenticated,
            InftError::Forbidden(_) => ClientErrorForbidden,
            InftError::NotAuthorized(_) => ClientErrorNotAuthorized,
            InftError::NotPossible(_) => ClientErrorNotPossible,
            InftError::NotAcceptingJobs => ClientErrorNotPossible,
            InftError::TooManyJobs => ClientErrorNotPossible,
            InftError::ServiceUnavailable(_) => ServerErrorServiceUnavailable,
            InftError::DocumentAccess(_) => ClientErrorDocumentAccessError,
            InftError::Io(_)
            | InftError::Serialization(_)
            | InftError::Config(_)
            | InftError::ProxyConnection(_)
            | InftError::Internal(_) => ServerErrorInternalError,
        }
    }
}

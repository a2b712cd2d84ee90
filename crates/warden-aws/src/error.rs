//! AWS error classification
//!
//! SDK errors are sorted by their service error code, never by matching on
//! Debug output. The engine only cares about a handful of outcomes, so every
//! code collapses into one [`AwsError`] variant and from there into a
//! [`WardenError`].

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use thiserror::Error;
use warden_core::WardenError;

#[derive(Debug, Error)]
pub enum AwsError {
    /// The resource is already gone
    #[error("Resource not found ({code}): {message}")]
    NotFound { code: String, message: String },

    /// The resource is already where the call would have put it
    #[error("Resource already in state ({code}): {message}")]
    AlreadyInState { code: String, message: String },

    /// Volume is still attached somewhere
    #[error("Volume in use: {0}")]
    VolumeInUse(String),

    /// Another resource still references this one
    #[error("Resource has dependent objects: {0}")]
    DependencyViolation(String),

    #[error("Rate limit exceeded: {0}")]
    Throttled(String),

    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Worth retrying the same call after a pause
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AwsError::VolumeInUse(_) | AwsError::DependencyViolation(_) | AwsError::Throttled(_)
        )
    }
}

/// Codes meaning the target no longer exists
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidVolume.NotFound",
    "InvalidNetworkInterfaceID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidPermission.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidRouteTableID.NotFound",
    "InvalidInternetGatewayID.NotFound",
    "InvalidNatGatewayID.NotFound",
    "NatGatewayNotFound",
    "InvalidVpcEndpointId.NotFound",
    "InvalidAllocationID.NotFound",
    "InvalidVpcID.NotFound",
    "LoadBalancerNotFound",
    "NoSuchEntity",
];

/// Codes meaning a detach or disassociate already happened
const ALREADY_IN_STATE_CODES: &[&str] = &[
    "InvalidAssociationID.NotFound",
    "Gateway.NotAttached",
    "InvalidAttachment.NotFound",
];

const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Classify an AWS error by its service error code
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound {
            code: c.to_string(),
            message,
        },
        Some(c) if ALREADY_IN_STATE_CODES.contains(&c) => AwsError::AlreadyInState {
            code: c.to_string(),
            message,
        },
        Some("VolumeInUse") => AwsError::VolumeInUse(message),
        Some("DependencyViolation") => AwsError::DependencyViolation(message),
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled(message),
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify any SDK operation error
///
/// Transport failures carry no code; their full cause chain becomes the
/// message.
pub fn classify_sdk_error<E>(err: &E) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match (err.code(), err.message()) {
        (None, None) => AwsError::Sdk {
            code: None,
            message: DisplayErrorContext(err).to_string(),
        },
        (code, message) => classify_aws_error(code, message),
    }
}

/// `map_err` adapter turning an SDK error straight into the engine's error
pub(crate) fn sdk<E>(err: E) -> WardenError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    classify_sdk_error(&err).into()
}

impl From<AwsError> for WardenError {
    fn from(err: AwsError) -> Self {
        match err {
            AwsError::NotFound { .. } => WardenError::ResourceNotFound(err.to_string()),
            AwsError::AlreadyInState { .. } => WardenError::AlreadyInState(err.to_string()),
            AwsError::VolumeInUse(_) | AwsError::DependencyViolation(_) => {
                WardenError::ResourceBusy(err.to_string())
            }
            AwsError::Throttled(_) | AwsError::Sdk { .. } => WardenError::ApiError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = classify_aws_error(Some(code), Some("gone"));
            assert!(err.is_not_found(), "Expected NotFound for code: {code}");

            let warden: WardenError = err.into();
            assert!(warden.is_idempotent_success());
        }
    }

    #[test]
    fn test_already_detached_is_idempotent() {
        let err = classify_aws_error(Some("Gateway.NotAttached"), Some("igw-1 not attached"));
        assert!(matches!(err, AwsError::AlreadyInState { .. }));

        let warden: WardenError = err.into();
        assert!(matches!(warden, WardenError::AlreadyInState(_)));
    }

    #[test]
    fn test_volume_in_use_is_busy() {
        let err = classify_aws_error(Some("VolumeInUse"), Some("vol-1 is attached"));
        assert!(err.is_retryable());

        let warden: WardenError = err.into();
        assert!(matches!(warden, WardenError::ResourceBusy(_)));
    }

    #[test]
    fn test_dependency_violation_is_busy() {
        let err = classify_aws_error(Some("DependencyViolation"), Some("sg-1 has a dependent"));
        assert!(matches!(err, AwsError::DependencyViolation(_)));

        let warden: WardenError = err.into();
        assert!(matches!(warden, WardenError::ResourceBusy(_)));
    }

    #[test]
    fn test_throttling_is_retryable_api_error() {
        for code in THROTTLING_CODES {
            let err = classify_aws_error(Some(code), Some("slow down"));
            assert!(err.is_retryable());
            assert!(matches!(
                WardenError::from(err),
                WardenError::ApiError(_)
            ));
        }
    }

    #[test]
    fn test_unknown_and_missing_codes() {
        let err = classify_aws_error(Some("UnauthorizedOperation"), Some("denied"));
        assert!(matches!(err, AwsError::Sdk { code: Some(_), .. }));
        assert!(!err.is_retryable());

        let err = classify_aws_error(None, None);
        match err {
            AwsError::Sdk { code, message } => {
                assert!(code.is_none());
                assert_eq!(message, "Unknown error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

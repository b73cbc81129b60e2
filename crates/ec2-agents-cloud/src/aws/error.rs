//! EC2 error classification
//!
//! Every SDK failure is folded into an [`IaasError`] using the error code the
//! service returned (`ProvideErrorMetadata::code`), never by string matching
//! on the Debug output. Transport failures and call deadlines are transient.

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::fmt::Debug;
use thiserror::Error;

/// Result alias for facade calls
pub type IaasResult<T> = Result<T, IaasError>;

/// EC2 error categories for retry and fail-over decisions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IaasError {
    /// Retry with back-off: transport failures, 5xx, IAM propagation delay
    #[error("transient EC2 error{}: {message}", fmt_code(.code))]
    Transient {
        code: Option<String>,
        message: String,
    },

    /// Rate limit exceeded, retry with back-off
    #[error("EC2 rate limit exceeded ({code}): {message}")]
    Throttled { code: String, message: String },

    /// Referenced resource does not exist
    #[error("EC2 resource not found ({code}): {message}")]
    NotFound { code: String, message: String },

    /// Credentials rejected or operation not permitted
    #[error("EC2 authorization failed ({code}): {message}")]
    AuthFailed { code: String, message: String },

    /// Will not succeed on retry
    #[error("EC2 error{}: {message}", fmt_code(.code))]
    Permanent {
        code: Option<String>,
        message: String,
    },
}

fn fmt_code(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl IaasError {
    /// Transient failure that is not tied to a service error code.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            code: None,
            message: message.into(),
        }
    }

    /// Permanent failure that is not tied to a service error code.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            code: None,
            message: message.into(),
        }
    }

    /// The service error code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transient { code, .. } | Self::Permanent { code, .. } => code.as_deref(),
            Self::NotFound { code, .. }
            | Self::AuthFailed { code, .. }
            | Self::Throttled { code, .. } => Some(code),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if callers should retry with back-off
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Throttled { .. })
    }

    /// The requested capacity is not available in this placement; a
    /// different subnet or availability zone may succeed.
    pub fn is_insufficient_capacity(&self) -> bool {
        self.code().is_some_and(|c| CAPACITY_CODES.contains(&c))
    }

    /// A spot request was refused for capacity or price reasons and an
    /// on-demand launch may still succeed.
    pub fn is_spot_unavailable(&self) -> bool {
        self.is_insufficient_capacity() || self.code().is_some_and(|c| SPOT_CODES.contains(&c))
    }

    /// Get a user-friendly suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        let code = self.code()?;
        SUGGESTIONS
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, s)| *s)
    }
}

/// Known EC2 error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidInstanceID.Malformed",
    "InvalidAMIID.NotFound",
    "InvalidAMIID.Unavailable",
    "InvalidSubnetID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidKeyPair.NotFound",
    "InvalidSpotInstanceRequestID.NotFound",
];

/// Known EC2 error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
];

/// Credential and permission failures
const AUTH_CODES: &[&str] = &[
    "AuthFailure",
    "UnauthorizedOperation",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "OptInRequired",
];

/// Server-side failures worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
];

/// Capacity codes that trigger subnet fail-over
const CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientHostCapacity",
    "InsufficientCapacity",
    "InsufficientReservedInstanceCapacity",
    "InsufficientFreeAddressesInSubnet",
    "Unsupported",
];

/// Spot refusals that allow an on-demand fallback
const SPOT_CODES: &[&str] = &[
    "MaxSpotInstanceCountExceeded",
    "SpotMaxPriceTooLow",
    "InsufficientSpotCapacity",
];

/// Classify an EC2 error using the error code.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> IaasError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => IaasError::NotFound {
            code: c.to_string(),
            message,
        },
        Some(c) if THROTTLING_CODES.contains(&c) => IaasError::Throttled {
            code: c.to_string(),
            message,
        },
        Some(c) if AUTH_CODES.contains(&c) => IaasError::AuthFailed {
            code: c.to_string(),
            message,
        },
        Some(c) if TRANSIENT_CODES.contains(&c) => IaasError::Transient {
            code: Some(c.to_string()),
            message,
        },
        // Instance profiles take a while to become visible to EC2
        Some("InvalidParameterValue") if message.contains("iamInstanceProfile") => {
            IaasError::Transient {
                code: Some("InvalidParameterValue".to_string()),
                message,
            }
        }
        Some(c) if message.contains("Invalid IAM Instance Profile") => IaasError::Transient {
            code: Some(c.to_string()),
            message,
        },
        _ => IaasError::Permanent {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify an SDK error: service errors by code, everything on the wire as transient.
pub fn from_sdk_error<E, R>(err: SdkError<E, R>) -> IaasError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            IaasError::transient(DisplayErrorContext(&err).to_string())
        }
        _ => {
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
            classify_aws_error(err.code(), Some(&message))
        }
    }
}

/// Error code to user-friendly suggestion mapping
const SUGGESTIONS: &[(&str, &str)] = &[
    (
        "InsufficientInstanceCapacity",
        "Add another subnet in a different availability zone to the template.",
    ),
    (
        "InsufficientCapacity",
        "Add another subnet in a different availability zone to the template.",
    ),
    (
        "InsufficientFreeAddressesInSubnet",
        "The subnet has no free addresses; add another subnet to the template.",
    ),
    (
        "InstanceLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "VcpuLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "MaxSpotInstanceCountExceeded",
        "Reduce spot instance count or enable on-demand fallback.",
    ),
    (
        "SpotMaxPriceTooLow",
        "Raise the spot bid or enable on-demand fallback.",
    ),
    (
        "InvalidAMIID.NotFound",
        "The AMI does not exist in this region; check the template AMI id.",
    ),
    (
        "InvalidKeyPair.NotFound",
        "Import the cloud private key as an EC2 key pair or set the key pair name.",
    ),
    (
        "AuthFailure",
        "Check the cloud credentials.",
    ),
    (
        "UnauthorizedOperation",
        "The credentials lack an IAM permission required by this operation.",
    ),
    (
        "RequestLimitExceeded",
        "EC2 API rate limit hit. The operation is retried automatically.",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = classify_aws_error(Some(code), Some("some message"));
            assert!(err.is_not_found(), "Expected NotFound for code: {code}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn throttling_codes() {
        for code in THROTTLING_CODES {
            let err = classify_aws_error(Some(code), Some("msg"));
            assert!(err.is_retryable(), "Expected retryable for code: {code}");
            assert!(matches!(err, IaasError::Throttled { .. }));
        }
    }

    #[test]
    fn auth_codes() {
        for code in AUTH_CODES {
            let err = classify_aws_error(Some(code), None);
            assert!(matches!(err, IaasError::AuthFailed { .. }), "code: {code}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn server_errors_are_transient() {
        for code in TRANSIENT_CODES {
            assert!(classify_aws_error(Some(code), None).is_retryable());
        }
    }

    #[test]
    fn iam_propagation_delay_is_transient() {
        let err = classify_aws_error(
            Some("InvalidParameterValue"),
            Some("Value for parameter iamInstanceProfile is invalid"),
        );
        assert!(err.is_retryable());

        let err = classify_aws_error(Some("SomeCode"), Some("Invalid IAM Instance Profile name"));
        assert!(err.is_retryable());
    }

    #[test]
    fn capacity_errors_are_permanent_but_fail_over() {
        for code in CAPACITY_CODES {
            let err = classify_aws_error(Some(code), Some("no capacity"));
            assert!(matches!(err, IaasError::Permanent { .. }));
            assert!(err.is_insufficient_capacity(), "code: {code}");
            assert!(err.is_spot_unavailable());
        }
        let price = classify_aws_error(Some("SpotMaxPriceTooLow"), None);
        assert!(price.is_spot_unavailable());
        assert!(!price.is_insufficient_capacity());
    }

    #[test]
    fn unknown_and_missing_codes() {
        let err = classify_aws_error(Some("SomeNewError"), Some("details"));
        assert_eq!(err.code(), Some("SomeNewError"));
        assert!(!err.is_retryable());

        let err = classify_aws_error(None, Some("something failed"));
        assert!(matches!(err, IaasError::Permanent { code: None, .. }));
    }

    #[test]
    fn display_includes_code() {
        let err = classify_aws_error(Some("InvalidAMIID.NotFound"), Some("ami-123 missing"));
        assert_eq!(
            err.to_string(),
            "EC2 resource not found (InvalidAMIID.NotFound): ami-123 missing"
        );
        assert_eq!(
            IaasError::permanent("boom").to_string(),
            "EC2 error: boom"
        );
    }

    #[test]
    fn suggestions_for_known_codes() {
        for (code, _) in SUGGESTIONS {
            let err = classify_aws_error(Some(code), Some("msg"));
            assert!(err.suggestion().is_some(), "No suggestion for code: {code}");
        }
        assert!(classify_aws_error(Some("SomeUnknownCode"), None).suggestion().is_none());
    }
}

//! Engine-wide error kinds
//!
//! Facade failures arrive as [`IaasError`] and key failures as [`KeyError`];
//! both convert into [`ProvisionError`], which is what the planner, the launch
//! state machine and the pipeline step return.

use crate::aws::error::IaasError;
use ec2_agents_common::KeyError;
use std::error::Error as _;
use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("template '{template}' is invalid: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("EC2 call failed")]
    Iaas(#[from] IaasError),

    #[error("instance {instance_id} did not reach running: {reason}")]
    BootTimeout { instance_id: String, reason: String },

    #[error("SSH to {instance_id} timed out: {reason}")]
    SshTimeout { instance_id: String, reason: String },

    #[error("bootstrap of {instance_id} failed: {reason}")]
    BootstrapFailed { instance_id: String, reason: String },

    #[error("authentication to {instance_id} failed: {reason}")]
    AuthFailed { instance_id: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Flat classification of [`ProvisionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    InvalidKey,
    InvalidTemplate,
    CapacityExhausted,
    IaasTransient,
    IaasPermanent,
    IaasThrottled,
    AuthFailed,
    BootTimeout,
    SshTimeout,
    BootstrapFailed,
    DecryptFailed,
    Cancelled,
    NotFound,
    InvalidArgument,
}

impl ProvisionError {
    pub fn invalid_template(template: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Key(KeyError::InvalidKey(_)) => ErrorKind::InvalidKey,
            Self::Key(KeyError::DecryptFailed(_)) => ErrorKind::DecryptFailed,
            Self::InvalidTemplate { .. } => ErrorKind::InvalidTemplate,
            Self::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            Self::Iaas(IaasError::Transient { .. }) => ErrorKind::IaasTransient,
            Self::Iaas(IaasError::Throttled { .. }) => ErrorKind::IaasThrottled,
            Self::Iaas(IaasError::AuthFailed { .. }) => ErrorKind::AuthFailed,
            Self::Iaas(IaasError::NotFound { .. } | IaasError::Permanent { .. }) => {
                ErrorKind::IaasPermanent
            }
            Self::BootTimeout { .. } => ErrorKind::BootTimeout,
            Self::SshTimeout { .. } => ErrorKind::SshTimeout,
            Self::BootstrapFailed { .. } => ErrorKind::BootstrapFailed,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Errors that end a launch without another attempt.
    ///
    /// Timeouts are retried by the state machine up to its attempt budget;
    /// everything else is final.
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::IaasTransient
                | ErrorKind::IaasThrottled
                | ErrorKind::BootTimeout
                | ErrorKind::SshTimeout
        )
    }

    /// `error: cause: cause` rendering for node logs.
    pub fn cause_chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iaas_kinds_follow_classification() {
        let throttled: ProvisionError = IaasError::Throttled {
            code: "RequestLimitExceeded".to_string(),
            message: "slow down".to_string(),
        }
        .into();
        assert_eq!(throttled.kind(), ErrorKind::IaasThrottled);
        assert!(!throttled.is_permanent());

        let missing: ProvisionError = IaasError::NotFound {
            code: "InvalidAMIID.NotFound".to_string(),
            message: "no such image".to_string(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::IaasPermanent);
        assert!(missing.is_permanent());
    }

    #[test]
    fn key_errors_keep_their_kind() {
        let err: ProvisionError = KeyError::DecryptFailed("bad padding".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::DecryptFailed);
        assert!(err.is_permanent());
    }

    #[test]
    fn cause_chain_includes_sources() {
        let err: ProvisionError = IaasError::permanent("InvalidParameterValue").into();
        let chain = err.cause_chain();
        assert!(chain.starts_with("EC2 call failed: "));
        assert!(chain.contains("InvalidParameterValue"));
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = ProvisionError::SshTimeout {
            instance_id: "i-1".to_string(),
            reason: "no answer".to_string(),
        };
        assert!(!err.is_permanent());
        assert_eq!(err.kind().as_ref(), "SshTimeout");
    }
}

//! Windows administrator password
//!
//! EC2 publishes the generated password, RSA-encrypted with the key pair,
//! some minutes after a Windows instance starts.

use crate::aws::Ec2Api;
use crate::error::{ProvisionError, ProvisionResult};
use crate::wait::{WaitConfig, WaitError, wait_for_resource};
use ec2_agents_common::PrivateKey;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Poll for the encrypted password every `interval` and decrypt it.
pub async fn fetch_password<C: Ec2Api>(
    api: &C,
    instance_id: &str,
    key: &PrivateKey,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProvisionResult<String> {
    let config = WaitConfig::fixed(interval, timeout);
    let blob = wait_for_resource(
        &config,
        Some(cancel),
        || api.get_password_data(instance_id),
        "windows password",
    )
    .await
    .map_err(|e| match e {
        WaitError::Cancelled(_) => ProvisionError::Cancelled,
        WaitError::Timeout { elapsed, .. } => ProvisionError::BootTimeout {
            instance_id: instance_id.to_string(),
            reason: format!("password data not available after {elapsed:?}"),
        },
        WaitError::Check { source, .. } => ProvisionError::Iaas(source),
    })?;

    let password = key.decrypt_windows_password(&blob)?;
    info!(instance_id, "Decrypted Windows administrator password");
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::FakeEc2;
    use ec2_agents_test_utils::keys::{TEST_PASSWORD, TEST_PASSWORD_DATA, TEST_PRIVATE_KEY_PEM};

    #[tokio::test(start_paused = true)]
    async fn waits_for_password_data() {
        let fake = FakeEc2::new();
        fake.set_password_data("i-win", TEST_PASSWORD_DATA, 2);
        let key = PrivateKey::new(TEST_PRIVATE_KEY_PEM);

        let password = fetch_password(
            &fake,
            "i-win",
            &key,
            Duration::from_secs(15),
            Duration::from_secs(180),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(password, TEST_PASSWORD);
        assert_eq!(fake.calls("GetPasswordData"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_password() {
        let fake = FakeEc2::new();
        let key = PrivateKey::new(TEST_PRIVATE_KEY_PEM);
        let err = fetch_password(
            &fake,
            "i-win",
            &key,
            Duration::from_secs(15),
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BootTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_key_fails_decryption() {
        let fake = FakeEc2::new();
        fake.set_password_data("i-win", "bm90IGEgcGFzc3dvcmQ=", 0);
        let err = fetch_password(
            &fake,
            "i-win",
            &PrivateKey::new(TEST_PRIVATE_KEY_PEM),
            Duration::from_secs(15),
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptFailed);
    }
}

//! SDK configuration for one cloud
//!
//! Each cloud resolves region, credentials and endpoint once; the EC2 client
//! is built from the result.

use crate::config::{CloudConfig, CredentialSource};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::config::Credentials;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolved SDK configuration for a cloud.
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

impl AwsContext {
    /// Default credential chain: environment, profile, then instance role.
    pub async fn new(region: &str) -> Self {
        Self::load(region, &CredentialSource::InstanceRole, None).await
    }

    /// Load AWS configuration for a cloud: region, credential source and an
    /// optional endpoint override.
    pub async fn for_cloud(cloud: &CloudConfig) -> Self {
        if let Some(proxy) = &cloud.proxy {
            warn!(
                cloud = %cloud.name,
                proxy = %proxy,
                "Proxy settings are not applied; configure HTTPS_PROXY for the SDK transport"
            );
        }
        Self::load(&cloud.region, &cloud.credentials, cloud.endpoint_url.as_deref()).await
    }

    /// Load AWS configuration with an explicit credential source.
    pub async fn load(
        region: &str,
        credentials: &CredentialSource,
        endpoint_url: Option<&str>,
    ) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

        match credentials {
            CredentialSource::Static {
                access_key_id,
                secret_access_key,
            } => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "ec2-agents-static",
                ));
            }
            CredentialSource::Profile { name } => {
                loader = loader.profile_name(name);
            }
            CredentialSource::InstanceRole => {}
        }

        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }

        let config = loader.load().await;
        debug!(region, source = credentials.kind(), "Loaded AWS configuration");

        Self {
            config: Arc::new(config),
            region: region.to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(&self.config)
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

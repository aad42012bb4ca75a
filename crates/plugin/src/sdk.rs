//! Narrow seam to the AWS service APIs the data channel depends on.
//!
//! The core only ever needs three calls: `ResumeSession` when the WebSocket
//! drops, `TerminateSession` when retransmission gives up, and KMS
//! `GenerateDataKey` when the handshake negotiates encryption. Each is kept
//! behind a trait so the engine and the tests never touch SDK types.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::SdkConfig;
use tracing::debug;

use protocol::encryption::{DataKeyProvider, GeneratedDataKey, KMS_KEY_SIZE_IN_BYTES};
use protocol::error::{ProtocolError, Result};

/// Region used when neither `AWS_REGION` nor the shared config names one.
const FALLBACK_REGION: &str = "us-east-1";

/// Session control calls against the SSM service.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Fetches a fresh channel token for reconnecting. `None` means the
    /// session timed out on the service side.
    async fn resume_session(&self, session_id: &str) -> Result<Option<String>>;

    /// Ends the session on the service side.
    async fn terminate_session(&self, session_id: &str) -> Result<()>;
}

/// Loads the shared AWS configuration honoring the CLI-supplied profile.
/// `AWS_REGION` overrides the shared-config region; otherwise the default
/// provider chain applies with a `us-east-1` fallback.
pub async fn load_sdk_config(profile: Option<&str>) -> SdkConfig {
    let region =
        RegionProviderChain::default_provider().or_else(aws_config::Region::new(FALLBACK_REGION));
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
    if let Some(profile) = profile.filter(|p| !p.is_empty()) {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

/// `SessionService` backed by the SSM API.
pub struct SsmService {
    client: aws_sdk_ssm::Client,
}

impl SsmService {
    /// Builds the service client, optionally against a custom SSM endpoint.
    pub fn new(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_ssm::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: aws_sdk_ssm::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl SessionService for SsmService {
    async fn resume_session(&self, session_id: &str) -> Result<Option<String>> {
        debug!("calling ResumeSession for {session_id}");
        let output = self
            .client
            .resume_session()
            .session_id(session_id)
            .send()
            .await
            .map_err(|e| ProtocolError::Transport(format!("ResumeSession failed: {e}")))?;
        Ok(output.token_value().map(str::to_string))
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        debug!("calling TerminateSession for {session_id}");
        self.client
            .terminate_session()
            .session_id(session_id)
            .send()
            .await
            .map_err(|e| ProtocolError::Transport(format!("TerminateSession failed: {e}")))?;
        Ok(())
    }
}

/// `DataKeyProvider` backed by the KMS API.
pub struct KmsDataKeyProvider {
    client: aws_sdk_kms::Client,
}

impl KmsDataKeyProvider {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl DataKeyProvider for KmsDataKeyProvider {
    async fn generate_data_key(
        &self,
        kms_key_id: &str,
        encryption_context: &HashMap<String, String>,
    ) -> Result<GeneratedDataKey> {
        let output = self
            .client
            .generate_data_key()
            .key_id(kms_key_id)
            .number_of_bytes(KMS_KEY_SIZE_IN_BYTES as i32)
            .set_encryption_context(Some(
                encryption_context
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
            .send()
            .await
            .map_err(|e| {
                ProtocolError::DataKey(format!("error calling KMS GenerateDataKey API: {e}"))
            })?;

        let ciphertext_blob = output
            .ciphertext_blob()
            .ok_or_else(|| ProtocolError::DataKey("GenerateDataKey returned no ciphertext".to_string()))?
            .as_ref()
            .to_vec();
        let plaintext = output
            .plaintext()
            .ok_or_else(|| ProtocolError::DataKey("GenerateDataKey returned no plaintext".to_string()))?
            .as_ref()
            .to_vec();

        Ok(GeneratedDataKey {
            ciphertext_blob,
            plaintext,
        })
    }
}

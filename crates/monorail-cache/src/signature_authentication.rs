use std::env;

use base64::{prelude::BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use os_str_bytes::OsStringBytes;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the team's shared signing secret.
pub const SIGNATURE_KEY_ENV_VAR: &str = "MONORAIL_REMOTE_CACHE_SIGNATURE_KEY";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(
        "signature secret key not found. You must specify a secret key in the \
         MONORAIL_REMOTE_CACHE_SIGNATURE_KEY environment variable"
    )]
    NoSignatureSecretKey,
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error(transparent)]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// The metadata bound into every tag. Serialized as canonical JSON: these two
/// keys, in this order, no extra whitespace. Key order is fixed by the struct
/// field order.
#[derive(Serialize)]
struct SignatureMetadata<'a> {
    hash: &'a str,
    #[serde(rename = "teamId")]
    team_id: &'a str,
}

/// Produces and checks the HMAC-SHA256 tags that bind an artifact's bytes to
/// a (team, fingerprint) identity, so remote artifacts can be neither
/// tampered with nor replayed across teams.
#[derive(Debug)]
pub struct ArtifactSignatureAuthenticator {
    team_id: String,
    // An override for testing purposes, to avoid env var race conditions.
    secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: String, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    // An explicit secret takes priority over the environment. HMAC-SHA256 has
    // no key length limit, though keys over 64 bytes are first hashed.
    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(secret_key) = &self.secret_key_override {
            return Ok(secret_key.to_vec());
        }

        Ok(env::var_os(SIGNATURE_KEY_ENV_VAR)
            .ok_or(SignatureError::NoSignatureSecretKey)?
            .into_raw_vec())
    }

    /// Reports whether a signing secret is actually available, without
    /// computing a tag.
    pub fn is_enabled(&self) -> bool {
        self.secret_key().is_ok()
    }

    fn get_tag_generator(&self, hash: &str) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        let metadata = serde_json::to_vec(&SignatureMetadata {
            hash,
            team_id: &self.team_id,
        })?;

        mac.update(&metadata);

        Ok(mac)
    }

    #[tracing::instrument(skip_all)]
    pub fn generate_tag_bytes(
        &self,
        hash: &str,
        artifact_body: &[u8],
    ) -> Result<Vec<u8>, SignatureError> {
        let mut mac = self.get_tag_generator(hash)?;

        mac.update(artifact_body);
        let hmac_output = mac.finalize();
        Ok(hmac_output.into_bytes().to_vec())
    }

    #[tracing::instrument(skip_all)]
    pub fn generate_tag(
        &self,
        hash: &str,
        artifact_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mut mac = self.get_tag_generator(hash)?;

        mac.update(artifact_body);
        let hmac_output = mac.finalize();
        Ok(BASE64_STANDARD.encode(hmac_output.into_bytes()))
    }

    /// Recomputes the tag and compares in constant time. A tag that is not
    /// valid base64 is a mismatch, not an error.
    #[tracing::instrument(skip_all)]
    pub fn validate(
        &self,
        hash: &str,
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let Ok(expected_bytes) = BASE64_STANDARD.decode(expected_tag) else {
            return Ok(false);
        };

        let mut mac = self.get_tag_generator(hash)?;
        mac.update(artifact_body);

        Ok(mac.verify_slice(&expected_bytes).is_ok())
    }
}

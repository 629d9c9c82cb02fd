use std::io::Write;

use monorail_analytics::AnalyticsSender;
use monorail_api_client::{
    analytics::{self, AnalyticsEvent},
    ApiAuth, CacheClient, Response,
};
use monorail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

/// Remote operations in flight at once. Uploads in particular hold the whole
/// artifact in memory, so the fan-out has to stay bounded.
const CONCURRENCY_LIMIT: usize = 20;

/// The remote tier: exchanges artifacts with the cache service through an
/// opaque [`CacheClient`], optionally signing payloads so they cannot be
/// tampered with or cross-loaded between teams.
pub struct HttpCache<C = monorail_api_client::ApiClient> {
    client: C,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    repo_root: AbsoluteSystemPathBuf,
    api_auth: ApiAuth,
    read_only: bool,
    analytics_recorder: Option<AnalyticsSender>,
    semaphore: Semaphore,
}

impl<C: CacheClient> HttpCache<C> {
    pub fn new(
        client: C,
        opts: &CacheOpts,
        repo_root: AbsoluteSystemPathBuf,
        api_auth: ApiAuth,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> HttpCache<C> {
        let signer_verifier = opts
            .remote_cache_opts
            .as_ref()
            .filter(|remote_cache_opts| remote_cache_opts.signature)
            .map(|_| {
                ArtifactSignatureAuthenticator::new(
                    api_auth.team_id.clone().unwrap_or_default(),
                    None,
                )
            });

        HttpCache {
            client,
            signer_verifier,
            repo_root,
            api_auth,
            read_only: opts.remote_cache_read_only,
            analytics_recorder,
            semaphore: Semaphore::new(CONCURRENCY_LIMIT),
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if self.read_only {
            debug!("remote cache is read-only, skipping upload of {hash}");
            return Ok(());
        }

        let _permit = self.acquire_permit().await?;

        // The artifact is materialized in memory so the signature covers the
        // exact bytes that go over the wire.
        let mut artifact_body = Vec::new();
        Self::write(&mut artifact_body, anchor, files)?;

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash, &artifact_body))
            .transpose()?;

        debug!("uploading {hash}");

        self.client
            .put_artifact(
                hash,
                &artifact_body,
                duration,
                tag.as_deref(),
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?;

        debug!("uploaded {hash}");
        Ok(())
    }

    fn write(
        writer: impl Write,
        anchor: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
    ) -> Result<(), CacheError> {
        let mut cache_archive = CacheWriter::from_writer(writer, true)?;
        for file in files {
            cache_archive.add_file(anchor, file)?;
        }
        cache_archive.finish()?;

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let _permit = self.acquire_permit().await?;

        let response = self
            .client
            .artifact_exists(
                hash,
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?;

        let Some(response) = response else {
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    fn get_duration_from_response(response: &Response) -> Result<u64, CacheError> {
        if let Some(duration_value) = response.headers().get("x-artifact-duration") {
            let duration = duration_value
                .to_str()
                .map_err(|_| CacheError::InvalidDuration)?;

            duration
                .parse::<u64>()
                .map_err(|_| CacheError::InvalidDuration)
        } else {
            Ok(0)
        }
    }

    fn log_fetch(&self, event: analytics::CacheEvent, hash: &str, duration: u64) {
        // A failure to record analytics is not worth failing the cache.
        if let Some(analytics_recorder) = &self.analytics_recorder {
            let analytics_event = AnalyticsEvent {
                session_id: None,
                source: analytics::CacheSource::Remote,
                event,
                hash: hash.to_string(),
                duration,
            };
            let _ = analytics_recorder.send(analytics_event);
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let _permit = self.acquire_permit().await?;

        let response = self
            .client
            .fetch_artifact(
                hash,
                &self.api_auth.token,
                self.api_auth.team_id.as_deref(),
                self.api_auth.team_slug.as_deref(),
            )
            .await?;

        let Some(response) = response else {
            self.log_fetch(analytics::CacheEvent::Miss, hash, 0);
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;

        // With signing enabled the whole body is buffered and verified before
        // a single byte lands on disk.
        let body = if let Some(signer_verifier) = &self.signer_verifier {
            let expected_tag = response
                .headers()
                .get("x-artifact-tag")
                .ok_or(CacheError::ArtifactTagMissing)?;

            let expected_tag = expected_tag
                .to_str()
                .map_err(|_| CacheError::InvalidTag)?
                .to_string();

            let body = response
                .bytes()
                .await
                .map_err(monorail_api_client::Error::from)?;
            let is_valid = signer_verifier.validate(hash, &body, &expected_tag)?;

            if !is_valid {
                return Err(CacheError::InvalidTag);
            }

            body
        } else {
            response
                .bytes()
                .await
                .map_err(monorail_api_client::Error::from)?
        };

        let files = Self::restore_tar(&self.repo_root, &body)?;

        self.log_fetch(analytics::CacheEvent::Hit, hash, duration);
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            files,
        )))
    }

    pub(crate) fn restore_tar(
        root: &AbsoluteSystemPath,
        body: &[u8],
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut cache_reader = CacheReader::from_reader(body, true)?;
        cache_reader.restore(root)
    }

    pub fn clean(&self, _anchor: &AbsoluteSystemPath) {}

    pub fn clean_all(&self) {}

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, CacheError> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use monorail_api_client::ApiClient;
    use monorail_paths::AbsoluteSystemPathBuf;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        test_cases::{get_test_cases, TestCase},
        RemoteCacheOpts,
    };

    fn api_auth() -> ApiAuth {
        ApiAuth {
            team_id: Some("team_vought".to_string()),
            token: "secret-token".to_string(),
            team_slug: None,
        }
    }

    fn artifact_bytes(anchor: &AbsoluteSystemPath, test_case: &TestCase) -> Result<Vec<u8>> {
        let files: Vec<_> = test_case
            .files
            .iter()
            .map(|f| f.path().to_owned())
            .collect();
        let mut body = Vec::new();
        HttpCache::<ApiClient>::write(&mut body, anchor, &files)?;
        Ok(body)
    }

    #[tokio::test]
    async fn test_fetch_restores_files() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;

        for test_case in get_test_cases() {
            test_case.initialize(&repo_root_path)?;
            let body = artifact_bytes(&repo_root_path, &test_case)?;

            let server = httpmock::MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(httpmock::Method::GET)
                        .path(format!("/v1/artifacts/{}", test_case.hash));
                    then.status(200)
                        .header("x-artifact-duration", test_case.duration.to_string())
                        .body(&body);
                })
                .await;

            let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
            let cache = HttpCache::new(
                client,
                &CacheOpts::default(),
                repo_root_path.clone(),
                api_auth(),
                None,
            );

            let (status, files) = cache.fetch(test_case.hash).await?.unwrap();

            assert_eq!(
                status,
                CacheHitMetadata {
                    source: CacheSource::Remote,
                    time_saved: test_case.duration
                }
            );
            assert_eq!(files.len(), test_case.files.len());
            for (expected, actual) in test_case.files.iter().zip(files.iter()) {
                assert_eq!(expected.path(), actual.as_path());
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_miss_on_404() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;

        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET);
                then.status(404);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let cache = HttpCache::new(
            client,
            &CacheOpts::default(),
            repo_root_path,
            api_auth(),
            None,
        );

        assert!(cache.fetch("2e9f0c71a6d8b453").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_put_sends_artifact_and_headers() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let test_case = &get_test_cases()[0];
        test_case.initialize(&repo_root_path)?;

        let server = httpmock::MockServer::start_async().await;
        let put_mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PUT)
                    .path(format!("/v1/artifacts/{}", test_case.hash))
                    .header("x-artifact-duration", test_case.duration.to_string());
                then.status(200);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let cache = HttpCache::new(
            client,
            &CacheOpts::default(),
            repo_root_path.clone(),
            api_auth(),
            None,
        );

        let files: Vec<_> = test_case
            .files
            .iter()
            .map(|f| f.path().to_owned())
            .collect();
        cache
            .put(&repo_root_path, test_case.hash, &files, test_case.duration)
            .await?;

        put_mock.assert_hits_async(1).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_skips_put() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;

        let server = httpmock::MockServer::start_async().await;
        let put_mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PUT);
                then.status(200);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let opts = CacheOpts {
            remote_cache_read_only: true,
            ..Default::default()
        };
        let cache = HttpCache::new(client, &opts, repo_root_path.clone(), api_auth(), None);

        cache
            .put(&repo_root_path, "2e9f0c71a6d8b453", &[], 100)
            .await?;

        put_mock.assert_hits_async(0).await;
        Ok(())
    }

    fn signing_opts() -> CacheOpts {
        CacheOpts {
            remote_cache_opts: Some(RemoteCacheOpts::new(
                Some("team_vought".to_string()),
                true,
            )),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_signed_fetch_round_trips() -> Result<()> {
        // The signer reads its secret from the environment; pin it through an
        // override-free path by setting the variable for this process.
        std::env::set_var(
            crate::signature_authentication::SIGNATURE_KEY_ENV_VAR,
            "on-the-rails",
        );

        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let test_case = &get_test_cases()[0];
        test_case.initialize(&repo_root_path)?;
        let body = artifact_bytes(&repo_root_path, test_case)?;

        let signer = ArtifactSignatureAuthenticator::new("team_vought".to_string(), None);
        let tag = signer.generate_tag(test_case.hash, &body)?;

        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path(format!("/v1/artifacts/{}", test_case.hash));
                then.status(200)
                    .header("x-artifact-duration", test_case.duration.to_string())
                    .header("x-artifact-tag", tag.as_str())
                    .body(&body);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let cache = HttpCache::new(
            client,
            &signing_opts(),
            repo_root_path.clone(),
            api_auth(),
            None,
        );

        let (status, _) = cache.fetch(test_case.hash).await?.unwrap();
        assert_eq!(status.source, CacheSource::Remote);

        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_team_tag_is_rejected() -> Result<()> {
        std::env::set_var(
            crate::signature_authentication::SIGNATURE_KEY_ENV_VAR,
            "on-the-rails",
        );

        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let test_case = &get_test_cases()[0];
        test_case.initialize(&repo_root_path)?;
        let body = artifact_bytes(&repo_root_path, test_case)?;

        // A tag produced for some other team.
        let other_signer = ArtifactSignatureAuthenticator::new("team_other".to_string(), None);
        let tag = other_signer.generate_tag(test_case.hash, &body)?;

        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path(format!("/v1/artifacts/{}", test_case.hash));
                then.status(200)
                    .header("x-artifact-tag", tag.as_str())
                    .body(&body);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let cache = HttpCache::new(
            client,
            &signing_opts(),
            repo_root_path.clone(),
            api_auth(),
            None,
        );

        assert!(matches!(
            cache.fetch(test_case.hash).await,
            Err(CacheError::InvalidTag)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_tag_when_signing_is_fatal() -> Result<()> {
        std::env::set_var(
            crate::signature_authentication::SIGNATURE_KEY_ENV_VAR,
            "on-the-rails",
        );

        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let test_case = &get_test_cases()[0];
        test_case.initialize(&repo_root_path)?;
        let body = artifact_bytes(&repo_root_path, test_case)?;

        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path(format!("/v1/artifacts/{}", test_case.hash));
                then.status(200).body(&body);
            })
            .await;

        let client = ApiClient::new(server.base_url(), 10, "0.1.0")?;
        let cache = HttpCache::new(
            client,
            &signing_opts(),
            repo_root_path.clone(),
            api_auth(),
            None,
        );

        assert!(matches!(
            cache.fetch(test_case.hash).await,
            Err(CacheError::ArtifactTagMissing)
        ));

        Ok(())
    }
}

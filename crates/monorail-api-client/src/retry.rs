use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::sleep;

use crate::Error;

const MIN_SLEEP_TIME_SECS: u64 = 2;
const MAX_SLEEP_TIME_SECS: u64 = 10;
const RETRY_MAX: u32 = 2;

/// Retries a request until `RETRY_MAX` is reached, the error stops looking
/// transient, or the request succeeds. Exponential backoff with a base of 2
/// between attempts.
///
/// The builder must be cloneable; a streaming body cannot be retried, so such
/// requests are sent exactly once.
pub(crate) async fn make_retryable_request(
    request_builder: RequestBuilder,
) -> Result<Response, Error> {
    let mut last_error = None;
    for retry_count in 0..RETRY_MAX {
        let Some(builder) = request_builder.try_clone() else {
            return Ok(request_builder.send().await?);
        };
        match builder.send().await {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !should_retry_request(&err) {
                    return Err(err.into());
                }
                last_error = Some(err);
            }
        }

        let sleep_period = (2_u64)
            .pow(retry_count)
            .clamp(MIN_SLEEP_TIME_SECS, MAX_SLEEP_TIME_SECS);
        sleep(std::time::Duration::from_secs(sleep_period)).await;
    }

    Err(Error::TooManyFailures(Box::new(last_error.unwrap())))
}

fn should_retry_request(error: &reqwest::Error) -> bool {
    if let Some(status) = error.status() {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return true;
        }

        if status.as_u16() >= 500 && status.as_u16() != 501 {
            return true;
        }
    }

    error.is_connect()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn handles_too_many_failures() {
        let mock = httpmock::MockServer::start_async().await;
        let req = mock
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET);
                then.delay(Duration::from_secs(100));
            })
            .await;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        let request_builder = client.get(mock.url("/")).timeout(Duration::from_millis(10));
        let result = make_retryable_request(request_builder).await;

        // Timeouts after connecting are not retried.
        req.assert_hits_async(1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn handles_connection_refused() {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        // Nothing listens on port 1.
        let err = client.get("http://localhost:1").send().await.unwrap_err();
        assert!(should_retry_request(&err));
    }
}

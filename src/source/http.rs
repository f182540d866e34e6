//! Shared HTTP response helpers for the REST client.

use super::error::SourceError;

/// Check an HTTP response for common error conditions.
///
/// Returns the response unchanged on success. 429 becomes
/// [`SourceError::RateLimited`] (falling back to 60 s without a usable
/// `Retry-After`), 404 becomes [`SourceError::NotFound`], any other failure
/// status becomes [`SourceError::Api`] with the response body.
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status == 429 {
        return Err(SourceError::RateLimited {
            retry_after_secs: parse_retry_after(&resp),
        });
    }
    if status == 404 {
        return Err(SourceError::NotFound(resp.url().path().to_string()));
    }
    if !status.is_success() {
        return Err(SourceError::Api {
            status: status.as_u16(),
            message: resp.text().await.unwrap_or_default(),
        });
    }
    Ok(resp)
}

fn parse_retry_after(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60)
}

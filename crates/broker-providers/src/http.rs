use crate::{ProviderError, ProviderResult};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn build_client(timeout: Option<Duration>) -> ProviderResult<Client> {
    Client::builder()
        .timeout(timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
        .build()
        .map_err(|e| ProviderError::Backend(format!("failed to build http client: {e}")))
}

pub(crate) fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::Backend(format!("failed to decode response: {err}"))
    } else if err.is_builder() {
        ProviderError::InvalidParameters(err.to_string())
    } else {
        ProviderError::InstanceUnreachable(err.to_string())
    }
}

pub(crate) fn map_status(status: StatusCode, body: &str) -> ProviderError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthenticationFailed(message)
        }
        StatusCode::NOT_FOUND => ProviderError::ResourceNotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::InvalidParameters(message)
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Timeout(message)
        }
        s if s.is_server_error() => ProviderError::InstanceUnreachable(message),
        _ => ProviderError::Backend(message),
    }
}

/// Fails on non-success statuses, keeping the body for the error message.
pub(crate) async fn check(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_status(status, body.trim()))
}

pub(crate) async fn json<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
    check(response).await?.json().await.map_err(map_transport)
}

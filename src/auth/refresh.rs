// Token refresh exchange

use async_trait::async_trait;
use reqwest::{Client, Url};

use super::types::{Envelope, RefreshPayload, RefreshRequest, ResultCodes, TokenGrant};
use crate::error::RefreshError;

/// Path of the refresh endpoint, relative to the API base
pub const REFRESH_PATH: &str = "v1/auth/updateToken";

/// Network call trading a refresh token for new credentials
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

/// Refresh exchange against the backend's `updateToken` endpoint
pub struct HttpRefreshExchange {
    client: Client,
    url: Url,
    codes: ResultCodes,
}

impl HttpRefreshExchange {
    /// `base` is the API root, e.g. `https://example.com/api/`
    pub fn new(client: Client, base: &Url, codes: ResultCodes) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            url: base.join(REFRESH_PATH)?,
            codes,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RefreshExchange for HttpRefreshExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        tracing::info!("Refreshing access token via {}...", self.url.path());

        let response = self
            .client
            .post(self.url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %error_text,
                "Refresh endpoint returned an HTTP error"
            );
            return Err(RefreshError::Rejected {
                code: i64::from(status.as_u16()),
                message: error_text,
            });
        }

        let envelope: Envelope<RefreshPayload> = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidPayload(e.to_string()))?;

        interpret(envelope, &self.codes)
    }
}

/// Map a refresh response envelope onto a grant or a failure
pub fn interpret(
    envelope: Envelope<RefreshPayload>,
    codes: &ResultCodes,
) -> Result<TokenGrant, RefreshError> {
    if envelope.code == codes.login_again {
        tracing::warn!("Refresh token rejected by backend: {}", envelope.msg);
        return Err(RefreshError::SessionInvalid);
    }

    if envelope.code != codes.ok {
        return Err(RefreshError::Rejected {
            code: envelope.code,
            message: envelope.msg,
        });
    }

    let payload = envelope
        .data
        .ok_or_else(|| RefreshError::InvalidPayload("response has no data".to_string()))?;

    if payload.token.is_empty() {
        return Err(RefreshError::InvalidPayload(
            "response does not contain token".to_string(),
        ));
    }

    Ok(payload.into())
}

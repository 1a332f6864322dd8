//! `reqwest`-based [`Webhook`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use snafu::ResultExt;
use url::Url;

use crate::error::Error;

use super::{
    RequestSnafu, TransportError, Webhook, WebhookFuture, WebhookRequest, WebhookResponse,
};

#[derive(Clone)]
pub struct HttpWebhook {
    client: Client,
    base_url: Url,
}

impl HttpWebhook {
    /// Creates a client for the webhook host at `base_url`. Each attempt is
    /// bounded by `timeout`.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::internal)?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `path` to the base URL's path, keeping any prefix the base
    /// already carries (`https://host/api` + `/hook` is `https://host/api/hook`).
    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        if self.base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl {
                message: format!("{} cannot carry a path", self.base_url),
            });
        }

        let mut url = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            self.base_url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        Ok(url)
    }
}

impl Webhook for HttpWebhook {
    fn send<'a>(&'a self, request: &'a WebhookRequest, path: &'a str) -> WebhookFuture<'a> {
        Box::pin(async move {
            let url = self.endpoint(path)?;

            let response = self
                .client
                .post(url)
                .json(request)
                .send()
                .await
                .context(RequestSnafu)?;

            let status = response.status();
            if status != StatusCode::OK {
                return Err(TransportError::Status {
                    code: status.as_u16(),
                });
            }

            let bytes = response.bytes().await.context(RequestSnafu)?;

            serde_json::from_slice::<WebhookResponse>(&bytes).map_err(|e| {
                TransportError::Decode {
                    message: e.to_string(),
                }
            })
        })
    }
}

use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

pub type MessageId = Uuid;

// ===== Public API ============================================================

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

/// A client bound to one subscriber name.
#[derive(Clone)]
pub struct Subscriber {
    client: Client,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub payload: String,
}

pub struct AckableMessage {
    pub message_id: MessageId,
    pub payload: String,
    subscriber: Subscriber,
}

impl AckableMessage {
    pub async fn ack(self) -> Result<(), AckError> {
        self.subscriber.ack(self.message_id).await
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AckError {
    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("reservation expired: {0}")]
    ReservationExpired(String),

    #[error("ack rejected with {status}: {error}")]
    Rejected { status: u16, error: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

// ===== Wire types ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollBody {
    message: String,
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBody {
    message_id: MessageId,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

async fn error_of(res: reqwest::Response) -> (StatusCode, String) {
    let status = res.status();
    let body: ErrorBody = res.json().await.unwrap_or_default();
    (status, body.error)
}

// ===== Client API ============================================================

impl Client {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_options(base_url, ClientOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, opts: ClientOptions) -> anyhow::Result<Self> {
        // no overall timeout: polls are held open by the server
        let http = reqwest::Client::builder()
            .connect_timeout(opts.connect_timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout: opts.request_timeout,
        })
    }

    pub fn subscriber(&self, name: impl Into<String>) -> Subscriber {
        Subscriber {
            client: self.clone(),
            name: name.into(),
        }
    }

    pub async fn publish(&self, payload: impl Into<Bytes>) -> anyhow::Result<MessageId> {
        let res = self
            .http
            .post(format!("{}/publish", self.base_url))
            .timeout(self.request_timeout)
            .body(payload.into())
            .send()
            .await?;

        if !res.status().is_success() {
            let (status, error) = error_of(res).await;
            anyhow::bail!("publish failed with {status}: {error}");
        }

        let body: PublishBody = res.json().await?;
        Ok(body.message_id)
    }

    /// Long poll for the next message of `client`. Waits as long as the
    /// server holds the request.
    pub async fn poll(&self, client: &str) -> anyhow::Result<Message> {
        let res = self
            .http
            .get(format!("{}/poll", self.base_url))
            .query(&[("clientName", client)])
            .send()
            .await?;

        if !res.status().is_success() {
            let (status, error) = error_of(res).await;
            anyhow::bail!("poll failed with {status}: {error}");
        }

        let body: PollBody = res.json().await?;
        Ok(Message {
            message_id: body.message_id,
            payload: body.message,
        })
    }

    pub async fn ack(&self, client: &str, message_id: MessageId) -> Result<(), AckError> {
        let message_id = message_id.to_string();
        let res = self
            .http
            .get(format!("{}/ack", self.base_url))
            .timeout(self.request_timeout)
            .query(&[("clientName", client), ("messageId", message_id.as_str())])
            .send()
            .await?;

        if res.status().is_success() {
            return Ok(());
        }

        let (status, error) = error_of(res).await;
        Err(match status {
            StatusCode::NOT_FOUND => AckError::UnknownClient(error),
            StatusCode::GONE => AckError::ReservationExpired(error),
            other => AckError::Rejected {
                status: other.as_u16(),
                error,
            },
        })
    }

    pub async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        let res = self
            .http
            .get(format!("{}/stats", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json().await?)
    }
}

impl Subscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next(&self) -> anyhow::Result<AckableMessage> {
        let msg = self.client.poll(&self.name).await?;
        Ok(AckableMessage {
            message_id: msg.message_id,
            payload: msg.payload,
            subscriber: self.clone(),
        })
    }

    pub async fn ack(&self, message_id: MessageId) -> Result<(), AckError> {
        self.client.ack(&self.name, message_id).await
    }

    /// Endless stream of polled messages; ends after the first error.
    pub fn into_stream(self) -> impl futures::Stream<Item = anyhow::Result<AckableMessage>> {
        futures::stream::unfold(Some(self), |state| async move {
            let sub = state?;
            match sub.next().await {
                Ok(msg) => Some((Ok(msg), Some(sub))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

// ===== Options ===============================================================

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Applies to publish, ack and stats. Polls never time out.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

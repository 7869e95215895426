//! Google Cloud Pub/Sub over its REST API.
//!
//! Queue URLs look like `gcppubsub://projects/<project>/topics/<topic>` and
//! `gcppubsub://projects/<project>/subscriptions/<subscription>`. When
//! `PUBSUB_EMULATOR_HOST` is set, requests go to the emulator without auth.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use super::deadline::DeadlineExtender;
use super::publisher::MessageSink;
use super::{QueueError, Subscriber, SubscriberOptions};
use crate::auth::TokenSource;
use crate::data::BatchRequest;

pub const URL_SCHEME: &str = "gcppubsub";
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";
const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Turn a `gcppubsub://projects/p/<kind>/name` URL into `projects/p/<kind>/name`.
pub fn resource_name(url: &str, kind: &str) -> Result<String, QueueError> {
    let invalid = |reason: String| QueueError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let rest = url
        .strip_prefix(URL_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| invalid(format!("expected {URL_SCHEME}:// scheme")))?;
    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match parts.as_slice() {
        ["projects", project, k, name] if *k == kind && !project.is_empty() && !name.is_empty() => {
            Ok(rest.trim_end_matches('/').to_string())
        }
        _ => Err(invalid(format!("expected projects/<project>/{kind}/<name>"))),
    }
}

#[derive(Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    endpoint: String,
    auth: Option<Arc<TokenSource>>,
}

impl PubSubClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, auth: Option<Arc<TokenSource>>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn from_env() -> Self {
        let http = reqwest::Client::new();
        match std::env::var(EMULATOR_HOST_ENV) {
            Ok(host) if !host.is_empty() => {
                debug!(host = %host, "Using Pub/Sub emulator");
                Self::new(http, format!("http://{host}"), None)
            }
            _ => {
                let auth = Arc::new(TokenSource::from_env(http.clone()));
                Self::new(http, PUBSUB_ENDPOINT, Some(auth))
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        resource: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, QueueError> {
        let url = format!("{}/v1/{}:{}", self.endpoint, resource, method);
        let mut request = self.http.post(&url).json(&body);
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.token().await?);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        deadline: Duration,
    ) -> Result<(), QueueError> {
        let _: IgnoredAny = self
            .call(
                subscription,
                "modifyAckDeadline",
                json!({ "ackIds": [ack_id], "ackDeadlineSeconds": deadline.as_secs() }),
            )
            .await?;
        Ok(())
    }
}

/// Publishing side: one `:publish` call per message.
#[derive(Clone)]
pub struct PubSubSink {
    client: PubSubClient,
    topic: String,
}

impl PubSubSink {
    pub fn new(client: PubSubClient, topic_url: &str) -> Result<Self, QueueError> {
        Ok(Self {
            client,
            topic: resource_name(topic_url, "topics")?,
        })
    }
}

#[async_trait]
impl MessageSink for PubSubSink {
    async fn send(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let _: IgnoredAny = self
            .client
            .call(
                &self.topic,
                "publish",
                json!({ "messages": [{ "data": STANDARD.encode(payload) }] }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

struct Held {
    ack_id: String,
    extender: DeadlineExtender,
}

fn is_transient(e: &QueueError) -> bool {
    match e {
        QueueError::Transport(_) => true,
        QueueError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

pub struct PubSubSubscriber {
    client: PubSubClient,
    subscription: String,
    options: SubscriberOptions,
    held: Option<Held>,
}

impl PubSubSubscriber {
    pub fn new(
        client: PubSubClient,
        subscription_url: &str,
        options: SubscriberOptions,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            client,
            subscription: resource_name(subscription_url, "subscriptions")?,
            options,
            held: None,
        })
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<(), QueueError> {
        let _: IgnoredAny = self
            .client
            .call(&self.subscription, "acknowledge", json!({ "ackIds": [ack_id] }))
            .await?;
        Ok(())
    }

    fn hold(&mut self, ack_id: String) {
        let client = self.client.clone();
        let subscription = self.subscription.clone();
        let id = ack_id.clone();
        let deadline = self.options.ack_deadline;
        let extender = DeadlineExtender::spawn(self.options.extend_interval, move || {
            let client = client.clone();
            let subscription = subscription.clone();
            let id = id.clone();
            async move { client.modify_ack_deadline(&subscription, &id, deadline).await }
        });
        self.held = Some(Held { ack_id, extender });
    }

    async fn release(&mut self) -> Result<String, QueueError> {
        let held = self.held.take().ok_or(QueueError::NoMessageHeld)?;
        held.extender.stop().await;
        Ok(held.ack_id)
    }
}

#[async_trait]
impl Subscriber for PubSubSubscriber {
    async fn synchronous_pull(&mut self) -> Result<Option<BatchRequest>, QueueError> {
        if self.held.is_some() {
            return Err(QueueError::MessageHeld);
        }
        let mut failures = 0;
        loop {
            let pulled: Result<PullResponse, QueueError> = self
                .client
                .call(&self.subscription, "pull", json!({ "maxMessages": 1 }))
                .await;
            let received = match pulled {
                Ok(response) => {
                    failures = 0;
                    response.received_messages.into_iter().next()
                }
                Err(e) if is_transient(&e) && failures < self.options.max_transport_retries => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Pull failed, retrying");
                    tokio::time::sleep(self.options.empty_backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(received) = received else {
                debug!(subscription = %self.subscription, "No messages available, backing off");
                tokio::time::sleep(self.options.empty_backoff).await;
                continue;
            };
            let decoded = STANDARD
                .decode(received.message.data.as_bytes())
                .map_err(|e| e.to_string())
                .and_then(|bytes| BatchRequest::decode(&bytes).map_err(|e| e.to_string()));
            match decoded {
                Ok(request) => {
                    self.hold(received.ack_id);
                    return Ok(Some(request));
                }
                Err(e) => {
                    error!(
                        message_id = %received.message.message_id,
                        error = %e,
                        "Dropping message that cannot be decoded"
                    );
                    self.acknowledge(&received.ack_id).await?;
                }
            }
        }
    }

    async fn ack(&mut self) -> Result<(), QueueError> {
        let ack_id = self.release().await?;
        self.acknowledge(&ack_id).await
    }

    async fn nack(&mut self) -> Result<(), QueueError> {
        let ack_id = self.release().await?;
        self.client
            .modify_ack_deadline(&self.subscription, &ack_id, Duration::ZERO)
            .await
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        if self.held.is_some() {
            warn!("Closing subscriber with a held message, releasing it");
            self.nack().await?;
        }
        Ok(())
    }
}

//! HTTP implementations of the generation and retrieval calls.
//!
//! Generation posts the turn payload and streams the plain-text response
//! body back chunk by chunk. Retrieval posts the same payload and reads a
//! JSON [`RetrievalResult`].

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};

use parley_chat::{ChatError, ChunkStream, GenerationBackend, GenerationPayload, RetrievalBackend, RetrievalResult};
use parley_core::config::BackendConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBackend {
    client: Client,
    generation_url: String,
    retrieval_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        // A whole-request timeout would cut off long replies, so the
        // configured limit applies to each read instead.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            generation_url: endpoint(&config.base_url, &config.generation_path),
            retrieval_url: endpoint(&config.base_url, &config.retrieval_path),
            api_token: config.api_token.clone(),
        })
    }

    fn post(&self, url: &str, payload: &GenerationPayload) -> RequestBuilder {
        let request = self.client.post(url).json(payload);
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn generate(&self, payload: &GenerationPayload) -> Result<ChunkStream, ChatError> {
        let response = self
            .post(&self.generation_url, payload)
            .send()
            .await
            .map_err(|e| ChatError::GenerationCallFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::GenerationCallFailed(format!(
                "backend returned {}",
                status
            )));
        }
        tracing::debug!(url = %self.generation_url, model = %payload.model, "Generation stream opened");

        let mut body = response.bytes_stream();
        Ok(stream! {
            let mut decoder = Utf8Decoder::default();
            let mut failed = false;
            while let Some(item) = body.next().await {
                match item {
                    Ok(bytes) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        failed = true;
                        yield Err(ChatError::StreamReadFailed(e.to_string()));
                        break;
                    }
                }
            }
            if !failed {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    yield Ok(rest);
                }
            }
        }
        .boxed())
    }
}

#[async_trait]
impl RetrievalBackend for HttpBackend {
    async fn retrieve(&self, payload: &GenerationPayload) -> Result<RetrievalResult, ChatError> {
        let response = self
            .post(&self.retrieval_url, payload)
            .send()
            .await
            .map_err(|e| ChatError::RetrievalProcessingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(retrieval_error(status, &body));
        }
        response
            .json::<RetrievalResult>()
            .await
            .map_err(|e| ChatError::RetrievalProcessingFailed(format!("bad response: {}", e)))
    }
}

fn retrieval_error(status: StatusCode, body: &str) -> ChatError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    if status == StatusCode::NOT_FOUND {
        ChatError::RetrievalNotFound(detail)
    } else {
        ChatError::RetrievalProcessingFailed(detail)
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Turns a byte stream into text without splitting multi-byte characters
/// that straddle two network reads.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // Incomplete sequence at the end: hold it for the next read.
            Err(e) if e.error_len().is_none() => {
                let tail = self.pending.split_off(e.valid_up_to());
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = tail;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

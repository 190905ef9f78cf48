//! Streaming client for the Gemini generateContent API.
//!
//! Requests use `streamGenerateContent?alt=sse`, so the response body is a
//! server-sent-event stream of JSON chunks. A pump task reads the body and
//! forwards extracted text deltas over a channel; dropping the returned
//! stream drops the receiver, which aborts the HTTP request on the next
//! forward attempt.

use crate::delivery::DeltaStream;
use crate::error::SourceError;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model,
        }
    }

    /// Start a generation and return the delta stream. Errors before the
    /// first byte (connection refused, auth rejection) surface as the first
    /// stream item rather than here, keeping the call site uniform.
    pub async fn stream_answer(&self, prompt: &str) -> DeltaStream {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let body = GenerateRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
        };
        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", self.api_key.clone())
            .json(&body);

        let (tx, rx) = mpsc::channel::<Result<String, SourceError>>(32);
        tokio::spawn(pump(request, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

/// Read the SSE body and forward text deltas. Stops early if the receiver
/// is gone.
async fn pump(request: reqwest::RequestBuilder, tx: mpsc::Sender<Result<String, SourceError>>) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            let _ = tx
                .send(Err(SourceError(format!("request failed: {error}"))))
                .await;
            return;
        }
    };

    if let Err(error) = response.error_for_status_ref() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        tracing::warn!(%status, %error, "generation request rejected");
        let _ = tx
            .send(Err(SourceError(format!(
                "generation rejected with {status}: {detail}"
            ))))
            .await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut pending = Vec::new();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(error) => {
                let _ = tx
                    .send(Err(SourceError(format!("stream interrupted: {error}"))))
                    .await;
                return;
            }
        };
        pending.extend_from_slice(&bytes);

        // SSE events are newline-delimited; a chunk may end mid-line.
        while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    for delta in extract_text(chunk) {
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "skipping unparseable stream event");
                }
            }
        }
    }
}

fn extract_text(chunk: StreamChunk) -> Vec<String> {
    chunk
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .filter(|text| !text.is_empty())
        .collect()
}

use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Incremental decoder for `text/event-stream` bodies. Yields the joined
/// `data:` payload of every complete event.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame = self.buffer.drain(..pos + 2).collect::<Vec<_>>();
            let frame = String::from_utf8_lossy(&frame[..pos]);
            let data = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|line| line.strip_prefix(' ').unwrap_or(line))
                .collect::<Vec<_>>()
                .join("\n");
            let data = data.trim();
            if !data.is_empty() {
                out.push(data.to_string());
            }
        }
        out
    }
}

/// Maps an SSE response into a stream of text deltas using a vendor-specific
/// extractor. `[DONE]` sentinels and undecodable payloads are skipped.
pub(crate) fn text_stream<F>(
    response: reqwest::Response,
    cancel: CancellationToken,
    extract: F,
) -> TokenStream
where
    F: Fn(&Value) -> anyhow::Result<Option<String>> + Send + 'static,
{
    let mut bytes = response.bytes_stream();
    Box::pin(try_stream! {
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = bytes.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let chunk = chunk?;
            for payload in decoder.push(&chunk) {
                if payload == "[DONE]" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                    continue;
                };
                if let Some(text) = extract(&value)? {
                    if !text.is_empty() {
                        yield text;
                    }
                }
            }
        }
    })
}

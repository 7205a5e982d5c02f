//! SSE response -> [`CompletionStream`] adapter.

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Response;

use crate::provider::{CompletionStream, LlmError, Result};
use crate::types::CompletionChunk;

fn to_stream_error(err: LlmError) -> LlmError {
    match err {
        LlmError::Stream(msg) => LlmError::Stream(msg),
        other => LlmError::Stream(other.to_string()),
    }
}

/// Convert an SSE HTTP [`Response`] into a [`CompletionStream`].
///
/// `handler` receives the event name and data payload of each event and
/// returns `Ok(Some(chunk))` to emit, `Ok(None)` to skip, or an error that is
/// surfaced as [`LlmError::Stream`].
pub fn completion_stream_from_sse<H>(response: Response, mut handler: H) -> CompletionStream
where
    H: FnMut(&str, &str) -> Result<Option<CompletionChunk>> + Send + 'static,
{
    let stream = response
        .bytes_stream()
        .eventsource()
        .map(move |event| {
            let event = event.map_err(|e| LlmError::Stream(e.to_string()))?;
            handler(event.event.as_str(), event.data.as_str()).map_err(to_stream_error)
        })
        .filter_map(|result| async move {
            match result {
                Ok(Some(chunk)) => Some(Ok(chunk)),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            }
        });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(body: &'static str) -> (MockServer, Response) {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&mock_server)
            .await;

        let response = reqwest::Client::new()
            .get(format!("{}/sse", mock_server.uri()))
            .send()
            .await
            .expect("response");
        (mock_server, response)
    }

    #[tokio::test]
    async fn skipped_events_are_filtered() {
        let (_server, response) = serve(concat!(
            "event: token\n",
            "data: hello\n",
            "\n",
            "event: token\n",
            "data: skip\n",
            "\n",
        ))
        .await;

        let mut stream = completion_stream_from_sse(response, |event, data| {
            if data == "skip" {
                return Ok(None);
            }
            Ok(Some(CompletionChunk::Token(format!("{event}:{data}"))))
        });

        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.expect("chunk"));
        }
        assert_eq!(out, vec![CompletionChunk::Token("token:hello".to_string())]);
    }

    #[tokio::test]
    async fn handler_errors_become_stream_errors() {
        let (_server, response) = serve(concat!("data: boom\n", "\n")).await;

        let mut stream =
            completion_stream_from_sse(response, |_event, _data| Err(LlmError::Api("boom".to_string())));

        match stream.next().await {
            Some(Err(LlmError::Stream(msg))) => assert!(msg.contains("API error")),
            other => panic!("expected a stream error, got {other:?}"),
        }
    }
}

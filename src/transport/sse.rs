use std::fmt::Display;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};

use super::BoxEventStream;
use crate::error::{AgentError, ProtocolError};
use crate::events::Event;

/// Frame one event as an SSE `data:` record.
pub fn encode_sse(event: &Event) -> Result<String, AgentError> {
    let json = event
        .to_json()
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(format!("data: {json}\n\n"))
}

/// Frame a whole event stream, ready to hand to an HTTP response body.
pub fn sse_body<S>(events: S) -> impl Stream<Item = Result<String, AgentError>> + Send
where
    S: Stream<Item = Event> + Send,
{
    events.map(|event| encode_sse(&event))
}

/// Decode an SSE byte stream into events. Records without data (keep-alive
/// comments, bare retries) are skipped; unknown event types are errors.
pub fn decode_sse<S, B, E>(bytes: S) -> BoxEventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let events = bytes
        .eventsource()
        .filter(|record| {
            let keep = match record {
                Ok(record) => !record.data.trim().is_empty(),
                Err(_) => true,
            };
            futures::future::ready(keep)
        })
        .map(|record| match record {
            Ok(record) => Event::from_json(&record.data).map_err(AgentError::from),
            Err(e) => Err(AgentError::Protocol(ProtocolError::Malformed(format!(
                "SSE stream error: {e}"
            )))),
        });
    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: Vec<&'static str>) -> impl Stream<Item = Result<&'static [u8], std::io::Error>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes())))
    }

    #[test]
    fn frames_as_data_line() {
        let framed = encode_sse(&Event::step_started("step_1")).unwrap();
        assert_eq!(framed, "data: {\"type\":\"STEP_STARTED\",\"stepName\":\"step_1\"}\n\n");
    }

    #[tokio::test]
    async fn decodes_records_split_across_chunks() {
        let events: Vec<Event> = decode_sse(chunks(vec![
            "data: {\"type\":\"RUN_STA",
            "RTED\",\"threadId\":\"t\",\"runId\":\"r\"}\n",
            "\n: keep-alive\n\n",
            "data: {\"type\":\"RUN_FINISHED\",\"threadId\":\"t\",\"runId\":\"r\",\"outcome\":\"success\"}\n\n",
        ]))
        .map(Result::unwrap)
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Event::run_started("t", "r"));
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn unknown_type_is_a_protocol_error() {
        let mut events = decode_sse(chunks(vec!["data: {\"type\":\"NOPE\"}\n\n"]));
        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AgentError::Protocol(ProtocolError::UnknownEventType(ref t)) if t == "NOPE"
        ));
    }

    #[tokio::test]
    async fn body_round_trips_through_decoder() {
        let source = vec![
            Event::text_message_start("m1"),
            Event::text_message_content("m1", "héllo\nworld"),
            Event::text_message_end("m1"),
        ];
        let framed: String = sse_body(stream::iter(source.clone()))
            .map(Result::unwrap)
            .collect::<Vec<_>>()
            .await
            .concat();

        let decoded: Vec<Event> = decode_sse(stream::iter(vec![Ok::<_, std::io::Error>(framed)]))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(decoded, source);
    }
}

//! Shared SSE plumbing for the provider adapters.
//!
//! Both adapters receive a `reqwest::Response`, accumulate chunks,
//! split on blank lines, and hand each `data:` payload to a
//! provider-specific parser returning zero or more normalized deltas.

use dp_domain::error::Result;
use dp_domain::stream::{BoxStream, StreamDelta};

use crate::util::from_reqwest;

/// Pull complete `data:` payloads out of an SSE buffer.
///
/// Events are delimited by a blank line; `event:`, `id:` and `retry:`
/// lines are ignored. Consumed bytes are drained in place so a trailing
/// partial event survives to the next call.
pub(crate) fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

/// Build a delta stream from an SSE response and a parser closure.
///
/// The closure is `FnMut` because tool-call assembly needs mutable
/// state across payloads. The stream flushes the trailing buffer when
/// the body closes and guarantees a final `Finish` delta even when the
/// provider never sent one.
pub(crate) fn sse_delta_stream<F>(
    provider: String,
    response: reqwest::Response,
    mut parse: F,
) -> BoxStream<'static, Result<StreamDelta>>
where
    F: FnMut(&str) -> Vec<Result<StreamDelta>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut finished = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for payload in drain_data_payloads(&mut buffer) {
                        for delta in parse(&payload) {
                            if matches!(&delta, Ok(StreamDelta::Finish { .. })) {
                                finished = true;
                            }
                            yield delta;
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for payload in drain_data_payloads(&mut buffer) {
                            for delta in parse(&payload) {
                                if matches!(&delta, Ok(StreamDelta::Finish { .. })) {
                                    finished = true;
                                }
                                yield delta;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(&provider, e));
                    break;
                }
            }
        }

        if !finished {
            yield Ok(StreamDelta::Finish {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

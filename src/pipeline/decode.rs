//! Streaming decoder (Bytes -> StreamFragment)
//!
//! The upstream streams newline-delimited `data: {json}` lines and ends with
//! `data: [DONE]`. The decoder buffers raw bytes, so chunk boundaries may fall
//! anywhere, including inside a multi-byte UTF-8 sequence.

use crate::error_code::{ClassifiedError, ErrorClassifier, Outcome};
use crate::types::{StreamFragment, Usage};
use crate::{BoxStream, Error};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;

const DATA_PREFIX: &str = "data:";
const DONE_SIGNAL: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental SSE decoder for one response.
///
/// Feed it raw chunks with [`feed`](Self::feed) and call [`finish`](Self::finish)
/// at end of input. It emits at most one terminal fragment and ignores anything
/// after it.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    done: bool,
    usage: Option<Usage>,
    // An error hit after some fragments were already decoded in the same call.
    deferred: Option<ClassifiedError>,
    classifier: ErrorClassifier,
}

impl StreamDecoder {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self {
            buf: Vec::new(),
            done: false,
            usage: None,
            deferred: None,
            classifier,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Take an error that was held back so earlier fragments could be delivered first.
    pub fn take_deferred_error(&mut self) -> Option<ClassifiedError> {
        let err = self.deferred.take();
        if err.is_some() {
            self.done = true;
        }
        err
    }

    /// Decode every complete line in `chunk` (plus any buffered remainder).
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamFragment>, ClassifiedError> {
        if let Some(err) = self.deferred.take() {
            self.done = true;
            return Err(err);
        }
        if self.done {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=idx).collect();
            if let Err(err) = self.decode_line(&line, &mut out) {
                self.buf.clear();
                if out.is_empty() {
                    self.done = true;
                    return Err(err);
                }
                self.deferred = Some(err);
                return Ok(out);
            }
            if self.done {
                self.buf.clear();
                break;
            }
        }
        Ok(out)
    }

    /// Flush a trailing unterminated line. Errors if no terminal frame was seen.
    pub fn finish(&mut self) -> Result<Vec<StreamFragment>, ClassifiedError> {
        if let Some(err) = self.deferred.take() {
            self.done = true;
            return Err(err);
        }
        let mut out = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.decode_line(&line, &mut out)?;
        }
        if !self.done {
            tracing::warn!("chatlink stream closed before terminal frame");
            return Err(self.classifier.classify(Outcome::TruncatedStream));
        }
        Ok(out)
    }

    fn decode_line(
        &mut self,
        raw: &[u8],
        out: &mut Vec<StreamFragment>,
    ) -> Result<(), ClassifiedError> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();

        // Blank separators, SSE comments (": OPENROUTER PROCESSING"), and
        // non-data fields carry nothing for us.
        if line.is_empty() || line.starts_with(':') {
            return Ok(());
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return Ok(());
        };
        let payload = payload.trim_start();

        if payload == DONE_SIGNAL {
            self.done = true;
            out.push(StreamFragment::Done { usage: self.usage });
            return Ok(());
        }

        let chunk: ChunkWire = serde_json::from_str(payload).map_err(|e| {
            self.classifier.classify(Outcome::MalformedResponse {
                detail: format!("invalid stream chunk: {}", e),
            })
        })?;

        if chunk.error.is_some() {
            return Err(self.classifier.classify(Outcome::StreamError { body: payload }));
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let content = choice
                .delta
                .and_then(|d| d.content)
                .unwrap_or_default();
            if content.is_empty() && choice.finish_reason.is_none() {
                continue;
            }
            out.push(StreamFragment::Delta {
                content,
                finish_reason: choice.finish_reason,
            });
        }
        Ok(())
    }
}

/// Adapt a raw byte stream into an ordered fragment stream.
///
/// The output ends right after the terminal fragment, or right after the first
/// error (a transport error from `input`, a classified stream error, or a
/// truncation).
pub fn decode_stream(
    input: BoxStream<'static, Bytes>,
    classifier: ErrorClassifier,
) -> BoxStream<'static, StreamFragment> {
    struct State {
        input: BoxStream<'static, Bytes>,
        decoder: StreamDecoder,
        pending: VecDeque<StreamFragment>,
        finished: bool,
    }

    let state = State {
        input,
        decoder: StreamDecoder::new(classifier),
        pending: VecDeque::new(),
        finished: false,
    };

    let stream = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frag) = st.pending.pop_front() {
                if frag.is_terminal() {
                    st.finished = true;
                }
                return Some((Ok(frag), st));
            }
            if st.finished {
                return None;
            }
            if let Some(e) = st.decoder.take_deferred_error() {
                st.finished = true;
                return Some((Err(Error::Api(e)), st));
            }

            let decoded = match st.input.next().await {
                Some(Ok(bytes)) => st.decoder.feed(&bytes),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = st.decoder.is_done();
                    let res = st.decoder.finish();
                    if res.is_err() {
                        st.finished = true;
                    }
                    res
                }
            };

            match decoded {
                Ok(frags) => {
                    st.pending.extend(frags);
                    // Input exhausted cleanly with nothing left to flush.
                    if st.pending.is_empty() && st.decoder.is_done() {
                        return None;
                    }
                }
                Err(e) => {
                    st.finished = true;
                    return Some((Err(Error::Api(e)), st));
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::ErrorKind;
    use futures::TryStreamExt;

    const FRAMES: &str = concat!(
        ": OPENROUTER PROCESSING\n\n",
        "data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
        "data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo, wörld\"}}]}\n\n",
        "data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
        "data: [DONE]\n\n",
    );

    fn decode_in_chunks(input: &[u8], size: usize) -> Result<Vec<StreamFragment>, ClassifiedError> {
        let mut dec = StreamDecoder::new(ErrorClassifier::default());
        let mut out = Vec::new();
        for chunk in input.chunks(size) {
            out.extend(dec.feed(chunk)?);
        }
        out.extend(dec.finish()?);
        Ok(out)
    }

    fn concat(frags: &[StreamFragment]) -> String {
        frags.iter().filter_map(|f| f.content()).collect()
    }

    #[test]
    fn reproduces_content_regardless_of_chunking() {
        for size in [1, 2, 3, 7, 16, 64, FRAMES.len()] {
            let frags = decode_in_chunks(FRAMES.as_bytes(), size).unwrap();
            assert_eq!(concat(&frags), "Hello, wörld", "chunk size {}", size);
            let terminals = frags.iter().filter(|f| f.is_terminal()).count();
            assert_eq!(terminals, 1, "chunk size {}", size);
            assert!(frags.last().unwrap().is_terminal());
        }
    }

    #[test]
    fn terminal_carries_usage_and_finish_reason_is_forwarded() {
        let frags = decode_in_chunks(FRAMES.as_bytes(), 5).unwrap();
        assert!(frags.iter().any(|f| matches!(
            f,
            StreamFragment::Delta { finish_reason: Some(r), .. } if r == "stop"
        )));
        match frags.last().unwrap() {
            StreamFragment::Done { usage: Some(u) } => assert_eq!(u.total_tokens, 5),
            other => panic!("unexpected terminal {:?}", other),
        }
    }

    #[test]
    fn missing_done_is_truncation() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
        let err = decode_in_chunks(input.as_bytes(), 4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);
    }

    #[test]
    fn done_without_trailing_newline_is_accepted() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]";
        let frags = decode_in_chunks(input.as_bytes(), 3).unwrap();
        assert_eq!(concat(&frags), "a");
        assert!(frags.last().unwrap().is_terminal());
    }

    #[test]
    fn crlf_and_no_space_prefix() {
        let input = "data:{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\ndata:[DONE]\r\n";
        let frags = decode_in_chunks(input.as_bytes(), 2).unwrap();
        assert_eq!(concat(&frags), "x");
        assert_eq!(frags.len(), 2);
    }

    #[test]
    fn frames_after_done_are_ignored() {
        let input = "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\ndata: [DONE]\n\n";
        let frags = decode_in_chunks(input.as_bytes(), 8).unwrap();
        assert_eq!(frags, vec![StreamFragment::Done { usage: None }]);
    }

    #[test]
    fn error_frame_is_classified() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"error\":{\"code\":429,\"message\":\"slow down\"}}\n\n";
        let mut dec = StreamDecoder::new(ErrorClassifier::default());
        let frags = dec.feed(input.as_bytes()).unwrap();
        assert_eq!(concat(&frags), "a");
        let err = dec.feed(b"").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RateLimit { .. }));
        assert!(dec.feed(b"data: [DONE]\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut dec = StreamDecoder::new(ErrorClassifier::default());
        let err = dec.feed(b"data: {not json}\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn stream_adapter_yields_ordered_fragments() {
        let chunks: Vec<crate::Result<Bytes>> = FRAMES
            .as_bytes()
            .chunks(9)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let out = decode_stream(
            Box::pin(futures::stream::iter(chunks)),
            ErrorClassifier::default(),
        );
        let frags: Vec<StreamFragment> = out.try_collect().await.unwrap();
        assert_eq!(concat(&frags), "Hello, wörld");
        assert_eq!(frags.iter().filter(|f| f.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn stream_adapter_surfaces_truncation_once() {
        let chunks: Vec<crate::Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
        ))];
        let out = decode_stream(
            Box::pin(futures::stream::iter(chunks)),
            ErrorClassifier::default(),
        );
        let items: Vec<crate::Result<StreamFragment>> = out.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Network));
    }
}

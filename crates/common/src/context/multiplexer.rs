//! Source Multiplexer - sources and tokens on one outbound stream
//!
//! Runs `Idle -> SourcesSent | Skipped -> Streaming -> Closed`. The sources
//! frame goes out first and only when there is something to cite; token
//! frames follow one per decoded increment. The multiplexer polls the token
//! stream only when its own consumer asks for a frame, so a slow client
//! slows the upstream read. Dropping it early drops the upstream body.

use crate::context::completion::TokenStream;
use crate::context::frames::{SourceSummary, StreamFrame};
use crate::metrics;
use futures::stream::{self, FusedStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    SourcesSent,
    Skipped,
    Streaming,
    Closed,
}

pub struct SourceMultiplexer {
    state: MuxState,
    sources: Vec<SourceSummary>,
    tokens: TokenStream,
    tokens_sent: usize,
}

impl SourceMultiplexer {
    pub fn new(sources: Vec<SourceSummary>, tokens: TokenStream) -> Self {
        Self {
            state: MuxState::Idle,
            sources,
            tokens,
            tokens_sent: 0,
        }
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    /// Token frames emitted so far
    pub fn tokens_sent(&self) -> usize {
        self.tokens_sent
    }

    fn close(&mut self) {
        self.state = MuxState::Closed;
        // release the upstream connection now rather than on drop
        self.tokens = Box::pin(stream::empty());
    }

    fn poll_tokens(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamFrame>> {
        match self.tokens.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(text))) => {
                self.state = MuxState::Streaming;
                self.tokens_sent += 1;
                metrics::record_frame("token");
                Poll::Ready(Some(StreamFrame::Token { response: text }))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(
                    error = %e,
                    tokens_sent = self.tokens_sent,
                    "Completion stream failed mid-answer, closing"
                );
                self.close();
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                debug!(tokens_sent = self.tokens_sent, "Completion stream finished");
                self.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for SourceMultiplexer {
    type Item = StreamFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.state {
            MuxState::Idle if !this.sources.is_empty() => {
                this.state = MuxState::SourcesSent;
                metrics::record_frame("sources");
                Poll::Ready(Some(StreamFrame::Sources {
                    sources: std::mem::take(&mut this.sources),
                }))
            }
            MuxState::Idle => {
                this.state = MuxState::Skipped;
                this.poll_tokens(cx)
            }
            MuxState::SourcesSent | MuxState::Skipped | MuxState::Streaming => this.poll_tokens(cx),
            MuxState::Closed => Poll::Ready(None),
        }
    }
}

impl fmt::Debug for SourceMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMultiplexer")
            .field("state", &self.state)
            .field("pending_sources", &self.sources.len())
            .field("tokens_sent", &self.tokens_sent)
            .finish_non_exhaustive()
    }
}

impl FusedStream for SourceMultiplexer {
    fn is_terminated(&self) -> bool {
        self.state == MuxState::Closed
    }
}

impl Drop for SourceMultiplexer {
    fn drop(&mut self) {
        if self.state != MuxState::Closed {
            info!(
                state = ?self.state,
                tokens_sent = self.tokens_sent,
                "Stream cancelled by caller"
            );
            metrics::record_stream_cancelled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use chrono::Utc;
    use futures::channel::mpsc;
    use tokio_test::{assert_pending, assert_ready};
    use uuid::Uuid;

    fn sources(n: usize) -> Vec<SourceSummary> {
        (0..n)
            .map(|i| SourceSummary {
                id: Uuid::new_v4(),
                content: format!("entry {i}"),
                created_at: Utc::now(),
                relevance: 0.5,
            })
            .collect()
    }

    fn tokens(items: Vec<crate::errors::Result<String>>) -> TokenStream {
        Box::pin(stream::iter(items))
    }

    fn ok(words: &[&str]) -> Vec<crate::errors::Result<String>> {
        words.iter().map(|w| Ok(w.to_string())).collect()
    }

    #[tokio::test]
    async fn test_sources_first_then_tokens_in_order() {
        let mux = SourceMultiplexer::new(sources(2), tokens(ok(&["a", "b", "c"])));
        let frames: Vec<StreamFrame> = mux.collect().await;

        assert_eq!(frames.len(), 4);
        assert!(matches!(&frames[0], StreamFrame::Sources { sources } if sources.len() == 2));
        let texts: Vec<&str> = frames[1..]
            .iter()
            .map(|f| match f {
                StreamFrame::Token { response } => response.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(
            frames.iter().filter(|f| f.kind() == "sources").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_no_sources_frame_when_nothing_retrieved() {
        let mut mux = SourceMultiplexer::new(Vec::new(), tokens(ok(&["only"])));

        let first = mux.next().await;
        assert_eq!(mux.state(), MuxState::Streaming);
        assert_eq!(
            first,
            Some(StreamFrame::Token {
                response: "only".to_string()
            })
        );
        assert_eq!(mux.next().await, None);
        assert!(mux.is_terminated());
    }

    #[tokio::test]
    async fn test_empty_answer_with_no_sources_is_an_empty_stream() {
        let mut mux = SourceMultiplexer::new(Vec::new(), tokens(Vec::new()));
        assert_eq!(mux.next().await, None);
        assert_eq!(mux.state(), MuxState::Closed);
    }

    #[tokio::test]
    async fn test_connection_drop_keeps_delivered_frames() {
        let mut items = ok(&["one", "two", "three"]);
        items.push(Err(AppError::CompletionUnavailable {
            message: "connection reset".to_string(),
        }));
        items.extend(ok(&["never"]));

        let mut mux = SourceMultiplexer::new(sources(1), tokens(items));
        let mut frames = Vec::new();
        while let Some(frame) = mux.next().await {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].kind(), "sources");
        assert!(frames[1..].iter().all(|f| f.kind() == "token"));
        assert_eq!(mux.tokens_sent(), 3);
        assert_eq!(mux.state(), MuxState::Closed);
        assert_eq!(mux.next().await, None);
    }

    #[tokio::test]
    async fn test_pulls_upstream_only_on_demand() {
        let (tx, rx) = mpsc::unbounded::<crate::errors::Result<String>>();
        let mut mux = tokio_test::task::spawn(SourceMultiplexer::new(sources(1), Box::pin(rx)));

        let first = assert_ready!(mux.poll_next());
        assert_eq!(first.map(|f| f.kind()), Some("sources"));
        assert_pending!(mux.poll_next());

        tx.unbounded_send(Ok("hi".to_string())).unwrap();
        assert!(mux.is_woken());
        let token = assert_ready!(mux.poll_next());
        assert_eq!(
            token,
            Some(StreamFrame::Token {
                response: "hi".to_string()
            })
        );

        drop(tx);
        assert_eq!(assert_ready!(mux.poll_next()), None);
    }

    #[tokio::test]
    async fn test_caller_disconnect_drops_upstream() {
        let (tx, rx) = mpsc::unbounded::<crate::errors::Result<String>>();
        let mut mux = SourceMultiplexer::new(Vec::new(), Box::pin(rx));

        tx.unbounded_send(Ok("partial".to_string())).unwrap();
        assert!(mux.next().await.is_some());
        assert_eq!(mux.state(), MuxState::Streaming);

        drop(mux);
        assert!(tx.is_closed());
    }
}

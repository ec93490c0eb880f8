//! Pull-based token streams.
//!
//! A streaming completion is a one-shot, server-driven token sequence. It is
//! modeled as an explicit pull iterator with an explicit [`TokenStream::close`]
//! so resource release stays deterministic under cancellation: dropping or
//! closing the stream drops the inner source (and with it the connection or
//! forwarding task feeding it).

use std::any::Any;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::LlmError;

type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// A cooperative, single-pass, non-restartable sequence of text chunks.
pub struct TokenStream {
    inner: Option<ChunkStream>,
    /// Resources released together with the stream (in-flight guards etc.).
    guards: Vec<Box<dyn Any + Send>>,
}

impl TokenStream {
    /// Wrap an arbitrary chunk stream.
    pub fn new(stream: impl Stream<Item = Result<String, LlmError>> + Send + 'static) -> Self {
        Self {
            inner: Some(Box::pin(stream)),
            guards: Vec::new(),
        }
    }

    /// Wrap a channel receiver. The sending side notices the receiver going
    /// away (send fails) and can stop pulling from the network.
    pub fn from_receiver(rx: mpsc::Receiver<Result<String, LlmError>>) -> Self {
        Self::new(ReceiverStream::new(rx))
    }

    /// An already-exhausted stream.
    pub fn empty() -> Self {
        Self {
            inner: None,
            guards: Vec::new(),
        }
    }

    /// Tie a resource's lifetime to this stream. Used by the gateway to keep
    /// its in-flight accounting correct until the consumer is done.
    pub fn attach_guard(&mut self, guard: Box<dyn Any + Send>) {
        self.guards.push(guard);
    }

    /// Pull the next chunk. `None` means the stream is exhausted or closed.
    pub async fn next(&mut self) -> Option<Result<String, LlmError>> {
        let inner = self.inner.as_mut()?;
        let item = inner.next().await;
        if item.is_none() {
            // Exhausted: release the source and guards eagerly.
            self.close();
        }
        item
    }

    /// Close the stream, releasing the underlying connection. Abandoning a
    /// partially-consumed stream this way must not leak; further `next`
    /// calls return `None`.
    pub fn close(&mut self) {
        self.inner = None;
        self.guards.clear();
    }

    /// Whether the stream has been closed or exhausted.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Drain the remaining chunks into one string. Convenience for callers
    /// that requested streaming but decided to buffer.
    pub async fn collect_text(mut self) -> Result<String, LlmError> {
        let mut out = String::new();
        while let Some(chunk) = self.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pulls_chunks_in_order() {
        let chunks = vec![Ok("a".to_string()), Ok("b".to_string()), Ok("c".to_string())];
        let mut stream = TokenStream::new(futures::stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        assert_eq!(stream.next().await.unwrap().unwrap(), "c");
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn close_stops_iteration() {
        let chunks = vec![Ok("a".to_string()), Ok("b".to_string())];
        let mut stream = TokenStream::new(futures::stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        stream.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closing_receiver_stream_is_observable_by_sender() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = TokenStream::from_receiver(rx);

        tx.send(Ok("first".to_string())).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");

        stream.close();
        // The sender now fails: the connection-side task can stop pulling.
        assert!(tx.send(Ok("second".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn collect_text_concatenates() {
        let chunks = vec![Ok("hel".to_string()), Ok("lo".to_string())];
        let stream = TokenStream::new(futures::stream::iter(chunks));
        assert_eq!(stream.collect_text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn guards_dropped_on_close() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut stream = TokenStream::empty();
        stream.inner = Some(Box::pin(futures::stream::pending()));
        stream.attach_guard(Box::new(Flag(dropped.clone())));

        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));
        stream.close();
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}

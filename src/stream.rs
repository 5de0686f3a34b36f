//! Incremental response streaming.
//!
//! [`ResponseStream`] relays fragments from a backend stream to the
//! consumer in arrival order. An upstream failure surfaces as one terminal
//! `Err` item after any fragments already delivered; fragments are never
//! retracted. Cancelling the stream tears down the relay task and drops the
//! upstream receiver, which propagates cancellation to the producer.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::generate::Fragment;

pub struct ResponseStream {
    rx: mpsc::Receiver<Result<Fragment>>,
    cancel: CancellationToken,
}

impl ResponseStream {
    /// Next fragment, a terminal error, or `None` when the stream is done.
    pub async fn next(&mut self) -> Option<Result<Fragment>> {
        self.rx.recv().await
    }

    /// Abandon the stream. Fragments already delivered stay delivered;
    /// no further items arrive.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream and concatenate all fragment text. Returns the
    /// terminal error if the stream failed partway.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(item) = self.next().await {
            out.push_str(&item?.text);
        }
        Ok(out)
    }
}

impl Stream for ResponseStream {
    type Item = Result<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bridge a backend fragment channel into a consumer-facing stream.
pub fn relay(mut upstream: mpsc::Receiver<Result<Fragment>>) -> ResponseStream {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(32);
    let token = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = upstream.recv() => match item {
                    None => break,
                    Some(Ok(fragment)) => {
                        if tx.send(Ok(fragment)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Terminal: nothing follows an error.
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                },
            }
        }
    });

    ResponseStream { rx, cancel }
}

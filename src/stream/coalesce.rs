//! Latest-wins rate limiting for snapshot streams

use futures::Stream;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep};

/// Extension trait to add coalescing to any Stream
pub trait CoalesceExt: Stream {
    /// Emit at most one item per `period`.
    ///
    /// The first item passes straight through. Items arriving inside a
    /// window replace each other and only the latest is emitted when the
    /// window closes. Nothing is emitted for a window without items.
    fn coalesce(self, period: Duration) -> Coalesce<Self>
    where
        Self: Sized,
    {
        Coalesce::new(self, period)
    }
}

impl<T: Stream> CoalesceExt for T {}

pin_project! {
    /// Stream returned by [`CoalesceExt::coalesce`].
    pub struct Coalesce<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        window: Sleep,
        period: Duration,
        latest: Option<S::Item>,
        window_open: bool,
        exhausted: bool,
    }
}

impl<S: Stream> Coalesce<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        Self {
            stream,
            window: sleep(Duration::ZERO),
            period,
            latest: None,
            window_open: false,
            exhausted: false,
        }
    }
}

impl<S: Stream> Stream for Coalesce<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        while !*this.exhausted {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.latest = Some(item),
                Poll::Ready(None) => *this.exhausted = true,
                Poll::Pending => break,
            }
        }

        if this.latest.is_none() {
            return if *this.exhausted { Poll::Ready(None) } else { Poll::Pending };
        }

        if *this.window_open {
            if this.window.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            *this.window_open = false;
        }

        let item = this.latest.take();
        this.window.as_mut().reset(Instant::now() + *this.period);
        *this.window_open = true;
        Poll::Ready(item)
    }
}

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::log_assert;

pin_project! {
    /// A future that is pending forever until armed with an inner future.
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
    #[project = OptionFutureProj]
    pub enum OptionFuture<F>{
        #[default]
        Never,
        On {
            #[pin]
            future: F
        }
    }
}

impl<F> OptionFuture<F> {
    pub const fn never() -> Self {
        OptionFuture::Never
    }

    pub fn clear(&mut self) {
        *self = OptionFuture::Never;
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, OptionFuture::On { .. })
    }
}

impl<F: Future> OptionFuture<F> {
    pub fn set(&mut self, future: F) {
        log_assert!(matches!(self, OptionFuture::Never));
        *self = OptionFuture::On { future }
    }

    pub fn replace(&mut self, future: F) {
        *self = OptionFuture::On { future }
    }
}

impl<F: Future> Future for OptionFuture<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.as_mut().project() {
            OptionFutureProj::Never => Poll::Pending,
            OptionFutureProj::On { future } => match future.poll(cx) {
                Poll::Ready(r) => {
                    self.set(OptionFuture::Never);
                    Poll::Ready(r)
                }
                Poll::Pending => Poll::Pending
            }
        }
    }
}

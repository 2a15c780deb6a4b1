use std::task::{Context, Poll};

use futures::future::BoxFuture;

/// Polls a future exactly once with a no-op waker.
///
/// Backend calls that resolve on the first poll complete synchronously from
/// the caller's point of view; everything else is handed to a spawned driver
/// task, which re-polls the future with a real waker.
pub(crate) fn poll_once<T>(fut: &mut BoxFuture<'static, T>) -> Option<T> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(value) => Some(value),
        Poll::Pending => None,
    }
}

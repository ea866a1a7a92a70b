use crate::{promise::Reaction, Error, Promise};
use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// Awaits a [`Promise`] from async code. Returned by [`Promise::waiter`].
///
/// The outcome arrives through the promise's scheduler like any other
/// reaction, so the scheduler must be drained for the waiter to complete.
///
/// # Examples
///
/// ```
/// use promise_chain::{Error, Promise, TaskQueue};
/// use futures::executor::block_on;
///
/// let queue = TaskQueue::new();
/// let deferred = Promise::<String, Error>::deferred(&queue);
/// let waiter = deferred.promise.waiter();
/// deferred.resolve.resolve("Hi".into());
/// queue.run_until_stalled();
/// assert_eq!(block_on(waiter), Ok("Hi".to_string()));
/// ```
#[derive(Debug)]
pub struct Waiter<T, E> {
    promise: Rc<RefCell<Inner<T, E>>>,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Taken,
}

#[derive(Debug)]
struct Inner<T, E> {
    value: Option<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

impl<T, E> Waiter<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub(crate) fn new(promise: &Promise<T, E>) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let (fulfilled, rejected) = (inner.clone(), inner.clone());
        promise.react(Reaction::Observe {
            on_fulfilled: Box::new(move |value| deliver(&fulfilled, Ok(value))),
            on_rejected: Box::new(move |reason| deliver(&rejected, Err(reason))),
        });
        Self { promise: inner }
    }
}

fn deliver<T, E>(inner: &RefCell<Inner<T, E>>, outcome: Result<T, E>) {
    let waker = {
        let mut promise = inner.borrow_mut();
        promise.value = Some(outcome);
        std::mem::replace(&mut promise.waker, Err(WakerState::Taken))
    };
    if let Ok(waker) = waker {
        waker.wake()
    }
}

impl<T, E> Future for Waiter<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut promise = self.promise.borrow_mut();
        match promise.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                promise.waker = Ok(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

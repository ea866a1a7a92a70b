use crate::{
    resolution::{self, Resolution},
    waiter::Waiter,
    Error, Schedule,
};
use std::{cell::RefCell, fmt, mem, rc::Rc};

/// A continuation queued on a pending promise.
///
/// `Chain` keeps the promise it settles outside its closures so a dropped
/// pending chain can be released without recursing through it.
pub(crate) enum Reaction<T, E> {
    Chain {
        next: Promise<T, E>,
        on_fulfilled: Box<dyn FnOnce(T, Promise<T, E>)>,
        on_rejected: Box<dyn FnOnce(E, Promise<T, E>)>,
    },
    Observe {
        on_fulfilled: Box<dyn FnOnce(T)>,
        on_rejected: Box<dyn FnOnce(E)>,
    },
}

impl<T, E> Reaction<T, E> {
    fn fire(self, outcome: Result<T, E>) {
        match (self, outcome) {
            (Reaction::Chain { next, on_fulfilled, .. }, Ok(value)) => on_fulfilled(value, next),
            (Reaction::Chain { next, on_rejected, .. }, Err(reason)) => on_rejected(reason, next),
            (Reaction::Observe { on_fulfilled, .. }, Ok(value)) => on_fulfilled(value),
            (Reaction::Observe { on_rejected, .. }, Err(reason)) => on_rejected(reason),
        }
    }

    fn into_next(self) -> Option<Promise<T, E>> {
        match self {
            Reaction::Chain { next, .. } => Some(next),
            Reaction::Observe { .. } => None,
        }
    }
}

/// A `then` handler. Returning `Err` rejects the promise `then` produced.
pub type Handler<A, T, E> = Box<dyn FnOnce(A) -> Result<Resolution<T, E>, E>>;

/// Where a promise is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

enum Settlement<T, E> {
    Pending(Vec<Reaction<T, E>>),
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Drop for Settlement<T, E> {
    fn drop(&mut self) {
        let Settlement::Pending(reactions) = self else {
            return;
        };
        let mut downstream: Vec<Promise<T, E>> =
            reactions.drain(..).filter_map(Reaction::into_next).collect();
        while let Some(promise) = downstream.pop() {
            // Still reachable elsewhere, dropping the handle is shallow.
            let Ok(cell) = Rc::try_unwrap(promise.inner) else {
                continue;
            };
            if let Settlement::Pending(reactions) = &mut *cell.borrow_mut() {
                downstream.extend(reactions.drain(..).filter_map(Reaction::into_next));
            };
        }
    }
}

/// The eventual result of an asynchronous operation: one value or one
/// failure, delivered once.
///
/// Clones are handles on the same promise.
///
/// # Examples
///
/// ```
/// use promise_chain::{Error, Promise, Resolution, TaskQueue};
///
/// let queue = TaskQueue::new();
/// let doubled = Promise::<i32, Error>::new(&queue, |resolve, _reject| {
///     resolve.resolve(21);
///     Ok(())
/// })
/// .and_then(Box::new(|v| Ok(Resolution::Value(v * 2))));
///
/// assert!(doubled.is_pending());
/// queue.run_until_stalled();
/// assert_eq!(doubled.outcome(), Some(Ok(42)));
/// ```
pub struct Promise<T, E> {
    inner: Rc<RefCell<Settlement<T, E>>>,
    scheduler: Rc<dyn Schedule>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

/// Fulfills the promise it was created for. Calls after the first
/// settlement are ignored.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

/// Rejects the promise it was created for. Calls after the first
/// settlement are ignored.
pub struct Rejecter<T, E> {
    promise: Promise<T, E>,
}

/// A pending promise together with its settlement capabilities, for
/// settling it from outside a setup routine.
pub struct Deferred<T, E> {
    pub promise: Promise<T, E>,
    pub resolve: Resolver<T, E>,
    pub reject: Rejecter<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Clone for Rejecter<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn resolve(&self, value: T) {
        self.promise.settle(Ok(value));
    }
}

impl<T, E> Rejecter<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn reject(&self, reason: E) {
        self.promise.settle(Err(reason));
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `setup` on it synchronously.
    ///
    /// If `setup` fails before settling the promise, the promise is
    /// rejected with the failure. A failure after settlement is ignored.
    pub fn new<S, F>(scheduler: &S, setup: F) -> Self
    where
        S: Schedule + Clone + 'static,
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E>,
    {
        let promise = Self::pending(Rc::new(scheduler.clone()));
        let resolver = Resolver {
            promise: promise.clone(),
        };
        let rejecter = Rejecter {
            promise: promise.clone(),
        };
        if let Err(reason) = setup(resolver, rejecter) {
            promise.settle(Err(reason));
        }
        promise
    }

    /// Like [`Promise::new`], but fails with [`Error::InvalidExecutor`] when
    /// there is no setup routine to run.
    ///
    /// ```
    /// use promise_chain::{Error, Promise, Rejecter, Resolver, TaskQueue};
    ///
    /// type Setup = fn(Resolver<(), Error>, Rejecter<(), Error>) -> Result<(), Error>;
    /// let queue = TaskQueue::new();
    /// let result = Promise::try_new(&queue, None::<Setup>);
    /// assert!(matches!(result, Err(Error::InvalidExecutor)));
    /// ```
    pub fn try_new<S, F>(scheduler: &S, setup: Option<F>) -> Result<Self, Error>
    where
        S: Schedule + Clone + 'static,
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E>,
    {
        match setup {
            Some(setup) => Ok(Self::new(scheduler, setup)),
            None => Err(Error::InvalidExecutor),
        }
    }

    /// A promise that is already fulfilled with `value`.
    pub fn fulfilled<S>(scheduler: &S, value: T) -> Self
    where
        S: Schedule + Clone + 'static,
    {
        let promise = Self::pending(Rc::new(scheduler.clone()));
        promise.settle(Ok(value));
        promise
    }

    /// A promise that is already rejected with `reason`.
    pub fn rejected<S>(scheduler: &S, reason: E) -> Self
    where
        S: Schedule + Clone + 'static,
    {
        let promise = Self::pending(Rc::new(scheduler.clone()));
        promise.settle(Err(reason));
        promise
    }

    /// A pending promise and the capabilities that settle it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Deferred, Error, Promise, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let Deferred { promise, resolve, .. } = Promise::<&str, Error>::deferred(&queue);
    /// resolve.resolve("🍓");
    /// assert_eq!(promise.outcome(), Some(Ok("🍓")));
    /// ```
    pub fn deferred<S>(scheduler: &S) -> Deferred<T, E>
    where
        S: Schedule + Clone + 'static,
    {
        let promise = Self::pending(Rc::new(scheduler.clone()));
        Deferred {
            resolve: Resolver {
                promise: promise.clone(),
            },
            reject: Rejecter {
                promise: promise.clone(),
            },
            promise,
        }
    }

    fn pending(scheduler: Rc<dyn Schedule>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Settlement::Pending(vec![]))),
            scheduler,
        }
    }

    /// Registers continuations and returns the promise their outcome
    /// settles.
    ///
    /// A missing `on_fulfilled` passes the value through and a missing
    /// `on_rejected` passes the reason through. Handlers always run from the
    /// scheduler, never inside this call.
    pub fn then(
        &self,
        on_fulfilled: Option<Handler<T, T, E>>,
        on_rejected: Option<Handler<E, T, E>>,
    ) -> Promise<T, E> {
        let on_fulfilled =
            on_fulfilled.unwrap_or_else(|| Box::new(|value| Ok(Resolution::Value(value))));
        let on_rejected = on_rejected.unwrap_or_else(|| Box::new(|reason| Err(reason)));

        let next = Self::pending(self.scheduler.clone());
        self.react(Reaction::Chain {
            next: next.clone(),
            on_fulfilled: Box::new(move |value, next: Promise<T, E>| {
                next.settle_with(on_fulfilled(value))
            }),
            on_rejected: Box::new(move |reason, next: Promise<T, E>| {
                next.settle_with(on_rejected(reason))
            }),
        });
        next
    }

    /// `then` with only a fulfillment handler.
    pub fn and_then(&self, on_fulfilled: Handler<T, T, E>) -> Promise<T, E> {
        self.then(Some(on_fulfilled), None)
    }

    /// `then` with only a rejection handler.
    pub fn catch(&self, on_rejected: Handler<E, T, E>) -> Promise<T, E> {
        self.then(None, Some(on_rejected))
    }

    /// A [`std::future::Future`] that completes with this promise's outcome.
    pub fn waiter(&self) -> Waiter<T, E> {
        Waiter::new(self)
    }

    pub fn state(&self) -> State {
        match &*self.inner.borrow() {
            Settlement::Pending { .. } => State::Pending,
            Settlement::Fulfilled(_) => State::Fulfilled,
            Settlement::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// The settled value or reason, `None` while pending.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &*self.inner.borrow() {
            Settlement::Pending { .. } => None,
            Settlement::Fulfilled(value) => Some(Ok(value.clone())),
            Settlement::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues a reaction. On a settled promise it is scheduled right away
    /// with a clone of the payload.
    pub(crate) fn react(&self, reaction: Reaction<T, E>) {
        let settled = {
            let mut slot = self.inner.borrow_mut();
            match &mut *slot {
                Settlement::Pending(reactions) => {
                    reactions.push(reaction);
                    return;
                }
                Settlement::Fulfilled(value) => Ok(value.clone()),
                Settlement::Rejected(reason) => Err(reason.clone()),
            }
        };
        self.scheduler.enqueue(Box::new(move || reaction.fire(settled)));
    }

    /// The single transition out of `Pending`. Ignored once settled.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        let reactions = {
            let mut slot = self.inner.borrow_mut();
            let reactions = match &mut *slot {
                Settlement::Pending(reactions) => mem::take(reactions),
                _ => {
                    tracing::debug!("ignoring settlement of an already settled promise");
                    return;
                }
            };
            *slot = match &outcome {
                Ok(value) => Settlement::Fulfilled(value.clone()),
                Err(reason) => Settlement::Rejected(reason.clone()),
            };
            reactions
        };

        tracing::trace!(
            reactions = reactions.len(),
            fulfilled = outcome.is_ok(),
            "promise settled"
        );
        for reaction in reactions {
            let outcome = outcome.clone();
            self.scheduler.enqueue(Box::new(move || reaction.fire(outcome)));
        }
    }

    fn settle_with(&self, outcome: Result<Resolution<T, E>, E>) {
        match outcome {
            Ok(x) => resolution::resolve(self, x),
            Err(reason) => self.settle(Err(reason)),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Promise");
        match &*self.inner.borrow() {
            Settlement::Pending(reactions) => out
                .field("state", &State::Pending)
                .field("reactions", &reactions.len()),
            Settlement::Fulfilled(value) => {
                out.field("state", &State::Fulfilled).field("value", value)
            }
            Settlement::Rejected(reason) => {
                out.field("state", &State::Rejected).field("reason", reason)
            }
        };
        out.finish()
    }
}

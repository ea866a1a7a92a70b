//! Turning a handler's result into the settlement of the promise `then`
//! produced.
//!
//! A handler returns a [`Resolution`]: a plain value, one of our own
//! promises, or some foreign object that may carry a `then` member. Own
//! promises are adopted, foreign objects are probed and, if thenable, adopted
//! through a pair of passthrough callbacks that settle at most once no matter
//! how the foreign `then` behaves.
use crate::{promise::Reaction, Error, Promise};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// What a handler produced.
pub enum Resolution<T, E> {
    /// Fulfill with this value.
    Value(T),
    /// Adopt the outcome of this promise.
    Promise(Promise<T, E>),
    /// Probe this object for a `then` member and adopt through it if present.
    Object(Rc<dyn Thenable<T, E>>),
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

/// The `then` member read off an object, bound to that object.
pub type ThenFn<T, E> =
    Box<dyn FnOnce(ResolvePassthrough<T, E>, RejectPassthrough<T, E>) -> Result<(), E>>;

/// Result of looking for a callable `then` member.
pub enum Probe<T, E> {
    /// There is no `then`, or it is not callable. The object is a plain
    /// value and this is that value.
    NotThenable(T),
    Thenable(ThenFn<T, E>),
}

/// An object that other promise implementations can hand us.
///
/// `probe` stands for reading the `then` member. It may fail, in which case
/// the adopting promise is rejected with the failure.
pub trait Thenable<T, E> {
    fn probe(&self) -> Result<Probe<T, E>, E>;
}

/// One-shot flag shared by the two passthroughs of a single adoption.
struct Guard<T, E> {
    called: Cell<bool>,
    in_then: Cell<bool>,
    deferred: RefCell<Option<Resolution<T, E>>>,
}

impl<T, E> Guard<T, E> {
    /// Trips the guard. Returns `false` if it was already tripped.
    fn trip(&self) -> bool {
        !self.called.replace(true)
    }
}

/// Handed to a foreign `then` as its success callback.
pub struct ResolvePassthrough<T, E> {
    next: Promise<T, E>,
    guard: Rc<Guard<T, E>>,
}

/// Handed to a foreign `then` as its failure callback.
pub struct RejectPassthrough<T, E> {
    next: Promise<T, E>,
    guard: Rc<Guard<T, E>>,
}

impl<T, E> Clone for ResolvePassthrough<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<T, E> Clone for RejectPassthrough<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<T, E> ResolvePassthrough<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Resolves the adopting promise with `value`, which is itself resolved
    /// the same way a handler result is. Only the first call of either
    /// passthrough counts.
    pub fn resolve(&self, value: Resolution<T, E>) {
        if !self.guard.trip() {
            tracing::debug!("thenable settled twice, ignoring resolve");
            return;
        }
        if self.guard.in_then.get() {
            // Picked up by the loop in `resolve` once `then` returns.
            *self.guard.deferred.borrow_mut() = Some(value);
        } else {
            resolve(&self.next, value);
        }
    }

    /// Shorthand for `resolve(Resolution::Value(value))`.
    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value));
    }
}

impl<T, E> RejectPassthrough<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    pub fn reject(&self, reason: E) {
        if !self.guard.trip() {
            tracing::debug!("thenable settled twice, ignoring reject");
            return;
        }
        self.next.settle(Err(reason));
    }
}

/// Settles `next` from the handler result `x`.
pub(crate) fn resolve<T, E>(next: &Promise<T, E>, x: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let mut x = x;
    loop {
        match x {
            Resolution::Promise(promise) if promise.ptr_eq(next) => {
                tracing::debug!("chaining cycle detected");
                next.settle(Err(Error::ChainCycle.into()));
                return;
            }
            Resolution::Promise(promise) => {
                adopt(next, &promise);
                return;
            }
            Resolution::Object(object) => match call_then(next, object.as_ref()) {
                Some(resolution) => x = resolution,
                None => return,
            },
            Resolution::Value(value) => {
                next.settle(Ok(value));
                return;
            }
        }
    }
}

fn adopt<T, E>(next: &Promise<T, E>, promise: &Promise<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let on_fulfilled: Box<dyn FnOnce(T, Promise<T, E>)> = if promise.is_pending() {
        Box::new(|value, next: Promise<T, E>| resolve(&next, Resolution::Value(value)))
    } else {
        Box::new(|value, next: Promise<T, E>| next.settle(Ok(value)))
    };
    promise.react(Reaction::Chain {
        next: next.clone(),
        on_fulfilled,
        on_rejected: Box::new(|reason, next: Promise<T, E>| next.settle(Err(reason))),
    });
}

/// Probes `object` and runs its `then`. Returns what is left to resolve
/// `next` with, if anything.
fn call_then<T, E>(next: &Promise<T, E>, object: &dyn Thenable<T, E>) -> Option<Resolution<T, E>>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let then = match object.probe() {
        Ok(Probe::Thenable(then)) => then,
        Ok(Probe::NotThenable(value)) => return Some(Resolution::Value(value)),
        Err(reason) => {
            tracing::debug!("reading then failed");
            next.settle(Err(reason));
            return None;
        }
    };

    let guard = Rc::new(Guard {
        called: Cell::new(false),
        in_then: Cell::new(true),
        deferred: RefCell::new(None),
    });
    let resolve = ResolvePassthrough {
        next: next.clone(),
        guard: guard.clone(),
    };
    let reject = RejectPassthrough {
        next: next.clone(),
        guard: guard.clone(),
    };
    let called = then(resolve, reject);
    guard.in_then.set(false);

    if let Err(reason) = called {
        if guard.trip() {
            next.settle(Err(reason));
        } else {
            tracing::debug!("then failed after settling, ignoring");
        }
    }
    let deferred = guard.deferred.borrow_mut().take();
    deferred
}

#[cfg(test)]
mod tests {
    use super::{Probe, RejectPassthrough, ResolvePassthrough, Resolution, Thenable};
    use crate::{Error, Promise, State, TaskQueue};
    use std::{cell::RefCell, rc::Rc};

    /// A thenable whose `then` is a fixed script.
    struct Scripted<F>(RefCell<Option<F>>);

    impl<F> Thenable<i32, String> for Scripted<F>
    where
        F: FnOnce(ResolvePassthrough<i32, String>, RejectPassthrough<i32, String>) -> Result<(), String>
            + 'static,
    {
        fn probe(&self) -> Result<Probe<i32, String>, String> {
            match self.0.borrow_mut().take() {
                Some(then) => Ok(Probe::Thenable(Box::new(then))),
                None => Err("then read twice".into()),
            }
        }
    }

    fn scripted<F>(then: F) -> Resolution<i32, String>
    where
        F: FnOnce(ResolvePassthrough<i32, String>, RejectPassthrough<i32, String>) -> Result<(), String>
            + 'static,
    {
        Resolution::Object(Rc::new(Scripted(RefCell::new(Some(then)))))
    }

    fn resolved(x: Resolution<i32, String>) -> (TaskQueue, Promise<i32, String>) {
        let queue = TaskQueue::new();
        let next = Promise::<i32, String>::deferred(&queue).promise;
        super::resolve(&next, x);
        queue.run_until_stalled();
        (queue, next)
    }

    #[test]
    fn test_plain_value_fulfills() {
        let (_, next) = resolved(Resolution::Value(3));
        assert_eq!(next.outcome(), Some(Ok(3)));
    }

    #[test]
    fn test_self_resolution_rejects_with_cycle() {
        let queue = TaskQueue::new();
        let next = Promise::<i32, Error>::deferred(&queue).promise;
        super::resolve(&next, Resolution::Promise(next.clone()));
        assert_eq!(next.outcome(), Some(Err(Error::ChainCycle)));
    }

    #[test]
    fn test_adopting_settled_promise_waits_for_the_queue() {
        let queue = TaskQueue::new();
        let next = Promise::<i32, String>::deferred(&queue).promise;
        let adopted = Promise::<i32, String>::fulfilled(&queue, 8);
        super::resolve(&next, adopted.into());
        assert_eq!(next.state(), State::Pending);
        queue.run_until_stalled();
        assert_eq!(next.outcome(), Some(Ok(8)));
    }

    #[test]
    fn test_resolve_then_reject_keeps_resolve() {
        let (_, next) = resolved(scripted(|resolve, reject| {
            resolve.fulfill(1);
            reject.reject("late".into());
            resolve.fulfill(2);
            Ok(())
        }));
        assert_eq!(next.outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_reject_then_failure_keeps_reject() {
        let (_, next) = resolved(scripted(|resolve, reject| {
            reject.reject("first".into());
            resolve.fulfill(2);
            Err("thrown".into())
        }));
        assert_eq!(next.outcome(), Some(Err("first".to_string())));
    }

    #[test]
    fn test_failure_before_settling_rejects() {
        let (_, next) = resolved(scripted(|_, _| Err("thrown".into())));
        assert_eq!(next.outcome(), Some(Err("thrown".to_string())));
    }

    #[test]
    fn test_probe_failure_rejects() {
        struct Broken;
        impl Thenable<i32, String> for Broken {
            fn probe(&self) -> Result<Probe<i32, String>, String> {
                Err("getter threw".into())
            }
        }
        let (_, next) = resolved(Resolution::Object(Rc::new(Broken)));
        assert_eq!(next.outcome(), Some(Err("getter threw".to_string())));
    }

    #[test]
    fn test_non_callable_then_fulfills_with_object() {
        struct Record(i32);
        impl Thenable<i32, String> for Record {
            fn probe(&self) -> Result<Probe<i32, String>, String> {
                Ok(Probe::NotThenable(self.0))
            }
        }
        let (_, next) = resolved(Resolution::Object(Rc::new(Record(11))));
        assert_eq!(next.outcome(), Some(Ok(11)));
    }

    #[test]
    fn test_passthrough_kept_for_later() {
        let kept = Rc::new(RefCell::new(None));
        let slot = kept.clone();
        let (_, next) = resolved(scripted(move |resolve, _| {
            *slot.borrow_mut() = Some(resolve);
            Ok(())
        }));
        assert_eq!(next.state(), State::Pending);

        let resolve = kept.borrow_mut().take().unwrap();
        resolve.fulfill(4);
        resolve.fulfill(5);
        assert_eq!(next.outcome(), Some(Ok(4)));
    }

    #[test]
    fn test_dropping_long_pending_adoption_chain() {
        let queue = TaskQueue::new();
        let head = Promise::<i32, String>::deferred(&queue);
        let mut tail = head.promise.clone();
        for _ in 0..100_000 {
            let next = Promise::<i32, String>::deferred(&queue).promise;
            super::resolve(&next, Resolution::Promise(tail));
            tail = next;
        }
        drop(tail);
        drop(head);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_long_adoption_chain_settles_through_the_queue() {
        let queue = TaskQueue::new();
        let head = Promise::<i32, String>::deferred(&queue);
        let mut tail = head.promise.clone();
        for _ in 0..10_000 {
            let next = Promise::<i32, String>::deferred(&queue).promise;
            super::resolve(&next, Resolution::Promise(tail));
            tail = next;
        }
        head.resolve.resolve(3);
        queue.run_until_stalled();
        assert_eq!(tail.outcome(), Some(Ok(3)));
    }

    /// Each layer resolves synchronously with the next layer down.
    struct Onion(u32);

    impl Thenable<i32, String> for Onion {
        fn probe(&self) -> Result<Probe<i32, String>, String> {
            let depth = self.0;
            Ok(Probe::Thenable(Box::new(move |resolve, _| {
                if depth == 0 {
                    resolve.fulfill(-1);
                } else {
                    resolve.resolve(Resolution::Object(Rc::new(Onion(depth - 1))));
                }
                Ok(())
            })))
        }
    }

    #[test]
    fn test_deeply_nested_thenables_do_not_recurse() {
        let (_, next) = resolved(Resolution::Object(Rc::new(Onion(200_000))));
        assert_eq!(next.outcome(), Some(Ok(-1)));
    }
}

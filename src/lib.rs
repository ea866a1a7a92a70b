//! Chaining promises for single-threaded rust.
//!
//! A [`Promise`] carries one value or one failure, delivered once. `then`
//! registers continuations and returns a new promise settled from whatever
//! the continuation produced: a plain value, another [`Promise`], or a foreign
//! [`Thenable`] object. Continuations never run inside the call that
//! registered or settled them; they go through a [`Schedule`], usually a
//! [`TaskQueue`] the host drains.
//!
//! ```
//! use promise_chain::{Error, Promise, Resolution, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let chained = Promise::<i32, Error>::fulfilled(&queue, 2)
//!     .then(None, None)
//!     .and_then(Box::new(|v| Ok(Resolution::Value(v + 1))));
//! queue.run_until_stalled();
//! assert_eq!(chained.outcome(), Some(Ok(3)));
//! ```
pub mod promise;
pub mod queue;
pub mod resolution;
pub mod waiter;

pub use promise::{Deferred, Handler, Promise, Rejecter, Resolver, State};
pub use queue::{Schedule, Task, TaskQueue};
pub use resolution::{Probe, RejectPassthrough, ResolvePassthrough, Resolution, ThenFn, Thenable};
pub use waiter::Waiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("promise setup routine is missing")]
    InvalidExecutor,
    #[error("promise was resolved with itself")]
    ChainCycle,
}

/// Lets plain `String` reasons carry the crate's own failures.
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

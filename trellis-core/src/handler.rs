//! Delivery handlers.
//!
//! Every entity that receives data (subscriber, queryable, liveliness
//! subscriber, pending query) owns one [`DeliverySink`]. The sink forwards
//! events to a [`Handler`] and calls `on_close` exactly once when it is
//! dropped, which the engine does only after the last event was delivered.
//!
//! Applications pick the delivery surface through [`IntoHandler`]:
//!
//! - a closure `Fn(T)`: called inline on the delivering thread
//! - [`Callback`]: a closure plus a drop notification
//! - [`FifoChannel`](crate::channel::FifoChannel) /
//!   [`RingChannel`](crate::channel::RingChannel): a bounded queue drained
//!   through a [`Receiver`](crate::channel::Receiver)

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Consumer of events of type `T`.
pub trait Handler<T>: Send + Sync {
    fn on_event(&self, event: T);

    /// The engine stopped deliveries. A handler blocked inside `on_event`
    /// waiting on its consumer must give up; `on_close` follows once every
    /// running `on_event` has returned.
    fn on_interrupt(&self) {}

    /// Called once, after the last `on_event`.
    fn on_close(&self) {}
}

type OnEvent<T> = Box<dyn Fn(T) + Send + Sync>;
type OnDrop = Box<dyn FnOnce() + Send>;

/// Closure-based handler with an optional drop notification.
pub struct Callback<T> {
    call: OnEvent<T>,
    on_drop: Mutex<Option<OnDrop>>,
}

impl<T> Callback<T> {
    pub fn new<F>(call: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            call: Box::new(call),
            on_drop: Mutex::new(None),
        }
    }

    /// Attach a closure run once when the handler is closed.
    #[must_use]
    pub fn with_drop<D>(self, on_drop: D) -> Self
    where
        D: FnOnce() + Send + 'static,
    {
        *self.on_drop.lock() = Some(Box::new(on_drop));
        self
    }
}

impl<T> Handler<T> for Callback<T> {
    fn on_event(&self, event: T) {
        (self.call)(event);
    }

    fn on_close(&self) {
        if let Some(f) = self.on_drop.lock().take() {
            f();
        }
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}

/// Owning wrapper around a handler; closes it on drop.
pub struct DeliverySink<T> {
    handler: Box<dyn Handler<T>>,
}

impl<T> DeliverySink<T> {
    pub fn new<H>(handler: H) -> Self
    where
        H: Handler<T> + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Sink that discards everything.
    pub fn noop() -> Self
    where
        T: 'static,
    {
        Self::new(Callback::new(|_| {}))
    }

    /// Hand one event to the handler.
    ///
    /// A panic inside the handler is caught and logged; returns `false` in that case.
    pub fn deliver(&self, event: T) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.handler.on_event(event))) {
            Ok(()) => true,
            Err(payload) => {
                warn!("[HANDLER] callback panicked: {}", panic_message(&payload));
                false
            }
        }
    }
}

impl<T> DeliverySink<T> {
    /// Wake a delivery blocked on a full consumer; later deliveries are discarded.
    pub fn interrupt(&self) {
        if catch_unwind(AssertUnwindSafe(|| self.handler.on_interrupt())).is_err() {
            warn!("[HANDLER] interrupt panicked");
        }
    }
}

impl<T> Drop for DeliverySink<T> {
    fn drop(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.handler.on_close())).is_err() {
            warn!("[HANDLER] drop callback panicked");
        }
    }
}

impl<T> fmt::Debug for DeliverySink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverySink").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Conversion into a sink plus the value handed back to the application.
pub trait IntoHandler<T> {
    type Receiver;

    fn into_handler(self) -> (DeliverySink<T>, Self::Receiver);
}

impl<T, F> IntoHandler<T> for F
where
    T: 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    type Receiver = ();

    fn into_handler(self) -> (DeliverySink<T>, ()) {
        (DeliverySink::new(Callback::new(self)), ())
    }
}

impl<T: 'static> IntoHandler<T> for Callback<T> {
    type Receiver = ();

    fn into_handler(self) -> (DeliverySink<T>, ()) {
        (DeliverySink::new(self), ())
    }
}

impl<T> IntoHandler<T> for DeliverySink<T> {
    type Receiver = ();

    fn into_handler(self) -> (DeliverySink<T>, ()) {
        (self, ())
    }
}

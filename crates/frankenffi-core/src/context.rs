//! Scoped context propagation.
//!
//! Context is an immutable, persistent stack of `(key, value)` frames. Each
//! thread has a current [`Frame`]; [`with`] pushes a binding for the duration
//! of a closure and restores the previous frame on every exit path,
//! unwinding included. Frames share their tails, so capturing one is a
//! pointer copy and a captured frame never observes later shadowing.
//!
//! The scheduler captures the spawning frame and reinstalls it around every
//! poll of the task, so a value bound before `spawn` is visible inside the
//! task no matter which carrier thread runs it.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use frankenffi_membrane::{FfiError, FfiResult};

/// Typed name for a context binding.
///
/// Two keys with the same name but different value types never match each
/// other's bindings.
pub struct ContextKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextKey").field(&self.name).finish()
    }
}

struct FrameNode {
    key: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    parent: Frame,
}

/// Immutable snapshot of the binding stack. The default frame is empty.
#[derive(Clone, Default)]
pub struct Frame {
    head: Option<Arc<FrameNode>>,
}

impl Frame {
    /// The empty frame.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.head.is_none()
    }

    /// New frame with `key` bound to `value` on top of this one.
    #[must_use]
    pub fn bind<T: Send + Sync + 'static>(&self, key: &ContextKey<T>, value: T) -> Frame {
        Frame {
            head: Some(Arc::new(FrameNode {
                key: key.name,
                value: Arc::new(value),
                parent: self.clone(),
            })),
        }
    }

    /// Innermost value bound to `key` in this frame.
    #[must_use]
    pub fn lookup<T: Send + Sync + 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            if node.key == key.name {
                if let Some(value) = node.value.downcast_ref::<T>() {
                    return Some(value);
                }
            }
            cursor = node.parent.head.as_deref();
        }
        None
    }

    /// Number of bindings, shadowed ones included.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            depth += 1;
            cursor = node.parent.head.as_deref();
        }
        depth
    }

    /// Bound key names, innermost first.
    #[must_use]
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            keys.push(node.key);
            cursor = node.parent.head.as_deref();
        }
        keys
    }

    /// Install this frame on the current thread until the guard drops.
    #[must_use]
    pub fn enter(&self) -> FrameGuard {
        let previous = CURRENT.with(|cell| cell.replace(self.clone()));
        FrameGuard {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }

    /// Run `future` with this frame installed around each of its polls.
    pub fn scope<F: Future>(self, future: F) -> Scoped<F> {
        Scoped {
            frame: self,
            future: Box::pin(future),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("keys", &self.keys()).finish()
    }
}

std::thread_local! {
    static CURRENT: RefCell<Frame> = RefCell::new(Frame::root());
}

/// Restores the previously installed frame on drop.
pub struct FrameGuard {
    previous: Option<Frame>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CURRENT.with(|cell| *cell.borrow_mut() = previous);
        }
    }
}

/// Future adapter installing a frame around every poll.
pub struct Scoped<F> {
    frame: Frame,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let _frame = this.frame.enter();
        this.future.as_mut().poll(cx)
    }
}

/// The current thread's frame.
#[must_use]
pub fn capture() -> Frame {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Run `body` with `key` bound to `value`.
pub fn with<T, R>(key: &ContextKey<T>, value: T, body: impl FnOnce() -> R) -> R
where
    T: Send + Sync + 'static,
{
    let frame = capture().bind(key, value);
    let _guard = frame.enter();
    body()
}

/// Bind `key` to `value` for every poll of `future`.
pub fn with_async<T, F>(key: &ContextKey<T>, value: T, future: F) -> Scoped<F>
where
    T: Send + Sync + 'static,
    F: Future,
{
    capture().bind(key, value).scope(future)
}

/// Innermost value bound to `key`, or `ContextKeyMissing`.
pub fn get<T: Clone + Send + Sync + 'static>(key: &ContextKey<T>) -> FfiResult<T> {
    try_get(key).ok_or_else(|| FfiError::ContextKeyMissing {
        key: key.name.to_string(),
    })
}

/// Innermost value bound to `key`, if any.
#[must_use]
pub fn try_get<T: Clone + Send + Sync + 'static>(key: &ContextKey<T>) -> Option<T> {
    CURRENT.with(|cell| cell.borrow().lookup(key).cloned())
}

#[must_use]
pub fn is_bound<T: Send + Sync + 'static>(key: &ContextKey<T>) -> bool {
    CURRENT.with(|cell| cell.borrow().lookup(key).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;

    static REQUEST_ID: ContextKey<String> = ContextKey::new("request_id");
    static ATTEMPT: ContextKey<u32> = ContextKey::new("attempt");

    #[test]
    fn unbound_key_is_missing() {
        let err = get(&REQUEST_ID).unwrap_err();
        assert!(matches!(err, FfiError::ContextKeyMissing { ref key } if key == "request_id"));
        assert!(!is_bound(&REQUEST_ID));
    }

    #[test]
    fn nested_bindings_shadow_and_restore() {
        with(&REQUEST_ID, "outer".to_string(), || {
            assert_eq!(get(&REQUEST_ID).unwrap(), "outer");
            with(&REQUEST_ID, "inner".to_string(), || {
                assert_eq!(get(&REQUEST_ID).unwrap(), "inner");
                assert_eq!(capture().depth(), 2);
            });
            assert_eq!(get(&REQUEST_ID).unwrap(), "outer");
        });
        assert!(try_get(&REQUEST_ID).is_none());
        assert!(capture().is_root());
    }

    #[test]
    fn unwinding_restores_frame() {
        let result = std::panic::catch_unwind(|| {
            with(&ATTEMPT, 3, || panic!("declined"));
        });
        assert!(result.is_err());
        assert!(!is_bound(&ATTEMPT));
    }

    #[test]
    fn type_must_match_as_well_as_name() {
        let same_name: ContextKey<u64> = ContextKey::new("attempt");
        with(&ATTEMPT, 7_u32, || {
            assert_eq!(get(&ATTEMPT).unwrap(), 7);
            assert!(try_get(&same_name).is_none());
            with(&same_name, 9_u64, || {
                // Each key sees its own typed binding.
                assert_eq!(get(&ATTEMPT).unwrap(), 7);
                assert_eq!(get(&same_name).unwrap(), 9);
            });
        });
    }

    #[test]
    fn captured_frames_are_immutable_snapshots() {
        let captured = with(&REQUEST_ID, "REQ-1".to_string(), capture);
        with(&REQUEST_ID, "REQ-2".to_string(), || {
            assert_eq!(captured.lookup(&REQUEST_ID).map(String::as_str), Some("REQ-1"));
        });

        let thread_view = std::thread::spawn(move || {
            let _guard = captured.enter();
            get(&REQUEST_ID).unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(thread_view, "REQ-1");
        assert!(!is_bound(&REQUEST_ID));
    }

    #[test]
    fn scoped_future_sees_binding_on_every_poll() {
        struct TwoPolls {
            polled: bool,
        }
        impl Future for TwoPolls {
            type Output = (Option<String>, Option<String>);
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                if !self.polled {
                    self.polled = true;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Ready((try_get(&REQUEST_ID), try_get(&REQUEST_ID)))
            }
        }

        let mut fut = with_async(&REQUEST_ID, "REQ-9".to_string(), TwoPolls { polled: false });
        let mut cx = Context::from_waker(Waker::noop());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(!is_bound(&REQUEST_ID));
        match Pin::new(&mut fut).poll(&mut cx) {
            Poll::Ready((a, b)) => {
                assert_eq!(a.as_deref(), Some("REQ-9"));
                assert_eq!(b.as_deref(), Some("REQ-9"));
            }
            Poll::Pending => panic!("second poll should complete"),
        }
        assert!(!is_bound(&REQUEST_ID));
    }

    #[test]
    fn keys_list_innermost_first() {
        let frame = Frame::root()
            .bind(&REQUEST_ID, "a".to_string())
            .bind(&ATTEMPT, 1);
        assert_eq!(frame.keys(), vec!["attempt", "request_id"]);
        assert_eq!(frame.depth(), 2);
    }
}

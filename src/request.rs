//! Per-frame processing context.
//!
//! A [`Request`] wraps one inbound message together with its connection and
//! the routing cursor that drives handler execution. The cursor is touched
//! only by the worker currently executing the request; ownership is
//! expressed through `&mut` rather than a lock.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    connection::Connection,
    interceptor::IcResponse,
    message::Message,
    router::{Router, RouterHandler},
};

/// Phase cursor for the classic three-phase router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleStep {
    /// Before the business phase.
    PreHandle,
    /// The business phase.
    Handle,
    /// After the business phase.
    PostHandle,
    /// Terminal state; the request is finished.
    Over,
}

impl HandleStep {
    fn advance(self) -> Self {
        match self {
            Self::PreHandle => Self::Handle,
            Self::Handle => Self::PostHandle,
            Self::PostHandle | Self::Over => Self::Over,
        }
    }
}

/// Which dispatch model the request is bound to.
///
/// The binding is set by the dispatcher right before execution; carrying it
/// on the request keeps the two models out of global state.
#[derive(Clone, Default)]
pub enum RouterBinding {
    /// Not yet routed.
    #[default]
    None,
    /// Classic three-phase router object.
    Classic(Arc<dyn Router>),
    /// Ordered middleware-style handler list.
    Slices(Arc<[RouterHandler]>),
}

/// Context for one inbound frame.
pub struct Request {
    conn: Option<Arc<Connection>>,
    message: Message,
    response: IcResponse,
    binding: RouterBinding,
    step: HandleStep,
    need_next: bool,
    index: i32,
}

impl Request {
    /// Build a request for a message received on `conn`.
    #[must_use]
    pub fn new(conn: Arc<Connection>, message: Message) -> Self {
        Self {
            conn: Some(conn),
            ..Self::detached(message)
        }
    }

    /// Build a request with no connection attached.
    ///
    /// Used for internally generated messages and in tests; handlers see
    /// [`Request::connection`] return `None`.
    #[must_use]
    pub fn detached(message: Message) -> Self {
        Self {
            conn: None,
            message,
            response: IcResponse::noop(),
            binding: RouterBinding::None,
            step: HandleStep::PreHandle,
            need_next: true,
            index: -1,
        }
    }

    /// The connection the frame arrived on, if any.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> { self.conn.clone() }

    /// The message being processed.
    #[must_use]
    pub fn message(&self) -> &Message { &self.message }

    /// Mutable access for decoders; handlers treat the message as read-only.
    pub(crate) fn message_mut(&mut self) -> &mut Message { &mut self.message }

    /// Message id used for routing.
    #[must_use]
    pub fn msg_id(&self) -> u32 { self.message.id() }

    /// Payload bytes of the message.
    #[must_use]
    pub fn data(&self) -> &Bytes { self.message.payload() }

    /// Value produced by the decoder stage, if any.
    #[must_use]
    pub fn response(&self) -> &IcResponse { &self.response }

    /// Store the decoded value for downstream handlers.
    pub fn set_response(&mut self, response: IcResponse) { self.response = response; }

    /// Current routing binding.
    #[must_use]
    pub fn binding(&self) -> &RouterBinding { &self.binding }

    /// Bind a classic router for [`Request::call`].
    pub fn bind_router(&mut self, router: Arc<dyn Router>) {
        self.binding = RouterBinding::Classic(router);
    }

    /// Bind a handler list for [`Request::router_slices_next`].
    pub fn bind_router_slices(&mut self, handlers: Arc<[RouterHandler]>) {
        self.binding = RouterBinding::Slices(handlers);
    }

    /// Drive the classic router through its phases.
    ///
    /// Runs `pre_handle`, `handle`, `post_handle` in order, advancing after
    /// each phase unless [`Request::goto_step`] pinned the cursor, until the
    /// cursor passes [`HandleStep::Over`]. Without a classic binding this is
    /// a no-op.
    pub fn call(&mut self) {
        let RouterBinding::Classic(router) = &self.binding else {
            return;
        };
        let router = Arc::clone(router);
        while self.step < HandleStep::Over {
            match self.step {
                HandleStep::PreHandle => router.pre_handle(self),
                HandleStep::Handle => router.handle(self),
                HandleStep::PostHandle => router.post_handle(self),
                HandleStep::Over => {}
            }
            self.next();
        }
        self.step = HandleStep::PreHandle;
    }

    /// Terminate handler execution.
    ///
    /// The calling handler runs to completion; no further phase or handler
    /// executes afterwards.
    pub fn abort(&mut self) {
        match &self.binding {
            RouterBinding::Slices(handlers) => self.index = handlers.len() as i32,
            RouterBinding::Classic(_) | RouterBinding::None => self.step = HandleStep::Over,
        }
    }

    /// Jump the classic cursor to an arbitrary phase.
    ///
    /// Use with care: jumping backwards re-runs phases and may loop.
    pub fn goto_step(&mut self, step: HandleStep) {
        self.step = step;
        self.need_next = false;
    }

    /// Run the bound handler list from the current cursor position.
    ///
    /// Each handler is invoked in order; a handler that itself calls this
    /// method re-enters the loop, and a handler that returns without calling
    /// it still flows through to the next one. Without a slices binding this
    /// is a no-op.
    pub fn router_slices_next(&mut self) {
        let RouterBinding::Slices(handlers) = &self.binding else {
            return;
        };
        let handlers = Arc::clone(handlers);
        self.index += 1;
        while self.index >= 0 && (self.index as usize) < handlers.len() {
            let handler = Arc::clone(&handlers[self.index as usize]);
            handler(self);
            self.index += 1;
        }
    }

    fn next(&mut self) {
        if !self.need_next {
            self.need_next = true;
            return;
        }
        self.step = self.step.advance();
    }
}

/// Internal task carried on worker queues alongside requests.
///
/// Function tasks let server internals run a closure on the worker that owns
/// a connection, preserving per-connection ordering with message handling.
pub enum Task {
    /// A framed message ready for routing.
    Request(Box<Request>),
    /// An internal function call.
    Func(Box<dyn FnOnce() + Send>),
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::*;
    use crate::router::handler;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl Recorder {
        fn push(&self, tag: &'static str) { self.0.lock().expect("trace lock").push(tag); }

        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut self.0.lock().expect("trace lock"))
        }
    }

    struct PhaseRouter(Arc<Recorder>);

    impl Router for PhaseRouter {
        fn pre_handle(&self, _request: &mut Request) { self.0.push("P"); }

        fn handle(&self, _request: &mut Request) { self.0.push("H"); }

        fn post_handle(&self, _request: &mut Request) { self.0.push("Po"); }
    }

    struct AbortingRouter(Arc<Recorder>);

    impl Router for AbortingRouter {
        fn pre_handle(&self, request: &mut Request) {
            self.0.push("P");
            request.abort();
        }

        fn handle(&self, _request: &mut Request) { self.0.push("H"); }
    }

    #[rstest]
    fn classic_phases_run_in_order() {
        let trace = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(PhaseRouter(Arc::clone(&trace))));
        req.call();
        assert_eq!(trace.take(), vec!["P", "H", "Po"]);
    }

    #[rstest]
    fn abort_in_pre_handle_skips_remaining_phases() {
        let trace = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(AbortingRouter(Arc::clone(&trace))));
        req.call();
        assert_eq!(trace.take(), vec!["P"]);
    }

    #[rstest]
    fn goto_step_repeats_a_phase_once() {
        struct RetryRouter {
            trace: Arc<Recorder>,
            retried: Mutex<bool>,
        }

        impl Router for RetryRouter {
            fn handle(&self, request: &mut Request) {
                self.trace.push("H");
                let mut retried = self.retried.lock().expect("retry flag");
                if !*retried {
                    *retried = true;
                    request.goto_step(HandleStep::Handle);
                }
            }

            fn post_handle(&self, _request: &mut Request) { self.trace.push("Po"); }
        }

        let trace = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(RetryRouter {
            trace: Arc::clone(&trace),
            retried: Mutex::new(false),
        }));
        req.call();
        assert_eq!(trace.take(), vec!["H", "H", "Po"]);
    }

    #[rstest]
    fn slices_flow_through_without_explicit_next() {
        let trace = Arc::new(Recorder::default());
        let a = {
            let trace = Arc::clone(&trace);
            handler(move |_| trace.push("a"))
        };
        let b = {
            let trace = Arc::clone(&trace);
            handler(move |_| trace.push("b"))
        };

        let mut req = Request::detached(Message::default());
        req.bind_router_slices(vec![a, b].into());
        req.router_slices_next();
        assert_eq!(trace.take(), vec!["a", "b"]);
    }

    #[rstest]
    fn slices_explicit_next_reenters_then_unwinds() {
        let trace = Arc::new(Recorder::default());
        let outer = {
            let trace = Arc::clone(&trace);
            handler(move |req| {
                trace.push("before");
                req.router_slices_next();
                trace.push("after");
            })
        };
        let inner = {
            let trace = Arc::clone(&trace);
            handler(move |_| trace.push("inner"))
        };

        let mut req = Request::detached(Message::default());
        req.bind_router_slices(vec![outer, inner].into());
        req.router_slices_next();
        // The inner handler runs inside the outer's `next` call; unwinding
        // does not run it a second time.
        assert_eq!(trace.take(), vec!["before", "inner", "after"]);
    }

    #[rstest]
    fn slices_abort_stops_the_chain() {
        let trace = Arc::new(Recorder::default());
        let auth = {
            let trace = Arc::clone(&trace);
            handler(move |req| {
                trace.push("auth");
                req.abort();
            })
        };
        let hello = {
            let trace = Arc::clone(&trace);
            handler(move |_| trace.push("hello"))
        };

        let mut req = Request::detached(Message::default());
        req.bind_router_slices(vec![auth, hello].into());
        req.router_slices_next();
        assert_eq!(trace.take(), vec!["auth"]);
    }
}

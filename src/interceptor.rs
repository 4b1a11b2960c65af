//! The inbound interceptor pipeline.
//!
//! Every frame flows through an ordered chain: the decoder at the head,
//! user interceptors in registration order, and the dispatcher at the tail.
//! Propagation is cooperative: an interceptor that returns without calling
//! [`Chain::proceed`] short-circuits the pipeline and its response bubbles
//! back to the caller.

use std::{any::Any, sync::Arc};

use async_trait::async_trait;

use crate::{error::FrameError, message::Message, request::Request};

/// Opaque value passed back up the chain.
///
/// Interceptors that have nothing to report return the no-op sentinel;
/// decoders wrap their parsed frame so downstream handlers can read it from
/// the request's response slot.
#[derive(Clone, Default)]
pub struct IcResponse(Option<Arc<dyn Any + Send + Sync>>);

impl IcResponse {
    /// The sentinel returned when the chain runs past its end.
    #[must_use]
    pub fn noop() -> Self { Self(None) }

    /// Wrap a decoded value.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(value: T) -> Self { Self(Some(Arc::new(value))) }

    /// Whether this is the no-op sentinel.
    #[must_use]
    pub fn is_noop(&self) -> bool { self.0.is_none() }

    /// Borrow the carried value as `T`, when present and of that type.
    #[must_use]
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for IcResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("IcResponse(<value>)"),
            None => f.write_str("IcResponse(noop)"),
        }
    }
}

/// One stage of the inbound pipeline.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Process the in-flight request carried by `chain`.
    ///
    /// Call [`Chain::proceed`] to hand the request to the next stage, or
    /// return without proceeding to stop propagation.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the carried frame is malformed; the
    /// error propagates to the chain's caller and the frame is dropped.
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError>;
}

/// Cursor over an assembled interceptor list plus the in-flight request.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    position: usize,
    request: &'a mut Option<Request>,
}

impl Chain<'_> {
    /// Advance the cursor and invoke the next interceptor.
    ///
    /// Past the end of the chain this returns the no-op sentinel, so a tail
    /// interceptor may call it unconditionally.
    ///
    /// # Errors
    ///
    /// Propagates any [`FrameError`] raised further down the chain.
    pub async fn proceed(&mut self) -> Result<IcResponse, FrameError> {
        let Some(interceptor) = self.interceptors.get(self.position).cloned() else {
            return Ok(IcResponse::noop());
        };
        self.position += 1;
        interceptor.intercept(self).await
    }

    /// The in-flight request, unless the tail already claimed it.
    #[must_use]
    pub fn request(&self) -> Option<&Request> { self.request.as_ref() }

    /// Mutable access to the in-flight request.
    pub fn request_mut(&mut self) -> Option<&mut Request> { self.request.as_mut() }

    /// The message undergoing framing, for decoder stages.
    #[must_use]
    pub fn message(&self) -> Option<&Message> { self.request.as_ref().map(Request::message) }

    /// Mutable access to the message undergoing framing.
    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.request.as_mut().map(Request::message_mut)
    }

    /// Take ownership of the request; the dispatcher tail uses this to move
    /// it onto a worker queue.
    pub fn take_request(&mut self) -> Option<Request> { self.request.take() }

    /// Store `decoded` in the request's response slot and advance.
    ///
    /// Passing the no-op sentinel leaves the slot untouched, signalling that
    /// the frame is incomplete and flows on unchanged.
    ///
    /// # Errors
    ///
    /// Propagates any [`FrameError`] raised further down the chain.
    pub async fn proceed_with_decoded(
        &mut self,
        decoded: IcResponse,
    ) -> Result<IcResponse, FrameError> {
        if !decoded.is_noop() {
            if let Some(request) = self.request.as_mut() {
                request.set_response(decoded);
            }
        }
        self.proceed().await
    }
}

/// Assembles the head / body / tail interceptor order.
///
/// The decoder occupies the head slot so it runs before user interceptors;
/// the dispatcher occupies the tail slot and is installed exactly once at
/// message-handler construction.
#[derive(Default)]
pub struct ChainBuilder {
    head: Option<Arc<dyn Interceptor>>,
    body: Vec<Arc<dyn Interceptor>>,
    tail: Option<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    /// Builder with no stages installed.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Install the head stage, replacing any previous head.
    pub fn set_head(&mut self, interceptor: Arc<dyn Interceptor>) { self.head = Some(interceptor); }

    /// Install the tail stage, replacing any previous tail.
    pub fn set_tail(&mut self, interceptor: Arc<dyn Interceptor>) { self.tail = Some(interceptor); }

    /// Append a body stage; body stages run in registration order.
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.body.push(interceptor);
    }

    /// Snapshot the assembled interceptor order.
    #[must_use]
    pub fn assemble(&self) -> Vec<Arc<dyn Interceptor>> {
        self.head
            .iter()
            .chain(self.body.iter())
            .chain(self.tail.iter())
            .cloned()
            .collect()
    }

    /// Run `request` through the assembled chain from the head.
    ///
    /// # Errors
    ///
    /// Returns the [`FrameError`] of whichever stage rejected the frame.
    pub async fn execute(&self, request: Request) -> Result<IcResponse, FrameError> {
        let interceptors = self.assemble();
        execute_chain(&interceptors, request).await
    }
}

/// Run `request` through an already-assembled interceptor list.
pub(crate) async fn execute_chain(
    interceptors: &[Arc<dyn Interceptor>],
    request: Request,
) -> Result<IcResponse, FrameError> {
    let mut slot = Some(request);
    let mut chain = Chain {
        interceptors,
        position: 0,
        request: &mut slot,
    };
    chain.proceed().await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::rstest;

    use super::*;

    struct Tag {
        name: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
        proceed: bool,
    }

    #[async_trait]
    impl Interceptor for Tag {
        async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
            self.trace.lock().expect("trace lock").push(self.name);
            if self.proceed {
                chain.proceed().await
            } else {
                Ok(IcResponse::with_value(self.name))
            }
        }
    }

    fn tag(
        name: &'static str,
        trace: &Arc<Mutex<Vec<&'static str>>>,
        proceed: bool,
    ) -> Arc<dyn Interceptor> {
        Arc::new(Tag {
            name,
            trace: Arc::clone(trace),
            proceed,
        })
    }

    #[rstest]
    #[tokio::test]
    async fn head_body_tail_run_in_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut builder = ChainBuilder::new();
        builder.set_tail(tag("tail", &trace, true));
        builder.set_head(tag("head", &trace, true));
        builder.add_interceptor(tag("body1", &trace, true));
        builder.add_interceptor(tag("body2", &trace, true));

        let response = builder
            .execute(Request::detached(Message::default()))
            .await
            .expect("chain should succeed");
        assert!(response.is_noop());
        assert_eq!(
            *trace.lock().expect("trace lock"),
            vec!["head", "body1", "body2", "tail"]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn returning_without_proceed_short_circuits() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut builder = ChainBuilder::new();
        builder.add_interceptor(tag("stop", &trace, false));
        builder.add_interceptor(tag("unreached", &trace, true));

        let response = builder
            .execute(Request::detached(Message::default()))
            .await
            .expect("chain should succeed");
        assert_eq!(response.downcast_ref::<&'static str>(), Some(&"stop"));
        assert_eq!(*trace.lock().expect("trace lock"), vec!["stop"]);
    }

    #[rstest]
    #[tokio::test]
    async fn proceed_past_the_end_is_noop() {
        let builder = ChainBuilder::new();
        let response = builder
            .execute(Request::detached(Message::default()))
            .await
            .expect("empty chain should succeed");
        assert!(response.is_noop());
    }

    #[rstest]
    #[tokio::test]
    async fn decoded_value_lands_in_the_response_slot() {
        struct Decoderish;

        #[async_trait]
        impl Interceptor for Decoderish {
            async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
                chain
                    .proceed_with_decoded(IcResponse::with_value(41_u32))
                    .await
            }
        }

        struct Check;

        #[async_trait]
        impl Interceptor for Check {
            async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
                let request = chain.request().expect("request should be present");
                assert_eq!(request.response().downcast_ref::<u32>(), Some(&41));
                Ok(IcResponse::noop())
            }
        }

        let mut builder = ChainBuilder::new();
        builder.set_head(Arc::new(Decoderish));
        builder.set_tail(Arc::new(Check));
        builder
            .execute(Request::detached(Message::default()))
            .await
            .expect("chain should succeed");
    }
}

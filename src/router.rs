//! The two dispatch models: classic three-phase routers and
//! middleware-style handler slices.
//!
//! A process runs one model, selected by configuration at server
//! construction; the registration entry points on
//! [`crate::server::Server`] refuse calls against the inactive model.
//! Within the dispatch path the model is carried per-request as a tagged
//! binding, so nothing here consults global state.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{error::RegistrationError, request::Request};

/// Classic three-phase route. All phases default to no-ops so
/// implementations override only what they need.
pub trait Router: Send + Sync {
    /// Hook running before the main business phase.
    fn pre_handle(&self, _request: &mut Request) {}
    /// The main business phase.
    fn handle(&self, _request: &mut Request) {}
    /// Hook running after the main business phase.
    fn post_handle(&self, _request: &mut Request) {}
}

/// A single middleware-style handler.
///
/// Handlers cooperate: calling [`Request::router_slices_next`] advances the
/// chain explicitly, but returning without calling it also passes through to
/// the next handler. [`Request::abort`] jumps the cursor past the end.
pub type RouterHandler = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// Wrap a plain function or closure as a [`RouterHandler`].
#[must_use]
pub fn handler<F>(f: F) -> RouterHandler
where
    F: Fn(&mut Request) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Table mapping message ids to ordered handler lists.
///
/// The effective list for an id is snapshotted at registration time as
/// `globals ++ per-id handlers` (with a group prefix in between when
/// registering through a [`GroupRouter`]). Handlers added to the globals
/// afterwards do not retroactively apply.
#[derive(Default)]
pub struct RouterSlices {
    apis: RwLock<HashMap<u32, Arc<[RouterHandler]>>>,
    globals: RwLock<Vec<RouterHandler>>,
}

impl RouterSlices {
    /// Build an empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append handlers to the global prefix shared by future registrations.
    pub fn use_handlers(&self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.globals
            .write()
            .expect("router globals lock poisoned")
            .extend(handlers);
    }

    /// Register `handlers` for `id`, prefixed by the current globals.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicateRoute`] when `id` is already
    /// registered; no state is committed in that case.
    pub fn add_handler(
        &self,
        id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RegistrationError> {
        let globals = self
            .globals
            .read()
            .expect("router globals lock poisoned")
            .clone();
        self.insert(id, globals.into_iter().chain(handlers).collect())
    }

    /// Look up the effective handler list for `id`.
    #[must_use]
    pub fn get_handlers(&self, id: u32) -> Option<Arc<[RouterHandler]>> {
        self.apis
            .read()
            .expect("router table lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Create a group covering `start..=end` with its own prefix handlers.
    #[must_use]
    pub fn group(
        self: &Arc<Self>,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter {
        GroupRouter {
            start,
            end,
            prefix: RwLock::new(handlers.into_iter().collect()),
            parent: Arc::clone(self),
        }
    }

    fn insert(&self, id: u32, list: Vec<RouterHandler>) -> Result<(), RegistrationError> {
        let mut apis = self.apis.write().expect("router table lock poisoned");
        if apis.contains_key(&id) {
            return Err(RegistrationError::DuplicateRoute(id));
        }
        apis.insert(id, list.into());
        log::info!("add handler slices for msg id {id}");
        Ok(())
    }
}

/// A contiguous message-id range sharing a prefix handler list.
///
/// Registrations through a group compose
/// `parent globals ++ group prefix ++ per-id handlers`, snapshotted at
/// registration time, and must fall inside the group's range.
pub struct GroupRouter {
    start: u32,
    end: u32,
    prefix: RwLock<Vec<RouterHandler>>,
    parent: Arc<RouterSlices>,
}

impl GroupRouter {
    /// Append handlers to this group's prefix.
    pub fn use_handlers(&self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.prefix
            .write()
            .expect("group prefix lock poisoned")
            .extend(handlers);
    }

    /// Register `handlers` for `id` inside the group's range.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::OutOfRange`] when `id` falls outside
    /// `start..=end` and [`RegistrationError::DuplicateRoute`] when the id is
    /// already taken on the parent table.
    pub fn add_handler(
        &self,
        id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RegistrationError> {
        if id < self.start || id > self.end {
            return Err(RegistrationError::OutOfRange {
                id,
                start: self.start,
                end: self.end,
            });
        }
        let prefix = self
            .prefix
            .read()
            .expect("group prefix lock poisoned")
            .clone();
        self.parent
            .add_handler(id, prefix.into_iter().chain(handlers))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use rstest::rstest;

    use super::*;

    fn tracing_handler(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> RouterHandler {
        let log = Arc::clone(log);
        handler(move |_req| log.lock().expect("trace lock poisoned").push(tag))
    }

    #[rstest]
    fn duplicate_registration_fails_without_partial_state() {
        let table = RouterSlices::new();
        table
            .add_handler(1, [handler(|_| {})])
            .expect("first registration should succeed");

        let before = table.get_handlers(1).expect("route should exist");
        let err = table
            .add_handler(1, [handler(|_| {}), handler(|_| {})])
            .expect_err("second registration must fail");
        assert_eq!(err, RegistrationError::DuplicateRoute(1));

        let after = table.get_handlers(1).expect("route should still exist");
        assert_eq!(before.len(), after.len());
    }

    #[rstest]
    fn effective_list_is_globals_then_group_prefix_then_handlers() {
        let table = Arc::new(RouterSlices::new());
        let trace = Arc::new(Mutex::new(Vec::new()));

        table.use_handlers([tracing_handler(&trace, "global")]);
        let group = table.group(10, 20, [tracing_handler(&trace, "prefix")]);
        group
            .add_handler(15, [tracing_handler(&trace, "leaf")])
            .expect("registration should succeed");

        let handlers = table.get_handlers(15).expect("route should exist");
        assert_eq!(handlers.len(), 3);
        let mut req = crate::request::Request::detached(crate::message::Message::default());
        for h in handlers.iter() {
            h(&mut req);
        }
        assert_eq!(
            *trace.lock().expect("trace lock poisoned"),
            vec!["global", "prefix", "leaf"]
        );
    }

    #[rstest]
    fn group_registration_equivalent_to_prefixed_parent_registration() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let counting = |calls: &Arc<AtomicUsize>| {
            let calls = Arc::clone(calls);
            handler(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Registered through a group...
        let grouped = Arc::new(RouterSlices::new());
        let group = grouped.group(0, 100, [counting(&calls_a)]);
        group
            .add_handler(5, [counting(&calls_a)])
            .expect("group registration should succeed");

        // ...or directly with the prefix spliced in by hand.
        let direct = Arc::new(RouterSlices::new());
        direct
            .add_handler(5, [counting(&calls_b), counting(&calls_b)])
            .expect("direct registration should succeed");

        let mut req = crate::request::Request::detached(crate::message::Message::default());
        for h in grouped.get_handlers(5).expect("route should exist").iter() {
            h(&mut req);
        }
        for h in direct.get_handlers(5).expect("route should exist").iter() {
            h(&mut req);
        }
        assert_eq!(
            calls_a.load(Ordering::SeqCst),
            calls_b.load(Ordering::SeqCst)
        );
    }

    #[rstest]
    #[case::below(9)]
    #[case::above(21)]
    fn out_of_range_group_registration_fails(#[case] id: u32) {
        let table = Arc::new(RouterSlices::new());
        let group = table.group(10, 20, []);
        let err = group
            .add_handler(id, [handler(|_| {})])
            .expect_err("registration outside the range must fail");
        assert_eq!(
            err,
            RegistrationError::OutOfRange {
                id,
                start: 10,
                end: 20
            }
        );
        assert!(table.get_handlers(id).is_none());
    }

    #[rstest]
    fn later_globals_do_not_apply_retroactively() {
        let table = RouterSlices::new();
        table
            .add_handler(1, [handler(|_| {})])
            .expect("registration should succeed");
        table.use_handlers([handler(|_| {})]);
        table
            .add_handler(2, [handler(|_| {})])
            .expect("registration should succeed");

        assert_eq!(table.get_handlers(1).expect("route 1").len(), 1);
        assert_eq!(table.get_handlers(2).expect("route 2").len(), 2);
    }
}

use std::{
    any,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use futures_timer::Delay;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    config::{BatchRules, Window},
    data::{KeySet, Token as KeyToken, ValueSet},
    error::{Error, FetchError},
    key::{Id, Key},
    registry::Pass,
    wakerset::{Token as WakerToken, WakerSet},
};

pub(crate) type BoxBatcher<V> =
    Arc<dyn Fn(KeySet<Key>) -> BoxFuture<'static, Result<ValueSet<V>, FetchError>> + Send + Sync>;

/// What closes an accumulating window.
enum Trigger {
    /// Close when a handle that has already yielded once is polled again.
    Tick,
    /// Close when the timer (raced against pass cancellation) fires.
    Timer(BoxFuture<'static, ()>),
    /// Close on the next poll.
    Now,
}

impl Debug for Trigger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Tick => "Tick",
            Trigger::Timer(..) => "Timer",
            Trigger::Now => "Now",
        })
    }
}

#[derive(Debug)]
struct AccumulatingState {
    keys: KeySet<Key>,
    trigger: Trigger,
    wakers: WakerSet,
}

// We only need one task to "drive" a dispatched batch. However, there are two
// cases we need to handle:
// - If a future is dropped, we need to arrange for a different task to
//   continue driving this batch
// - When the batch completes, we need to wake ALL the tasks
struct RunningState<V> {
    fut: BoxFuture<'static, Result<ValueSet<V>, FetchError>>,
    index: Vec<(Key, KeyToken)>,
    wakers: WakerSet,
}

enum State<V> {
    Accum(AccumulatingState),
    Running(RunningState<V>),
    Done(Result<ValueSet<V>, Error>),
}

impl<V> State<V> {
    fn name(&self) -> &'static str {
        match self {
            State::Accum(..) => "accumulating",
            State::Running(..) => "running",
            State::Done(Ok(..)) => "done",
            State::Done(Err(..)) => "failed",
        }
    }
}

type SharedState<V> = Arc<Mutex<State<V>>>;

enum Slot<V> {
    /// The key is part of a window that hasn't resolved yet.
    Pending {
        state: Weak<Mutex<State<V>>>,
        token: KeyToken,
    },
    Ready(V),
}

struct Inner<V> {
    /// The currently accumulating window, if there is one. Handles own their
    /// windows; the loader only keeps a weak pointer so that new keys can be
    /// added to it.
    window: Weak<Mutex<State<V>>>,
    cache: HashMap<Key, Slot<V>>,
    dispatches: usize,
}

struct Shared<V> {
    relation: &'static str,
    batcher: BoxBatcher<V>,
    rules: BatchRules,
    pass: Pass,

    // Lock order: `inner` before any window state. Futures never acquire
    // `inner` while holding a window lock.
    inner: Mutex<Inner<V>>,
}

fn is_pending_on<V>(slot: Option<&Slot<V>>, state: &SharedState<V>) -> bool {
    matches!(slot, Some(Slot::Pending { state: pending, .. }) if Weak::as_ptr(pending) == Arc::as_ptr(state))
}

impl<V: Clone + Send + 'static> Shared<V> {
    fn open_trigger(&self) -> Trigger {
        match self.rules.window {
            Window::Tick => Trigger::Tick,
            Window::Delay(delay) => {
                let cancelled = Box::pin(self.pass.token().clone().cancelled_owned());
                Trigger::Timer(future::select(Delay::new(delay), cancelled).map(drop).boxed())
            }
        }
    }

    /// Add a key to the open window, opening a fresh one if there is none.
    fn enqueue(&self, inner: &mut Inner<V>, key: Key) -> (SharedState<V>, KeyToken) {
        if let Some(state) = inner.window.upgrade() {
            let added = match *state.lock() {
                State::Accum(ref mut window) => {
                    let token = window.keys.add_key(key.clone());

                    // If we've hit the key limit, close the window on the
                    // next poll so that the batch is issued immediately.
                    let full = matches!(self.rules.max_keys, Some(max_keys) if window.keys.len() >= max_keys.get());
                    if full {
                        window.trigger = Trigger::Now;
                        window.wakers.wake_driver();
                    }

                    Some((token, full))
                }
                _ => None,
            };

            if let Some((token, full)) = added {
                // Detach a full window, so the next key opens a fresh one.
                if full {
                    inner.window = Weak::new();
                }
                return (state, token);
            }
        }

        let mut keys = KeySet::new();
        let token = keys.add_key(key);

        let full = matches!(self.rules.max_keys, Some(max_keys) if max_keys.get() <= 1);
        let trigger = if full { Trigger::Now } else { self.open_trigger() };

        let state = Arc::new(Mutex::new(State::Accum(AccumulatingState {
            keys,
            trigger,
            wakers: WakerSet::default(),
        })));

        inner.window = if full {
            Weak::new()
        } else {
            Arc::downgrade(&state)
        };

        (state, token)
    }

    /// Close an accumulating window and hand its keys to the batch function.
    /// No-op if someone else already closed it.
    fn dispatch(&self, state: &SharedState<V>) {
        let mut inner = self.inner.lock();
        let mut guard = state.lock();

        let window = match *guard {
            State::Accum(ref mut window) => window,
            _ => return,
        };

        if Weak::as_ptr(&inner.window) == Arc::as_ptr(state) {
            inner.window = Weak::new();
        }

        let keys = window.keys.take();
        let wakers = mem::take(&mut window.wakers);
        let index = keys.index();

        if self.pass.is_cancelled() {
            *guard = State::Done(Err(Error::RequestCancelled));
            drop(guard);

            for (key, _token) in &index {
                if is_pending_on(inner.cache.get(key), state) {
                    inner.cache.remove(key);
                }
            }
            drop(inner);

            debug!(
                relation = self.relation,
                pass = self.pass.id(),
                keys = index.len(),
                "window closed by cancellation"
            );
            wakers.wake_all();
            return;
        }

        // Never call the batch function with an empty key set
        if keys.is_empty() {
            *guard = State::Done(Ok(ValueSet::empty()));
            drop(guard);
            drop(inner);
            wakers.wake_all();
            return;
        }

        inner.dispatches += 1;
        drop(inner);

        debug!(
            relation = self.relation,
            pass = self.pass.id(),
            keys = keys.len(),
            waiting = wakers.len(),
            "dispatching batch"
        );

        let fut = (self.batcher)(keys);
        *guard = State::Running(RunningState { fut, index, wakers });
    }

    /// Write the results of a finished window into the cache. Keys without a
    /// value (failed batch, or a key the batch function didn't cover) are
    /// forgotten, so that a later load retries them in a new window.
    fn settle(&self, state: &SharedState<V>, entries: Vec<(Key, Option<V>)>) {
        let mut inner = self.inner.lock();

        for (key, value) in entries {
            match value {
                Some(value) => {
                    inner.cache.insert(key, Slot::Ready(value));
                }
                None => {
                    if is_pending_on(inner.cache.get(&key), state) {
                        inner.cache.remove(&key);
                    }
                }
            }
        }
    }
}

/// A coalescing loader for a single relation, scoped to a single pass.
///
/// Every call to [`load`][Loader::load] returns a [`Deferred`] handle
/// immediately. Keys requested while a window is open are collected
/// (and deduplicated) into that window; when the window closes, the batch
/// function is called exactly once with every distinct key, and each handle
/// receives the value for its own key. Results are cached for the rest of the
/// pass, so a key is fetched at most once per pass.
pub struct Loader<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Debug for Loader<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Loader")
            .field("relation", &self.shared.relation)
            .field("value", &any::type_name::<V>())
            .field("rules", &self.shared.rules)
            .field("pass", &self.shared.pass.id())
            .field("cached", &inner.cache.len())
            .field("dispatches", &inner.dispatches)
            .finish()
    }
}

impl<V: Clone + Send + 'static> Loader<V> {
    /// Create a loader for `relation`. Most loaders are created by a
    /// [`Catalog`][crate::Catalog] instead, once per pass.
    pub fn new<F, Fut>(relation: &'static str, rules: BatchRules, pass: Pass, batcher: F) -> Self
    where
        F: Fn(KeySet<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueSet<V>, FetchError>> + Send + 'static,
    {
        Self::from_boxed(relation, rules, pass, Arc::new(move |keys| batcher(keys).boxed()))
    }

    pub(crate) fn from_boxed(
        relation: &'static str,
        rules: BatchRules,
        pass: Pass,
        batcher: BoxBatcher<V>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                relation,
                batcher,
                rules,
                pass,
                inner: Mutex::new(Inner {
                    window: Weak::new(),
                    cache: HashMap::new(),
                    dispatches: 0,
                }),
            }),
        }
    }

    #[inline]
    pub fn relation(&self) -> &'static str {
        self.shared.relation
    }

    #[inline]
    pub fn pass(&self) -> &Pass {
        &self.shared.pass
    }

    /// How many times this loader has called its batch function.
    pub fn dispatch_count(&self) -> usize {
        self.shared.inner.lock().dispatches
    }

    /// Request the value for `id`. Never blocks; the returned handle resolves
    /// once the window containing `id` has been dispatched. If the key is
    /// already cached, or already pending in this pass, the existing result
    /// is shared instead of registering the key again.
    pub fn load(&self, id: impl Into<Id>) -> Deferred<V> {
        let key = Key::new(self.shared.relation, id);

        if self.shared.pass.is_cancelled() {
            return Deferred::ready(key, Err(Error::RequestCancelled));
        }

        let mut inner = self.shared.inner.lock();

        match inner.cache.get(&key) {
            Some(Slot::Ready(value)) => {
                trace!(%key, "cache hit");
                let value = value.clone();
                return Deferred::ready(key, Ok(value));
            }
            Some(Slot::Pending { state, token }) => {
                // A dead pointer means every handle for that window was
                // dropped before it resolved; fall through and register again.
                if let Some(state) = state.upgrade() {
                    trace!(%key, "joined pending load");
                    let token = *token;
                    return Deferred::pending(key, state, token, self.shared.clone());
                }
            }
            None => {}
        }

        let (state, token) = self.shared.enqueue(&mut inner, key.clone());
        inner.cache.insert(
            key.clone(),
            Slot::Pending {
                state: Arc::downgrade(&state),
                token,
            },
        );
        drop(inner);

        Deferred::pending(key, state, token, self.shared.clone())
    }

    /// Pointwise [`load`][Loader::load]; handles are returned in the same
    /// order as `ids`.
    pub fn load_many<I>(&self, ids: I) -> Vec<Deferred<V>>
    where
        I: IntoIterator,
        I::Item: Into<Id>,
    {
        ids.into_iter().map(|id| self.load(id)).collect()
    }

    /// Register every id, then wait for all of them. Values are returned in
    /// the same order as `ids`; the first error is returned if any load fails.
    pub fn load_all<I>(&self, ids: I) -> impl Future<Output = Result<Vec<V>, Error>> + Send
    where
        I: IntoIterator,
        I::Item: Into<Id>,
    {
        let gets: Vec<Get<V>> = self.load_many(ids).iter().map(Deferred::get).collect();
        future::try_join_all(gets)
    }

    /// Seed the cache with a value that is already known, so that loading
    /// `id` later in this pass doesn't fetch it. Returns false (and changes
    /// nothing) if the key is already cached or pending.
    pub fn prime(&self, id: impl Into<Id>, value: V) -> bool {
        let key = Key::new(self.shared.relation, id);
        let mut inner = self.shared.inner.lock();

        let occupied = match inner.cache.get(&key) {
            Some(Slot::Ready(..)) => true,
            Some(Slot::Pending { state, .. }) => state.strong_count() > 0,
            None => false,
        };

        if !occupied {
            trace!(%key, "primed");
            inner.cache.insert(key, Slot::Ready(value));
        }

        !occupied
    }
}

enum Resolution<V> {
    Ready(Result<V, Error>),
    Pending {
        state: SharedState<V>,
        token: KeyToken,
        shared: Arc<Shared<V>>,
    },
}

/// A handle to a value that will be known once its key's window completes.
///
/// Handles are cheap to clone. Observing a handle (with [`get`][Deferred::get]
/// or `.await`) suspends the caller until the window is dispatched; every
/// observation of the same handle yields the same outcome, and none of them
/// cause another fetch.
pub struct Deferred<V> {
    key: Key,
    resolution: Resolution<V>,
}

impl<V> Clone for Deferred<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        let resolution = match &self.resolution {
            Resolution::Ready(result) => Resolution::Ready(result.clone()),
            Resolution::Pending {
                state,
                token,
                shared,
            } => Resolution::Pending {
                state: state.clone(),
                token: *token,
                shared: shared.clone(),
            },
        };

        Self {
            key: self.key.clone(),
            resolution,
        }
    }
}

impl<V> Debug for Deferred<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &self.resolution {
            Resolution::Ready(Ok(..)) => "cached",
            Resolution::Ready(Err(..)) => "failed",
            Resolution::Pending { state, .. } => state.lock().name(),
        };

        f.debug_struct("Deferred")
            .field("key", &self.key)
            .field("state", &state)
            .finish()
    }
}

impl<V: Clone> Deferred<V> {
    fn ready(key: Key, result: Result<V, Error>) -> Self {
        Self {
            key,
            resolution: Resolution::Ready(result),
        }
    }

    fn pending(key: Key, state: SharedState<V>, token: KeyToken, shared: Arc<Shared<V>>) -> Self {
        Self {
            key,
            resolution: Resolution::Pending {
                state,
                token,
                shared,
            },
        }
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Wait for the value of this handle.
    pub fn get(&self) -> Get<V> {
        Get {
            handle: self.clone(),
            waker_token: None,
            yielded: false,
        }
    }

    /// The outcome of this handle, if it is already known. Never suspends and
    /// never drives the window forward.
    pub fn peek(&self) -> Option<Result<V, Error>> {
        match &self.resolution {
            Resolution::Ready(result) => Some(result.clone()),
            Resolution::Pending { state, token, .. } => match &*state.lock() {
                State::Done(Ok(values)) => Some(
                    values
                        .get(*token)
                        .cloned()
                        .ok_or_else(|| Error::MissingValue {
                            key: self.key.clone(),
                        }),
                ),
                State::Done(Err(err)) => Some(Err(err.clone())),
                State::Accum(..) | State::Running(..) => None,
            },
        }
    }
}

impl<V: Clone + Send + 'static> IntoFuture for Deferred<V> {
    type Output = Result<V, Error>;
    type IntoFuture = Get<V>;

    fn into_future(self) -> Get<V> {
        Get {
            handle: self,
            waker_token: None,
            yielded: false,
        }
    }
}

enum Step<V> {
    Dispatch,
    Finish {
        result: Result<ValueSet<V>, FetchError>,
        index: Vec<(Key, KeyToken)>,
        wakers: WakerSet,
    },
}

/// The future returned by [`Deferred::get`].
///
/// All of the asynchronous work is driven through polling these futures: the
/// batch function is not scheduled in any runtime, it is driven in the
/// foreground by whichever `Get` is currently the driving waker of the window.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Get<V> {
    handle: Deferred<V>,
    waker_token: Option<WakerToken>,
    yielded: bool,
}

// Nothing in Get is structurally pinned.
impl<V> Unpin for Get<V> {}

impl<V> Debug for Get<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Get")
            .field("handle", &self.handle)
            .field("waker_token", &self.waker_token)
            .finish()
    }
}

impl<V: Clone + Send + 'static> Future for Get<V> {
    type Output = Result<V, Error>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        let (state, token, shared) = match &this.handle.resolution {
            Resolution::Ready(result) => return Poll::Ready(result.clone()),
            Resolution::Pending {
                state,
                token,
                shared,
            } => (state, *token, shared),
        };

        // Note about these locks: they are only held for the duration of a
        // poll, never across an await.
        loop {
            let mut guard = state.lock();

            let step = match *guard {
                State::Accum(ref mut window) => {
                    let closed = shared.pass.is_cancelled()
                        || match window.trigger {
                            Trigger::Now => true,
                            Trigger::Timer(ref mut timer) => timer.poll_unpin(ctx).is_ready(),
                            Trigger::Tick if this.yielded => true,
                            Trigger::Tick => {
                                // Yield once, so that every other resolver
                                // runnable this tick gets to join the window.
                                this.yielded = true;
                                ctx.waker().wake_by_ref();
                                false
                            }
                        };

                    if !closed {
                        window.wakers.register(&mut this.waker_token, ctx.waker());
                        return Poll::Pending;
                    }

                    Step::Dispatch
                }

                State::Running(ref mut running) => match running.fut.poll_unpin(ctx) {
                    Poll::Pending => {
                        running.wakers.register(&mut this.waker_token, ctx.waker());
                        return Poll::Pending;
                    }
                    Poll::Ready(result) => Step::Finish {
                        result,
                        index: mem::take(&mut running.index),
                        wakers: mem::take(&mut running.wakers),
                    },
                },

                State::Done(ref result) => {
                    this.waker_token = None;

                    return Poll::Ready(match result {
                        Ok(values) => values.get(token).cloned().ok_or_else(|| Error::MissingValue {
                            key: this.handle.key.clone(),
                        }),
                        Err(err) => Err(err.clone()),
                    });
                }
            };

            match step {
                Step::Dispatch => {
                    drop(guard);
                    shared.dispatch(state);
                }
                Step::Finish {
                    result,
                    index,
                    wakers,
                } => {
                    let result = result.map_err(|source| Error::BatchFetch {
                        relation: shared.relation,
                        source,
                    });

                    let entries: Vec<(Key, Option<V>)> = match result {
                        Ok(ref values) => index
                            .into_iter()
                            .map(|(key, token)| {
                                let value = values.get(token).cloned();
                                if value.is_none() {
                                    warn!(%key, "batch function returned no value for key");
                                }
                                (key, value)
                            })
                            .collect(),
                        Err(ref err) => {
                            warn!(
                                relation = shared.relation,
                                pass = shared.pass.id(),
                                keys = index.len(),
                                error = %err,
                                "batch fetch failed"
                            );
                            index.into_iter().map(|(key, _token)| (key, None)).collect()
                        }
                    };

                    *guard = State::Done(result);
                    drop(guard);

                    // Every result is cached before any waiting handle is woken.
                    shared.settle(state, entries);
                    wakers.discard_wake_all(this.waker_token.take());
                }
            }
        }
    }
}

impl<V> Drop for Get<V> {
    fn drop(&mut self) {
        // A dropped Get may have been the driving future of its window, so
        // another one has to be woken to take over. WakerSet handles that.
        if let (Some(waker_token), Resolution::Pending { state, .. }) =
            (self.waker_token.take(), &self.handle.resolution)
        {
            match *state.lock() {
                State::Accum(ref mut window) => window.wakers.discard_and_wake(waker_token),
                State::Running(ref mut running) => running.wakers.discard_and_wake(waker_token),
                State::Done(..) => {}
            }
        }
    }
}

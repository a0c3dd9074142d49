use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared batch. Only a single task needs to actually do the work
/// of driving the batch to completion, but other tasks can take its place if
/// that one is dropped.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token is held by a `Get` future and is used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
///
/// The WakerSet maintains the notion of the "driving waker"; this is the
/// waker that most recently polled the shared batch. If the driving waker is
/// discarded from the set, another is selected as the driving waker and woken.
/// So long as futures take care to discard their stored tokens when dropped,
/// the shared batch always has a "path forward".
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Tokens are an ever-increasing integer. WakerSets live for one window,
    // so there's no chance of running out of these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
            driving_waker: None,
        }
    }
}

impl WakerSet {
    /// Record `waker` as the driving waker. If `slot` already holds a token
    /// from this set, that entry is updated in place; otherwise a new entry
    /// is created and its token is stored in `slot`.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        match slot {
            Some(token) if self.wakers.contains_key(token) => self.replace_waker(*token, waker),
            _ => *slot = Some(self.add_waker(waker.clone())),
        }
    }

    /// Add a new waker to this set and make it the driving waker.
    #[must_use]
    fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token, waker);
        self.driving_waker = Some(token);
        token
    }

    /// Set a waker with an existing token in this set, and make it the
    /// driving waker. The waker is set with clone_from because it comes from
    /// a Context and would need to be cloned anyway.
    fn replace_waker(&mut self, token: Token, waker: &Waker) {
        if let Some(existing) = self.wakers.get_mut(&token) {
            if !existing.will_wake(waker) {
                existing.clone_from(waker);
            }
            self.driving_waker = Some(token);
        }
    }

    /// Discard a waker from this set. If that waker was the current driving
    /// waker (or there is currently no driving waker), an arbitrary waker is
    /// made the current driving waker and awoken.
    ///
    /// A new driving waker is chosen immediately because if a series of drops
    /// happen at the same time at least one non-dropped waker must be awoken.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker == Some(token) || self.driving_waker.is_none() {
            match self.wakers.iter().next() {
                None => self.driving_waker = None,
                Some((&token, waker)) => {
                    self.driving_waker = Some(token);
                    waker.wake_by_ref();
                }
            }
        }
    }

    /// Wake only the driving waker, so that it can push the batch forward.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self.driving_waker.and_then(|token| self.wakers.get(&token)) {
            waker.wake_by_ref();
        }
    }

    /// Wake every waker in the set except the one associated with `token`,
    /// which belongs to the future that is finishing the batch right now.
    pub(crate) fn discard_wake_all(mut self, token: Option<Token>) {
        if let Some(token) = token {
            self.wakers.remove(&token);
        }
        self.wake_all();
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}

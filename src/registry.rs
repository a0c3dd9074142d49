//! Relation catalogs, and the per-pass registries created from them.

use std::{
    any::{self, Any},
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    batch::{BoxBatcher, Loader},
    config::BatchRules,
    data::{KeySet, ValueSet},
    error::{ConfigurationError, Error, FetchError},
    key::{is_valid_relation_name, Id, Key},
};

static NEXT_PASS_ID: AtomicU64 = AtomicU64::new(1);

/// One top-level resolution pass. Every loader created for a pass shares its
/// cancellation state.
#[derive(Debug, Clone)]
pub struct Pass {
    id: u64,
    cancel: CancellationToken,
}

impl Pass {
    pub fn new() -> Self {
        Self {
            id: NEXT_PASS_ID.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Abort this pass. Windows that were already dispatched run to
    /// completion; open windows resolve to [`Error::RequestCancelled`], and
    /// no new windows are opened.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(pass = self.id, "pass cancelled");
        }
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast with [`Error::RequestCancelled`] if this pass was cancelled.
    pub fn check(&self) -> Result<(), Error> {
        match self.is_cancelled() {
            true => Err(Error::RequestCancelled),
            false => Ok(()),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for Pass {
    fn default() -> Self {
        Self::new()
    }
}

type ErasedLoader = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(BatchRules, &Pass) -> ErasedLoader + Send + Sync>;

/// The set of known relations, each bound to its batch function. A catalog is
/// built once, shared by every request, and never holds any loaded data; call
/// [`create`][Catalog::create] at the start of each pass to get a fresh
/// [`Registry`].
#[derive(Clone, Default)]
pub struct Catalog {
    rules: BatchRules,
    factories: HashMap<&'static str, Factory>,
}

impl Debug for Catalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut relations: Vec<&str> = self.factories.keys().copied().collect();
        relations.sort_unstable();

        f.debug_struct("Catalog")
            .field("rules", &self.rules)
            .field("relations", &relations)
            .finish()
    }
}

impl Catalog {
    pub fn new(rules: BatchRules) -> Self {
        Self {
            rules,
            factories: HashMap::new(),
        }
    }

    #[inline]
    pub fn rules(&self) -> BatchRules {
        self.rules
    }

    /// The names of every relation in this catalog, sorted.
    pub fn relations(&self) -> Vec<&'static str> {
        let mut relations: Vec<&'static str> = self.factories.keys().copied().collect();
        relations.sort_unstable();
        relations
    }

    fn insert<V: Clone + Send + Sync + 'static>(
        mut self,
        name: &'static str,
        batcher: BoxBatcher<V>,
    ) -> Result<Self, ConfigurationError> {
        if !is_valid_relation_name(name) {
            return Err(ConfigurationError::InvalidRelationName {
                name: name.to_owned(),
            });
        }

        if self.factories.contains_key(name) {
            return Err(ConfigurationError::DuplicateRelation {
                name: name.to_owned(),
            });
        }

        let factory: Factory = Arc::new(move |rules: BatchRules, pass: &Pass| -> ErasedLoader {
            Arc::new(Loader::from_boxed(name, rules, pass.clone(), batcher.clone()))
        });

        self.factories.insert(name, factory);
        Ok(self)
    }

    /// Register a relation with a raw batch function, which receives the
    /// deduplicated key set of a window and must produce a value for every
    /// key in it.
    pub fn relation<V, F, Fut>(self, name: &'static str, batcher: F) -> Result<Self, ConfigurationError>
    where
        V: Clone + Send + Sync + 'static,
        F: Fn(KeySet<Key>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueSet<V>, FetchError>> + Send + 'static,
    {
        self.insert(name, Arc::new(move |keys| batcher(keys).boxed()))
    }

    /// Register a one-to-one relation. `fetch` receives the distinct ids of a
    /// window and returns the matching rows; `id_of` extracts a row's id.
    /// Ids with no matching row resolve to `None`.
    pub fn one_to_one<R, F, Fut, K>(
        self,
        name: &'static str,
        fetch: F,
        id_of: K,
    ) -> Result<Self, ConfigurationError>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(Vec<Id>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, FetchError>> + Send + 'static,
        K: Fn(&R) -> Id + Send + Sync + 'static,
    {
        let id_of = Arc::new(id_of);

        self.relation(name, move |keys: KeySet<Key>| {
            let rows = fetch(keys.ids().cloned().collect());
            let id_of = id_of.clone();
            async move {
                let rows = rows.await?;
                Ok::<_, FetchError>(keys.into_one_to_one(rows, &*id_of))
            }
        })
    }

    /// Register a one-to-many relation. `fetch` receives the distinct ids of a
    /// window and returns every matching row; `id_of` extracts the join key
    /// that rows are grouped by. Ids with no matching rows resolve to an
    /// empty list.
    pub fn one_to_many<R, F, Fut, K>(
        self,
        name: &'static str,
        fetch: F,
        id_of: K,
    ) -> Result<Self, ConfigurationError>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(Vec<Id>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, FetchError>> + Send + 'static,
        K: Fn(&R) -> Id + Send + Sync + 'static,
    {
        let id_of = Arc::new(id_of);

        self.relation(name, move |keys: KeySet<Key>| {
            let rows = fetch(keys.ids().cloned().collect());
            let id_of = id_of.clone();
            async move {
                let rows = rows.await?;
                Ok::<_, FetchError>(keys.into_one_to_many(rows, &*id_of))
            }
        })
    }

    /// Build a fresh registry, with one empty loader per relation, for a new
    /// pass.
    pub fn create(&self) -> Registry {
        self.create_for(Pass::new())
    }

    /// Build a fresh registry for an existing pass, for callers that need the
    /// pass handle (to cancel it) before the registry exists.
    pub fn create_for(&self, pass: Pass) -> Registry {
        let loaders = self
            .factories
            .iter()
            .map(|(&name, factory)| (name, factory(self.rules, &pass)))
            .collect();

        info!(pass = pass.id(), relations = self.factories.len(), "loader registry created");

        Registry { pass, loaders }
    }
}

/// The loaders of a single pass. A registry must not outlive its pass or be
/// shared between passes: every loader it holds caches what it loads, and
/// that cache is dropped with the registry.
pub struct Registry {
    pass: Pass,
    loaders: HashMap<&'static str, ErasedLoader>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut relations: Vec<&str> = self.loaders.keys().copied().collect();
        relations.sort_unstable();

        f.debug_struct("Registry")
            .field("pass", &self.pass.id())
            .field("relations", &relations)
            .finish()
    }
}

impl Registry {
    #[inline]
    pub fn pass(&self) -> &Pass {
        &self.pass
    }

    /// Look up the loader for `name`. Fails if there is no such relation, or
    /// if it doesn't produce values of type `V`.
    pub fn get<V: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<Loader<V>>, ConfigurationError> {
        let loader = self
            .loaders
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownRelation {
                name: name.to_owned(),
            })?;

        loader
            .clone()
            .downcast::<Loader<V>>()
            .map_err(|_| ConfigurationError::RelationType {
                name: name.to_owned(),
                expected: any::type_name::<V>(),
            })
    }
}

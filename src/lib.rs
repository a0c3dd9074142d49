//! coalesce-loader solves the N+1 fetch problem of graph-shaped query
//! resolution. Resolvers ask for entities one key at a time; a [`Loader`]
//! collects every key requested while its window is open, deduplicates them,
//! and calls its batch function exactly once for the whole window. Each
//! requester gets back a [`Deferred`] handle that resolves to the value for
//! its own key.
//!
//! ## Overview
//!
//! Relations are declared once, in a [`Catalog`]. A relation is a name plus a
//! batch function. The common shapes have helpers: a one-to-one relation
//! pairs each id with at most one row, and a one-to-many relation groups rows
//! by a join key.
//!
//! ```
//! use coalesce_loader::{BatchRules, Catalog, FetchError, Id};
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! let catalog = Catalog::new(BatchRules::default())
//!     .one_to_one(
//!         "user",
//!         |ids: Vec<Id>| async move {
//!             let users: Vec<User> = ids
//!                 .iter()
//!                 .filter_map(Id::as_int)
//!                 .filter(|&id| id < 100)
//!                 .map(|id| User { id, name: format!("user {}", id) })
//!                 .collect();
//!             Ok::<_, FetchError>(users)
//!         },
//!         |user: &User| Id::from(user.id),
//!     )
//!     .unwrap();
//! ```
//!
//! At the start of every request, [`Catalog::create`] builds a [`Registry`]
//! with one empty loader per relation. Loaders cache what they fetch, so a
//! registry must never be shared between requests.
//!
//! ```
//! # use coalesce_loader::{BatchRules, Catalog, FetchError, Id};
//! # use futures::{executor::block_on, future::join};
//! # #[derive(Debug, Clone)] struct User { id: i64, name: String }
//! # let catalog = Catalog::new(BatchRules::default())
//! #     .one_to_one(
//! #         "user",
//! #         |ids: Vec<Id>| async move {
//! #             let users: Vec<User> = ids.iter().filter_map(Id::as_int).filter(|&id| id < 100)
//! #                 .map(|id| User { id, name: format!("user {}", id) }).collect();
//! #             Ok::<_, FetchError>(users)
//! #         },
//! #         |user: &User| Id::from(user.id),
//! #     )
//! #     .unwrap();
//! let registry = catalog.create();
//! let users = registry.get::<Option<User>>("user").unwrap();
//!
//! // Neither call blocks, and neither fetches anything yet.
//! let alice = users.load(1);
//! let nobody = users.load(404);
//!
//! let (alice, nobody) = block_on(join(alice.get(), nobody.get()));
//! assert_eq!(alice.unwrap().unwrap().name, "user 1");
//! assert!(nobody.unwrap().is_none());
//!
//! // Both keys went out in a single batch.
//! assert_eq!(users.dispatch_count(), 1);
//! ```
//!
//! A key with no backing row is not an error: it resolves to `None` for a
//! one-to-one relation and to an empty list for a one-to-many relation. A
//! failed batch fetch fails every handle in its window with the same
//! [`Error::BatchFetch`].
//!
//! ## Windows
//!
//! [`BatchRules`] decide when an open window closes:
//!
//! - [`Window::Tick`] (the default) closes the window once every handle in it
//!   has been polled and the first of them comes around again. Resolvers that
//!   run concurrently in one task, such as sibling fields joined with
//!   `join_all`, all get to add their keys first.
//! - [`Window::Delay`] closes the window a fixed time after it opened. Use it
//!   when resolvers run as separate tasks, possibly on other threads.
//! - `max_keys` dispatches a window as soon as it holds that many distinct
//!   keys. The next key opens a fresh window.
//!
//! ## Design notes
//!
//! ### Poll-driven design
//!
//! All of the asynchronous work is driven through polling [`Get`], the future
//! returned by [`Deferred::get`]. The batch function is not scheduled in any
//! runtime or run in the background; it is driven directly in the foreground
//! by one of the waiting futures. Only that future is woken while the batch
//! runs. The others are woken when the values are available, or when the
//! driving future is dropped and one of them has to take over.
//!
//! ### `KeySet` and `ValueSet`
//!
//! The batch function receives a [`KeySet`] of distinct keys and must return
//! a [`ValueSet`]. The only way to build a `ValueSet` is from its `KeySet`, so
//! a batch function can't return values for keys it wasn't asked about, and
//! every key gets exactly one value.
//!
//! ## Resolution
//!
//! The [`resolve`] module contains a small tree resolution driver: objects
//! implement [`Resolve`], and [`execute`] walks a [`Selection`] tree against
//! them, resolving sibling fields concurrently. The [`rides`] module is a
//! complete example domain built on it.

mod batch;
mod config;
mod data;
mod error;
mod key;
mod registry;
pub mod resolve;
pub mod rides;
mod wakerset;

pub use batch::{Deferred, Get, Loader};
pub use config::{BatchRules, Window, MAX_KEYS_VAR, WINDOW_VAR};
pub use data::{KeySet, ValueSet};
pub use error::{ConfigurationError, Error, FetchError};
pub use key::{Id, Key};
pub use registry::{Catalog, Pass, Registry};
pub use resolve::{execute, Context, FieldError, PathSegment, Resolve, Resolved, Response, Schema, Selection};

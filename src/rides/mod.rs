//! A small rides domain (drivers, customers and the rides between them) served
//! through coalescing loaders.

use std::sync::Arc;

use crate::{
    config::BatchRules,
    error::ConfigurationError,
    registry::{Catalog, Pass},
    resolve::{execute, Context, Response, Schema, Selection},
};

pub mod relations;
pub mod schema;
pub mod store;

pub use relations::catalog;
pub use schema::{schema, Customer, Driver, Mutation, Query, Ride};
pub use store::{Call, CustomerRow, DeepRideRow, DriverRow, NewRide, RideRow, Statement, Store, StoreError};

/// Everything needed to serve requests: the store, the relation catalog and
/// the schema. Shared by every request; each request gets its own registry.
#[derive(Debug, Clone)]
pub struct Rides {
    store: Arc<Store>,
    catalog: Catalog,
    schema: Arc<Schema>,
}

impl Rides {
    pub fn new(store: Arc<Store>, rules: BatchRules) -> Result<Self, ConfigurationError> {
        Ok(Self {
            catalog: catalog(store.clone(), rules)?,
            schema: Arc::new(schema()),
            store,
        })
    }

    #[inline]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[inline]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// A fresh context for a new pass.
    pub fn context(&self) -> Context {
        self.context_for(Pass::new())
    }

    pub fn context_for(&self, pass: Pass) -> Context {
        Context::new(self.catalog.create_for(pass), self.schema.clone())
    }

    pub async fn query(&self, selections: &[Selection]) -> Response {
        execute(&self.context(), &Query, selections).await
    }

    pub async fn mutate(&self, selections: &[Selection]) -> Response {
        execute(&self.context(), &Mutation::new(self.store.clone()), selections).await
    }
}

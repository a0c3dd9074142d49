//! The relations of the rides domain, each bound to the store statement that
//! fetches it.

use std::sync::Arc;

use futures::future;

use crate::{
    config::BatchRules,
    error::{ConfigurationError, FetchError},
    key::Id,
    registry::Catalog,
};

use super::store::{CustomerRow, DeepRideRow, DriverRow, RideRow, Store, StoreError};

pub const DRIVER: &str = "driver";
pub const CUSTOMER: &str = "customer";
pub const RIDE: &str = "ride";
pub const RIDES_BY_DRIVER_ID: &str = "rides_by_driver_id";
pub const RIDES_BY_CUSTOMER_ID: &str = "rides_by_customer_id";
pub const DEEP_RIDES_BY_CUSTOMER_ID: &str = "deep_rides_by_customer_id";

type Select<R> = fn(&Store, &[i64]) -> Result<Vec<R>, StoreError>;

/// Adapt a store select to a batch fetch. Every id in this domain is an
/// integer; string ids can never match a row, so they are left out of the
/// query, and a window with no integer ids doesn't reach the store at all.
fn select<R: Send + 'static>(
    store: &Arc<Store>,
    statement: Select<R>,
) -> impl Fn(Vec<Id>) -> future::Ready<Result<Vec<R>, FetchError>> + Send + Sync + 'static {
    let store = store.clone();

    move |ids| {
        let ids: Vec<i64> = ids.iter().filter_map(Id::as_int).collect();

        future::ready(match ids.is_empty() {
            true => Ok(Vec::new()),
            false => statement(&store, &ids).map_err(FetchError::new),
        })
    }
}

/// Build the catalog of every relation in the rides domain.
pub fn catalog(store: Arc<Store>, rules: BatchRules) -> Result<Catalog, ConfigurationError> {
    Catalog::new(rules)
        .one_to_one(
            DRIVER,
            select(&store, Store::drivers_by_ids),
            |row: &DriverRow| Id::from(row.driver_id),
        )?
        .one_to_one(
            CUSTOMER,
            select(&store, Store::customers_by_ids),
            |row: &CustomerRow| Id::from(row.customer_id),
        )?
        .one_to_one(
            RIDE,
            select(&store, Store::rides_by_ids),
            |row: &RideRow| Id::from(row.ride_id),
        )?
        .one_to_many(
            RIDES_BY_DRIVER_ID,
            select(&store, Store::rides_by_driver_ids),
            |row: &RideRow| Id::from(row.driver_id),
        )?
        .one_to_many(
            RIDES_BY_CUSTOMER_ID,
            select(&store, Store::rides_by_customer_ids),
            |row: &RideRow| Id::from(row.customer_id),
        )?
        .one_to_many(
            DEEP_RIDES_BY_CUSTOMER_ID,
            select(&store, Store::deep_rides_by_customer_ids),
            |row: &DeepRideRow| Id::from(row.ride.customer_id),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rides::store::Statement;
    use futures::executor;

    #[test]
    fn catalog_has_every_relation() {
        let catalog = catalog(Arc::new(Store::seeded()), BatchRules::default()).unwrap();

        assert_eq!(
            catalog.relations(),
            [
                CUSTOMER,
                DEEP_RIDES_BY_CUSTOMER_ID,
                DRIVER,
                RIDE,
                RIDES_BY_CUSTOMER_ID,
                RIDES_BY_DRIVER_ID,
            ]
        );
    }

    #[test]
    fn string_ids_never_reach_the_store() {
        let store = Arc::new(Store::seeded());
        let registry = catalog(store.clone(), BatchRules::default()).unwrap().create();
        let drivers = registry.get::<Option<DriverRow>>(DRIVER).unwrap();

        let driver = executor::block_on(drivers.load("1").get()).unwrap();

        assert_eq!(driver, None);
        assert_eq!(store.call_count(Statement::DriversById), 0);
    }
}

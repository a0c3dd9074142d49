//! An in-memory backing store for the rides domain. Every select takes a list
//! of ids, the way an `IN (...)` query would, and every statement it serves is
//! recorded so that callers can check how many round trips a pass made.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display, Formatter},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRow {
    pub driver_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRow {
    pub customer_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideRow {
    pub ride_id: i64,
    pub driver_id: i64,
    pub customer_id: i64,
    pub destination: String,
}

/// A ride joined with the name of its driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepRideRow {
    pub ride: RideRow,
    pub driver_name: String,
}

impl DeepRideRow {
    pub fn driver(&self) -> DriverRow {
        DriverRow {
            driver_id: self.ride.driver_id,
            name: self.driver_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRide {
    pub customer_id: i64,
    pub driver_id: i64,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    DriversById,
    CustomersById,
    RidesById,
    RidesByDriverId,
    RidesByCustomerId,
    DeepRidesByCustomerId,
    InsertRide,
}

impl Statement {
    pub fn sql(&self) -> &'static str {
        match self {
            Statement::DriversById => "SELECT * FROM driver WHERE driver_id IN (..)",
            Statement::CustomersById => "SELECT * FROM customer WHERE customer_id IN (..)",
            Statement::RidesById => "SELECT * FROM ride WHERE ride_id IN (..)",
            Statement::RidesByDriverId => "SELECT * FROM ride WHERE driver_id IN (..)",
            Statement::RidesByCustomerId => "SELECT * FROM ride WHERE customer_id IN (..)",
            Statement::DeepRidesByCustomerId => {
                "SELECT ride.*, driver.name FROM ride JOIN driver USING (driver_id) WHERE customer_id IN (..)"
            }
            Statement::InsertRide => "INSERT INTO ride (customer_id, driver_id, destination) VALUES (..)",
        }
    }
}

impl Display for Statement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{statement}: empty id list")]
    EmptyIdList { statement: Statement },

    #[error("{statement}: {reason}")]
    Unavailable { statement: Statement, reason: String },

    #[error("no {table} with id {id}")]
    MissingReference { table: &'static str, id: i64 },

    #[error("{table} ids are exhausted")]
    IdsExhausted { table: &'static str },
}

#[derive(Debug, Default)]
struct Tables {
    drivers: BTreeMap<i64, DriverRow>,
    customers: BTreeMap<i64, CustomerRow>,
    rides: BTreeMap<i64, RideRow>,
}

/// A statement the store has served, with the ids it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub statement: Statement,
    pub ids: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<HashMap<Statement, String>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small fixed dataset: three drivers, three customers and six rides.
    pub fn seeded() -> Self {
        let store = Self::new();

        for (id, name) in [(1, "Ayrton"), (2, "Niki"), (3, "Jackie")] {
            store.add_driver(id, name);
        }

        for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Edsger")] {
            store.add_customer(id, name);
        }

        for (id, driver_id, customer_id, destination) in [
            (1, 1, 1, "Airport"),
            (2, 2, 1, "Harbour"),
            (3, 1, 1, "Museum"),
            (4, 3, 2, "Stadium"),
            (5, 2, 2, "Airport"),
            (6, 1, 3, "Library"),
        ] {
            store.add_ride(RideRow {
                ride_id: id,
                driver_id,
                customer_id,
                destination: destination.to_owned(),
            });
        }

        store
    }

    pub fn add_driver(&self, driver_id: i64, name: &str) {
        self.tables.write().drivers.insert(
            driver_id,
            DriverRow {
                driver_id,
                name: name.to_owned(),
            },
        );
    }

    pub fn add_customer(&self, customer_id: i64, name: &str) {
        self.tables.write().customers.insert(
            customer_id,
            CustomerRow {
                customer_id,
                name: name.to_owned(),
            },
        );
    }

    /// Insert a ride with a known id. Unlike [`insert_ride`][Store::insert_ride],
    /// this isn't recorded as a statement and doesn't check references.
    pub fn add_ride(&self, row: RideRow) {
        self.tables.write().rides.insert(row.ride_id, row);
    }

    /// Make the next call of `statement` fail with `reason`.
    pub fn fail_next(&self, statement: Statement, reason: impl Into<String>) {
        self.faults.lock().insert(statement, reason.into());
    }

    /// Every statement served so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// The id lists of every call of `statement`, in order.
    pub fn calls_of(&self, statement: Statement) -> Vec<Vec<i64>> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.statement == statement)
            .map(|call| call.ids.clone())
            .collect()
    }

    pub fn call_count(&self, statement: Statement) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.statement == statement)
            .count()
    }

    fn begin(&self, statement: Statement, ids: &[i64]) -> Result<(), StoreError> {
        if let Some(reason) = self.faults.lock().remove(&statement) {
            debug!(%statement, %reason, "injected failure");
            return Err(StoreError::Unavailable { statement, reason });
        }

        if ids.is_empty() && statement != Statement::InsertRide {
            return Err(StoreError::EmptyIdList { statement });
        }

        debug!(%statement, ?ids, sql = statement.sql(), "executing statement");

        self.calls.lock().push(Call {
            statement,
            ids: ids.to_vec(),
        });

        Ok(())
    }

    pub fn drivers_by_ids(&self, ids: &[i64]) -> Result<Vec<DriverRow>, StoreError> {
        self.begin(Statement::DriversById, ids)?;
        let tables = self.tables.read();

        Ok(ids
            .iter()
            .filter_map(|id| tables.drivers.get(id).cloned())
            .collect())
    }

    pub fn customers_by_ids(&self, ids: &[i64]) -> Result<Vec<CustomerRow>, StoreError> {
        self.begin(Statement::CustomersById, ids)?;
        let tables = self.tables.read();

        Ok(ids
            .iter()
            .filter_map(|id| tables.customers.get(id).cloned())
            .collect())
    }

    pub fn rides_by_ids(&self, ids: &[i64]) -> Result<Vec<RideRow>, StoreError> {
        self.begin(Statement::RidesById, ids)?;
        let tables = self.tables.read();

        Ok(ids
            .iter()
            .filter_map(|id| tables.rides.get(id).cloned())
            .collect())
    }

    pub fn rides_by_driver_ids(&self, ids: &[i64]) -> Result<Vec<RideRow>, StoreError> {
        self.begin(Statement::RidesByDriverId, ids)?;
        let tables = self.tables.read();

        Ok(tables
            .rides
            .values()
            .filter(|ride| ids.contains(&ride.driver_id))
            .cloned()
            .collect())
    }

    pub fn rides_by_customer_ids(&self, ids: &[i64]) -> Result<Vec<RideRow>, StoreError> {
        self.begin(Statement::RidesByCustomerId, ids)?;
        let tables = self.tables.read();

        Ok(tables
            .rides
            .values()
            .filter(|ride| ids.contains(&ride.customer_id))
            .cloned()
            .collect())
    }

    pub fn deep_rides_by_customer_ids(&self, ids: &[i64]) -> Result<Vec<DeepRideRow>, StoreError> {
        self.begin(Statement::DeepRidesByCustomerId, ids)?;
        let tables = self.tables.read();

        Ok(tables
            .rides
            .values()
            .filter(|ride| ids.contains(&ride.customer_id))
            .filter_map(|ride| {
                // Inner join: rides whose driver is gone are dropped.
                let driver = tables.drivers.get(&ride.driver_id)?;
                Some(DeepRideRow {
                    ride: ride.clone(),
                    driver_name: driver.name.clone(),
                })
            })
            .collect())
    }

    /// Insert a new ride, assigning it the next free id.
    pub fn insert_ride(&self, ride: NewRide) -> Result<RideRow, StoreError> {
        self.begin(Statement::InsertRide, &[])?;
        let mut tables = self.tables.write();

        if !tables.customers.contains_key(&ride.customer_id) {
            return Err(StoreError::MissingReference {
                table: "customer",
                id: ride.customer_id,
            });
        }

        if !tables.drivers.contains_key(&ride.driver_id) {
            return Err(StoreError::MissingReference {
                table: "driver",
                id: ride.driver_id,
            });
        }

        let ride_id = match tables.rides.keys().next_back() {
            None => 1,
            Some(id) => id
                .checked_add(1)
                .ok_or(StoreError::IdsExhausted { table: "ride" })?,
        };
        let row = RideRow {
            ride_id,
            driver_id: ride.driver_id,
            customer_id: ride.customer_id,
            destination: ride.destination,
        };

        tables.rides.insert(ride_id, row.clone());
        Ok(row)
    }
}

//! The object types of the rides domain, and the query and mutation roots.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{Error, FetchError},
    resolve::{Context, Resolve, Resolved, Schema, Selection},
};

use super::{
    relations::{CUSTOMER, DEEP_RIDES_BY_CUSTOMER_ID, DRIVER, RIDE, RIDES_BY_CUSTOMER_ID, RIDES_BY_DRIVER_ID},
    store::{CustomerRow, DeepRideRow, DriverRow, NewRide, RideRow, Store, StoreError},
};

pub fn schema() -> Schema {
    Schema::new()
        .object("Query", &["ride", "rides", "customer", "driver"])
        .object("Mutation", &["add_ride"])
        .object("Driver", &["id", "name", "rides"])
        .object("Customer", &["id", "name", "rides", "deep_rides"])
        .object("Ride", &["id", "driver", "customer", "destination"])
}

fn unknown_field(type_name: &'static str, field: &Selection) -> Error {
    Error::UnknownField {
        type_name,
        field: field.name().to_owned(),
    }
}

/// A driver. The name is filled in up front when the driver was reached
/// through a join; otherwise it is loaded on demand.
#[derive(Debug, Clone)]
pub struct Driver {
    id: i64,
    name: Option<String>,
}

impl Driver {
    pub fn by_id(id: i64) -> Self {
        Self { id, name: None }
    }
}

impl From<DriverRow> for Driver {
    fn from(row: DriverRow) -> Self {
        Self {
            id: row.driver_id,
            name: Some(row.name),
        }
    }
}

#[async_trait]
impl Resolve for Driver {
    fn type_name(&self) -> &'static str {
        "Driver"
    }

    async fn resolve(&self, ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
        match field.name() {
            "id" => Ok(Resolved::value(self.id)),
            "name" => match self.name {
                Some(ref name) => Ok(Resolved::value(name.as_str())),
                None => {
                    let row = ctx.loader::<Option<DriverRow>>(DRIVER)?.load(self.id).await?;
                    Ok(row.map_or(Resolved::Null, |row| Resolved::value(row.name)))
                }
            },
            "rides" => {
                let rides = ctx.loader::<Vec<RideRow>>(RIDES_BY_DRIVER_ID)?.load(self.id).await?;
                Ok(Resolved::list(rides.into_iter().map(Ride::from)))
            }
            _ => Err(unknown_field("Driver", field)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Customer {
    id: i64,
    name: Option<String>,
}

impl Customer {
    pub fn by_id(id: i64) -> Self {
        Self { id, name: None }
    }
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Self {
            id: row.customer_id,
            name: Some(row.name),
        }
    }
}

#[async_trait]
impl Resolve for Customer {
    fn type_name(&self) -> &'static str {
        "Customer"
    }

    async fn resolve(&self, ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
        match field.name() {
            "id" => Ok(Resolved::value(self.id)),
            "name" => match self.name {
                Some(ref name) => Ok(Resolved::value(name.as_str())),
                None => {
                    let row = ctx.loader::<Option<CustomerRow>>(CUSTOMER)?.load(self.id).await?;
                    Ok(row.map_or(Resolved::Null, |row| Resolved::value(row.name)))
                }
            },
            "rides" => {
                let rides = ctx.loader::<Vec<RideRow>>(RIDES_BY_CUSTOMER_ID)?.load(self.id).await?;
                Ok(Resolved::list(rides.into_iter().map(Ride::from)))
            }
            "deep_rides" => {
                let rows = ctx
                    .loader::<Vec<DeepRideRow>>(DEEP_RIDES_BY_CUSTOMER_ID)?
                    .load(self.id)
                    .await?;

                // The join already fetched every driver's name; seed the
                // driver loader so other fields in this pass reuse it.
                let drivers = ctx.loader::<Option<DriverRow>>(DRIVER)?;
                for row in &rows {
                    drivers.prime(row.ride.driver_id, Some(row.driver()));
                }

                Ok(Resolved::list(rows.into_iter().map(Ride::from)))
            }
            _ => Err(unknown_field("Customer", field)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ride {
    row: RideRow,
    driver_name: Option<String>,
}

impl From<RideRow> for Ride {
    fn from(row: RideRow) -> Self {
        Self {
            row,
            driver_name: None,
        }
    }
}

impl From<DeepRideRow> for Ride {
    fn from(row: DeepRideRow) -> Self {
        Self {
            row: row.ride,
            driver_name: Some(row.driver_name),
        }
    }
}

#[async_trait]
impl Resolve for Ride {
    fn type_name(&self) -> &'static str {
        "Ride"
    }

    async fn resolve(&self, _ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
        match field.name() {
            "id" => Ok(Resolved::value(self.row.ride_id)),
            "destination" => Ok(Resolved::value(self.row.destination.as_str())),
            "driver" => Ok(Resolved::object(Driver {
                id: self.row.driver_id,
                name: self.driver_name.clone(),
            })),
            "customer" => Ok(Resolved::object(Customer::by_id(self.row.customer_id))),
            _ => Err(unknown_field("Ride", field)),
        }
    }
}

/// The query root. Every lookup goes through a one-to-one loader, so an
/// unknown id resolves to `null` and nothing beneath it is resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct Query;

#[async_trait]
impl Resolve for Query {
    fn type_name(&self) -> &'static str {
        "Query"
    }

    async fn resolve(&self, ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
        match field.name() {
            "ride" => {
                let id: i64 = field.parse_arg("id")?;
                let row = ctx.loader::<Option<RideRow>>(RIDE)?.load(id).await?;
                Ok(Resolved::optional(row.map(Ride::from)))
            }
            "rides" => {
                let ids: Vec<i64> = field.parse_arg("ids")?;
                let rows = ctx.loader::<Option<RideRow>>(RIDE)?.load_all(ids).await?;

                Ok(Resolved::List(
                    rows.into_iter()
                        .map(|row| Resolved::optional(row.map(Ride::from)))
                        .collect(),
                ))
            }
            "customer" => {
                let id: i64 = field.parse_arg("id")?;
                let row = ctx.loader::<Option<CustomerRow>>(CUSTOMER)?.load(id).await?;
                Ok(Resolved::optional(row.map(Customer::from)))
            }
            "driver" => {
                let id: i64 = field.parse_arg("id")?;
                let row = ctx.loader::<Option<DriverRow>>(DRIVER)?.load(id).await?;
                Ok(Resolved::optional(row.map(Driver::from)))
            }
            _ => Err(unknown_field("Query", field)),
        }
    }
}

/// The mutation root.
#[derive(Debug, Clone)]
pub struct Mutation {
    store: Arc<Store>,
}

impl Mutation {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Resolve for Mutation {
    fn type_name(&self) -> &'static str {
        "Mutation"
    }

    async fn resolve(&self, ctx: &Context, field: &Selection) -> Result<Resolved, Error> {
        match field.name() {
            "add_ride" => {
                let ride = NewRide {
                    customer_id: field.parse_arg("customer_id")?,
                    driver_id: field.parse_arg("driver_id")?,
                    destination: field.parse_arg("destination")?,
                };

                let row = self.store.insert_ride(ride).map_err(|err| match err {
                    StoreError::MissingReference { .. } => Error::InvalidArgument {
                        field: field.name().to_owned(),
                        reason: err.to_string(),
                    },
                    _ => Error::Upstream {
                        field: field.name().to_owned(),
                        source: FetchError::new(err),
                    },
                })?;

                ctx.loader::<Option<RideRow>>(RIDE)?.prime(row.ride_id, Some(row.clone()));
                Ok(Resolved::object(Ride::from(row)))
            }
            _ => Err(unknown_field("Mutation", field)),
        }
    }
}

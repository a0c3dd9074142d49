use std::sync::Arc;

use anyhow::Context as _;
use coalesce_loader::{
    rides::{Rides, Statement, Store},
    BatchRules, Response, Selection,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print(title: &str, response: &Response) -> anyhow::Result<()> {
    println!("# {}", title);
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,coalesce_loader=debug")),
        )
        .init();

    let rules = BatchRules::from_env().context("invalid batching configuration")?;
    info!(window = %rules.window, max_keys = ?rules.max_keys, "starting");

    let store = Arc::new(Store::seeded());
    let rides = Rides::new(store.clone(), rules)?;

    let response = rides
        .query(&[Selection::field("customer").arg("id", 1).select([
            Selection::field("name"),
            Selection::field("rides").select([
                Selection::field("destination"),
                Selection::field("driver").select([Selection::field("name")]),
            ]),
        ])])
        .await;
    print("rides of one customer, with their drivers", &response)?;

    let response = rides
        .query(&[Selection::field("rides").arg("ids", vec![1, 4, 99]).select([
            Selection::field("id"),
            Selection::field("customer").select([Selection::field("name")]),
        ])])
        .await;
    print("several rides by id", &response)?;

    let response = rides
        .query(&[Selection::field("customer").arg("id", 2).select([Selection::field("deep_rides").select([
            Selection::field("destination"),
            Selection::field("driver").select([Selection::field("name")]),
        ])])])
        .await;
    print("joined rides, without a driver lookup", &response)?;

    let response = rides
        .mutate(&[Selection::field("add_ride")
            .arg("customer_id", 3)
            .arg("driver_id", 2)
            .arg("destination", "Park")
            .select([
                Selection::field("id"),
                Selection::field("driver").select([Selection::field("name")]),
            ])])
        .await;
    print("new ride", &response)?;

    for call in store.calls() {
        let ids = match call.statement {
            Statement::InsertRide => String::new(),
            _ => format!("{:?}", call.ids),
        };
        println!("{} {}", call.statement.sql(), ids);
    }

    Ok(())
}

// `main.rs` only declares modules and delegates to `server::run()`. The
// pipeline lives in `mqtt` (broker wrapper), `handlers` (decode and persist),
// `db` (storage) and `server` (wiring and process lifetime).
mod config;
mod db;
mod handlers;
mod logger;
mod metrics;
mod mqtt;
mod reading;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::run().await
}

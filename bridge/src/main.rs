mod api;
mod bus;
mod host;
mod reconcile;
mod store;
mod token;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

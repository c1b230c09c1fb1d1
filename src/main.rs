#[tokio::main]
async fn main() -> anyhow::Result<()> {
    memento_sync_lib::run().await
}

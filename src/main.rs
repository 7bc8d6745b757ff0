#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcphub::run().await
}

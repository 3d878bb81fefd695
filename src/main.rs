#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peerchat::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vidfetch_lib::run().await
}

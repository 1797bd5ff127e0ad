use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    numerous_apps::run().await
}

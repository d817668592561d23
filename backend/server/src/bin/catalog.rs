#[tokio::main]
async fn main() -> anyhow::Result<()> {
    activities::start_catalog_server().await
}

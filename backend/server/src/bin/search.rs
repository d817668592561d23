#[tokio::main]
async fn main() -> anyhow::Result<()> {
    activities::start_search_server().await
}

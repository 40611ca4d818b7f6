#[tokio::main]
async fn main() -> anyhow::Result<()> {
    workermaster::wm::ctl::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coach_ledger_lib::run().await
}

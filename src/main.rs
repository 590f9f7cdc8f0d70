use anyhow::Result;
use answer_batch_runner::{logger, App, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志
    logger::init(config.verbose_logging);

    // 初始化并运行应用
    let app = App::initialize(config).await?;
    tokio::select! {
        result = app.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号");
            app.shutdown().await;
        }
    }

    Ok(())
}

//! 同步演示：启动恢复、拉取增量、应用并保存快照
//!
//! 用法：CASELY_API_URL=http://localhost:8080 cargo run --example sync_demo

use std::time::Duration;

use casely_sdk::{CaselyConfig, CaselySDK, LoadOutcome};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();
    info!("{}", casely_sdk::version_line());

    let api_base_url =
        std::env::var("CASELY_API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let data_dir = std::env::temp_dir().join("casely-demo");
    let config = CaselyConfig::builder()
        .data_dir(&data_dir)
        .api_base_url(api_base_url)
        .debug_mode(true)
        .build();

    let sdk = CaselySDK::initialize(config).await?;
    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("📣 事件: {} {:?}", event.event_type(), event);
        }
    });

    sdk.bootstrap().await;
    let state = sdk.state();
    info!(
        "恢复完成: {} 个合同, {} 个标签, 快照 {:?}",
        state.contracts.count(),
        state.labels.count(),
        state.current_snapshot
    );

    match sdk.load_changes(Some(false)).await {
        LoadOutcome::Loaded { pending_contracts, pending_labels, .. } => {
            info!("新数据: {} 个合同, {} 个标签，全部应用", pending_contracts, pending_labels);
            sdk.apply_pending(None).wait().await;
        }
        other => info!("拉取结果: {:?}", other),
    }

    let state = sdk.state();
    info!(
        "当前: {} 个合同, {} 个标签, 游标 {}/{}",
        state.contracts.count(),
        state.labels.count(),
        state.contracts.last_updated(),
        state.labels.last_updated()
    );

    // 轮询几秒钟观察效果
    sdk.start_polling()?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    sdk.shutdown().await?;
    Ok(())
}

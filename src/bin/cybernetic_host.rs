//! Cybernetic Host 主程序 - 配置驱动运行
//!
//! 加载宿主配置，注册示例插件，批量激活后输出状态并关闭

use cybernetic_host::{
    config::{generate_default_config_file, ConfigManager},
    demo::{BrokenPlugin, TelemetryPlugin},
    init_logging, ActivationConfig, HostConfig, InitOptions, PluginHost, PluginSelection, Result,
};
use std::env;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "cybernetic_host.yaml";

/// 程序入口点
#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        eprintln!("cybernetic_host failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => {
            let path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);
            generate_default_config_file(path).await?;
            println!("Default configuration written to {}", path);
            Ok(())
        }
        Some("run") => run(args.get(2).map(String::as_str)).await,
        None => run(None).await,
        Some(_) => {
            print_usage();
            Ok(())
        }
    }
}

async fn load_config(path: Option<&str>) -> Result<HostConfig> {
    let manager = match path {
        Some(path) => ConfigManager::load_from_file(path).await?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            ConfigManager::load_from_file(DEFAULT_CONFIG_PATH).await?
        }
        None => ConfigManager::new(HostConfig::new(num_cpus::get())),
    };
    manager.validate()?;
    Ok(manager.get_config().clone())
}

async fn run(path: Option<&str>) -> Result<()> {
    let config = load_config(path).await?;
    init_logging(&config.logging);

    let host = PluginHost::new(&config);
    let cancel = CancellationToken::new();
    let supervision = host.supervise(cancel.clone());

    let mut options = InitOptions::new();
    options.insert("flush_interval_ms".to_string(), serde_json::json!(100));
    host.register("telemetry", Box::new(TelemetryPlugin::new()), options)
        .await?;

    let registration = host
        .register(
            "broken",
            Box::new(BrokenPlugin::new("certificate store unavailable")),
            InitOptions::new(),
        )
        .await?;
    if let Some(e) = registration.init_error {
        tracing::warn!("plugin registered in failed state: {}", e);
    }

    let mut activation = ActivationConfig::new();
    activation.insert("endpoint".to_string(), serde_json::json!("local"));
    let report = host
        .activate(&PluginSelection::All, &activation, &cancel)
        .await;
    tracing::info!(
        completed = ?report.completed(),
        failed = ?report.failed(),
        "activation finished"
    );

    tokio::time::sleep(Duration::from_millis(350)).await;

    let status = host.status(true).await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    let report = host.shutdown(&activation).await;
    if !report.is_success() {
        tracing::warn!(failed = ?report.failed(), "some plugins failed to deactivate");
    }

    let failures = host.failures();
    if !failures.is_empty() {
        println!("{}", serde_json::to_string_pretty(&failures)?);
    }

    cancel.cancel();
    let _ = supervision.await;
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  cybernetic_host              run with ./{} or built-in defaults", DEFAULT_CONFIG_PATH);
    println!("  cybernetic_host run [path]   run with the given YAML/TOML config");
    println!("  cybernetic_host init [path]  write a default config file");
}

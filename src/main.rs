//! Chips Bundles 命令行入口
//!
//! 启动动态模块运行时、查看 bundle 与检查配置。
//!
//! # 命令概览
//!
//! - `start` - 启动框架，按 Ctrl+C 停止
//! - `list-bundles` - 启动框架、列出 bundle 后停止
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 使用自定义配置文件启动
//! chips-bundles -c runtime.yaml start
//!
//! # 以 JSON 输出 bundle 列表
//! chips-bundles list-bundles --json
//!
//! # 检查配置文件
//! chips-bundles check-config -c runtime.yaml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use chips_bundles::{CoreConfig, Framework, Logger, LoggerConfig, StateMask, StopStatus};

/// Chips Bundles - 薯片动态模块运行时
#[derive(Parser)]
#[command(name = "chips-bundles")]
#[command(version, about = "薯片生态的动态模块运行时", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动框架
    ///
    /// 安装 bundle 目录中的描述文件并启动自动启动的 bundle。
    /// 按 Ctrl+C 停止框架。
    Start,

    /// 列出 bundle
    ///
    /// 启动框架、打印全部 bundle 的状态后停止。
    ListBundles {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start) | None => {
            let config = load_config(&cli.config, cli.dev, cli.log_level.as_deref()).await?;
            let _guard = Logger::init(LoggerConfig::from_log_config(&config.logging))?;
            run_start(config).await?;
        }
        Some(Commands::ListBundles { json }) => {
            let config = load_config(&cli.config, cli.dev, cli.log_level.as_deref()).await?;
            let _guard = Logger::try_init(LoggerConfig::from_log_config(&config.logging));
            list_bundles(config, json).await?;
        }
        Some(Commands::CheckConfig { config }) => {
            let path = config.unwrap_or(cli.config);
            check_config(&path).await?;
        }
        Some(Commands::Version) => print_version(),
    }

    Ok(())
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(
    path: &Path,
    dev_mode: bool,
    log_level: Option<&str>,
) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    let mut config = if path.exists() {
        CoreConfig::from_file(path).await?
    } else {
        CoreConfig::default()
    };
    if dev_mode {
        config.dev_mode = true;
    }
    if let Some(level) = log_level {
        config.logging.level = level.to_string();
    }
    config.validate()?;
    Ok(config)
}

/// 启动框架并等待关闭信号
async fn run_start(config: CoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_millis(config.framework.stop_timeout_ms);
    let framework = Framework::builder().config(config).build().await?;
    framework.start().await?;

    let bundles = framework.get_bundles(StateMask::INSTALLED_ANY).await;
    println!();
    println!("薯片动态模块运行时已启动");
    println!("═══════════════════════════════════════");
    println!("  版本:       {}", chips_bundles::VERSION);
    println!("  启动级别:   {}", framework.start_level());
    println!("  bundle 数:  {}", bundles.len());
    println!();
    println!("  按 Ctrl+C 停止");
    println!("═══════════════════════════════════════");
    println!();

    signal::ctrl_c().await?;
    info!("收到关闭信号，正在停止框架");
    framework.stop();
    match framework.wait_for_stop(timeout).await {
        StopStatus::Stopped => info!("框架已停止"),
        StopStatus::WaitTimedOut => warn!(?timeout, "等待框架停止超时"),
        StopStatus::Running => warn!("框架仍在运行"),
    }
    Ok(())
}

/// 列出 bundle
async fn list_bundles(config: CoreConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_millis(config.framework.stop_timeout_ms);
    let framework = Framework::builder().config(config).build().await?;
    framework.start().await?;

    let mut infos = Vec::new();
    for bundle in framework.get_bundles(StateMask::ALL).await {
        infos.push(bundle.info().await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else {
        println!();
        println!("{:>4}  {:<12}  {:>5}  {:<32}  {}", "ID", "状态", "级别", "符号名", "版本");
        println!("────────────────────────────────────────────────────────────────────");
        for info in &infos {
            println!(
                "{:>4}  {:<12}  {:>5}  {:<32}  {}",
                info.id,
                info.state.to_string(),
                info.start_level,
                info.symbolic_name,
                info.version
            );
        }
        println!();
    }

    framework.stop();
    framework.wait_for_stop(timeout).await;
    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&CoreConfig::default());
        return Ok(());
    }

    match CoreConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {} [{}]", e, e.error_code());
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &CoreConfig) {
    let framework = &config.framework;
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [框架配置]");
    match &framework.storage_dir {
        Some(dir) => println!("    存储目录:       {}", dir.display()),
        None => println!("    存储目录:       (内存)"),
    }
    println!("    目标启动级别:   {}", framework.beginning_start_level);
    println!("    初始 bundle 级别: {}", framework.initial_bundle_start_level);
    println!("    停止超时:       {} ms", framework.stop_timeout_ms);
    println!("    校验档位:       {:?}", framework.validation_profile);
    println!("    系统包:         {:?}", framework.system_packages);
    println!();
    println!("  [bundle 配置]");
    println!("    bundle 目录:    {:?}", config.bundles.bundle_dirs);
    println!("    自动启动:       {:?}", config.bundles.auto_start);
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!();
    println!("  [其他]");
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Chips Bundles - 薯片动态模块运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_bundles::VERSION);
    println!("  系统 bundle:      {}", chips_bundles::SYSTEM_BUNDLE_NAME);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

//! COHD - Columbia Open Health Data 服务
//!
//! 基于电子病历聚合计数的临床概念共现查询：
//! - 概念检索、层级与词表映射
//! - 单概念/概念对频率
//! - 卡方、观测/期望比、相对频率等关联统计
//! - OMOP 与 Biolink 之间的概念映射

pub mod core;
pub mod server;
pub mod storage;

use crate::core::biolink::BiolinkMapper;
use crate::core::kgx::{self, KgxOptions};
use crate::core::models::{AppConfig, BuildStatus};
use crate::core::normalizer::{NodeNormalizer, SriNodeNormalizer};
use crate::storage::cache::ResponseCache;
use crate::storage::config::ConfigManager;
use crate::storage::database::Database;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// COHD 命令行
#[derive(Parser, Debug)]
#[command(name = "cohd")]
#[command(version)]
#[command(about = "Columbia Open Health Data - clinical concept co-occurrence API", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动HTTP服务（默认）
    Serve,

    /// 重建OMOP-Biolink映射
    BuildMappings,

    /// 导出显著关联为KGX文件
    ExportKgx {
        #[arg(long, default_value_t = 1)]
        dataset_id: i64,

        /// 输出目录
        #[arg(short, long, default_value = "kgx")]
        output: PathBuf,

        /// 计数阈值（严格大于）
        #[arg(long, default_value_t = 10)]
        min_count: i64,

        #[arg(long, default_value_t = 1.0)]
        ln_ratio_threshold: f64,
    },

    /// 创建数据库表
    InitDb,

    /// 清空响应缓存与映射缓存
    ClearCache,

    /// 把当前生效的配置写入配置文件
    InitConfig {
        /// 写入默认配置
        #[arg(long)]
        defaults: bool,
    },
}

fn open_database(config: &AppConfig) -> Result<Arc<Database>> {
    let db = Database::open(&config.database_path)?;
    tracing::info!("已打开数据库: {}", config.database_path.display());
    Ok(Arc::new(db))
}

fn node_normalizer(config: &AppConfig) -> Result<Arc<dyn NodeNormalizer>> {
    Ok(Arc::new(SriNodeNormalizer::new(&config.node_normalizer_url)?))
}

async fn serve(config: AppConfig) -> Result<()> {
    let db = open_database(&config)?;
    let normalizer = node_normalizer(&config)?;
    let state = server::AppState::new(config, db, normalizer)?;

    state.cache.purge_expired();
    state.mapping_cache.purge_expired();
    if state.config.cache_purge_interval_secs > 0 {
        crate::core::scheduler::spawn_cache_purge(
            vec![state.cache.clone(), state.mapping_cache.clone()],
            Duration::from_secs(state.config.cache_purge_interval_secs),
        );
    }

    if state.config.is_dev_env() {
        crate::core::scheduler::spawn(state.mapper.clone(), state.mapping_cache.clone());
    }

    server::serve(state).await
}

async fn build_mappings(config: &AppConfig) -> Result<()> {
    let mapper = BiolinkMapper::new(open_database(config)?, node_normalizer(config)?)?;
    let build = mapper.build_mappings().await?;

    if build.status == BuildStatus::Updated {
        ResponseCache::new(config.mapping_cache_dir(), config.mapping_cache_ttl_secs)?.clear()?;
    }
    println!("{}", build.status_message());
    Ok(())
}

fn export_kgx(config: &AppConfig, options: KgxOptions, output: PathBuf) -> Result<()> {
    let db = open_database(config)?;
    let mapper = BiolinkMapper::new(db.clone(), node_normalizer(config)?)?;
    if mapper.len() == 0 {
        tracing::warn!("没有可用的Biolink映射，请先运行 build-mappings");
    }

    let summary = kgx::export(&db, &mapper, &options, &output)?;
    println!(
        "扫描 {} 个概念对，导出 {} 条边、{} 个节点到 {}",
        summary.pairs_scanned,
        summary.edges,
        summary.nodes,
        output.display()
    );
    Ok(())
}

fn clear_cache(config: &AppConfig) -> Result<()> {
    for dir in [config.response_cache_dir(), config.mapping_cache_dir()] {
        let cache = ResponseCache::new(&dir, 0)?;
        cache.clear()?;
        tracing::info!("已清空缓存: {}", cache.dir().display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let manager = ConfigManager::new(cli.config.unwrap_or_else(ConfigManager::default_path));
    let config = manager.load()?;
    tracing::info!(
        "已加载配置: {} (环境: {})",
        manager.path().display(),
        config.deployment_env
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::BuildMappings => build_mappings(&config).await,
        Commands::ExportKgx {
            dataset_id,
            output,
            min_count,
            ln_ratio_threshold,
        } => {
            let options = KgxOptions {
                dataset_id,
                min_count,
                ln_ratio_threshold,
                confidence: config.default_confidence,
            };
            export_kgx(&config, options, output)
        }
        Commands::InitDb => {
            open_database(&config)?;
            println!("数据库已就绪: {}", config.database_path.display());
            Ok(())
        }
        Commands::ClearCache => clear_cache(&config),
        Commands::InitConfig { defaults } => {
            if defaults {
                manager.reset()?;
            } else {
                manager.save(&config)?;
            }
            println!("配置已写入: {}", manager.path().display());
            Ok(())
        }
    }
}

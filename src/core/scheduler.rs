//! 映射重建调度
//!
//! - 每月第一个星期六 00:00 UTC 重建一次OMOP-Biolink映射
//! - 按固定间隔清理磁盘上的过期缓存条目

use crate::core::biolink::BiolinkMapper;
use crate::core::models::BuildStatus;
use crate::storage::cache::ResponseCache;
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use std::sync::Arc;
use std::time::Duration;

/// 某月第一个星期六 00:00 UTC
fn first_saturday(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (Weekday::Sat.num_days_from_monday() + 7
        - first.weekday().num_days_from_monday())
        % 7;
    let date = first.checked_add_days(Days::new(u64::from(offset)))?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// `now` 之后（不含）的下一次重建时间
pub fn next_run_after(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (mut year, mut month) = (now.year(), now.month());
    loop {
        let candidate = first_saturday(year, month)?;
        if candidate > now {
            return Some(candidate);
        }
        (year, month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
    }
}

/// 启动后台重建任务
///
/// 重建成功替换映射后清空映射缓存。
pub fn spawn(
    mapper: Arc<BiolinkMapper>,
    mapping_cache: Arc<ResponseCache>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_run_after(now) else {
                tracing::error!("无法计算下次映射重建时间，调度停止");
                return;
            };
            tracing::info!("下次映射重建时间: {}", next.to_rfc3339());

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match mapper.build_mappings().await {
                Ok(build) => {
                    tracing::info!(
                        "定时映射重建完成: {} ({})",
                        build.status,
                        build.build_id
                    );
                    if build.status == BuildStatus::Updated {
                        if let Err(e) = mapping_cache.clear() {
                            tracing::warn!("清空映射缓存失败: {}", e);
                        }
                    }
                }
                Err(e) => tracing::error!("定时映射重建失败: {}", e),
            }
        }
    })
}

/// 启动过期缓存清理任务
///
/// 第一次清理在一个间隔之后进行（启动时已清理过一次）。
pub fn spawn_cache_purge(
    caches: Vec<Arc<ResponseCache>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for cache in &caches {
                let cache = cache.clone();
                match tokio::task::spawn_blocking(move || cache.purge_expired()).await {
                    Ok(removed) => tracing::debug!("定时清理缓存: 删除 {} 个条目", removed),
                    Err(e) => tracing::warn!("缓存清理任务异常: {}", e),
                }
            }
        }
    })
}

//! 关联统计模块
//!
//! 在已聚合（且上游已做Poisson随机化）的计数上计算关联指标：
//! - 卡方检验（1自由度）与 Bonferroni 校正
//! - 观测/期望比的对数及其双Poisson置信区间
//! - 相对频率及其Poisson置信区间
//! - 对数优势比（log-odds）
//!
//! 除区间缓存外所有函数均为纯函数。

use moka::sync::Cache;
use once_cell::sync::Lazy;
use statrs::distribution::{ChiSquared, ContinuousCDF, DiscreteCDF, Normal, Poisson};

/// 默认置信度
pub const DEFAULT_CONFIDENCE: f64 = 0.99;

/// API输出中 ln_ratio 置信区间下界的截断值
pub const LN_RATIO_CI_FLOOR: f64 = -999.0;

/// JSON不允许Infinity，导出时用此值替换
pub const JSON_INFINITY_REPLACEMENT: f64 = 9999.0;

/// Poisson 区间缓存容量（两种置信度 × 两种区间）
const POISSON_CI_CACHE_CAP: u64 = 40_000;

const SINGLE_CI: u8 = 0;
const DOUBLE_CI: u8 = 1;

static POISSON_CI_CACHE: Lazy<PoissonCiCache> =
    Lazy::new(|| PoissonCiCache::new(POISSON_CI_CACHE_CAP));

static STANDARD_NORMAL: Lazy<Option<Normal>> = Lazy::new(|| Normal::new(0.0, 1.0).ok());

/// 置信区间
pub type Interval = (f64, f64);

/// 判断置信度是否属于缓存范围
fn cache_slot(confidence: f64) -> Option<u8> {
    if (confidence - 0.99).abs() < 1e-9 {
        Some(0)
    } else if (confidence - 0.999).abs() < 1e-9 {
        Some(1)
    } else {
        None
    }
}

/// 常用置信度（0.99 / 0.999）的 Poisson 区间缓存
///
/// 键为 (区间类型, 置信度下标, freq位模式)，满了以后按 TinyLFU 淘汰。
pub struct PoissonCiCache {
    cache: Cache<(u8, u8, u64), Interval>,
}

impl PoissonCiCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// 命中时直接返回，否则计算并写入；其他置信度不缓存
    fn get_or_compute(
        &self,
        kind: u8,
        freq: f64,
        confidence: f64,
        compute: impl FnOnce() -> Interval,
    ) -> Interval {
        match cache_slot(confidence) {
            Some(slot) => self.cache.get_with((kind, slot, freq.to_bits()), compute),
            None => compute(),
        }
    }

    /// 当前条目数
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// Poisson 分位数：满足 CDF(k) >= q 的最小整数 k
pub fn poisson_ppf(q: f64, mu: f64) -> f64 {
    if q >= 1.0 {
        return f64::INFINITY;
    }
    if mu <= 0.0 || q <= 0.0 {
        return 0.0;
    }
    let Ok(dist) = Poisson::new(mu) else {
        return 0.0;
    };

    // 用正态近似给出起点，再逐步逼近精确分位数
    let z = STANDARD_NORMAL
        .as_ref()
        .map(|n| n.inverse_cdf(q))
        .unwrap_or(0.0);
    let mut k = (mu + z * mu.sqrt()).floor().max(0.0) as u64;

    if dist.cdf(k) >= q {
        while k > 0 && dist.cdf(k - 1) >= q {
            k -= 1;
        }
    } else {
        while dist.cdf(k) < q {
            k += 1;
        }
    }
    k as f64
}

/// Poisson 中心区间 `[ppf(α/2), ppf(1-α/2)]`，下界不截断
pub fn poisson_interval(freq: f64, confidence: f64) -> Interval {
    let alpha = 1.0 - confidence;
    (
        poisson_ppf(alpha / 2.0, freq),
        poisson_ppf(1.0 - alpha / 2.0, freq),
    )
}

fn single_ci(freq: f64, confidence: f64) -> Interval {
    let (lower, upper) = poisson_interval(freq, confidence);
    (lower.max(1.0), upper)
}

/// 两级区间：先求 freq 的区间，再对两端各自求区间的外侧端点
fn nested_ci(freq: f64, confidence: f64) -> Interval {
    let stage_confidence = 1.0 - (1.0 - confidence).sqrt();
    let alpha = 1.0 - stage_confidence;
    let lower = poisson_ppf(alpha / 2.0, poisson_ppf(alpha / 2.0, freq));
    let upper = poisson_ppf(1.0 - alpha / 2.0, poisson_ppf(1.0 - alpha / 2.0, freq));
    (lower.max(1.0), upper)
}

/// 计数 freq 的 Poisson 置信区间，下界至少为1（最小可能计数）
pub fn poisson_ci(freq: f64, confidence: f64) -> Interval {
    POISSON_CI_CACHE.get_or_compute(SINGLE_CI, freq, confidence, || single_ci(freq, confidence))
}

/// 两个Poisson过程（事件本身 + 随机化）叠加时的置信区间
///
/// 每一级使用置信度 `1 - sqrt(1 - confidence)`，总体达到 `confidence`。
pub fn double_poisson_ci(freq: f64, confidence: f64) -> Interval {
    POISSON_CI_CACHE.get_or_compute(DOUBLE_CI, freq, confidence, || nested_ci(freq, confidence))
}

/// 对称截断到 [-limit, limit]
pub fn clip(x: f64, limit: f64) -> f64 {
    if x < -limit {
        -limit
    } else if x > limit {
        limit
    } else {
        x
    }
}

/// ln(观测/期望) 的置信区间（双Poisson方法）
pub fn ln_ratio_ci(freq: f64, ln_ratio: f64, confidence: f64, replace_inf: Option<f64>) -> Interval {
    let (lo, hi) = double_poisson_ci(freq, confidence);
    let ratio = ln_ratio.exp();
    let ci = ((lo * ratio / freq).ln(), (hi * ratio / freq).ln());
    match replace_inf {
        Some(r) => (ci.0.max(-r), ci.1.min(r)),
        None => ci,
    }
}

/// 相对频率的置信区间
pub fn rel_freq_ci(
    pair_count: f64,
    base_count: f64,
    confidence: f64,
    replace_inf: Option<f64>,
) -> Interval {
    let pair_ci = poisson_ci(pair_count, confidence);
    let base_ci = poisson_ci(base_count, confidence);
    let ci = (pair_ci.0 / base_ci.1, pair_ci.1 / base_ci.0);
    match replace_inf {
        Some(r) => (ci.0, ci.1.min(r)),
        None => ci,
    }
}

/// 区间显著性：两个区间不重叠（未给出 ci2 时与0比较）
pub fn ci_significance(ci1: Interval, ci2: Option<Interval>) -> bool {
    let ci2 = ci2.unwrap_or((0.0, 0.0));
    ci1.0 > ci2.1 || ci2.0 > ci1.1
}

/// 对数优势比及95%置信区间
///
/// 2x2列联表: a=cp, b=c1-cp, c=c2-cp, d=n-c1-c2+cp。
/// Poisson扰动可能使 b 或 c 非正，此时返回 0 或替换值。
pub fn log_odds(c1: f64, c2: f64, cp: f64, n: f64, replace_inf: f64) -> (f64, Interval) {
    let a = cp;
    let b = c1 - cp;
    let c = c2 - cp;
    let d = n - c1 - c2 + cp;

    if b <= 0.0 || c <= 0.0 {
        if a == 0.0 {
            return (0.0, (0.0, 0.0));
        }
        return (replace_inf, (replace_inf, replace_inf));
    }

    let lo = ((a * d) / (b * c)).ln();
    let half_width = 1.96 * (1.0 / a + 1.0 / b + 1.0 / c + 1.0 / d).sqrt();
    (
        clip(lo, replace_inf),
        (
            clip(lo - half_width, replace_inf),
            clip(lo + half_width, replace_inf),
        ),
    )
}

/// 卡方检验结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChiSquareStat {
    /// 卡方统计量
    pub statistic: f64,
    /// p值（1自由度）
    pub p_value: f64,
}

/// 2x2列联表卡方检验
///
/// 观测与期望都按 [~c1~c2, c1~c2, ~c1c2, c1c2] 排列，
/// 4个格子减1再减2个估计参数，剩1个自由度。
pub fn chi_square(cpc: f64, c1: f64, c2: f64, n: f64) -> ChiSquareStat {
    let observed = [n - c1 - c2 + cpc, c1 - cpc, c2 - cpc, cpc];
    let expected = [
        (n - c1) * (n - c2) / n,
        c1 * (n - c2) / n,
        c2 * (n - c1) / n,
        c1 * c2 / n,
    ];

    let statistic: f64 = observed
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| (o - e).powi(2) / e)
        .sum();

    let p_value = if statistic.is_nan() {
        f64::NAN
    } else {
        ChiSquared::new(1.0)
            .map(|dist| dist.sf(statistic))
            .unwrap_or(f64::NAN)
    };

    ChiSquareStat { statistic, p_value }
}

/// Bonferroni 校正
pub fn bonferroni(p_value: f64, n_tests: f64) -> f64 {
    (p_value * n_tests).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(x: Interval, y: Interval, dp: i32) -> bool {
        let tol = 10f64.powi(-dp);
        (x.0 - y.0).abs() < tol && (x.1 - y.1).abs() < tol
    }

    #[test]
    fn test_double_poisson_ci() {
        assert!(close(double_poisson_ci(50.0, 0.99), (29.0, 75.0), 1));
        assert!(close(double_poisson_ci(50.0, 0.95), (33.0, 68.0), 1));
        assert!(close(double_poisson_ci(5000.0, 0.99), (4769.0, 5235.0), 1));
        assert!(close(double_poisson_ci(5000.0, 0.95), (4829.0, 5173.0), 1));
    }

    #[test]
    fn test_poisson_ci_lower_bound_at_least_one() {
        let ci = poisson_ci(1.0, 0.99);
        assert_eq!(ci.0, 1.0);
        assert!(ci.1 >= 1.0);
    }

    #[test]
    fn test_nested_ci_stage_bounds() {
        // 0.99 -> 每级 0.9：50 的区间 [39, 62]，再取 39 的下界、62 的上界
        assert_eq!(poisson_ppf(0.05, 50.0), 39.0);
        assert_eq!(poisson_ppf(0.95, 50.0), 62.0);
        assert_eq!(nested_ci(50.0, 0.99), (29.0, 75.0));
        assert_eq!(nested_ci(0.0, 0.99), (1.0, 0.0));
    }

    #[test]
    fn test_poisson_interval_keeps_zero_lower_bound() {
        assert_eq!(poisson_interval(0.0, 0.99), (0.0, 0.0));
        assert_eq!(poisson_interval(1.0, 0.99), (0.0, 4.0));
        assert_eq!(single_ci(1.0, 0.99), (1.0, 4.0));
    }

    #[test]
    fn test_poisson_ci_cache_is_bounded() {
        let cache = PoissonCiCache::new(8);
        for i in 0..64 {
            let freq = i as f64;
            let ci = cache.get_or_compute(SINGLE_CI, freq, 0.99, || single_ci(freq, 0.99));
            assert_eq!(ci, single_ci(freq, 0.99));
        }
        assert!(cache.entry_count() <= 8);

        // 满了以后结果仍然正确
        let ci = cache.get_or_compute(DOUBLE_CI, 5000.0, 0.99, || nested_ci(5000.0, 0.99));
        assert_eq!(ci, (4769.0, 5235.0));
    }

    #[test]
    fn test_poisson_ci_cache_hit_skips_compute() {
        let cache = PoissonCiCache::new(8);
        let first = cache.get_or_compute(SINGLE_CI, 42.0, 0.999, || single_ci(42.0, 0.999));
        let second = cache.get_or_compute(SINGLE_CI, 42.0, 0.999, || panic!("recomputed"));
        assert_eq!(first, second);

        // 非常用置信度不缓存
        let mut calls = 0;
        for _ in 0..2 {
            cache.get_or_compute(SINGLE_CI, 42.0, 0.9, || {
                calls += 1;
                single_ci(42.0, 0.9)
            });
        }
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_poisson_ci_cached_value_is_stable() {
        let first = poisson_ci(123.0, 0.99);
        let second = poisson_ci(123.0, 0.99);
        assert_eq!(first, second);
    }

    #[test]
    fn test_ln_ratio_ci() {
        let ci = ln_ratio_ci(5000.0, 2.0, 0.99, None);
        assert!(close(ci, (1.9526987268819869, 2.0459289318883997), 4));

        let ci = ln_ratio_ci(5000.0, 2.0, 0.95, None);
        assert!(close(ci, (1.9652014944573044, 2.0340148785872776), 4));

        let ci = ln_ratio_ci(5000.0, 5.0, 0.95, None);
        assert!(close(ci, (4.965201494457304, 5.034014878587278), 4));
    }

    #[test]
    fn test_rel_freq_ci() {
        let pair = poisson_ci(50.0, 0.95);
        let base = poisson_ci(100.0, 0.95);
        let ci = rel_freq_ci(50.0, 100.0, 0.95, None);
        assert!(close(ci, (pair.0 / base.1, pair.1 / base.0), 12));
        assert!(ci.0 < 0.5 && 0.5 < ci.1);

        let ci = rel_freq_ci(5000.0, 500000.0, 0.99, None);
        assert!(ci.0 < 0.01 && 0.01 < ci.1);
        assert!(ci.1 - ci.0 < 0.002);
    }

    #[test]
    fn test_rel_freq_ci_replace_inf_caps_upper() {
        let ci = rel_freq_ci(50.0, 100.0, 0.95, Some(0.5));
        assert_eq!(ci.1, 0.5);
    }

    #[test]
    fn test_ci_significance() {
        assert!(ci_significance((10.0, 20.0), None));
        assert!(ci_significance((-20.0, -10.0), None));
        assert!(!ci_significance((-20.0, 10.0), None));
        assert!(ci_significance((-20.0, -10.0), Some((-9.0, -5.0))));
        assert!(ci_significance((5.0, 9.0), Some((10.0, 20.0))));
        assert!(!ci_significance((-20.0, -10.0), Some((-11.0, -5.0))));
        assert!(!ci_significance((5.0, 11.0), Some((10.0, 20.0))));
    }

    #[test]
    fn test_log_odds_degenerate_tables() {
        // b <= 0 且 a == 0
        assert_eq!(log_odds(0.0, 10.0, 0.0, 100.0, 9999.0), (0.0, (0.0, 0.0)));
        // c <= 0 且 a > 0
        assert_eq!(
            log_odds(20.0, 10.0, 10.0, 100.0, 9999.0),
            (9999.0, (9999.0, 9999.0))
        );
    }

    #[test]
    fn test_log_odds_regular_table() {
        let (lo, ci) = log_odds(20.0, 30.0, 10.0, 100.0, 9999.0);
        // a=10 b=10 c=20 d=60 -> ln(600/200)
        assert!((lo - 3f64.ln()).abs() < 1e-12);
        assert!(ci.0 < lo && lo < ci.1);
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip(5.0, 3.0), 3.0);
        assert_eq!(clip(-5.0, 3.0), -3.0);
        assert_eq!(clip(1.5, 3.0), 1.5);
    }

    #[test]
    fn test_chi_square_independent_counts() {
        // 完全独立：c1*c2/n == cpc
        let stat = chi_square(10.0, 100.0, 100.0, 1000.0);
        assert!(stat.statistic.abs() < 1e-9);
        assert!((stat.p_value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_chi_square_strong_association() {
        let stat = chi_square(90.0, 100.0, 100.0, 1000.0);
        assert!(stat.statistic > 100.0);
        assert!(stat.p_value < 1e-10);
    }

    #[test]
    fn test_bonferroni_caps_at_one() {
        assert_eq!(bonferroni(0.2, 10.0), 1.0);
        assert!((bonferroni(0.001, 10.0) - 0.01).abs() < 1e-15);
    }
}

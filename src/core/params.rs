//! 请求参数解析
//!
//! 沿用COHD接口的参数约定：缺失、空白与非数字的值按相同规则处理，
//! 错误消息会原样返回给调用方。

use crate::core::error::{CohdError, Result};
use std::collections::HashMap;

/// 默认数据集
pub const DATASET_ID_DEFAULT: i64 = 1;
/// 层级查询（祖先/后代）默认数据集
pub const DATASET_ID_DEFAULT_HIER: i64 = 3;
/// 时间分布（年龄/间隔）默认数据集
pub const DATASET_ID_DEFAULT_TEMPORAL: i64 = 4;

/// 请求参数（查询字符串）
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: HashMap<String, String>,
}

impl From<HashMap<String, String>> for Args {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl Args {
    /// 从键值对构造
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// 原始值
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    /// 非空白的字符串参数（已去除首尾空白）
    pub fn text(&self, name: &str) -> Option<&str> {
        self.raw(name).map(str::trim).filter(|s| !s.is_empty())
    }

    /// 数据集ID，缺失或非数字时使用默认值
    pub fn dataset_id(&self, default: i64) -> i64 {
        self.text("dataset_id")
            .filter(|s| is_digits(s))
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// 概念ID，缺失或非数字时为 None
    pub fn concept_id(&self, name: &str) -> Option<i64> {
        self.text(name)
            .filter(|s| is_digits(s))
            .and_then(|s| s.parse().ok())
    }

    /// 逗号分隔的字符串列表
    pub fn list(&self, name: &str) -> Option<Vec<String>> {
        self.text(name).map(|s| {
            s.split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect()
        })
    }

    /// 布尔参数（true / 1 / t）
    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.text(name)
            .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "t"))
    }

    /// 置信度，必须位于 [0, 1)
    pub fn confidence(&self, default: f64) -> Result<f64> {
        let confidence = match self.text("confidence") {
            None => default,
            Some(s) => s
                .parse::<f64>()
                .map_err(|_| CohdError::bad_request("Confidence is not a number 0-1"))?,
        };
        if !(0.0..1.0).contains(&confidence) {
            return Err(CohdError::bad_request(
                "Confidence should be a number between 0-1",
            ));
        }
        Ok(confidence)
    }

    /// 解析逗号分隔的概念ID列表（q参数）
    pub fn concept_id_list(&self, name: &str) -> Result<Vec<i64>> {
        let q = self
            .text(name)
            .ok_or_else(|| CohdError::bad_request(format!("{} parameter is missing", name)))?;

        q.split(',')
            .map(|x| {
                let x = x.trim();
                if is_digits(x) {
                    x.parse::<i64>().map_err(|_| {
                        CohdError::bad_request("Error in q: concept_ids should be integers")
                    })
                } else {
                    Err(CohdError::bad_request(
                        "Error in q: concept_ids should be integers",
                    ))
                }
            })
            .collect()
    }

    /// 排序后的键值对，用于生成缓存键
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

/// 是否全部为ASCII数字（非空）
pub fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

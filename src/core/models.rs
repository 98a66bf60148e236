//! 核心数据模型定义
//!
//! 每个结构体对应一个COHD接口返回的行，字段名即JSON字段名。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::stats::Interval;

/// 接口统一的结果包装 `{"results": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Results<T> {
    pub results: Vec<T>,
}

impl<T> Results<T> {
    pub fn new(results: Vec<T>) -> Self {
        Self { results }
    }
}

// ---------------------------------------------------------------------------
// metadata
// ---------------------------------------------------------------------------

/// 数据集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: i64,
    pub dataset_name: String,
    pub dataset_description: String,
}

/// 每个domain中的概念数量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainCount {
    pub dataset_id: i64,
    pub domain_id: String,
    pub count: i64,
}

/// 每对domain之间的概念对数量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPairCount {
    pub dataset_id: i64,
    pub domain_id_1: String,
    pub domain_id_2: String,
    pub count: i64,
}

/// 数据集患者数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientCount {
    pub dataset_id: i64,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// omop
// ---------------------------------------------------------------------------

/// OMOP概念定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    pub concept_code: String,
}

/// 概念名称检索结果（附带计数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptSearchResult {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    pub concept_code: String,
    pub concept_count: i64,
}

/// 层级关系中的相关概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyConcept {
    pub min_levels_of_separation: i64,
    pub max_levels_of_separation: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    pub standard_concept: Option<String>,
    pub concept_code: String,
    pub concept_count: i64,
}

/// 祖先概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptAncestor {
    pub ancestor_concept_id: i64,
    #[serde(flatten)]
    pub concept: HierarchyConcept,
}

/// 后代概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDescendant {
    pub descendant_concept_id: i64,
    #[serde(flatten)]
    pub concept: HierarchyConcept,
}

/// 源编码到标准概念的映射
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardConceptMapping {
    pub source_concept_id: i64,
    pub source_concept_code: String,
    pub source_concept_name: String,
    pub source_vocabulary_id: String,
    pub standard_concept_id: i64,
    pub standard_concept_name: String,
    pub standard_domain_id: String,
    pub standard_concept_code: String,
    pub standard_vocabulary_id: String,
}

/// 映射到某标准概念的源概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConcept {
    pub concept_id: i64,
    pub concept_code: String,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    pub standard_concept: Option<String>,
}

/// 词表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub vocabulary_id: String,
}

// ---------------------------------------------------------------------------
// frequencies
// ---------------------------------------------------------------------------

/// 单概念频率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleConceptFreq {
    pub dataset_id: i64,
    pub concept_id: i64,
    pub concept_count: i64,
    pub concept_frequency: f64,
}

/// 概念对频率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedConceptFreq {
    pub dataset_id: i64,
    pub concept_id_1: i64,
    pub concept_id_2: i64,
    pub concept_count: i64,
    pub concept_frequency: f64,
}

/// 与给定概念共现的概念频率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedConceptFreq {
    pub dataset_id: i64,
    pub concept_id: i64,
    pub associated_concept_id: i64,
    pub concept_count: i64,
    pub concept_frequency: f64,
    pub associated_concept_name: String,
    pub associated_domain_id: String,
}

/// 高频概念
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequentConcept {
    pub dataset_id: i64,
    pub concept_id: i64,
    pub concept_count: i64,
    pub concept_frequency: f64,
    pub domain_id: String,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
}

// ---------------------------------------------------------------------------
// association
// ---------------------------------------------------------------------------

/// 关联计算所需的计数行（已按调用方的概念顺序定向）
#[derive(Debug, Clone, PartialEq)]
pub struct PairCountRow {
    pub dataset_id: i64,
    pub concept_id_1: i64,
    pub concept_id_2: i64,
    pub pair_count: i64,
    pub count_1: i64,
    pub count_2: i64,
    pub patient_count: i64,
    /// 仅在未指定 concept_id_2 时填充
    pub concept_2_name: Option<String>,
    pub concept_2_domain: Option<String>,
}

/// 卡方检验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChiSquareResult {
    pub dataset_id: i64,
    pub concept_id_1: i64,
    pub concept_id_2: i64,
    pub n: i64,
    pub n_c1: i64,
    pub n_c2: i64,
    #[serde(rename = "n_~c1_~c2")]
    pub n_not_c1_not_c2: i64,
    #[serde(rename = "n_c1_~c2")]
    pub n_c1_not_c2: i64,
    #[serde(rename = "n_~c1_c2")]
    pub n_not_c1_c2: i64,
    pub n_c1_c2: i64,
    pub chi_square: f64,
    #[serde(rename = "p-value")]
    pub p_value: f64,
    #[serde(rename = "adj_p-value")]
    pub adj_p_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_domain: Option<String>,
}

/// 观测/期望比结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsExpRatioResult {
    pub dataset_id: i64,
    pub concept_id_1: i64,
    pub concept_id_2: i64,
    pub observed_count: i64,
    pub expected_count: f64,
    pub ln_ratio: f64,
    pub confidence_interval: Interval,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_domain: Option<String>,
}

/// 相对频率结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeFrequencyResult {
    pub dataset_id: i64,
    pub concept_id_1: i64,
    pub concept_id_2: i64,
    pub concept_pair_count: i64,
    pub concept_2_count: i64,
    pub relative_frequency: f64,
    pub confidence_interval: Interval,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_2_domain: Option<String>,
}

// ---------------------------------------------------------------------------
// temporal
// ---------------------------------------------------------------------------

/// 概念的年龄分布，`counts[i]` 为第 i 个年龄段（宽 `bin_width` 岁）的计数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptAgeCounts {
    pub dataset_id: i64,
    pub concept_id: i64,
    pub concept_name: String,
    pub concept_count: i64,
    pub bin_width: i64,
    pub counts: Vec<i64>,
    /// 每箱计数的Poisson区间
    pub confidence_interval: Vec<(i64, i64)>,
}

/// 概念对的时间间隔分布
///
/// 共 `2n + 1` 个箱，中间一箱为同日共现，之前为目标概念早于源概念。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptPairDeltaCounts {
    pub dataset_id: i64,
    pub source_concept_id: i64,
    pub source_concept_name: String,
    pub source_concept_count: i64,
    pub target_concept_id: i64,
    pub target_concept_name: String,
    pub target_concept_count: i64,
    pub concept_pair_count: i64,
    pub bin_width: i64,
    pub n: i64,
    pub counts: Vec<i64>,
    /// 每箱计数的Poisson区间
    pub confidence_interval: Vec<(i64, i64)>,
}

impl ConceptPairDeltaCounts {
    /// 交换源概念与目标概念，间隔分布随之翻转
    pub fn reversed(self) -> Self {
        let mut counts = self.counts;
        counts.reverse();
        let mut confidence_interval = self.confidence_interval;
        confidence_interval.reverse();
        Self {
            dataset_id: self.dataset_id,
            source_concept_id: self.target_concept_id,
            source_concept_name: self.target_concept_name,
            source_concept_count: self.target_concept_count,
            target_concept_id: self.source_concept_id,
            target_concept_name: self.source_concept_name,
            target_concept_count: self.source_concept_count,
            concept_pair_count: self.concept_pair_count,
            bin_width: self.bin_width,
            n: self.n,
            counts,
            confidence_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// biolink
// ---------------------------------------------------------------------------

/// OMOP domain_id 与 concept_class_id 组合
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainClass {
    pub domain_id: Option<String>,
    pub concept_class_id: Option<String>,
}

impl DomainClass {
    pub fn new(domain_id: &str, concept_class_id: Option<&str>) -> Self {
        Self {
            domain_id: Some(domain_id.to_string()),
            concept_class_id: concept_class_id.map(|s| s.to_string()),
        }
    }
}

/// 存储中的一行 OMOP-Biolink 映射
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiolinkMappingRow {
    pub omop_id: i64,
    pub biolink_id: String,
    pub biolink_label: String,
    /// Biolink 类别列表
    pub categories: Vec<String>,
    pub provenance: String,
    pub distance: i64,
    pub string_similarity: f64,
    pub preferred: bool,
    /// 来自 concept 表的概念名称
    pub concept_name: Option<String>,
}

/// OMOP 与 Biolink 之间的一次映射（含来源信息）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmopBiolinkMapping {
    pub omop_id: String,
    pub biolink_id: String,
    pub omop_label: String,
    pub biolink_label: String,
    pub provenance: String,
    pub distance: i64,
}

/// OMOP -> Biolink 的查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiolinkLookup {
    pub mapping: OmopBiolinkMapping,
    pub categories: Vec<String>,
}

/// 映射重建的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    /// 已替换为新映射
    Updated,
    /// 新映射数量不足，保留旧映射
    Retained,
    /// 重建失败
    Failed,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Updated => write!(f, "Updated"),
            BuildStatus::Retained => write!(f, "Retained"),
            BuildStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Updated" => Ok(BuildStatus::Updated),
            "Retained" => Ok(BuildStatus::Retained),
            "Failed" => Ok(BuildStatus::Failed),
            other => Err(anyhow::anyhow!("未知的构建状态: {}", other)),
        }
    }
}

/// 映射重建历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingBuild {
    /// 构建ID
    pub build_id: String,
    /// 开始时间
    pub started_at: DateTime<Utc>,
    /// 结束时间
    pub finished_at: DateTime<Utc>,
    /// 重建前的映射数量
    pub previous_count: i64,
    /// 本次生成的映射数量
    pub new_count: i64,
    /// 结果
    pub status: BuildStatus,
}

impl MappingBuild {
    /// 构建结果说明
    pub fn status_message(&self) -> String {
        let outcome = match self.status {
            BuildStatus::Updated => "Updated to new mappings",
            BuildStatus::Retained => "Retained old mappings",
            BuildStatus::Failed => "Failed to build mappings",
        };
        format!(
            "Current number of mappings: {}\nNew mappings: {}\n{}",
            self.previous_count, self.new_count, outcome
        )
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 监听地址
    pub bind_addr: String,
    /// SQLite数据库路径
    pub database_path: PathBuf,
    /// 响应缓存目录
    pub cache_dir: PathBuf,
    /// 响应缓存有效期（秒），0表示不缓存
    pub cache_ttl_secs: u64,
    /// 映射查询缓存有效期（秒）
    pub mapping_cache_ttl_secs: u64,
    /// 过期缓存清理间隔（秒），0表示只在启动时清理
    pub cache_purge_interval_secs: u64,
    /// SRI Node Normalizer 基础URL
    pub node_normalizer_url: String,
    /// 部署环境（dev / itrb-ci / itrb-test / itrb-prod）
    pub deployment_env: String,
    /// 默认置信度
    pub default_confidence: f64,
    /// 根路径重定向到的接口文档
    pub docs_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            database_path: PathBuf::from("cohd.db"),
            cache_dir: PathBuf::from("cache"),
            cache_ttl_secs: 86_400,
            mapping_cache_ttl_secs: 2_419_200,
            cache_purge_interval_secs: 3_600,
            node_normalizer_url: "https://nodenormalization-sri.renci.org/1.1/".to_string(),
            deployment_env: "dev".to_string(),
            default_confidence: crate::core::stats::DEFAULT_CONFIDENCE,
            docs_url: "http://cohdcovid.smart-api.info/".to_string(),
        }
    }
}

impl AppConfig {
    /// 查询响应缓存目录
    pub fn response_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("responses")
    }

    /// 映射缓存目录
    pub fn mapping_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("mappings")
    }

    /// 是否为开发类环境（允许重建映射）
    pub fn is_dev_env(&self) -> bool {
        matches!(
            self.deployment_env.to_lowercase().as_str(),
            "dev" | "itrb-ci"
        )
    }
}

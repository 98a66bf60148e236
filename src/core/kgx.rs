//! KGX 导出
//!
//! 把显著关联的概念对导出为 KGX JSON-lines（`cohd_nodes.jsonl` / `cohd_edges.jsonl`）。
//! 只导出两端都有Biolink映射、三个计数都超过阈值、且 ln_ratio 置信区间
//! 不覆盖 `±ln_ratio_threshold` 的概念对。

use crate::core::biolink::BiolinkMapper;
use crate::core::error::Result;
use crate::core::models::{BiolinkLookup, PairCountRow};
use crate::core::stats::{self, Interval, JSON_INFINITY_REPLACEMENT};
use crate::storage::database::Database;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const INFORES_ID: &str = "infores:cohd";
pub const SUPPORTING_DATA_SOURCE: &str = "infores:columbia-cdw-ehr-data";
const KNOWLEDGE_LEVEL: &str = "statistical_association";
const AGENT_TYPE: &str = "data_analysis_pipeline";

/// p值下限
pub const MIN_P: f64 = 1e-12;

pub const NODES_FILE: &str = "cohd_nodes.jsonl";
pub const EDGES_FILE: &str = "cohd_edges.jsonl";

/// 导出选项
#[derive(Debug, Clone)]
pub struct KgxOptions {
    pub dataset_id: i64,
    /// 计数阈值（严格大于）
    pub min_count: i64,
    pub ln_ratio_threshold: f64,
    pub confidence: f64,
}

impl Default for KgxOptions {
    fn default() -> Self {
        Self {
            dataset_id: 1,
            min_count: 10,
            ln_ratio_threshold: 1.0,
            confidence: stats::DEFAULT_CONFIDENCE,
        }
    }
}

/// KGX节点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KgxNode {
    pub id: String,
    pub name: String,
    pub category: Vec<String>,
    /// 对应的OMOP概念 (OMOP:xxx)
    pub omop_id: String,
}

/// log-odds 或其区间任一端超出 JSON 无穷替代值
fn exceeds_json_range(log_odds: f64, ci: Interval) -> bool {
    [log_odds, ci.0, ci.1]
        .iter()
        .any(|v| v.abs() > JSON_INFINITY_REPLACEMENT)
}

/// 数据来源
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KgxSource {
    pub resource_id: String,
    pub resource_role: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upstream_resource_ids: Vec<String>,
}

/// KGX边，subject 对应概念1，object 对应概念2
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KgxEdge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub supporting_data_set: String,
    pub knowledge_level: String,
    pub agent_type: String,
    pub concept_pair_count: i64,
    pub concept_count_subject: i64,
    pub concept_count_object: i64,
    pub dataset_count: i64,
    pub unadjusted_p_value: f64,
    pub bonferonni_adjusted_p_value: f64,
    pub expected_count: f64,
    pub ln_ratio: f64,
    pub ln_ratio_confidence_interval: Interval,
    pub relative_frequency_subject: f64,
    pub relative_frequency_subject_confidence_interval: Interval,
    pub relative_frequency_object: f64,
    pub relative_frequency_object_confidence_interval: Interval,
    pub log_odds_ratio: f64,
    pub log_odds_ratio_95_ci: Interval,
    pub sources: Vec<KgxSource>,
}

/// 导出统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KgxSummary {
    pub pairs_scanned: usize,
    pub edges: usize,
    pub nodes: usize,
}

/// 计算一个概念对的边，不显著时返回 None
pub fn association_edge(
    row: &PairCountRow,
    subject: &BiolinkLookup,
    object: &BiolinkLookup,
    n_tests: f64,
    options: &KgxOptions,
) -> Option<KgxEdge> {
    let (cp, c1, c2, n) = (
        row.pair_count as f64,
        row.count_1 as f64,
        row.count_2 as f64,
        row.patient_count as f64,
    );

    let expected_count = c1 * c2 / n;
    let ln_ratio = (cp * n / (c1 * c2)).ln();
    let ln_ratio_ci = stats::ln_ratio_ci(
        cp,
        ln_ratio,
        options.confidence,
        Some(JSON_INFINITY_REPLACEMENT),
    );
    let threshold = options.ln_ratio_threshold;
    if !stats::ci_significance(ln_ratio_ci, Some((-threshold, threshold))) {
        return None;
    }

    let chi = stats::chi_square(cp, c1, c2, n);
    let p_value = chi.p_value.max(MIN_P);
    let adj_p_value = stats::bonferroni(chi.p_value, n_tests).max(MIN_P);

    let (log_odds, log_odds_ci) = stats::log_odds(c1, c2, cp, n, JSON_INFINITY_REPLACEMENT);
    if exceeds_json_range(log_odds, log_odds_ci) {
        tracing::warn!(
            "log-odds 超出范围: {} - {}",
            row.concept_id_1,
            row.concept_id_2
        );
    }

    let predicate = if ln_ratio > 0.0 {
        "biolink:positively_correlated_with"
    } else {
        "biolink:negatively_correlated_with"
    };

    Some(KgxEdge {
        subject: subject.mapping.biolink_id.clone(),
        predicate: predicate.to_string(),
        object: object.mapping.biolink_id.clone(),
        supporting_data_set: format!("COHD:dataset_{}", row.dataset_id),
        knowledge_level: KNOWLEDGE_LEVEL.to_string(),
        agent_type: AGENT_TYPE.to_string(),
        concept_pair_count: row.pair_count,
        concept_count_subject: row.count_1,
        concept_count_object: row.count_2,
        dataset_count: row.patient_count,
        unadjusted_p_value: p_value,
        bonferonni_adjusted_p_value: adj_p_value,
        expected_count,
        ln_ratio,
        ln_ratio_confidence_interval: ln_ratio_ci,
        relative_frequency_subject: cp / c1,
        relative_frequency_subject_confidence_interval: stats::rel_freq_ci(
            cp,
            c1,
            options.confidence,
            Some(JSON_INFINITY_REPLACEMENT),
        ),
        relative_frequency_object: cp / c2,
        relative_frequency_object_confidence_interval: stats::rel_freq_ci(
            cp,
            c2,
            options.confidence,
            Some(JSON_INFINITY_REPLACEMENT),
        ),
        log_odds_ratio: log_odds,
        log_odds_ratio_95_ci: log_odds_ci,
        sources: vec![
            KgxSource {
                resource_id: SUPPORTING_DATA_SOURCE.to_string(),
                resource_role: "supporting_data_source".to_string(),
                upstream_resource_ids: vec![],
            },
            KgxSource {
                resource_id: INFORES_ID.to_string(),
                resource_role: "primary_knowledge_source".to_string(),
                upstream_resource_ids: vec![SUPPORTING_DATA_SOURCE.to_string()],
            },
        ],
    })
}

fn node_for(lookup: &BiolinkLookup) -> KgxNode {
    let name = if lookup.mapping.biolink_label.is_empty() {
        lookup.mapping.omop_label.clone()
    } else {
        lookup.mapping.biolink_label.clone()
    };
    KgxNode {
        id: lookup.mapping.biolink_id.clone(),
        name,
        category: lookup.categories.clone(),
        omop_id: lookup.mapping.omop_id.clone(),
    }
}

/// 生成节点与边，节点按ID排序，只包含出现在边中的节点
pub fn build_graph(
    db: &Database,
    mapper: &BiolinkMapper,
    options: &KgxOptions,
) -> Result<(Vec<KgxNode>, Vec<KgxEdge>, usize)> {
    let rows = db.all_pair_counts(options.dataset_id, options.min_count)?;
    let n_tests = db.pair_total(options.dataset_id)?.unwrap_or(1).max(1) as f64;
    tracing::info!(
        "数据集 {} 中有 {} 个概念对超过计数阈值",
        options.dataset_id,
        rows.len()
    );

    let mut nodes: BTreeMap<String, KgxNode> = BTreeMap::new();
    let mut edges = Vec::new();

    for row in &rows {
        let (Some(subject), Some(object)) = (
            mapper.map_from_omop(row.concept_id_1),
            mapper.map_from_omop(row.concept_id_2),
        ) else {
            continue;
        };

        if let Some(edge) = association_edge(row, &subject, &object, n_tests, options) {
            for lookup in [&subject, &object] {
                nodes
                    .entry(lookup.mapping.biolink_id.clone())
                    .or_insert_with(|| node_for(lookup));
            }
            edges.push(edge);
        }
    }

    Ok((nodes.into_values().collect(), edges, rows.len()))
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// 导出到目录
pub fn export(
    db: &Database,
    mapper: &BiolinkMapper,
    options: &KgxOptions,
    output_dir: &Path,
) -> Result<KgxSummary> {
    std::fs::create_dir_all(output_dir)?;

    let (nodes, edges, pairs_scanned) = build_graph(db, mapper, options)?;
    write_jsonl(&output_dir.join(EDGES_FILE), &edges)?;
    write_jsonl(&output_dir.join(NODES_FILE), &nodes)?;

    tracing::info!(
        "KGX导出完成: {} 条边, {} 个节点 -> {}",
        edges.len(),
        nodes.len(),
        output_dir.display()
    );
    Ok(KgxSummary {
        pairs_scanned,
        edges: edges.len(),
        nodes: nodes.len(),
    })
}

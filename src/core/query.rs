//! 查询服务
//!
//! 每个COHD接口对应一个方法：解析参数、读取聚合计数、计算统计量。
//! 参数错误返回 `CohdError::BadRequest`，消息原样返回给调用方。

use crate::core::error::{CohdError, Result};
use crate::core::models::*;
use crate::core::params::{
    is_digits, Args, DATASET_ID_DEFAULT, DATASET_ID_DEFAULT_HIER, DATASET_ID_DEFAULT_TEMPORAL,
};
use crate::core::stats;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// 接口所属的服务
pub const SERVICES: [&str; 5] = [
    "metadata",
    "omop",
    "frequencies",
    "association",
    "temporal",
];

/// 时间分布计数区间的置信度
const TEMPORAL_CONFIDENCE: f64 = 0.99;

/// 查询服务
pub struct QueryService {
    db: Arc<crate::storage::database::Database>,
    default_confidence: f64,
}

impl QueryService {
    /// 创建查询服务
    pub fn new(db: Arc<crate::storage::database::Database>, default_confidence: f64) -> Self {
        Self {
            db,
            default_confidence,
        }
    }

    /// 按 service / meta 分派请求
    pub fn dispatch(&self, service: &str, meta: &str, args: &Args) -> Result<serde_json::Value> {
        tracing::debug!("查询 service={} meta={}", service, meta);
        match (service, meta) {
            ("metadata", "datasets") => to_json(self.datasets()?),
            ("metadata", "domainCounts") => to_json(self.domain_counts(args)?),
            ("metadata", "domainPairCounts") => to_json(self.domain_pair_counts(args)?),
            ("metadata", "patientCount" | "visitCount") => to_json(self.patient_count(args)?),

            ("omop", "findConceptIDs") => to_json(self.find_concept_ids(args)?),
            ("omop", "concepts") => to_json(self.concepts(args)?),
            ("omop", "conceptAncestors") => to_json(self.concept_ancestors(args)?),
            ("omop", "conceptDescendants") => to_json(self.concept_descendants(args)?),
            ("omop", "mapToStandardConceptID") => to_json(self.map_to_standard_concept_id(args)?),
            ("omop", "mapFromStandardConceptID") => {
                to_json(self.map_from_standard_concept_id(args)?)
            }
            ("omop", "vocabularies") => to_json(self.vocabularies()?),

            ("frequencies", "singleConceptFreq") => to_json(self.single_concept_freq(args)?),
            ("frequencies", "pairedConceptFreq") => to_json(self.paired_concept_freq(args)?),
            ("frequencies", "associatedConceptFreq") => {
                to_json(self.associated_concept_freq(args)?)
            }
            ("frequencies", "associatedConceptDomainFreq") => {
                to_json(self.associated_concept_domain_freq(args)?)
            }
            ("frequencies", "mostFrequentConcepts") => {
                to_json(self.most_frequent_concepts(args)?)
            }

            ("association", "chiSquare") => to_json(self.chi_square(args)?),
            ("association", "obsExpRatio") => to_json(self.obs_exp_ratio(args)?),
            ("association", "relativeFrequency") => to_json(self.relative_frequency(args)?),

            ("temporal", "conceptAgeCounts") => to_json(self.concept_age_counts(args)?),
            ("temporal", "conceptPairDeltaCounts") => {
                to_json(self.concept_pair_delta_counts(args)?)
            }

            (service, _) if SERVICES.contains(&service) => {
                Err(CohdError::bad_request("meta not recognized"))
            }
            _ => Err(CohdError::bad_request("service not recognized")),
        }
    }

    // -----------------------------------------------------------------------
    // metadata
    // -----------------------------------------------------------------------

    pub fn datasets(&self) -> Result<Results<Dataset>> {
        Ok(Results::new(self.db.datasets()?))
    }

    pub fn domain_counts(&self, args: &Args) -> Result<Results<DomainCount>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        Ok(Results::new(self.db.domain_counts(dataset_id)?))
    }

    pub fn domain_pair_counts(&self, args: &Args) -> Result<Results<DomainPairCount>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        Ok(Results::new(self.db.domain_pair_counts(dataset_id)?))
    }

    pub fn patient_count(&self, args: &Args) -> Result<Results<PatientCount>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        Ok(Results::new(self.db.patient_count(dataset_id)?))
    }

    // -----------------------------------------------------------------------
    // omop
    // -----------------------------------------------------------------------

    /// 按名称检索标准概念
    ///
    /// `min_count` 缺省为1；为0时不过滤；空白或不是整数时报错。
    pub fn find_concept_ids(&self, args: &Args) -> Result<Results<ConceptSearchResult>> {
        let query = args
            .text("q")
            .ok_or_else(|| CohdError::bad_request("q parameter is missing"))?;
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let domain_id = args.text("domain");

        let min_count = match args.raw("min_count") {
            None => Some(1),
            Some(raw) => {
                let raw = raw.trim();
                if !is_digits(raw) {
                    return Err(CohdError::bad_request(
                        "min_count parameter should be an integer",
                    ));
                }
                let min_count: i64 = raw.parse().map_err(|_| {
                    CohdError::bad_request("min_count parameter should be an integer")
                })?;
                (min_count > 0).then_some(min_count)
            }
        };

        Ok(Results::new(self.db.find_concepts(
            query, dataset_id, domain_id, min_count,
        )?))
    }

    pub fn concepts(&self, args: &Args) -> Result<Results<Concept>> {
        let concept_ids = args.concept_id_list("q")?;
        Ok(Results::new(self.db.concepts(&concept_ids)?))
    }

    pub fn concept_ancestors(&self, args: &Args) -> Result<Results<ConceptAncestor>> {
        let concept_id = args
            .concept_id("concept_id")
            .ok_or_else(|| CohdError::bad_request("No concept_id specified"))?;
        Ok(Results::new(self.db.concept_ancestors(
            concept_id,
            args.dataset_id(DATASET_ID_DEFAULT_HIER),
            args.text("vocabulary_id"),
            args.text("concept_class_id"),
        )?))
    }

    pub fn concept_descendants(&self, args: &Args) -> Result<Results<ConceptDescendant>> {
        let concept_id = args
            .concept_id("concept_id")
            .ok_or_else(|| CohdError::bad_request("No concept_id specified"))?;
        Ok(Results::new(self.db.concept_descendants(
            concept_id,
            args.dataset_id(DATASET_ID_DEFAULT_HIER),
            args.text("vocabulary_id"),
            args.text("concept_class_id"),
        )?))
    }

    pub fn map_to_standard_concept_id(
        &self,
        args: &Args,
    ) -> Result<Results<StandardConceptMapping>> {
        let concept_code = args
            .text("concept_code")
            .ok_or_else(|| CohdError::bad_request("No concept_code was specified"))?;
        Ok(Results::new(
            self.db
                .map_to_standard(concept_code, args.text("vocabulary_id"))?,
        ))
    }

    pub fn map_from_standard_concept_id(&self, args: &Args) -> Result<Results<SourceConcept>> {
        let concept_id = args
            .concept_id("concept_id")
            .ok_or_else(|| CohdError::bad_request("No concept_id was specified"))?;
        let vocabularies = args.list("vocabulary_id");
        Ok(Results::new(
            self.db
                .map_from_standard(concept_id, vocabularies.as_deref())?,
        ))
    }

    pub fn vocabularies(&self) -> Result<Results<Vocabulary>> {
        Ok(Results::new(self.db.vocabularies()?))
    }

    // -----------------------------------------------------------------------
    // frequencies
    // -----------------------------------------------------------------------

    pub fn single_concept_freq(&self, args: &Args) -> Result<Results<SingleConceptFreq>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let concept_ids = args.concept_id_list("q")?;
        Ok(Results::new(
            self.db.single_concept_counts(dataset_id, &concept_ids)?,
        ))
    }

    pub fn paired_concept_freq(&self, args: &Args) -> Result<Results<PairedConceptFreq>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let query = args
            .text("q")
            .ok_or_else(|| CohdError::bad_request("q parameter is missing"))?;

        let ids: Vec<&str> = query.split(',').map(str::trim).collect();
        let (concept_id_1, concept_id_2) = match ids.as_slice() {
            [a, b] if is_digits(a) && is_digits(b) => (a.parse().ok(), b.parse().ok()),
            _ => (None, None),
        };
        let (Some(concept_id_1), Some(concept_id_2)) = (concept_id_1, concept_id_2) else {
            return Err(CohdError::bad_request(
                "Error in q: should be two concept IDs, e.g., 4196636,437643",
            ));
        };

        Ok(Results::new(self.db.paired_concept_counts(
            dataset_id,
            concept_id_1,
            concept_id_2,
        )?))
    }

    pub fn associated_concept_freq(&self, args: &Args) -> Result<Results<AssociatedConceptFreq>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let query = args
            .text("q")
            .ok_or_else(|| CohdError::bad_request("q parameter is missing"))?;
        let concept_id = parse_id(query)
            .ok_or_else(|| CohdError::bad_request("Error in q: concept_id should be an integer"))?;

        Ok(Results::new(
            self.db
                .associated_concept_counts(dataset_id, concept_id, None)?,
        ))
    }

    pub fn associated_concept_domain_freq(
        &self,
        args: &Args,
    ) -> Result<Results<AssociatedConceptFreq>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let concept_id = args
            .text("concept_id")
            .ok_or_else(|| CohdError::bad_request("No concept_id selected"))?;
        let domain_id = args
            .text("domain")
            .ok_or_else(|| CohdError::bad_request("No domain selected"))?;
        let concept_id = parse_id(concept_id)
            .ok_or_else(|| CohdError::bad_request("concept_id should be numeric"))?;

        Ok(Results::new(self.db.associated_concept_counts(
            dataset_id,
            concept_id,
            Some(domain_id),
        )?))
    }

    /// 高频概念，`q` 为返回数量（缺省或非正数时不限制）
    pub fn most_frequent_concepts(&self, args: &Args) -> Result<Results<FrequentConcept>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let limit = args.text("q").and_then(parse_id).filter(|&n| n > 0);
        let vocabulary_ids = args.list("vocabulary_id");
        let concept_class_ids = args.list("concept_class_id");

        Ok(Results::new(self.db.most_frequent_concepts(
            dataset_id,
            limit,
            args.text("domain"),
            vocabulary_ids.as_deref(),
            concept_class_ids.as_deref(),
        )?))
    }

    // -----------------------------------------------------------------------
    // association
    // -----------------------------------------------------------------------

    /// 读取关联计算所需的计数行
    fn association_rows(&self, args: &Args) -> Result<(i64, Vec<PairCountRow>)> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT);
        let concept_id_1 = args
            .concept_id("concept_id_1")
            .ok_or_else(|| CohdError::bad_request("No concept_id_1 selected"))?;
        let concept_id_2 = args.concept_id("concept_id_2");

        let rows = self.db.association_counts(
            dataset_id,
            concept_id_1,
            concept_id_2,
            args.text("domain"),
        )?;
        Ok((dataset_id, rows))
    }

    /// 卡方检验，p值按数据集中的概念对总数做 Bonferroni 校正
    pub fn chi_square(&self, args: &Args) -> Result<Results<ChiSquareResult>> {
        let (dataset_id, rows) = self.association_rows(args)?;
        let n_tests = self.db.pair_total(dataset_id)?.unwrap_or(1).max(1) as f64;

        let mut results: Vec<ChiSquareResult> = rows
            .into_iter()
            .map(|r| {
                let (cpc, c1, c2, n) = (r.pair_count, r.count_1, r.count_2, r.patient_count);
                let cs = stats::chi_square(cpc as f64, c1 as f64, c2 as f64, n as f64);
                ChiSquareResult {
                    dataset_id: r.dataset_id,
                    concept_id_1: r.concept_id_1,
                    concept_id_2: r.concept_id_2,
                    n,
                    n_c1: c1,
                    n_c2: c2,
                    n_not_c1_not_c2: n - c1 - c2 + cpc,
                    n_c1_not_c2: c1 - cpc,
                    n_not_c1_c2: c2 - cpc,
                    n_c1_c2: cpc,
                    chi_square: cs.statistic,
                    p_value: cs.p_value,
                    adj_p_value: stats::bonferroni(cs.p_value, n_tests),
                    concept_2_name: r.concept_2_name,
                    concept_2_domain: r.concept_2_domain,
                }
            })
            .collect();

        results.sort_by(|a, b| descending(a.chi_square, b.chi_square));
        Ok(Results::new(results))
    }

    /// 观测/期望比（取对数）及其置信区间
    pub fn obs_exp_ratio(&self, args: &Args) -> Result<Results<ObsExpRatioResult>> {
        let (_, rows) = self.association_rows(args)?;
        let confidence = args.confidence(self.default_confidence)?;

        let mut results: Vec<ObsExpRatioResult> = rows
            .into_iter()
            .map(|r| {
                let (cpc, c1, c2, n) = (
                    r.pair_count as f64,
                    r.count_1 as f64,
                    r.count_2 as f64,
                    r.patient_count as f64,
                );
                let expected_count = c1 * c2 / n;
                let ln_ratio = (cpc * n / (c1 * c2)).ln();
                let ci = stats::ln_ratio_ci(cpc, ln_ratio, confidence, None);
                ObsExpRatioResult {
                    dataset_id: r.dataset_id,
                    concept_id_1: r.concept_id_1,
                    concept_id_2: r.concept_id_2,
                    observed_count: r.pair_count,
                    expected_count,
                    ln_ratio,
                    confidence_interval: (ci.0.max(stats::LN_RATIO_CI_FLOOR), ci.1),
                    concept_2_name: r.concept_2_name,
                    concept_2_domain: r.concept_2_domain,
                }
            })
            .collect();

        results.sort_by(|a, b| descending(a.ln_ratio, b.ln_ratio));
        Ok(Results::new(results))
    }

    /// 相对频率：概念对计数 / 概念2计数
    pub fn relative_frequency(&self, args: &Args) -> Result<Results<RelativeFrequencyResult>> {
        let (_, rows) = self.association_rows(args)?;
        let confidence = args.confidence(self.default_confidence)?;

        let mut results: Vec<RelativeFrequencyResult> = rows
            .into_iter()
            .map(|r| {
                let (pair, base) = (r.pair_count as f64, r.count_2 as f64);
                RelativeFrequencyResult {
                    dataset_id: r.dataset_id,
                    concept_id_1: r.concept_id_1,
                    concept_id_2: r.concept_id_2,
                    concept_pair_count: r.pair_count,
                    concept_2_count: r.count_2,
                    relative_frequency: pair / base,
                    confidence_interval: stats::rel_freq_ci(pair, base, confidence, None),
                    concept_2_name: r.concept_2_name,
                    concept_2_domain: r.concept_2_domain,
                }
            })
            .collect();

        results.sort_by(|a, b| descending(a.relative_frequency, b.relative_frequency));
        Ok(Results::new(results))
    }

    // -----------------------------------------------------------------------
    // temporal
    // -----------------------------------------------------------------------

    /// 概念首次出现时的年龄分布
    pub fn concept_age_counts(&self, args: &Args) -> Result<Results<ConceptAgeCounts>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT_TEMPORAL);
        let concept_id = args
            .concept_id("concept_id")
            .ok_or_else(|| CohdError::bad_request("concept_id parameter is missing"))?;

        let results = self
            .db
            .concept_age_counts(dataset_id, concept_id)?
            .into_iter()
            .map(|mut row| {
                row.confidence_interval = count_intervals(&row.counts);
                row
            })
            .collect();
        Ok(Results::new(results))
    }

    /// 源概念到目标概念的时间间隔分布
    pub fn concept_pair_delta_counts(
        &self,
        args: &Args,
    ) -> Result<Results<ConceptPairDeltaCounts>> {
        let dataset_id = args.dataset_id(DATASET_ID_DEFAULT_TEMPORAL);
        let source_concept_id = args
            .concept_id("source_concept_id")
            .ok_or_else(|| CohdError::bad_request("source_concept_id parameter is missing"))?;
        let target_concept_id = args
            .concept_id("target_concept_id")
            .ok_or_else(|| CohdError::bad_request("target_concept_id parameter is missing"))?;

        let results = self
            .db
            .delta_counts(dataset_id, source_concept_id, target_concept_id)?
            .into_iter()
            .map(|mut row| {
                row.confidence_interval = count_intervals(&row.counts);
                row
            })
            .collect();
        Ok(Results::new(results))
    }
}

/// 每箱计数的Poisson区间
fn count_intervals(counts: &[i64]) -> Vec<(i64, i64)> {
    counts
        .iter()
        .map(|&count| {
            let (lower, upper) = stats::poisson_interval(count as f64, TEMPORAL_CONFIDENCE);
            (lower as i64, upper as i64)
        })
        .collect()
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn parse_id(s: &str) -> Option<i64> {
    let s = s.trim();
    if is_digits(s) {
        s.parse().ok()
    } else {
        None
    }
}

/// 降序比较，NaN排在最后
fn descending(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::fixtures::*;

    fn service() -> QueryService {
        QueryService::new(Arc::new(sample_db()), stats::DEFAULT_CONFIDENCE)
    }

    fn bad_request(result: Result<serde_json::Value>) -> String {
        match result {
            Err(CohdError::BadRequest(msg)) => msg,
            other => panic!("expected bad request, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dispatch_errors() {
        let s = service();
        let args = Args::default();
        assert_eq!(bad_request(s.dispatch("foo", "bar", &args)), "service not recognized");
        assert_eq!(bad_request(s.dispatch("omop", "bar", &args)), "meta not recognized");
        assert_eq!(
            bad_request(s.dispatch("omop", "findConceptIDs", &args)),
            "q parameter is missing"
        );
        assert_eq!(
            bad_request(s.dispatch("association", "chiSquare", &args)),
            "No concept_id_1 selected"
        );
        assert_eq!(
            bad_request(s.dispatch("omop", "conceptAncestors", &args)),
            "No concept_id specified"
        );
        assert_eq!(
            bad_request(s.dispatch("omop", "mapToStandardConceptID", &args)),
            "No concept_code was specified"
        );
        assert_eq!(
            bad_request(s.dispatch("omop", "mapFromStandardConceptID", &args)),
            "No concept_id was specified"
        );
    }

    #[test]
    fn test_find_concept_ids_min_count() {
        let s = service();

        let args = Args::from_pairs([("q", "heart"), ("dataset_id", "2")]);
        assert!(s.find_concept_ids(&args).unwrap().results.is_empty());

        let args = Args::from_pairs([("q", "heart"), ("dataset_id", "2"), ("min_count", "0")]);
        assert_eq!(s.find_concept_ids(&args).unwrap().results.len(), 2);

        let args = Args::from_pairs([("q", "heart"), ("min_count", "100")]);
        let results = s.find_concept_ids(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].concept_id, HEART_DISEASE);

        for raw in ["-1", "", "  "] {
            let args = Args::from_pairs([("q", "heart"), ("min_count", raw)]);
            assert_eq!(
                s.find_concept_ids(&args).unwrap_err().to_string(),
                "min_count parameter should be an integer"
            );
        }
    }

    #[test]
    fn test_frequency_errors() {
        let s = service();

        let args = Args::from_pairs([("q", "313217")]);
        assert_eq!(
            s.paired_concept_freq(&args).unwrap_err().to_string(),
            "Error in q: should be two concept IDs, e.g., 4196636,437643"
        );

        let args = Args::from_pairs([("q", "abc")]);
        assert_eq!(
            s.associated_concept_freq(&args).unwrap_err().to_string(),
            "Error in q: concept_id should be an integer"
        );

        let args = Args::from_pairs([("concept_id", "313217")]);
        assert_eq!(
            s.associated_concept_domain_freq(&args).unwrap_err().to_string(),
            "No domain selected"
        );
        let args = Args::from_pairs([("concept_id", "x"), ("domain", "Drug")]);
        assert_eq!(
            s.associated_concept_domain_freq(&args).unwrap_err().to_string(),
            "concept_id should be numeric"
        );
    }

    #[test]
    fn test_paired_concept_freq_any_order() {
        let s = service();
        let args = Args::from_pairs([("q", "316139, 313217")]);
        let results = s.paired_concept_freq(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].concept_id_1, AFIB);
        assert_eq!(results[0].concept_count, 30);
        assert!((results[0].concept_frequency - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_chi_square_pair() {
        let s = service();
        let args = Args::from_pairs([
            ("concept_id_1", AFIB.to_string()),
            ("concept_id_2", HEART_FAILURE.to_string()),
        ]);
        let results = s.chi_square(&args).unwrap().results;
        assert_eq!(results.len(), 1);

        let r = &results[0];
        assert_eq!((r.n, r.n_c1, r.n_c2, r.n_c1_c2), (1000, 100, 80, 30));
        assert_eq!(r.n_not_c1_not_c2, 850);
        assert_eq!(r.n_c1_not_c2, 70);
        assert_eq!(r.n_not_c1_c2, 50);
        assert!((r.chi_square - 73.0676).abs() < 1e-3);
        // 6个概念对
        assert!((r.adj_p_value - (r.p_value * 6.0).min(1.0)).abs() < 1e-15);
        assert!(r.concept_2_name.is_none());

        let json = serde_json::to_value(r).unwrap();
        assert!(json.get("n_~c1_~c2").is_some());
        assert!(json.get("adj_p-value").is_some());
        assert!(json.get("concept_2_name").is_none());
    }

    #[test]
    fn test_chi_square_sorted_with_names() {
        let s = service();
        let args = Args::from_pairs([("concept_id_1", AFIB.to_string())]);
        let results = s.chi_square(&args).unwrap().results;
        assert_eq!(results.len(), 3);
        assert!(results
            .windows(2)
            .all(|w| w[0].chi_square >= w[1].chi_square));
        assert!(results.iter().all(|r| r.concept_2_name.is_some()));
    }

    #[test]
    fn test_obs_exp_ratio_orientation() {
        let s = service();
        let args = Args::from_pairs([
            ("concept_id_1", HEART_FAILURE.to_string()),
            ("concept_id_2", AFIB.to_string()),
        ]);
        let results = s.obs_exp_ratio(&args).unwrap().results;
        assert_eq!(results.len(), 1);

        let r = &results[0];
        assert_eq!(r.concept_id_1, HEART_FAILURE);
        assert_eq!(r.concept_id_2, AFIB);
        assert!((r.expected_count - 8.0).abs() < 1e-12);
        assert!((r.ln_ratio - 3.75f64.ln()).abs() < 1e-12);
        let expected_ci = stats::ln_ratio_ci(30.0, r.ln_ratio, 0.99, None);
        assert_eq!(r.confidence_interval, expected_ci);
        assert!(r.confidence_interval.0 < r.ln_ratio && r.ln_ratio < r.confidence_interval.1);
    }

    #[test]
    fn test_obs_exp_ratio_confidence_errors() {
        let s = service();
        let args = Args::from_pairs([("concept_id_1", "313217"), ("confidence", "abc")]);
        assert_eq!(
            s.obs_exp_ratio(&args).unwrap_err().to_string(),
            "Confidence is not a number 0-1"
        );
        let args = Args::from_pairs([("concept_id_1", "313217"), ("confidence", "1.5")]);
        assert_eq!(
            s.relative_frequency(&args).unwrap_err().to_string(),
            "Confidence should be a number between 0-1"
        );
    }

    #[test]
    fn test_missing_concept_id_1_reported_before_confidence() {
        let s = service();
        let args = Args::from_pairs([("confidence", "abc")]);
        assert_eq!(
            s.obs_exp_ratio(&args).unwrap_err().to_string(),
            "No concept_id_1 selected"
        );
        assert_eq!(
            s.relative_frequency(&args).unwrap_err().to_string(),
            "No concept_id_1 selected"
        );
    }

    #[test]
    fn test_relative_frequency_uses_concept_2_count() {
        let s = service();
        let args = Args::from_pairs([
            ("concept_id_1", AFIB.to_string()),
            ("concept_id_2", HEART_FAILURE.to_string()),
        ]);
        let r = &s.relative_frequency(&args).unwrap().results[0];
        assert_eq!(r.concept_2_count, 80);
        assert!((r.relative_frequency - 0.375).abs() < 1e-12);

        let args = Args::from_pairs([
            ("concept_id_1", HEART_FAILURE.to_string()),
            ("concept_id_2", AFIB.to_string()),
        ]);
        let r = &s.relative_frequency(&args).unwrap().results[0];
        assert_eq!(r.concept_2_count, 100);
        assert!((r.relative_frequency - 0.3).abs() < 1e-12);
        assert_eq!(
            r.confidence_interval,
            stats::rel_freq_ci(30.0, 100.0, 0.99, None)
        );
    }

    #[test]
    fn test_relative_frequency_domain_filter_sorted() {
        let s = service();
        let args = Args::from_pairs([("concept_id_1", AFIB.to_string()), ("domain", "Condition".to_string())]);
        let results = s.relative_frequency(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].concept_2_name.as_deref(), Some("Heart failure"));

        let args = Args::from_pairs([("concept_id_1", AFIB.to_string())]);
        let results = s.relative_frequency(&args).unwrap().results;
        let freqs: Vec<f64> = results.iter().map(|r| r.relative_frequency).collect();
        // 40/60, 30/80, 50/200
        assert_eq!(freqs.len(), 3);
        assert!((freqs[0] - 40.0 / 60.0).abs() < 1e-12);
        assert!((freqs[2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_map_between_source_and_standard() {
        let s = service();
        let args = Args::from_pairs([("concept_code", "427.31"), ("vocabulary_id", "ICD9CM")]);
        let results = s.map_to_standard_concept_id(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].standard_concept_id, AFIB);

        let args = Args::from_pairs([("concept_id", AFIB.to_string())]);
        let results = s.map_from_standard_concept_id(&args).unwrap().results;
        assert_eq!(
            results.iter().map(|r| r.concept_id).collect::<Vec<_>>(),
            vec![AFIB_ICD10, AFIB_ICD9]
        );

        let args = Args::from_pairs([
            ("concept_id", AFIB.to_string()),
            ("vocabulary_id", "ICD9CM".to_string()),
        ]);
        let results = s.map_from_standard_concept_id(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].concept_code, "427.31");
    }

    #[test]
    fn test_concept_age_counts_intervals() {
        let s = service();
        assert_eq!(
            bad_request(s.dispatch("temporal", "conceptAgeCounts", &Args::default())),
            "concept_id parameter is missing"
        );

        let args = Args::from_pairs([("concept_id", AFIB.to_string())]);
        let results = s.concept_age_counts(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        let ages = &results[0];
        assert_eq!(ages.dataset_id, DATASET_ID_DEFAULT_TEMPORAL);
        assert_eq!(ages.counts, vec![1, 12, 32, 45]);
        assert_eq!(ages.confidence_interval.len(), ages.counts.len());
        assert_eq!(ages.confidence_interval[0], (0, 4));
        for (&count, &(lower, upper)) in ages.counts.iter().zip(&ages.confidence_interval) {
            assert!(lower <= count && count <= upper);
        }

        let args = Args::from_pairs([("concept_id", WARFARIN.to_string())]);
        assert!(s.concept_age_counts(&args).unwrap().results.is_empty());
    }

    #[test]
    fn test_concept_pair_delta_counts() {
        let s = service();
        let args = Args::from_pairs([("target_concept_id", AFIB.to_string())]);
        assert_eq!(
            bad_request(s.dispatch("temporal", "conceptPairDeltaCounts", &args)),
            "source_concept_id parameter is missing"
        );
        let args = Args::from_pairs([("source_concept_id", AFIB.to_string())]);
        assert_eq!(
            bad_request(s.dispatch("temporal", "conceptPairDeltaCounts", &args)),
            "target_concept_id parameter is missing"
        );

        let args = Args::from_pairs([
            ("source_concept_id", WARFARIN.to_string()),
            ("target_concept_id", AFIB.to_string()),
        ]);
        let results = s.concept_pair_delta_counts(&args).unwrap().results;
        assert_eq!(results.len(), 1);
        let deltas = &results[0];
        assert_eq!(deltas.source_concept_id, WARFARIN);
        assert_eq!(deltas.counts, vec![3, 7, 9, 4, 2]);
        assert_eq!(deltas.confidence_interval.len(), 5);
        let (lower, upper) = stats::poisson_interval(9.0, 0.99);
        assert_eq!(deltas.confidence_interval[2], (lower as i64, upper as i64));

        let args = Args::from_pairs([
            ("source_concept_id", AFIB.to_string()),
            ("target_concept_id", HEART_FAILURE.to_string()),
        ]);
        assert!(s.concept_pair_delta_counts(&args).unwrap().results.is_empty());
    }

    #[test]
    fn test_descending_nan_last() {
        let mut v = vec![1.0, f64::NAN, 3.0, 2.0];
        v.sort_by(|a, b| descending(*a, *b));
        assert_eq!(&v[..3], &[3.0, 2.0, 1.0]);
        assert!(v[3].is_nan());
    }
}

//! OMOP与Biolink模型之间的映射
//!
//! - OMOP domain 与 Biolink 类别之间的固定对照表
//! - `BiolinkMapper`：内存中的首选映射表，以及从词表重建映射的流程
//!
//! 条件类概念通过 SNOMED / ICD / MedDRA 编码经 Node Normalizer 归一化；
//! 非成分的 RxNorm 药物直接使用 RXCUI；药物成分经 MeSH 归一化；
//! 操作类概念直接使用 CPT / HCPCS / ICD9CM / MedDRA / SNOMED 编码。

use crate::core::error::{CohdError, Result};
use crate::core::models::{
    BiolinkLookup, BiolinkMappingRow, BuildStatus, Concept, DomainClass, MappingBuild,
    OmopBiolinkMapping,
};
use crate::core::normalizer::{NodeNormalizer, NormalizedNode};
use crate::storage::database::Database;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// 无法映射时使用的Biolink类别
pub const DEFAULT_BLM_CLASS: &str = "biolink:NamedThing";

/// 新映射数量低于旧映射的该比例时保留旧映射
const RETENTION_RATIO: f64 = 0.95;

/// 操作类概念使用的词表
const PROCEDURE_VOCABULARIES: [&str; 5] = ["CPT4", "HCPCS", "ICD9CM", "MedDRA", "SNOMED"];

/// Biolink类别 -> OMOP domain
static BLM_CLASS_TO_DOMAIN: Lazy<HashMap<&'static str, Vec<DomainClass>>> = Lazy::new(|| {
    let ingredient = || vec![DomainClass::new("Drug", Some("Ingredient"))];
    let condition = || vec![DomainClass::new("Condition", None)];
    HashMap::from([
        ("biolink:ChemicalEntity", ingredient()),
        ("biolink:Device", vec![DomainClass::new("Device", None)]),
        ("biolink:DiseaseOrPhenotypicFeature", condition()),
        ("biolink:Disease", condition()),
        ("biolink:PhenotypicFeature", condition()),
        ("biolink:Drug", vec![DomainClass::new("Drug", None)]),
        ("biolink:MolecularEntity", ingredient()),
        (
            "biolink:Phenomenon",
            vec![
                DomainClass::new("Measurement", None),
                DomainClass::new("Observation", None),
            ],
        ),
        (
            "biolink:PopulationOfIndividualOrganisms",
            vec![
                DomainClass::new("Ethnicity", None),
                DomainClass::new("Gender", None),
                DomainClass::new("Race", None),
            ],
        ),
        ("biolink:Procedure", vec![DomainClass::new("Procedure", None)]),
        ("biolink:SmallMolecule", ingredient()),
    ])
});

/// OMOP (domain, concept_class) -> Biolink类别，按优先顺序排列
static DOMAIN_TO_BLM_CLASSES: Lazy<HashMap<DomainClass, Vec<&'static str>>> = Lazy::new(|| {
    let population = vec!["biolink:PopulationOfIndividualOrganisms"];
    HashMap::from([
        (
            DomainClass::new("Condition", None),
            vec![
                "biolink:DiseaseOrPhenotypicFeature",
                "biolink:Disease",
                "biolink:PhenotypicFeature",
            ],
        ),
        (DomainClass::new("Device", None), vec!["biolink:Device"]),
        (
            DomainClass::new("Drug", None),
            vec![
                "biolink:Drug",
                "biolink:MolecularEntity",
                "biolink:ChemicalEntity",
                "biolink:SmallMolecule",
            ],
        ),
        (
            DomainClass::new("Drug", Some("Ingredient")),
            vec![
                "biolink:MolecularEntity",
                "biolink:ChemicalEntity",
                "biolink:SmallMolecule",
            ],
        ),
        (DomainClass::new("Ethnicity", None), population.clone()),
        (DomainClass::new("Gender", None), population.clone()),
        (DomainClass::new("Measurement", None), vec!["biolink:Phenomenon"]),
        (DomainClass::new("Observation", None), vec!["biolink:Phenomenon"]),
        (DomainClass::new("Procedure", None), vec!["biolink:Procedure"]),
        (DomainClass::new("Race", None), population),
    ])
});

/// Biolink类别映射到OMOP domain，例如 `biolink:Disease` -> `Condition`
pub fn map_blm_class_to_omop_domain(blm_class: &str) -> Option<Vec<DomainClass>> {
    BLM_CLASS_TO_DOMAIN.get(blm_class).cloned()
}

/// OMOP domain 映射到 Biolink 类别
///
/// 先按 (domain, concept_class) 查找，再退回 (domain, None)，都找不到时为 `biolink:NamedThing`。
/// 给定 `desired` 时返回优先列表中第一个出现在 `desired` 里的类别，否则返回优先列表的第一个。
pub fn map_omop_domain_to_blm_class(
    domain_id: &str,
    concept_class_id: Option<&str>,
    desired: Option<&[String]>,
) -> String {
    let preferred = DOMAIN_TO_BLM_CLASSES
        .get(&DomainClass::new(domain_id, concept_class_id))
        .or_else(|| DOMAIN_TO_BLM_CLASSES.get(&DomainClass::new(domain_id, None)));

    let Some(preferred) = preferred else {
        return DEFAULT_BLM_CLASS.to_string();
    };

    let chosen = desired
        .and_then(|desired| {
            preferred
                .iter()
                .find(|class| desired.iter().any(|d| d == *class))
        })
        .or_else(|| preferred.first())
        .copied()
        .unwrap_or(DEFAULT_BLM_CLASS);
    chosen.to_string()
}

/// OMOP词表 -> Biolink前缀
pub fn biolink_prefix(vocabulary_id: &str) -> Option<&'static str> {
    match vocabulary_id {
        "ICD10CM" => Some("ICD10"),
        "ICD9CM" => Some("ICD9"),
        "MedDRA" => Some("MEDDRA"),
        "SNOMED" => Some("SNOMEDCT"),
        "HCPCS" => Some("HCPCS"),
        "CPT4" => Some("CPT"),
        _ => None,
    }
}

/// Ratcliff/Obershelp 字符串相似度，取值 [0, 1]
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, k) = longest_match(a, b);
    if k == 0 {
        return 0;
    }
    k + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + k..], &b[j + k..])
}

/// 最长公共子串 (a起点, b起点, 长度)，长度相同时取最靠前的
fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        let mut cur = vec![0usize; b.len() + 1];
        for j in 0..b.len() {
            if a[i] == b[j] {
                let k = prev[j] + 1;
                cur[j + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        prev = cur;
    }
    best
}

/// 从归一化结果构造映射行
fn normalized_mapping(omop_id: i64, omop_label: &str, curie: &str, node: &NormalizedNode) -> BiolinkMappingRow {
    let normalized_id = node.canonical_id();
    let biolink_label = node.normalized_identifier.label.clone();
    let mut provenance = format!("OMOP:{}-{}", omop_id, curie);
    let mut distance = 0;
    if curie != normalized_id {
        provenance.push_str(&format!("-{}", normalized_id));
        distance += 1;
    }

    BiolinkMappingRow {
        omop_id,
        biolink_id: normalized_id.to_string(),
        string_similarity: string_similarity(omop_label, &biolink_label),
        biolink_label,
        categories: node.categories.clone(),
        provenance,
        distance,
        preferred: false,
        concept_name: None,
    }
}

/// 直接使用词表编码构造映射行
fn direct_mapping(concept: &Concept, curie: String, category: &str) -> BiolinkMappingRow {
    BiolinkMappingRow {
        omop_id: concept.concept_id,
        provenance: format!("OMOP:{}-{}", concept.concept_id, curie),
        biolink_id: curie,
        biolink_label: concept.concept_name.clone(),
        categories: vec![category.to_string()],
        distance: 0,
        string_similarity: 1.0,
        preferred: false,
        concept_name: None,
    }
}

/// 每个Biolink ID选出一个首选映射：距离最小，其次相似度最高，再次概念计数最高
pub fn mark_preferred(mappings: &mut [BiolinkMappingRow], counts: &HashMap<i64, i64>) {
    let count = |m: &BiolinkMappingRow| counts.get(&m.omop_id).copied().unwrap_or(0);
    let better = |a: &BiolinkMappingRow, b: &BiolinkMappingRow| {
        b.distance
            .cmp(&a.distance)
            .then(
                a.string_similarity
                    .partial_cmp(&b.string_similarity)
                    .unwrap_or(Ordering::Equal),
            )
            .then(count(a).cmp(&count(b)))
            .then(b.omop_id.cmp(&a.omop_id))
            == Ordering::Greater
    };

    let mut best: HashMap<&str, usize> = HashMap::new();
    for (idx, m) in mappings.iter().enumerate() {
        match best.get(m.biolink_id.as_str()) {
            Some(&current) if !better(m, &mappings[current]) => {}
            _ => {
                best.insert(m.biolink_id.as_str(), idx);
            }
        }
    }

    let preferred: Vec<usize> = best.into_values().collect();
    for m in mappings.iter_mut() {
        m.preferred = false;
    }
    for idx in preferred {
        mappings[idx].preferred = true;
    }
}

/// OMOP-Biolink 映射器
pub struct BiolinkMapper {
    db: Arc<Database>,
    normalizer: Arc<dyn NodeNormalizer>,
    by_omop: RwLock<HashMap<i64, BiolinkMappingRow>>,
    by_biolink: RwLock<HashMap<String, BiolinkMappingRow>>,
}

impl BiolinkMapper {
    /// 创建映射器并预取首选映射
    pub fn new(db: Arc<Database>, normalizer: Arc<dyn NodeNormalizer>) -> Result<Self> {
        let mapper = Self {
            db,
            normalizer,
            by_omop: RwLock::new(HashMap::new()),
            by_biolink: RwLock::new(HashMap::new()),
        };
        mapper.prefetch()?;
        Ok(mapper)
    }

    /// 从数据库重新加载首选映射，返回加载数量
    pub fn prefetch(&self) -> Result<usize> {
        let rows = self.db.preferred_mappings()?;
        Ok(self.install(rows))
    }

    /// 替换内存中的首选映射表
    fn install(&self, rows: Vec<BiolinkMappingRow>) -> usize {
        let by_omop = rows.iter().map(|r| (r.omop_id, r.clone())).collect();
        let by_biolink = rows
            .iter()
            .map(|r| (r.biolink_id.clone(), r.clone()))
            .collect();
        *self.by_omop.write() = by_omop;
        *self.by_biolink.write() = by_biolink;

        tracing::info!("已加载 {} 条首选Biolink映射", rows.len());
        rows.len()
    }

    /// 最近的映射重建记录
    pub fn recent_builds(&self, limit: usize) -> Result<Vec<MappingBuild>> {
        self.db.recent_mapping_builds(limit)
    }

    /// 按ID查找映射重建记录
    pub fn find_build(&self, build_id: &str) -> Result<Option<MappingBuild>> {
        self.db.mapping_build(build_id)
    }

    /// 内存中的映射数量
    pub fn len(&self) -> usize {
        self.by_omop.read().len()
    }

    /// OMOP概念映射到Biolink
    pub fn map_from_omop(&self, concept_id: i64) -> Option<BiolinkLookup> {
        let by_omop = self.by_omop.read();
        let r = by_omop.get(&concept_id)?;
        Some(BiolinkLookup {
            mapping: OmopBiolinkMapping {
                omop_id: format!("OMOP:{}", concept_id),
                biolink_id: r.biolink_id.clone(),
                omop_label: r.concept_name.clone().unwrap_or_default(),
                biolink_label: r.biolink_label.clone(),
                provenance: r.provenance.clone(),
                distance: r.distance,
            },
            categories: r.categories.clone(),
        })
    }

    /// 一组Biolink CURIE映射到OMOP
    ///
    /// 输入CURIE不是规范标识符时距离加1。Node Normalizer 调用失败时所有结果为 None。
    pub async fn map_to_omop(&self, curies: &[String]) -> HashMap<String, Option<OmopBiolinkMapping>> {
        let mut mappings: HashMap<String, Option<OmopBiolinkMapping>> =
            curies.iter().map(|c| (c.clone(), None)).collect();

        let nodes = match self.normalizer.get_normalized_nodes(curies).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!("调用 Node Normalizer 失败: {}", e);
                return mappings;
            }
        };

        let by_biolink = self.by_biolink.read();
        for curie in curies {
            let Some(Some(node)) = nodes.get(curie) else {
                continue;
            };
            let canonical = node.canonical_id();
            let Some(r) = by_biolink.get(canonical) else {
                continue;
            };

            let distance = r.distance + i64::from(curie != canonical);
            mappings.insert(
                curie.clone(),
                Some(OmopBiolinkMapping {
                    omop_id: format!("OMOP:{}", r.omop_id),
                    biolink_id: curie.clone(),
                    omop_label: r.concept_name.clone().unwrap_or_default(),
                    biolink_label: node.label_for(curie).unwrap_or_default().to_string(),
                    provenance: r.provenance.clone(),
                    distance,
                }),
            );
        }
        mappings
    }

    /// 重建OMOP-Biolink映射
    ///
    /// Node Normalizer 失败时记录为 `Failed` 并保留旧映射；数据库错误直接返回。
    pub async fn build_mappings(&self) -> Result<MappingBuild> {
        let build_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!("开始重建OMOP-Biolink映射: {}", build_id);

        let previous_count = self.with_db(|db| db.mapping_count()).await?;

        let (status, new_count) = match self.collect_mappings().await {
            Ok(mut mappings) => {
                let new_count = mappings.len() as i64;
                if (new_count as f64) < RETENTION_RATIO * previous_count as f64 {
                    (BuildStatus::Retained, new_count)
                } else {
                    let preferred = self
                        .with_db(move |db| {
                            let counts = db.max_concept_counts()?;
                            mark_preferred(&mut mappings, &counts);
                            db.replace_mappings(&mappings)?;
                            db.preferred_mappings()
                        })
                        .await?;
                    self.install(preferred);
                    (BuildStatus::Updated, new_count)
                }
            }
            Err(e @ CohdError::Database(_)) => return Err(e),
            Err(e) => {
                tracing::error!("重建映射失败: {}", e);
                (BuildStatus::Failed, 0)
            }
        };

        let build = MappingBuild {
            build_id,
            started_at,
            finished_at: Utc::now(),
            previous_count,
            new_count,
            status,
        };
        let record = build.clone();
        self.with_db(move |db| db.save_mapping_build(&record)).await?;
        tracing::info!("{}", build.status_message().replace('\n', "; "));
        Ok(build)
    }

    /// 在阻塞线程池中执行数据库操作，避免占用异步工作线程
    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(anyhow::Error::from)?
    }

    /// 生成全部候选映射
    async fn collect_mappings(&self) -> Result<Vec<BiolinkMappingRow>> {
        let mut mappings = Vec::new();

        // 条件：SNOMED / ICD / MedDRA 编码经归一化
        tracing::info!("映射条件类概念");
        let candidates: Vec<(Concept, String)> = self
            .with_db(|db| db.active_concepts("Condition", &[], None))
            .await?
            .into_iter()
            .filter_map(|c| {
                let prefix = biolink_prefix(&c.vocabulary_id)?;
                let curie = format!("{}:{}", prefix, c.concept_code);
                Some((c, curie))
            })
            .collect();
        let curies: Vec<String> = candidates.iter().map(|(_, curie)| curie.clone()).collect();
        let normalized = self.normalizer.get_normalized_nodes(&curies).await?;
        for (concept, curie) in &candidates {
            if let Some(Some(node)) = normalized.get(curie) {
                mappings.push(normalized_mapping(
                    concept.concept_id,
                    &concept.concept_name,
                    curie,
                    node,
                ));
            }
        }

        // 非成分药物：RXCUI
        tracing::info!("映射药物概念");
        for concept in self
            .with_db(|db| db.active_concepts("Drug", &["RxNorm"], Some(("Ingredient", false))))
            .await?
        {
            let curie = format!("RXCUI:{}", concept.concept_code);
            mappings.push(direct_mapping(&concept, curie, "biolink:Drug"));
        }

        // 药物成分：取第一个能归一化的MeSH编码
        tracing::info!("映射药物成分概念");
        let mut ingredients: Vec<(i64, String, Vec<String>)> = Vec::new();
        for (omop_id, name, mesh_code) in self.with_db(|db| db.ingredient_mesh_codes()).await? {
            let curie = format!("MESH:{}", mesh_code);
            match ingredients.last_mut() {
                Some((last_id, _, codes)) if *last_id == omop_id => codes.push(curie),
                _ => ingredients.push((omop_id, name, vec![curie])),
            }
        }
        let curies: Vec<String> = ingredients
            .iter()
            .flat_map(|(_, _, codes)| codes.iter().cloned())
            .collect();
        if !curies.is_empty() {
            let normalized = self.normalizer.get_normalized_nodes(&curies).await?;
            for (omop_id, name, codes) in &ingredients {
                let first = codes
                    .iter()
                    .find_map(|curie| normalized.get(curie)?.as_ref().map(|node| (curie, node)));
                if let Some((curie, node)) = first {
                    mappings.push(normalized_mapping(*omop_id, name, curie, node));
                }
            }
        }

        // 操作：直接使用词表编码
        tracing::info!("映射操作类概念");
        for concept in self
            .with_db(|db| db.active_concepts("Procedure", &PROCEDURE_VOCABULARIES, None))
            .await?
        {
            if let Some(prefix) = biolink_prefix(&concept.vocabulary_id) {
                let curie = format!("{}:{}", prefix, concept.concept_code);
                mappings.push(direct_mapping(&concept, curie, "biolink:Procedure"));
            }
        }

        Ok(mappings)
    }
}

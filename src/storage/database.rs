//! 数据库存储模块
//!
//! 使用SQLite存储COHD聚合计数、OMOP词表和Biolink映射。
//! 计数表由外部ETL写入，本服务只读；`biolink_mappings` 与 `mapping_builds` 由服务自己维护。

use crate::core::error::{CohdError, Result};
use crate::core::models::*;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

/// 查询结果上限
pub const RESULT_LIMIT: i64 = 1000;

/// 数据库管理器
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开或创建数据库
    pub fn open(path: &Path) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 初始化表结构
    fn init_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            -- 数据集
            CREATE TABLE IF NOT EXISTS dataset (
                dataset_id INTEGER PRIMARY KEY,
                dataset_name TEXT NOT NULL,
                dataset_description TEXT NOT NULL DEFAULT ''
            );

            -- OMOP概念
            CREATE TABLE IF NOT EXISTS concept (
                concept_id INTEGER PRIMARY KEY,
                concept_name TEXT NOT NULL,
                domain_id TEXT NOT NULL,
                vocabulary_id TEXT NOT NULL,
                concept_class_id TEXT NOT NULL,
                standard_concept TEXT,
                concept_code TEXT NOT NULL
            );

            -- 单概念计数
            CREATE TABLE IF NOT EXISTS concept_counts (
                dataset_id INTEGER NOT NULL,
                concept_id INTEGER NOT NULL,
                concept_count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id)
            );

            -- 概念对计数（concept_id_1 < concept_id_2）
            CREATE TABLE IF NOT EXISTS concept_pair_counts (
                dataset_id INTEGER NOT NULL,
                concept_id_1 INTEGER NOT NULL,
                concept_id_2 INTEGER NOT NULL,
                concept_count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id_1, concept_id_2),
                CHECK (concept_id_1 < concept_id_2)
            );

            -- 患者数
            CREATE TABLE IF NOT EXISTS patient_count (
                dataset_id INTEGER PRIMARY KEY,
                count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS domain_concept_counts (
                dataset_id INTEGER NOT NULL,
                domain_id TEXT NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, domain_id)
            );

            CREATE TABLE IF NOT EXISTS domain_pair_concept_counts (
                dataset_id INTEGER NOT NULL,
                domain_id_1 TEXT NOT NULL,
                domain_id_2 TEXT NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, domain_id_1, domain_id_2)
            );

            CREATE TABLE IF NOT EXISTS concept_ancestor (
                ancestor_concept_id INTEGER NOT NULL,
                descendant_concept_id INTEGER NOT NULL,
                min_levels_of_separation INTEGER NOT NULL,
                max_levels_of_separation INTEGER NOT NULL,
                PRIMARY KEY (ancestor_concept_id, descendant_concept_id)
            );

            CREATE TABLE IF NOT EXISTS concept_relationship (
                concept_id_1 INTEGER NOT NULL,
                concept_id_2 INTEGER NOT NULL,
                relationship_id TEXT NOT NULL,
                PRIMARY KEY (concept_id_1, concept_id_2, relationship_id)
            );

            -- 概念年龄分布的分箱方案
            CREATE TABLE IF NOT EXISTS concept_age_schemes (
                dataset_id INTEGER NOT NULL,
                concept_id INTEGER NOT NULL,
                bin_width INTEGER NOT NULL,
                bins INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id)
            );

            CREATE TABLE IF NOT EXISTS concept_age_counts (
                dataset_id INTEGER NOT NULL,
                concept_id INTEGER NOT NULL,
                bin INTEGER NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id, bin)
            );

            -- 概念对时间间隔的分箱方案（bin 取值 -n..=n）
            CREATE TABLE IF NOT EXISTS delta_schemes (
                dataset_id INTEGER NOT NULL,
                concept_id_1 INTEGER NOT NULL,
                concept_id_2 INTEGER NOT NULL,
                bin_width INTEGER NOT NULL,
                n INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id_1, concept_id_2),
                CHECK (concept_id_1 < concept_id_2)
            );

            CREATE TABLE IF NOT EXISTS delta_counts (
                dataset_id INTEGER NOT NULL,
                concept_id_1 INTEGER NOT NULL,
                concept_id_2 INTEGER NOT NULL,
                bin INTEGER NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, concept_id_1, concept_id_2, bin)
            );

            -- OMOP-Biolink映射
            CREATE TABLE IF NOT EXISTS biolink_mappings (
                omop_id INTEGER NOT NULL,
                biolink_id TEXT NOT NULL,
                biolink_label TEXT NOT NULL,
                categories TEXT NOT NULL,
                provenance TEXT NOT NULL,
                distance INTEGER NOT NULL,
                string_similarity REAL NOT NULL,
                preferred INTEGER NOT NULL DEFAULT 0
            );

            -- 映射重建历史
            CREATE TABLE IF NOT EXISTS mapping_builds (
                build_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                previous_count INTEGER NOT NULL,
                new_count INTEGER NOT NULL,
                status TEXT NOT NULL
            );

            -- 创建索引
            CREATE INDEX IF NOT EXISTS idx_concept_name ON concept(concept_name);
            CREATE INDEX IF NOT EXISTS idx_concept_code ON concept(concept_code, vocabulary_id);
            CREATE INDEX IF NOT EXISTS idx_pair_counts_2 ON concept_pair_counts(dataset_id, concept_id_2);
            CREATE INDEX IF NOT EXISTS idx_ancestor_desc ON concept_ancestor(descendant_concept_id);
            CREATE INDEX IF NOT EXISTS idx_relationship_2 ON concept_relationship(concept_id_2, relationship_id);
            CREATE INDEX IF NOT EXISTS idx_mappings_omop ON biolink_mappings(omop_id);
            CREATE INDEX IF NOT EXISTS idx_mappings_biolink ON biolink_mappings(biolink_id);
            CREATE INDEX IF NOT EXISTS idx_builds_started ON mapping_builds(started_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// 执行查询并收集所有行
    fn query_rows<T, F>(&self, sql: &str, values: Vec<Value>, f: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(values), f)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // metadata
    // -----------------------------------------------------------------------

    /// 所有数据集
    pub fn datasets(&self) -> Result<Vec<Dataset>> {
        self.query_rows(
            "SELECT dataset_id, dataset_name, dataset_description FROM dataset ORDER BY dataset_id",
            vec![],
            |row| {
                Ok(Dataset {
                    dataset_id: row.get(0)?,
                    dataset_name: row.get(1)?,
                    dataset_description: row.get(2)?,
                })
            },
        )
    }

    /// 各domain的概念数
    pub fn domain_counts(&self, dataset_id: i64) -> Result<Vec<DomainCount>> {
        self.query_rows(
            r#"
            SELECT dataset_id, domain_id, count
            FROM domain_concept_counts
            WHERE dataset_id = ?1
            ORDER BY domain_id
            "#,
            vec![dataset_id.into()],
            |row| {
                Ok(DomainCount {
                    dataset_id: row.get(0)?,
                    domain_id: row.get(1)?,
                    count: row.get(2)?,
                })
            },
        )
    }

    /// 各domain对的概念对数
    pub fn domain_pair_counts(&self, dataset_id: i64) -> Result<Vec<DomainPairCount>> {
        self.query_rows(
            r#"
            SELECT dataset_id, domain_id_1, domain_id_2, count
            FROM domain_pair_concept_counts
            WHERE dataset_id = ?1
            ORDER BY domain_id_1, domain_id_2
            "#,
            vec![dataset_id.into()],
            |row| {
                Ok(DomainPairCount {
                    dataset_id: row.get(0)?,
                    domain_id_1: row.get(1)?,
                    domain_id_2: row.get(2)?,
                    count: row.get(3)?,
                })
            },
        )
    }

    /// 患者数
    pub fn patient_count(&self, dataset_id: i64) -> Result<Vec<PatientCount>> {
        self.query_rows(
            "SELECT dataset_id, count FROM patient_count WHERE dataset_id = ?1",
            vec![dataset_id.into()],
            |row| {
                Ok(PatientCount {
                    dataset_id: row.get(0)?,
                    count: row.get(1)?,
                })
            },
        )
    }

    /// 数据集中所有概念对的总数（Bonferroni校正因子）
    pub fn pair_total(&self, dataset_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(count) FROM domain_pair_concept_counts WHERE dataset_id = ?1",
            params![dataset_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // omop
    // -----------------------------------------------------------------------

    /// 按名称检索标准概念
    pub fn find_concepts(
        &self,
        query: &str,
        dataset_id: i64,
        domain_id: Option<&str>,
        min_count: Option<i64>,
    ) -> Result<Vec<ConceptSearchResult>> {
        let mut sql = String::from(
            r#"
            SELECT c.concept_id, c.concept_name, c.domain_id, c.vocabulary_id, c.concept_class_id,
                c.concept_code, CAST(IFNULL(cc.concept_count, 0) AS INTEGER) AS concept_count
            FROM concept c
            LEFT JOIN concept_counts cc ON cc.dataset_id = ?1 AND cc.concept_id = c.concept_id
            WHERE c.concept_name LIKE ?2 AND c.standard_concept IN ('S', 'C')
            "#,
        );
        let mut values: Vec<Value> = vec![dataset_id.into(), format!("%{}%", query).into()];

        if let Some(domain_id) = domain_id {
            values.push(domain_id.to_string().into());
            sql.push_str(&format!(" AND c.domain_id = ?{}", values.len()));
        }
        if let Some(min_count) = min_count {
            values.push(min_count.into());
            sql.push_str(&format!(" AND cc.concept_count >= ?{}", values.len()));
        }
        sql.push_str(&format!(
            " ORDER BY concept_count DESC, c.concept_id LIMIT {}",
            RESULT_LIMIT
        ));

        self.query_rows(&sql, values, |row| {
            Ok(ConceptSearchResult {
                concept_id: row.get(0)?,
                concept_name: row.get(1)?,
                domain_id: row.get(2)?,
                vocabulary_id: row.get(3)?,
                concept_class_id: row.get(4)?,
                concept_code: row.get(5)?,
                concept_count: row.get(6)?,
            })
        })
    }

    /// 概念定义
    pub fn concepts(&self, concept_ids: &[i64]) -> Result<Vec<Concept>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT concept_id, concept_name, domain_id, vocabulary_id, concept_class_id, concept_code
            FROM concept
            WHERE concept_id IN ({})
            ORDER BY concept_id
            "#,
            placeholders(1, concept_ids.len())
        );
        let values = concept_ids.iter().map(|&id| Value::from(id)).collect();
        self.query_rows(&sql, values, concept_from_row)
    }

    /// 祖先概念，按计数升序
    pub fn concept_ancestors(
        &self,
        concept_id: i64,
        dataset_id: i64,
        vocabulary_id: Option<&str>,
        concept_class_id: Option<&str>,
    ) -> Result<Vec<ConceptAncestor>> {
        let rows = self.concept_hierarchy(
            Hierarchy::Ancestors,
            concept_id,
            dataset_id,
            vocabulary_id,
            concept_class_id,
        )?;
        Ok(rows
            .into_iter()
            .map(|(ancestor_concept_id, concept)| ConceptAncestor {
                ancestor_concept_id,
                concept,
            })
            .collect())
    }

    /// 后代概念，按计数降序
    pub fn concept_descendants(
        &self,
        concept_id: i64,
        dataset_id: i64,
        vocabulary_id: Option<&str>,
        concept_class_id: Option<&str>,
    ) -> Result<Vec<ConceptDescendant>> {
        let rows = self.concept_hierarchy(
            Hierarchy::Descendants,
            concept_id,
            dataset_id,
            vocabulary_id,
            concept_class_id,
        )?;
        Ok(rows
            .into_iter()
            .map(|(descendant_concept_id, concept)| ConceptDescendant {
                descendant_concept_id,
                concept,
            })
            .collect())
    }

    fn concept_hierarchy(
        &self,
        direction: Hierarchy,
        concept_id: i64,
        dataset_id: i64,
        vocabulary_id: Option<&str>,
        concept_class_id: Option<&str>,
    ) -> Result<Vec<(i64, HierarchyConcept)>> {
        let (related, anchor, order) = match direction {
            Hierarchy::Ancestors => ("ancestor_concept_id", "descendant_concept_id", "ASC"),
            Hierarchy::Descendants => ("descendant_concept_id", "ancestor_concept_id", "DESC"),
        };
        let mut sql = format!(
            r#"
            SELECT ca.{related}, ca.min_levels_of_separation, ca.max_levels_of_separation,
                c.concept_name, c.domain_id, c.vocabulary_id, c.concept_class_id, c.standard_concept,
                c.concept_code, CAST(IFNULL(cc.concept_count, 0) AS INTEGER) AS concept_count
            FROM concept_ancestor ca
            JOIN concept c ON ca.{related} = c.concept_id
            LEFT JOIN concept_counts cc ON cc.concept_id = ca.{related} AND cc.dataset_id = ?2
            WHERE ca.{anchor} = ?1
            "#
        );
        let mut values: Vec<Value> = vec![concept_id.into(), dataset_id.into()];
        if let Some(vocabulary_id) = vocabulary_id {
            values.push(vocabulary_id.to_string().into());
            sql.push_str(&format!(" AND c.vocabulary_id = ?{}", values.len()));
        }
        if let Some(concept_class_id) = concept_class_id {
            values.push(concept_class_id.to_string().into());
            sql.push_str(&format!(" AND c.concept_class_id = ?{}", values.len()));
        }
        sql.push_str(&format!(
            " ORDER BY concept_count {order}, ca.{related} LIMIT {RESULT_LIMIT}"
        ));

        self.query_rows(&sql, values, |row| {
            Ok((
                row.get(0)?,
                HierarchyConcept {
                    min_levels_of_separation: row.get(1)?,
                    max_levels_of_separation: row.get(2)?,
                    concept_name: row.get(3)?,
                    domain_id: row.get(4)?,
                    vocabulary_id: row.get(5)?,
                    concept_class_id: row.get(6)?,
                    standard_concept: row.get(7)?,
                    concept_code: row.get(8)?,
                    concept_count: row.get(9)?,
                },
            ))
        })
    }

    /// 源编码经 "Maps to" 映射到标准概念
    pub fn map_to_standard(
        &self,
        concept_code: &str,
        vocabulary_id: Option<&str>,
    ) -> Result<Vec<StandardConceptMapping>> {
        let mut sql = String::from(
            r#"
            SELECT c1.concept_id, c1.concept_code, c1.concept_name, c1.vocabulary_id,
                c2.concept_id, c2.concept_name, c2.domain_id, c2.concept_code, c2.vocabulary_id
            FROM concept c1
            JOIN concept_relationship cr ON c1.concept_id = cr.concept_id_1
            JOIN concept c2 ON cr.concept_id_2 = c2.concept_id
            WHERE c1.concept_code = ?1 AND cr.relationship_id = 'Maps to'
            "#,
        );
        let mut values: Vec<Value> = vec![concept_code.to_string().into()];
        if let Some(vocabulary_id) = vocabulary_id {
            values.push(vocabulary_id.to_string().into());
            sql.push_str(" AND c1.vocabulary_id = ?2");
        }
        sql.push_str(" ORDER BY c1.vocabulary_id, c2.concept_id");

        self.query_rows(&sql, values, |row| {
            Ok(StandardConceptMapping {
                source_concept_id: row.get(0)?,
                source_concept_code: row.get(1)?,
                source_concept_name: row.get(2)?,
                source_vocabulary_id: row.get(3)?,
                standard_concept_id: row.get(4)?,
                standard_concept_name: row.get(5)?,
                standard_domain_id: row.get(6)?,
                standard_concept_code: row.get(7)?,
                standard_vocabulary_id: row.get(8)?,
            })
        })
    }

    /// 映射到给定标准概念的源概念
    pub fn map_from_standard(
        &self,
        concept_id: i64,
        vocabularies: Option<&[String]>,
    ) -> Result<Vec<SourceConcept>> {
        let mut sql = String::from(
            r#"
            SELECT c.concept_id, c.concept_code, c.concept_name, c.domain_id, c.vocabulary_id,
                c.concept_class_id, c.standard_concept
            FROM concept_relationship cr
            JOIN concept c ON cr.concept_id_1 = c.concept_id
            WHERE cr.concept_id_2 = ?1 AND cr.relationship_id = 'Maps to'
            "#,
        );
        let mut values: Vec<Value> = vec![concept_id.into()];
        if let Some(vocabularies) = vocabularies.filter(|v| !v.is_empty()) {
            sql.push_str(&format!(
                " AND c.vocabulary_id IN ({})",
                placeholders(2, vocabularies.len())
            ));
            values.extend(vocabularies.iter().map(|v| Value::from(v.clone())));
        }
        sql.push_str(" ORDER BY c.vocabulary_id ASC, c.concept_code ASC");

        self.query_rows(&sql, values, |row| {
            Ok(SourceConcept {
                concept_id: row.get(0)?,
                concept_code: row.get(1)?,
                concept_name: row.get(2)?,
                domain_id: row.get(3)?,
                vocabulary_id: row.get(4)?,
                concept_class_id: row.get(5)?,
                standard_concept: row.get(6)?,
            })
        })
    }

    /// 所有词表
    pub fn vocabularies(&self) -> Result<Vec<Vocabulary>> {
        self.query_rows(
            "SELECT DISTINCT vocabulary_id FROM concept ORDER BY vocabulary_id",
            vec![],
            |row| {
                Ok(Vocabulary {
                    vocabulary_id: row.get(0)?,
                })
            },
        )
    }

    // -----------------------------------------------------------------------
    // frequencies
    // -----------------------------------------------------------------------

    /// 单概念计数与患者数
    pub fn single_concept_counts(
        &self,
        dataset_id: i64,
        concept_ids: &[i64],
    ) -> Result<Vec<SingleConceptFreq>> {
        if concept_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT cc.dataset_id, cc.concept_id, cc.concept_count, pc.count
            FROM concept_counts cc
            JOIN patient_count pc ON cc.dataset_id = pc.dataset_id
            WHERE cc.dataset_id = ?1 AND cc.concept_id IN ({})
            ORDER BY cc.concept_id
            "#,
            placeholders(2, concept_ids.len())
        );
        let mut values: Vec<Value> = vec![dataset_id.into()];
        values.extend(concept_ids.iter().map(|&id| Value::from(id)));

        self.query_rows(&sql, values, |row| {
            let concept_count: i64 = row.get(2)?;
            let patients: i64 = row.get(3)?;
            Ok(SingleConceptFreq {
                dataset_id: row.get(0)?,
                concept_id: row.get(1)?,
                concept_count,
                concept_frequency: frequency(concept_count, patients),
            })
        })
    }

    /// 概念对计数（与顺序无关）
    pub fn paired_concept_counts(
        &self,
        dataset_id: i64,
        concept_id_1: i64,
        concept_id_2: i64,
    ) -> Result<Vec<PairedConceptFreq>> {
        let (lo, hi) = ordered(concept_id_1, concept_id_2);
        self.query_rows(
            r#"
            SELECT cpc.dataset_id, cpc.concept_id_1, cpc.concept_id_2, cpc.concept_count, pc.count
            FROM concept_pair_counts cpc
            JOIN patient_count pc ON pc.dataset_id = cpc.dataset_id
            WHERE cpc.dataset_id = ?1 AND cpc.concept_id_1 = ?2 AND cpc.concept_id_2 = ?3
            "#,
            vec![dataset_id.into(), lo.into(), hi.into()],
            |row| {
                let concept_count: i64 = row.get(3)?;
                let patients: i64 = row.get(4)?;
                Ok(PairedConceptFreq {
                    dataset_id: row.get(0)?,
                    concept_id_1: row.get(1)?,
                    concept_id_2: row.get(2)?,
                    concept_count,
                    concept_frequency: frequency(concept_count, patients),
                })
            },
        )
    }

    /// 与给定概念共现的所有概念，按计数降序
    pub fn associated_concept_counts(
        &self,
        dataset_id: i64,
        concept_id: i64,
        domain_id: Option<&str>,
    ) -> Result<Vec<AssociatedConceptFreq>> {
        let mut values: Vec<Value> = vec![dataset_id.into(), concept_id.into()];
        let domain_filter = match domain_id {
            Some(domain_id) => {
                values.push(domain_id.to_string().into());
                "AND c.domain_id = ?3"
            }
            None => "",
        };
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT cpc.dataset_id, cpc.concept_id_1 AS concept_id, cpc.concept_id_2 AS associated_concept_id,
                    cpc.concept_count, pc.count AS patients, c.concept_name, c.domain_id
                FROM concept_pair_counts cpc
                JOIN concept c ON cpc.concept_id_2 = c.concept_id
                JOIN patient_count pc ON cpc.dataset_id = pc.dataset_id
                WHERE cpc.dataset_id = ?1 AND cpc.concept_id_1 = ?2 {domain_filter}
                UNION ALL
                SELECT cpc.dataset_id, cpc.concept_id_2 AS concept_id, cpc.concept_id_1 AS associated_concept_id,
                    cpc.concept_count, pc.count AS patients, c.concept_name, c.domain_id
                FROM concept_pair_counts cpc
                JOIN concept c ON cpc.concept_id_1 = c.concept_id
                JOIN patient_count pc ON cpc.dataset_id = pc.dataset_id
                WHERE cpc.dataset_id = ?1 AND cpc.concept_id_2 = ?2 {domain_filter}
            ) x
            ORDER BY concept_count DESC, associated_concept_id
            "#
        );

        self.query_rows(&sql, values, |row| {
            let concept_count: i64 = row.get(3)?;
            let patients: i64 = row.get(4)?;
            Ok(AssociatedConceptFreq {
                dataset_id: row.get(0)?,
                concept_id: row.get(1)?,
                associated_concept_id: row.get(2)?,
                concept_count,
                concept_frequency: frequency(concept_count, patients),
                associated_concept_name: row.get(5)?,
                associated_domain_id: row.get(6)?,
            })
        })
    }

    /// 高频概念
    pub fn most_frequent_concepts(
        &self,
        dataset_id: i64,
        limit: Option<i64>,
        domain_id: Option<&str>,
        vocabulary_ids: Option<&[String]>,
        concept_class_ids: Option<&[String]>,
    ) -> Result<Vec<FrequentConcept>> {
        let mut sql = String::from(
            r#"
            SELECT cc.dataset_id, cc.concept_id, cc.concept_count, pc.count,
                c.domain_id, c.concept_name, c.vocabulary_id, c.concept_class_id
            FROM concept_counts cc
            JOIN concept c ON cc.concept_id = c.concept_id
            JOIN patient_count pc ON cc.dataset_id = pc.dataset_id
            WHERE cc.dataset_id = ?1
            "#,
        );
        let mut values: Vec<Value> = vec![dataset_id.into()];

        if let Some(domain_id) = domain_id {
            values.push(domain_id.to_string().into());
            sql.push_str(&format!(" AND c.domain_id = ?{}", values.len()));
        }
        for (column, list) in [
            ("c.vocabulary_id", vocabulary_ids),
            ("c.concept_class_id", concept_class_ids),
        ] {
            if let Some(list) = list.filter(|l| !l.is_empty()) {
                sql.push_str(&format!(
                    " AND {} IN ({})",
                    column,
                    placeholders(values.len() + 1, list.len())
                ));
                values.extend(list.iter().map(|v| Value::from(v.clone())));
            }
        }
        sql.push_str(" ORDER BY cc.concept_count DESC, cc.concept_id");
        if let Some(limit) = limit {
            values.push(limit.into());
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.query_rows(&sql, values, |row| {
            let concept_count: i64 = row.get(2)?;
            let patients: i64 = row.get(3)?;
            Ok(FrequentConcept {
                dataset_id: row.get(0)?,
                concept_id: row.get(1)?,
                concept_count,
                concept_frequency: frequency(concept_count, patients),
                domain_id: row.get(4)?,
                concept_name: row.get(5)?,
                vocabulary_id: row.get(6)?,
                concept_class_id: row.get(7)?,
            })
        })
    }

    // -----------------------------------------------------------------------
    // temporal
    // -----------------------------------------------------------------------

    /// 概念的年龄分布
    ///
    /// 没有分箱方案、单概念计数或分布数据时返回 None。
    pub fn concept_age_counts(
        &self,
        dataset_id: i64,
        concept_id: i64,
    ) -> Result<Option<ConceptAgeCounts>> {
        let conn = self.conn.lock();

        let bin_width: Option<i64> = conn
            .query_row(
                "SELECT bin_width FROM concept_age_schemes WHERE dataset_id = ?1 AND concept_id = ?2",
                params![dataset_id, concept_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(bin_width) = bin_width else {
            return Ok(None);
        };

        let Some(concept_count) = concept_count(&conn, dataset_id, concept_id)? else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT count FROM concept_age_counts
            WHERE dataset_id = ?1 AND concept_id = ?2
            ORDER BY bin
            "#,
        )?;
        let counts = stmt
            .query_map(params![dataset_id, concept_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if counts.is_empty() {
            return Ok(None);
        }

        Ok(Some(ConceptAgeCounts {
            dataset_id,
            concept_id,
            concept_name: concept_name(&conn, concept_id)?,
            concept_count,
            bin_width,
            counts,
            confidence_interval: Vec::new(),
        }))
    }

    /// 概念对的时间间隔分布，按调用方给出的 源 -> 目标 方向返回
    ///
    /// 库中以较小的概念ID为 concept_id_1 存储；缺少分箱方案、任一计数或分布数据时返回 None。
    pub fn delta_counts(
        &self,
        dataset_id: i64,
        source_concept_id: i64,
        target_concept_id: i64,
    ) -> Result<Option<ConceptPairDeltaCounts>> {
        let (lo, hi) = ordered(source_concept_id, target_concept_id);
        let conn = self.conn.lock();

        let scheme: Option<(i64, i64)> = conn
            .query_row(
                r#"
                SELECT bin_width, n FROM delta_schemes
                WHERE dataset_id = ?1 AND concept_id_1 = ?2 AND concept_id_2 = ?3
                "#,
                params![dataset_id, lo, hi],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((bin_width, n)) = scheme else {
            return Ok(None);
        };

        let (Some(count_lo), Some(count_hi)) = (
            concept_count(&conn, dataset_id, lo)?,
            concept_count(&conn, dataset_id, hi)?,
        ) else {
            return Ok(None);
        };

        let pair_count: Option<i64> = conn
            .query_row(
                r#"
                SELECT concept_count FROM concept_pair_counts
                WHERE dataset_id = ?1 AND concept_id_1 = ?2 AND concept_id_2 = ?3
                "#,
                params![dataset_id, lo, hi],
                |row| row.get(0),
            )
            .optional()?;
        let Some(concept_pair_count) = pair_count else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT count FROM delta_counts
            WHERE dataset_id = ?1 AND concept_id_1 = ?2 AND concept_id_2 = ?3
            ORDER BY bin
            "#,
        )?;
        let counts = stmt
            .query_map(params![dataset_id, lo, hi], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if counts.is_empty() {
            return Ok(None);
        }

        let deltas = ConceptPairDeltaCounts {
            dataset_id,
            source_concept_id: lo,
            source_concept_name: concept_name(&conn, lo)?,
            source_concept_count: count_lo,
            target_concept_id: hi,
            target_concept_name: concept_name(&conn, hi)?,
            target_concept_count: count_hi,
            concept_pair_count,
            bin_width,
            n,
            counts,
            confidence_interval: Vec::new(),
        };
        Ok(Some(if source_concept_id > target_concept_id {
            deltas.reversed()
        } else {
            deltas
        }))
    }

    // -----------------------------------------------------------------------
    // association
    // -----------------------------------------------------------------------

    /// 关联计算所需的计数，按调用方的概念顺序定向
    ///
    /// 指定 `concept_id_2` 时最多返回一行；否则返回包含 `concept_id_1` 的所有概念对，
    /// 并附带另一概念的名称与domain。
    pub fn association_counts(
        &self,
        dataset_id: i64,
        concept_id_1: i64,
        concept_id_2: Option<i64>,
        domain_id: Option<&str>,
    ) -> Result<Vec<PairCountRow>> {
        if let Some(concept_id_2) = concept_id_2 {
            let (lo, hi) = ordered(concept_id_1, concept_id_2);
            let rows = self.query_rows(
                r#"
                SELECT cp.dataset_id, cp.concept_id_1, cp.concept_id_2, cp.concept_count,
                    c1.concept_count, c2.concept_count, pc.count
                FROM concept_pair_counts cp
                JOIN concept_counts c1 ON c1.dataset_id = cp.dataset_id AND c1.concept_id = cp.concept_id_1
                JOIN concept_counts c2 ON c2.dataset_id = cp.dataset_id AND c2.concept_id = cp.concept_id_2
                JOIN patient_count pc ON pc.dataset_id = cp.dataset_id
                WHERE cp.dataset_id = ?1 AND cp.concept_id_1 = ?2 AND cp.concept_id_2 = ?3
                "#,
                vec![dataset_id.into(), lo.into(), hi.into()],
                pair_count_from_row,
            )?;
            return Ok(rows
                .into_iter()
                .map(|row| {
                    if row.concept_id_1 == concept_id_1 {
                        row
                    } else {
                        row.flipped()
                    }
                })
                .collect());
        }

        let mut values: Vec<Value> = vec![dataset_id.into(), concept_id_1.into()];
        let domain_filter = match domain_id {
            Some(domain_id) => {
                values.push(domain_id.to_string().into());
                "AND c.domain_id = ?3"
            }
            None => "",
        };
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT cp.dataset_id, cp.concept_id_1, cp.concept_id_2, cp.concept_count,
                    c1.concept_count, c2.concept_count, pc.count, c.concept_name, c.domain_id
                FROM concept_pair_counts cp
                JOIN concept_counts c1 ON c1.dataset_id = cp.dataset_id AND c1.concept_id = cp.concept_id_1
                JOIN concept_counts c2 ON c2.dataset_id = cp.dataset_id AND c2.concept_id = cp.concept_id_2
                JOIN patient_count pc ON pc.dataset_id = cp.dataset_id
                JOIN concept c ON c.concept_id = cp.concept_id_2
                WHERE cp.dataset_id = ?1 AND cp.concept_id_1 = ?2 {domain_filter}
                UNION ALL
                SELECT cp.dataset_id, cp.concept_id_2, cp.concept_id_1, cp.concept_count,
                    c2.concept_count, c1.concept_count, pc.count, c.concept_name, c.domain_id
                FROM concept_pair_counts cp
                JOIN concept_counts c1 ON c1.dataset_id = cp.dataset_id AND c1.concept_id = cp.concept_id_1
                JOIN concept_counts c2 ON c2.dataset_id = cp.dataset_id AND c2.concept_id = cp.concept_id_2
                JOIN patient_count pc ON pc.dataset_id = cp.dataset_id
                JOIN concept c ON c.concept_id = cp.concept_id_1
                WHERE cp.dataset_id = ?1 AND cp.concept_id_2 = ?2 {domain_filter}
            ) x
            "#
        );

        self.query_rows(&sql, values, |row| {
            let mut pair = pair_count_from_row(row)?;
            pair.concept_2_name = row.get(7)?;
            pair.concept_2_domain = row.get(8)?;
            Ok(pair)
        })
    }

    /// 数据集中所有概念对（按存储顺序），用于KGX导出
    pub fn all_pair_counts(&self, dataset_id: i64, min_count: i64) -> Result<Vec<PairCountRow>> {
        self.query_rows(
            r#"
            SELECT cp.dataset_id, cp.concept_id_1, cp.concept_id_2, cp.concept_count,
                c1.concept_count, c2.concept_count, pc.count
            FROM concept_pair_counts cp
            JOIN concept_counts c1 ON c1.dataset_id = cp.dataset_id AND c1.concept_id = cp.concept_id_1
            JOIN concept_counts c2 ON c2.dataset_id = cp.dataset_id AND c2.concept_id = cp.concept_id_2
            JOIN patient_count pc ON pc.dataset_id = cp.dataset_id
            WHERE cp.dataset_id = ?1 AND cp.concept_count > ?2
                AND c1.concept_count > ?2 AND c2.concept_count > ?2
            ORDER BY cp.concept_id_1, cp.concept_id_2
            "#,
            vec![dataset_id.into(), min_count.into()],
            pair_count_from_row,
        )
    }

    // -----------------------------------------------------------------------
    // biolink mappings
    // -----------------------------------------------------------------------

    /// 有计数的某domain概念，可按词表与概念类别过滤
    ///
    /// `class_filter`: `Some((class, true))` 只保留该类别，`Some((class, false))` 排除该类别。
    pub fn active_concepts(
        &self,
        domain_id: &str,
        vocabularies: &[&str],
        class_filter: Option<(&str, bool)>,
    ) -> Result<Vec<Concept>> {
        let mut sql = String::from(
            r#"
            SELECT c.concept_id, c.concept_name, c.domain_id, c.vocabulary_id, c.concept_class_id, c.concept_code
            FROM (SELECT DISTINCT concept_id FROM concept_counts) x
            JOIN concept c ON x.concept_id = c.concept_id
            WHERE c.domain_id = ?1 COLLATE NOCASE
            "#,
        );
        let mut values: Vec<Value> = vec![domain_id.to_string().into()];
        if !vocabularies.is_empty() {
            sql.push_str(&format!(
                " AND c.vocabulary_id IN ({})",
                placeholders(2, vocabularies.len())
            ));
            values.extend(vocabularies.iter().map(|v| Value::from(v.to_string())));
        }
        if let Some((class, include)) = class_filter {
            values.push(class.to_string().into());
            let op = if include { "=" } else { "!=" };
            sql.push_str(&format!(
                " AND c.concept_class_id {} ?{} COLLATE NOCASE",
                op,
                values.len()
            ));
        }
        sql.push_str(" ORDER BY c.concept_id");
        self.query_rows(&sql, values, concept_from_row)
    }

    /// 有计数的药物成分及其对应的MeSH编码
    ///
    /// 返回 (omop_id, 成分名称, MeSH编码)，同一成分可能对应多个MeSH编码。
    pub fn ingredient_mesh_codes(&self) -> Result<Vec<(i64, String, String)>> {
        self.query_rows(
            r#"
            SELECT c.concept_id, c.concept_name, c_mesh.concept_code
            FROM (SELECT DISTINCT concept_id FROM concept_counts) x
            JOIN concept c ON x.concept_id = c.concept_id
            JOIN concept_relationship cr ON c.concept_id = cr.concept_id_2
                AND cr.relationship_id = 'Maps to'
            JOIN concept c_mesh ON cr.concept_id_1 = c_mesh.concept_id
            WHERE c.domain_id = 'Drug' COLLATE NOCASE
                AND c.concept_class_id = 'Ingredient' COLLATE NOCASE
                AND c_mesh.vocabulary_id = 'MeSH'
            ORDER BY c.concept_id, c_mesh.concept_code
            "#,
            vec![],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
    }

    /// 每个概念在所有数据集中的最大计数
    pub fn max_concept_counts(&self) -> Result<HashMap<i64, i64>> {
        let rows = self.query_rows(
            "SELECT concept_id, MAX(concept_count) FROM concept_counts GROUP BY concept_id",
            vec![],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(rows.into_iter().collect())
    }

    /// 当前映射数量
    pub fn mapping_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM biolink_mappings", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// 用新映射整体替换旧映射
    pub fn replace_mappings(&self, mappings: &[BiolinkMappingRow]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM biolink_mappings", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO biolink_mappings
                (omop_id, biolink_id, biolink_label, categories, provenance, distance, string_similarity, preferred)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for m in mappings {
                let categories = serde_json::to_string(&m.categories)?;
                stmt.execute(params![
                    m.omop_id,
                    m.biolink_id,
                    m.biolink_label,
                    categories,
                    m.provenance,
                    m.distance,
                    m.string_similarity,
                    m.preferred,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// 首选映射（附带概念名称）
    pub fn preferred_mappings(&self) -> Result<Vec<BiolinkMappingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT m.omop_id, m.biolink_id, m.biolink_label, m.categories, m.provenance,
                m.distance, m.string_similarity, m.preferred, c.concept_name
            FROM biolink_mappings m
            JOIN concept c ON m.omop_id = c.concept_id
            WHERE m.preferred = 1
            ORDER BY m.omop_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let categories_json: String = row.get(3)?;
            Ok((
                categories_json,
                BiolinkMappingRow {
                    omop_id: row.get(0)?,
                    biolink_id: row.get(1)?,
                    biolink_label: row.get(2)?,
                    categories: Vec::new(),
                    provenance: row.get(4)?,
                    distance: row.get(5)?,
                    string_similarity: row.get(6)?,
                    preferred: row.get(7)?,
                    concept_name: row.get(8)?,
                },
            ))
        })?;

        let mut mappings = Vec::new();
        for row in rows {
            let (categories_json, mut mapping) = row?;
            mapping.categories = serde_json::from_str(&categories_json)?;
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    /// 保存映射重建记录
    pub fn save_mapping_build(&self, build: &MappingBuild) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT OR REPLACE INTO mapping_builds
            (build_id, started_at, finished_at, previous_count, new_count, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                build.build_id,
                build.started_at.to_rfc3339(),
                build.finished_at.to_rfc3339(),
                build.previous_count,
                build.new_count,
                build.status.to_string(),
            ],
        )?;
        Ok(())
    }

    /// 最近的映射重建记录
    pub fn recent_mapping_builds(&self, limit: usize) -> Result<Vec<MappingBuild>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT build_id, started_at, finished_at, previous_count, new_count, status
            FROM mapping_builds
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let started_at: String = row.get(1)?;
            let finished_at: String = row.get(2)?;
            let status: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                started_at,
                finished_at,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                status,
            ))
        })?;

        let mut builds = Vec::new();
        for row in rows {
            let (build_id, started_at, finished_at, previous_count, new_count, status) = row?;
            builds.push(MappingBuild {
                build_id,
                started_at: parse_timestamp(&started_at)?,
                finished_at: parse_timestamp(&finished_at)?,
                previous_count,
                new_count,
                status: status.parse()?,
            });
        }
        Ok(builds)
    }

    /// 按ID查找映射重建记录
    pub fn mapping_build(&self, build_id: &str) -> Result<Option<MappingBuild>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"
                SELECT started_at, finished_at, previous_count, new_count, status
                FROM mapping_builds WHERE build_id = ?1
                "#,
                params![build_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((started_at, finished_at, previous_count, new_count, status)) => {
                Ok(Some(MappingBuild {
                    build_id: build_id.to_string(),
                    started_at: parse_timestamp(&started_at)?,
                    finished_at: parse_timestamp(&finished_at)?,
                    previous_count,
                    new_count,
                    status: status.parse()?,
                }))
            }
        }
    }
}

enum Hierarchy {
    Ancestors,
    Descendants,
}

impl PairCountRow {
    /// 交换两个概念的位置
    pub fn flipped(self) -> Self {
        Self {
            concept_id_1: self.concept_id_2,
            concept_id_2: self.concept_id_1,
            count_1: self.count_2,
            count_2: self.count_1,
            ..self
        }
    }
}

fn pair_count_from_row(row: &Row<'_>) -> rusqlite::Result<PairCountRow> {
    Ok(PairCountRow {
        dataset_id: row.get(0)?,
        concept_id_1: row.get(1)?,
        concept_id_2: row.get(2)?,
        pair_count: row.get(3)?,
        count_1: row.get(4)?,
        count_2: row.get(5)?,
        patient_count: row.get(6)?,
        concept_2_name: None,
        concept_2_domain: None,
    })
}

fn concept_from_row(row: &Row<'_>) -> rusqlite::Result<Concept> {
    Ok(Concept {
        concept_id: row.get(0)?,
        concept_name: row.get(1)?,
        domain_id: row.get(2)?,
        vocabulary_id: row.get(3)?,
        concept_class_id: row.get(4)?,
        concept_code: row.get(5)?,
    })
}

/// 生成 `?start, ?start+1, ...` 占位符
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(",")
}

fn concept_count(conn: &Connection, dataset_id: i64, concept_id: i64) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT concept_count FROM concept_counts WHERE dataset_id = ?1 AND concept_id = ?2",
        params![dataset_id, concept_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// 概念名称，未知概念为空串
fn concept_name(conn: &Connection, concept_id: i64) -> Result<String> {
    let name: Option<String> = conn
        .query_row(
            "SELECT concept_name FROM concept WHERE concept_id = ?1",
            params![concept_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name.unwrap_or_default())
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn frequency(count: i64, patients: i64) -> f64 {
    if patients > 0 {
        count as f64 / patients as f64
    } else {
        0.0
    }
}

fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .map_err(|e| CohdError::Internal(anyhow::anyhow!("时间格式错误 {}: {}", s, e)))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_database_init() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data").join("cohd.db");

        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(db.datasets().unwrap().is_empty());
    }

    #[test]
    fn test_find_concepts_filters() {
        let db = sample_db();

        let rows = db.find_concepts("fibrillation", 1, None, Some(1)).unwrap();
        // 非标准的ICD编码不参与检索
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_id, AFIB);
        assert_eq!(rows[0].concept_count, 100);

        let rows = db.find_concepts("heart", 1, Some("Condition"), None).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.concept_id).collect::<Vec<_>>(),
            vec![HEART_DISEASE, HEART_FAILURE]
        );

        // 数据集2中没有计数
        assert!(db.find_concepts("heart", 2, None, Some(1)).unwrap().is_empty());
        let rows = db.find_concepts("heart", 2, None, None).unwrap();
        assert!(rows.iter().all(|r| r.concept_count == 0));
    }

    #[test]
    fn test_hierarchy_ordering() {
        let db = sample_db();

        let ancestors = db.concept_ancestors(AFIB, 3, None, None).unwrap();
        assert_eq!(ancestors.len(), 2);
        assert_eq!(ancestors[0].ancestor_concept_id, AFIB);
        assert_eq!(ancestors[0].concept.concept_count, 90);
        assert_eq!(ancestors[1].ancestor_concept_id, HEART_DISEASE);

        let descendants = db.concept_descendants(HEART_DISEASE, 3, None, None).unwrap();
        let counts: Vec<i64> = descendants.iter().map(|d| d.concept.concept_count).collect();
        assert_eq!(counts, vec![250, 90, 70]);

        // 数据集中没有计数的概念计为0
        let uncounted = db.concept_descendants(HEART_DISEASE, 2, None, None).unwrap();
        assert_eq!(uncounted.len(), 3);
        assert!(uncounted.iter().all(|d| d.concept.concept_count == 0));

        let filtered = db
            .concept_descendants(HEART_DISEASE, 3, Some("ICD10CM"), None)
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_association_counts_orientation() {
        let db = sample_db();

        let rows = db
            .association_counts(1, HEART_FAILURE, Some(AFIB), None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_id_1, HEART_FAILURE);
        assert_eq!(rows[0].concept_id_2, AFIB);
        assert_eq!(rows[0].count_1, 80);
        assert_eq!(rows[0].count_2, 100);
        assert_eq!(rows[0].pair_count, 30);

        let rows = db.association_counts(1, HEART_FAILURE, None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.concept_id_1 == HEART_FAILURE && r.count_1 == 80));
        assert!(rows.iter().all(|r| r.concept_2_name.is_some()));

        let rows = db
            .association_counts(1, HEART_FAILURE, None, Some("Drug"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_id_2, WARFARIN);
        assert_eq!(rows[0].concept_2_domain.as_deref(), Some("Drug"));
    }

    #[test]
    fn test_most_frequent_concepts_filters() {
        let db = sample_db();

        let rows = db.most_frequent_concepts(1, Some(2), None, None, None).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.concept_id).collect::<Vec<_>>(),
            vec![HEART_DISEASE, ECG]
        );

        let vocabs = vec!["RxNorm".to_string()];
        let classes = vec!["Clinical Drug".to_string()];
        let rows = db
            .most_frequent_concepts(1, None, Some("Drug"), Some(&vocabs), Some(&classes))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_id, WARFARIN_TABLET);
        assert!((rows[0].concept_frequency - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_concept_age_counts_ordered_by_bin() {
        let db = sample_db();

        let ages = db.concept_age_counts(4, AFIB).unwrap().unwrap();
        assert_eq!(ages.concept_name, "Atrial fibrillation");
        assert_eq!(ages.concept_count, 90);
        assert_eq!(ages.bin_width, 10);
        assert_eq!(ages.counts, vec![1, 12, 32, 45]);
        assert!(ages.confidence_interval.is_empty());

        // 有分箱方案但没有计数
        assert!(db.concept_age_counts(4, HEART_FAILURE).unwrap().is_none());
        assert!(db.concept_age_counts(1, AFIB).unwrap().is_none());
    }

    #[test]
    fn test_delta_counts_follow_requested_direction() {
        let db = sample_db();

        let forward = db.delta_counts(4, AFIB, WARFARIN).unwrap().unwrap();
        assert_eq!(forward.source_concept_id, AFIB);
        assert_eq!(forward.source_concept_count, 90);
        assert_eq!(forward.target_concept_name, "warfarin");
        assert_eq!(forward.concept_pair_count, 25);
        assert_eq!((forward.bin_width, forward.n), (30, 2));
        assert_eq!(forward.counts, vec![2, 4, 9, 7, 3]);

        let backward = db.delta_counts(4, WARFARIN, AFIB).unwrap().unwrap();
        assert_eq!(backward.source_concept_id, WARFARIN);
        assert_eq!(backward.source_concept_count, 50);
        assert_eq!(backward.target_concept_id, AFIB);
        assert_eq!(backward.target_concept_count, 90);
        assert_eq!(backward.concept_pair_count, 25);
        assert_eq!(backward.counts, vec![3, 7, 9, 4, 2]);

        assert!(db.delta_counts(4, AFIB, HEART_FAILURE).unwrap().is_none());
    }

    #[test]
    fn test_mapping_build_history() {
        let db = sample_db();
        let now = chrono::Utc::now();
        let build = MappingBuild {
            build_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            previous_count: 0,
            new_count: 4,
            status: BuildStatus::Updated,
        };
        db.save_mapping_build(&build).unwrap();

        let loaded = db.mapping_build(&build.build_id).unwrap().unwrap();
        assert_eq!(loaded.status, BuildStatus::Updated);
        assert_eq!(loaded.new_count, 4);
        assert_eq!(db.recent_mapping_builds(10).unwrap().len(), 1);
        assert!(db.mapping_build("missing").unwrap().is_none());
    }

    #[test]
    fn test_replace_mappings_and_prefetch() {
        let db = sample_db();
        let row = BiolinkMappingRow {
            omop_id: AFIB,
            biolink_id: "MONDO:0004981".to_string(),
            biolink_label: "atrial fibrillation".to_string(),
            categories: vec!["biolink:Disease".to_string()],
            provenance: "OMOP:313217-SNOMEDCT:49436004-MONDO:0004981".to_string(),
            distance: 1,
            string_similarity: 0.95,
            preferred: true,
            concept_name: None,
        };
        db.replace_mappings(&[row.clone()]).unwrap();
        assert_eq!(db.mapping_count().unwrap(), 1);

        let preferred = db.preferred_mappings().unwrap();
        assert_eq!(preferred.len(), 1);
        assert_eq!(preferred[0].categories, row.categories);
        assert_eq!(preferred[0].concept_name.as_deref(), Some("Atrial fibrillation"));
    }
}

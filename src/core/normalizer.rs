//! SRI Node Normalizer 客户端
//!
//! 把任意CURIE归一化为规范标识符，并返回等价标识符与Biolink类别。
//! 通过 `NodeNormalizer` trait 调用，便于测试时替换。

use crate::core::error::{CohdError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 单次请求的CURIE数量上限
const BATCH_SIZE: usize = 1000;

/// 请求超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// 规范或等价标识符
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentifier {
    #[serde(rename = "identifier")]
    pub id: String,
    #[serde(default)]
    pub label: String,
}

/// 归一化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedNode {
    /// 规范标识符
    #[serde(rename = "id")]
    pub normalized_identifier: NodeIdentifier,
    /// 等价标识符（包含规范标识符本身）
    #[serde(default)]
    pub equivalent_identifiers: Vec<NodeIdentifier>,
    /// Biolink类别
    #[serde(rename = "type", default)]
    pub categories: Vec<String>,
}

impl NormalizedNode {
    /// 规范标识符
    pub fn canonical_id(&self) -> &str {
        &self.normalized_identifier.id
    }

    /// 等价标识符中与 `curie` 相同的标签
    pub fn label_for(&self, curie: &str) -> Option<&str> {
        self.equivalent_identifiers
            .iter()
            .find(|e| e.id == curie)
            .map(|e| e.label.as_str())
    }
}

/// 归一化结果：每个输入CURIE一个条目，找不到时为 None
pub type NormalizedNodes = HashMap<String, Option<NormalizedNode>>;

/// 节点归一化服务
#[async_trait]
pub trait NodeNormalizer: Send + Sync {
    /// 归一化一组CURIE
    async fn get_normalized_nodes(&self, curies: &[String]) -> Result<NormalizedNodes>;
}

/// SRI Node Normalizer HTTP客户端
pub struct SriNodeNormalizer {
    /// HTTP客户端
    client: reqwest::Client,
    /// get_normalized_nodes 完整地址
    endpoint: String,
}

impl SriNodeNormalizer {
    /// 创建客户端，`base_url` 形如 `https://nodenormalization-sri.renci.org/1.1/`
    pub fn new(base_url: &str) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(CohdError::Internal(anyhow::anyhow!(
                "Node Normalizer 地址为空"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/get_normalized_nodes", base),
        })
    }

    async fn post_batch(&self, curies: &[String]) -> Result<NormalizedNodes> {
        #[derive(Serialize)]
        struct NormalizeRequest<'a> {
            curies: &'a [String],
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&NormalizeRequest { curies })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Node Normalizer 返回非200状态: {} {}", status, body);
            return Err(CohdError::Upstream(format!(
                "Node Normalizer returned {}",
                status
            )));
        }

        Ok(response.json::<NormalizedNodes>().await?)
    }
}

#[async_trait]
impl NodeNormalizer for SriNodeNormalizer {
    async fn get_normalized_nodes(&self, curies: &[String]) -> Result<NormalizedNodes> {
        let mut nodes = NormalizedNodes::with_capacity(curies.len());
        for batch in curies.chunks(BATCH_SIZE) {
            nodes.extend(self.post_batch(batch).await?);
        }

        // 确保每个输入都有条目
        for curie in curies {
            nodes.entry(curie.clone()).or_insert(None);
        }
        Ok(nodes)
    }
}

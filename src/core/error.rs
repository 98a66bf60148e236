//! 错误类型定义
//!
//! 查询层统一返回 `CohdError`，由服务层映射为HTTP状态码。

use thiserror::Error;

/// COHD服务错误
#[derive(Error, Debug)]
pub enum CohdError {
    /// 请求参数错误（返回400，消息原样返回给调用方）
    #[error("{0}")]
    BadRequest(String),

    /// 资源不存在
    #[error("{0}")]
    NotFound(String),

    /// 当前部署环境不允许的操作
    #[error("{0}")]
    Forbidden(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP客户端错误
    #[error("HTTP请求失败: {0}")]
    Http(#[from] reqwest::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O错误
    #[error("I/O错误: {0}")]
    Io(#[from] std::io::Error),

    /// 上游服务（如Node Normalizer）返回异常
    #[error("上游服务错误: {0}")]
    Upstream(String),

    /// 其他内部错误
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CohdError {
    /// 构造参数错误
    pub fn bad_request(msg: impl Into<String>) -> Self {
        CohdError::BadRequest(msg.into())
    }

    /// 是否为调用方的错误
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CohdError::BadRequest(_) | CohdError::NotFound(_) | CohdError::Forbidden(_)
        )
    }
}

/// 查询层结果类型
pub type Result<T> = std::result::Result<T, CohdError>;

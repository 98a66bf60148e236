//! Core模块 - 包含所有核心业务逻辑

pub mod biolink;
pub mod error;
pub mod kgx;
pub mod models;
pub mod normalizer;
pub mod params;
pub mod query;
pub mod scheduler;
pub mod stats;

//! Storage模块 - 数据库、响应缓存与配置文件

pub mod cache;
pub mod config;
pub mod database;

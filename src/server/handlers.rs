//! HTTP处理函数

use super::error::ApiError;
use super::AppState;
use crate::core::error::CohdError;
use crate::core::biolink::{map_blm_class_to_omop_domain, map_omop_domain_to_blm_class};
use crate::core::models::{BiolinkLookup, BuildStatus, DomainClass, MappingBuild, OmopBiolinkMapping};
use crate::core::params::Args;
use crate::storage::cache::ResponseCache;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

/// 不参与缓存键的参数
const NON_KEY_PARAMS: [&str; 3] = ["service", "meta", "bypass_cache"];

/// 经响应缓存执行查询
async fn cached_dispatch(
    state: &AppState,
    service: String,
    meta: String,
    args: Args,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = state.query.clone();
    let cache = state.cache.clone();

    let value = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, CohdError> {
        let bypass = args.boolean("bypass_cache").unwrap_or(false);
        let params: Vec<(String, String)> = args
            .sorted_pairs()
            .into_iter()
            .filter(|(k, _)| !NON_KEY_PARAMS.contains(&k.as_str()))
            .collect();
        let key = ResponseCache::key(&format!("{}/{}", service, meta), &params);

        if !bypass {
            if let Some(value) = cache.get::<serde_json::Value>(&key) {
                tracing::debug!("缓存命中: {}/{}", service, meta);
                return Ok(value);
            }
        }

        let value = query.dispatch(&service, &meta, &args)?;
        if let Err(e) = cache.put(&key, &value) {
            tracing::warn!("写入响应缓存失败: {}", e);
        }
        Ok(value)
    })
    .await??;

    Ok(Json(value))
}

/// GET /api/query?service=..&meta=..
pub async fn api_query(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let args = Args::from(params);
    let service = args
        .text("service")
        .ok_or_else(|| CohdError::bad_request("No service selected"))?
        .to_string();
    let meta = args.text("meta").unwrap_or_default().to_string();
    cached_dispatch(&state, service, meta, args).await
}

/// GET /api/{service}/{meta}
pub async fn api_service_meta(
    State(state): State<AppState>,
    Path((service, meta)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    cached_dispatch(&state, service, meta, Args::from(params)).await
}

#[derive(Debug, Deserialize)]
pub struct BiolinkToOmopRequest {
    #[serde(default)]
    pub curies: Vec<String>,
}

/// POST /api/translator/biolink_to_omop
pub async fn biolink_to_omop(
    State(state): State<AppState>,
    Json(req): Json<BiolinkToOmopRequest>,
) -> Result<Json<HashMap<String, Option<OmopBiolinkMapping>>>, ApiError> {
    if req.curies.is_empty() {
        return Err(CohdError::bad_request("No curies specified").into());
    }

    let cache_key =
        |curie: &str| ResponseCache::key("biolink_to_omop", &[("curie".to_string(), curie.to_string())]);

    let mut mappings = HashMap::with_capacity(req.curies.len());
    let mut misses = Vec::new();
    for curie in &req.curies {
        match state.mapping_cache.get::<OmopBiolinkMapping>(&cache_key(curie)) {
            Some(mapping) => {
                mappings.insert(curie.clone(), Some(mapping));
            }
            None => misses.push(curie.clone()),
        }
    }

    if !misses.is_empty() {
        for (curie, mapping) in state.mapper.map_to_omop(&misses).await {
            if let Some(mapping) = &mapping {
                if let Err(e) = state.mapping_cache.put(&cache_key(&curie), mapping) {
                    tracing::warn!("写入映射缓存失败: {}", e);
                }
            }
            mappings.insert(curie, mapping);
        }
    }

    Ok(Json(mappings))
}

#[derive(Debug, Deserialize)]
pub struct OmopToBiolinkRequest {
    #[serde(default)]
    pub omop_ids: Vec<String>,
}

/// POST /api/translator/omop_to_biolink
///
/// ID 可以是 `313217` 或 `OMOP:313217`，结果以输入原样为键。
pub async fn omop_to_biolink(
    State(state): State<AppState>,
    Json(req): Json<OmopToBiolinkRequest>,
) -> Result<Json<HashMap<String, Option<BiolinkLookup>>>, ApiError> {
    if req.omop_ids.is_empty() {
        return Err(CohdError::bad_request("No omop_ids specified").into());
    }

    let mappings = req
        .omop_ids
        .iter()
        .map(|raw| {
            let id = raw.trim();
            let id = id.strip_prefix("OMOP:").unwrap_or(id);
            let lookup = id
                .parse::<i64>()
                .ok()
                .and_then(|concept_id| state.mapper.map_from_omop(concept_id));
            (raw.clone(), lookup)
        })
        .collect();

    Ok(Json(mappings))
}

/// GET /api/translator/blm_class_to_omop_domain?blm_class=..
pub async fn blm_class_to_omop_domain(
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<DomainClass>>, ApiError> {
    let args = Args::from(params);
    let blm_class = args
        .text("blm_class")
        .ok_or_else(|| CohdError::bad_request("blm_class parameter is missing"))?;
    let domains = map_blm_class_to_omop_domain(blm_class)
        .ok_or_else(|| CohdError::NotFound(format!("No OMOP domain mapped for {}", blm_class)))?;
    Ok(Json(domains))
}

/// GET /api/translator/omop_domain_to_blm_class?domain_id=..&concept_class_id=..&desired=..
pub async fn omop_domain_to_blm_class(
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let args = Args::from(params);
    let domain_id = args
        .text("domain_id")
        .ok_or_else(|| CohdError::bad_request("domain_id parameter is missing"))?;
    let desired = args.list("desired");
    let blm_class =
        map_omop_domain_to_blm_class(domain_id, args.text("concept_class_id"), desired.as_deref());
    Ok(Json(serde_json::json!({ "biolink_class": blm_class })))
}

/// GET /api/dev/build_mappings
pub async fn build_mappings(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.config.is_dev_env() {
        return Err(CohdError::Forbidden(format!(
            "Mapping rebuilds are not available in the {} deployment",
            state.config.deployment_env
        ))
        .into());
    }

    let build = state.mapper.build_mappings().await?;
    if build.status == BuildStatus::Updated {
        if let Err(e) = state.mapping_cache.clear() {
            tracing::warn!("清空映射缓存失败: {}", e);
        }
    }

    Ok(Json(serde_json::json!({
        "message": build.status_message(),
        "build": build,
    })))
}

/// GET /、/api、/api/ 跳转到API文档
pub async fn docs_redirect(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [(header::LOCATION, state.config.docs_url.clone())],
    )
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "deployment_env": state.config.deployment_env,
        "biolink_mappings": state.mapper.len(),
    }))
}

/// GET /api/dev/mapping_builds?limit=..
pub async fn mapping_builds(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<MappingBuild>>, ApiError> {
    let limit = Args::from(params)
        .text("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10);
    Ok(Json(state.mapper.recent_builds(limit)?))
}

/// GET /api/dev/mapping_builds/{build_id}
pub async fn mapping_build(
    State(state): State<AppState>,
    Path(build_id): Path<String>,
) -> Result<Json<MappingBuild>, ApiError> {
    let build = state
        .mapper
        .find_build(&build_id)?
        .ok_or_else(|| CohdError::NotFound(format!("Mapping build {} not found", build_id)))?;
    Ok(Json(build))
}

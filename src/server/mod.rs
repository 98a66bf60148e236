//! Server模块 - HTTP路由与处理函数

pub mod error;
pub mod handlers;

use crate::core::biolink::BiolinkMapper;
use crate::core::models::AppConfig;
use crate::core::normalizer::NodeNormalizer;
use crate::core::query::QueryService;
use crate::storage::cache::ResponseCache;
use crate::storage::database::Database;
use anyhow::Result;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryService>,
    pub mapper: Arc<BiolinkMapper>,
    /// 查询响应缓存
    pub cache: Arc<ResponseCache>,
    /// Biolink -> OMOP 映射缓存
    pub mapping_cache: Arc<ResponseCache>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 组装服务状态
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        normalizer: Arc<dyn NodeNormalizer>,
    ) -> Result<Self> {
        let cache = ResponseCache::new(config.response_cache_dir(), config.cache_ttl_secs)?;
        let mapping_cache =
            ResponseCache::new(config.mapping_cache_dir(), config.mapping_cache_ttl_secs)?;

        let query = QueryService::new(db.clone(), config.default_confidence);
        let mapper = BiolinkMapper::new(db, normalizer)?;

        Ok(Self {
            query: Arc::new(query),
            mapper: Arc::new(mapper),
            cache: Arc::new(cache),
            mapping_cache: Arc::new(mapping_cache),
            config: Arc::new(config),
        })
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::docs_redirect))
        .route("/api", get(handlers::docs_redirect))
        .route("/api/", get(handlers::docs_redirect))
        .route("/health", get(handlers::health))
        .route("/api/health", get(handlers::health))
        .route("/api/query", get(handlers::api_query))
        .route("/api/v1/query", get(handlers::api_query))
        .route(
            "/api/translator/biolink_to_omop",
            post(handlers::biolink_to_omop),
        )
        .route(
            "/api/translator/omop_to_biolink",
            post(handlers::omop_to_biolink),
        )
        .route(
            "/api/translator/blm_class_to_omop_domain",
            get(handlers::blm_class_to_omop_domain),
        )
        .route(
            "/api/translator/omop_domain_to_blm_class",
            get(handlers::omop_domain_to_blm_class),
        )
        .route("/api/dev/build_mappings", get(handlers::build_mappings))
        .route("/api/dev/mapping_builds", get(handlers::mapping_builds))
        .route(
            "/api/dev/mapping_builds/{build_id}",
            get(handlers::mapping_build),
        )
        .route("/api/{service}/{meta}", get(handlers::api_service_meta))
        .route("/api/v1/{service}/{meta}", get(handlers::api_service_meta))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// 启动HTTP服务，Ctrl-C 时退出
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.bind_addr.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("COHD 服务监听于 http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("监听退出信号失败: {}", e);
            }
        })
        .await?;

    tracing::info!("COHD 服务已停止");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalizer::stub::sample_normalizer;
    use crate::storage::database::fixtures::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    async fn test_state(deployment_env: &str) -> (AppState, TempDir) {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            cache_dir: dir.path().join("cache"),
            deployment_env: deployment_env.to_string(),
            ..AppConfig::default()
        };
        let state = AppState::new(config, Arc::new(sample_db()), Arc::new(sample_normalizer())).unwrap();
        state.mapper.build_mappings().await.unwrap();
        (state, dir)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_service_routes() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        let (status, body) = get(&app, "/api/metadata/datasets").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["results"].as_array().unwrap().len(), 3);

        let (status, body) = get(
            &app,
            "/api/query?service=association&meta=chiSquare&concept_id_1=313217&concept_id_2=316139",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["results"][0]["n_c1_c2"], 30);

        let (status, body) = get(&app, "/api/v1/frequencies/singleConceptFreq?q=313217").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"concept_count\":100"));

        let (status, body) = get(&app, "/api/metadata/visitCount?dataset_id=2").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("1500"));
    }

    #[tokio::test]
    async fn test_temporal_routes() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        let (status, body) = get(&app, "/api/temporal/conceptAgeCounts?concept_id=313217").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["results"][0]["counts"], serde_json::json!([1, 12, 32, 45]));
        assert_eq!(json["results"][0]["confidence_interval"][0], serde_json::json!([0, 4]));

        let (status, body) = get(
            &app,
            "/api/v1/temporal/conceptPairDeltaCounts?source_concept_id=313217&target_concept_id=1310149",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["results"][0]["counts"], serde_json::json!([2, 4, 9, 7, 3]));

        assert_eq!(
            get(&app, "/api/temporal/conceptPairDeltaCounts?source_concept_id=313217").await,
            (
                StatusCode::BAD_REQUEST,
                "target_concept_id parameter is missing".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_parameter_errors_are_plain_text() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        assert_eq!(
            get(&app, "/api/query").await,
            (StatusCode::BAD_REQUEST, "No service selected".to_string())
        );
        assert_eq!(
            get(&app, "/api/foo/bar").await,
            (StatusCode::BAD_REQUEST, "service not recognized".to_string())
        );
        assert_eq!(
            get(&app, "/api/query?service=omop&meta=nothing").await,
            (StatusCode::BAD_REQUEST, "meta not recognized".to_string())
        );
        assert_eq!(
            get(&app, "/api/omop/findConceptIDs").await,
            (StatusCode::BAD_REQUEST, "q parameter is missing".to_string())
        );
        assert_eq!(
            get(&app, "/api/association/obsExpRatio?concept_id_1=313217&confidence=2").await,
            (
                StatusCode::BAD_REQUEST,
                "Confidence should be a number between 0-1".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_responses_are_cached() {
        let (state, dir) = test_state("dev").await;
        let app = router(state);
        let responses = dir.path().join("cache").join("responses");
        let entries = || std::fs::read_dir(&responses).unwrap().count();

        let (status, first) = get(&app, "/api/omop/vocabularies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entries(), 1);

        // 两种路由共享同一缓存条目
        let (_, second) = get(&app, "/api/query?service=omop&meta=vocabularies").await;
        assert_eq!(first, second);
        assert_eq!(entries(), 1);

        let (status, third) = get(&app, "/api/omop/vocabularies?bypass_cache=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, third);
        assert_eq!(entries(), 1);
    }

    #[tokio::test]
    async fn test_translator_endpoints() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        let (status, json) = post_json(
            &app,
            "/api/translator/biolink_to_omop",
            serde_json::json!({"curies": ["MONDO:0004981", "MONDO:0004981BAD"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["MONDO:0004981"]["omop_id"], "OMOP:313217");
        assert!(json["MONDO:0004981BAD"].is_null());
        assert!(json.as_object().unwrap().contains_key("MONDO:0004981BAD"));

        let (status, json) = post_json(
            &app,
            "/api/translator/omop_to_biolink",
            serde_json::json!({"omop_ids": ["313217", "OMOP:1310149", "78472197508"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["313217"]["mapping"]["biolink_id"], "MONDO:0004981");
        assert_eq!(json["OMOP:1310149"]["mapping"]["biolink_id"], "CHEBI:10033");
        assert!(json["78472197508"].is_null());

        let (status, _) = post_json(
            &app,
            "/api/translator/omop_to_biolink",
            serde_json::json!({"omop_ids": []}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_class_domain_translation() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        let (status, body) = get(
            &app,
            "/api/translator/blm_class_to_omop_domain?blm_class=biolink:Disease",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["domain_id"], "Condition");

        let (status, _) = get(
            &app,
            "/api/translator/blm_class_to_omop_domain?blm_class=biolink:Unknown",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get(
            &app,
            "/api/translator/omop_domain_to_blm_class?domain_id=Drug&concept_class_id=Ingredient",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["biolink_class"], "biolink:MolecularEntity");

        let (status, _) = get(&app, "/api/translator/omop_domain_to_blm_class").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mapping_build_history() {
        let (state, _dir) = test_state("dev").await;
        let app = router(state);

        let (status, body) = get(&app, "/api/dev/mapping_builds").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let build_id = json[0]["build_id"].as_str().unwrap().to_string();

        let (status, body) = get(&app, &format!("/api/dev/mapping_builds/{}", build_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Updated"));

        let (status, _) = get(&app, "/api/dev/mapping_builds/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_build_mappings_only_in_dev() {
        let (state, _dir) = test_state("itrb-prod").await;
        let app = router(state);
        let (status, _) = get(&app, "/api/dev/build_mappings").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (state, _dir) = test_state("itrb-ci").await;
        let app = router(state);
        let (status, body) = get(&app, "/api/dev/build_mappings").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["build"]["status"], "Updated");
        assert!(json["message"].as_str().unwrap().starts_with("Current number of mappings: 5"));
    }

    #[tokio::test]
    async fn test_redirect_and_health() {
        let (state, _dir) = test_state("dev").await;
        let docs_url = state.config.docs_url.clone();
        let app = router(state);

        for uri in ["/", "/api", "/api/"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(response.headers()[header::LOCATION], docs_url.as_str());
        }

        let (status, body) = get(&app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["biolink_mappings"], 5);
    }
}

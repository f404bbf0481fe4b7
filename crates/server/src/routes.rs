use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use ledgerline_core::{AccountId, DuplicatePolicy, EntityLink, FileFormat, ImportFile, UserId};
use ledgerline_import::{
    ImportPage, ImportPipeline, ImportRequest, ImportSummary, ParseOptions, RecurringDetection,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::error::AppError;

const USER_HEADER: &str = "x-user-id";
const MAX_PER_PAGE: u32 = 100;

pub struct AppState {
    pub pipeline: ImportPipeline,
    pub max_upload_bytes: usize,
}

pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    // Multipart framing adds a little on top of the file itself.
    let body_limit = state.max_upload_bytes + 64 * 1024;

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/imports", post(upload_statement).get(list_imports))
        .route("/imports/{id}", get(get_import))
        .route("/recurring/detect", post(detect_recurring))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<axum::body::Body>| {
                info_span!(
                    "request",
                    id = %Uuid::new_v4(),
                    method = %req.method(),
                    uri = %req.uri(),
                )
            }),
        );

    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if !origins.is_empty() {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        );
    }

    app.with_state(state)
}

fn user_id(headers: &HeaderMap) -> Result<UserId, AppError> {
    let raw = headers
        .get(USER_HEADER)
        .ok_or_else(|| AppError::Unauthorized(format!("Missing {USER_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .map(UserId)
        .ok_or_else(|| AppError::Unauthorized(format!("Invalid {USER_HEADER} header")))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn parse_flag(name: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(AppError::bad_request(format!("Invalid {name}: {value}"))),
    }
}

/// POST /imports - upload one statement.
///
/// Multipart form fields:
/// - file: the statement (required)
/// - account_id, duplicate_policy, format, update_balance, auto_link (optional)
/// - options: JSON parse options (optional)
/// - links: JSON object of row number → `{"type": "EXPENSE", "id": 12}` (optional)
async fn upload_statement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ImportSummary>, AppError> {
    let user = user_id(&headers)?;

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut account_id = None;
    let mut policy = DuplicatePolicy::default();
    let mut format: Option<FileFormat> = None;
    let mut options: Option<ParseOptions> = None;
    let mut update_balance = false;
    let mut auto_link = true;
    let mut links: HashMap<usize, EntityLink> = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Rejected(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or("").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::Rejected(e.status(), e.body_text()))?;
            if bytes.len() > state.max_upload_bytes {
                return Err(AppError::Rejected(
                    axum::http::StatusCode::PAYLOAD_TOO_LARGE,
                    format!(
                        "File too large. Maximum size is {} MB",
                        state.max_upload_bytes / 1024 / 1024
                    ),
                ));
            }
            file = Some((filename, bytes.to_vec()));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|_| AppError::bad_request(format!("Failed to read {name}")))?;
        match name.as_str() {
            "account_id" if !value.trim().is_empty() => {
                let id = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| AppError::bad_request(format!("Invalid account_id: {value}")))?;
                account_id = Some(AccountId(id));
            }
            "duplicate_policy" if !value.trim().is_empty() => {
                policy = value.parse().map_err(AppError::BadRequest)?;
            }
            "format" if !value.trim().is_empty() => {
                format = Some(value.parse().map_err(AppError::BadRequest)?);
            }
            "options" if !value.trim().is_empty() => {
                options = Some(
                    serde_json::from_str(&value)
                        .map_err(|e| AppError::bad_request(format!("Invalid options: {e}")))?,
                );
            }
            "links" if !value.trim().is_empty() => {
                links = serde_json::from_str(&value)
                    .map_err(|e| AppError::bad_request(format!("Invalid links: {e}")))?;
            }
            "update_balance" => update_balance = parse_flag("update_balance", &value)?,
            "auto_link" => auto_link = parse_flag("auto_link", &value)?,
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| AppError::bad_request("Missing file field"))?;
    info!(user = %user, filename = %filename, bytes = bytes.len(), "statement uploaded");

    let mut request = ImportRequest::new(user, filename, bytes);
    request.format = format;
    request.account_id = account_id;
    request.duplicate_policy = policy;
    if let Some(options) = options {
        request.options = options;
    }
    request.update_balance = update_balance;
    request.auto_link = auto_link;
    request.links = links;

    let summary = state.pipeline.import(request).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    page: Option<u32>,
    per_page: Option<u32>,
}

/// GET /imports - prior imports, newest first.
async fn list_imports(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> Result<Json<ImportPage>, AppError> {
    let user = user_id(&headers)?;
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, MAX_PER_PAGE);
    let result = state.pipeline.store().list_imports(user, page, per_page).await?;
    Ok(Json(result))
}

async fn get_import(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ImportFile>, AppError> {
    let user = user_id(&headers)?;
    state
        .pipeline
        .store()
        .get_import(id)
        .await?
        .filter(|f| f.user_id == user)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Import {id} not found")))
}

#[derive(Debug, Deserialize)]
struct DetectParams {
    as_of: Option<NaiveDate>,
}

/// POST /recurring/detect - recurring detection without an import.
async fn detect_recurring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DetectParams>,
) -> Result<Json<RecurringDetection>, AppError> {
    let user = user_id(&headers)?;
    let as_of = params.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let detection = state.pipeline.run_recurring_detection(user, as_of).await?;
    Ok(Json(detection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use ledgerline_import::{MemoryStore, PipelineConfig};
    use tower::ServiceExt;

    const BOUNDARY: &str = "ledgerline-test-boundary";

    fn app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState {
            pipeline: ImportPipeline::new(store.clone(), PipelineConfig::default()),
            max_upload_bytes: 1024 * 1024,
        });
        (store, router(state, &[]))
    }

    fn multipart_body(filename: &str, content: &str, fields: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: text/csv\r\n\r\n{content}\r\n"
        ));
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn upload(user: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/imports")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const CSV: &str = "Date,Description,Amount\n2024-01-05,WOOLWORTHS 1234,-45.00\n2024-01-06,ACME PAYROLL,2500.00\n";

    #[tokio::test]
    async fn health_is_ok() {
        let (_, app) = app();
        let res = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_then_conflict() {
        let (_, app) = app();
        let res = app
            .clone()
            .oneshot(upload(Some("1"), multipart_body("jan.csv", CSV, &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let summary = json_body(res).await;
        assert_eq!(summary["imported"], 2);
        assert_eq!(summary["total_rows"], 2);
        let id = summary["import_file_id"].as_i64().unwrap();

        let res = app
            .oneshot(upload(Some("1"), multipart_body("copy.csv", CSV, &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(res).await["existing_import_id"], id);
    }

    #[tokio::test]
    async fn mark_duplicate_field_allows_reimport() {
        let (store, app) = app();
        app.clone()
            .oneshot(upload(Some("1"), multipart_body("jan.csv", CSV, &[])))
            .await
            .unwrap();
        let res = app
            .oneshot(upload(
                Some("1"),
                multipart_body("jan.csv", CSV, &[("duplicate_policy", "MARK_DUPLICATE")]),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(store.transactions(UserId(1)).await.len(), 4);
    }

    #[tokio::test]
    async fn missing_user_is_unauthorized() {
        let (_, app) = app();
        let res = app
            .oneshot(upload(None, multipart_body("jan.csv", CSV, &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn error_statuses() {
        let (_, app) = app();

        let res = app
            .clone()
            .oneshot(upload(Some("1"), multipart_body("s.ofx", "<OFX/>", &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED);

        let res = app
            .clone()
            .oneshot(upload(Some("1"), multipart_body("s.pdf", "x", &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(upload(
                Some("1"),
                multipart_body("s.csv", CSV, &[("duplicate_policy", "MAYBE")]),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .oneshot(upload(
                Some("1"),
                multipart_body("s.csv", CSV, &[("update_balance", "true")]),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stage_failure_is_500_with_import_id() {
        let (store, app) = app();
        store.fail_transaction_inserts(true).await;
        let res = app
            .oneshot(upload(Some("1"), multipart_body("jan.csv", CSV, &[])))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(res).await;
        assert!(body["import_file_id"].as_i64().is_some());
        assert!(body["message"].as_str().unwrap().contains("transaction insert rejected"));
    }

    #[tokio::test]
    async fn options_and_links_fields() {
        let (store, app) = app();
        let csv = "05/01/2024;Netflix;-15.99\n";
        let options = r#"{"delimiter":";","has_header":false,"date_format":"%d/%m/%Y","mapping":{"date":0,"description":1,"amount":2}}"#;
        let links = r#"{"1":{"type":"EXPENSE","id":42}}"#;
        let res = app
            .oneshot(upload(
                Some("1"),
                multipart_body("nf.csv", csv, &[("options", options), ("links", links)]),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let txs = store.transactions(UserId(1)).await;
        assert_eq!(txs[0].date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(txs[0].link, Some(EntityLink::Expense(42)));
    }

    #[tokio::test]
    async fn list_and_get_are_scoped_to_user() {
        let (_, app) = app();
        let res = app
            .clone()
            .oneshot(upload(Some("1"), multipart_body("jan.csv", CSV, &[])))
            .await
            .unwrap();
        let id = json_body(res).await["import_file_id"].as_i64().unwrap();

        let list = |user: &str| {
            Request::get("/imports?page=1&per_page=5")
                .header(USER_HEADER, user)
                .body(Body::empty())
                .unwrap()
        };
        let page = json_body(app.clone().oneshot(list("1")).await.unwrap()).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["status"], "COMPLETED");
        let other = json_body(app.clone().oneshot(list("2")).await.unwrap()).await;
        assert_eq!(other["total"], 0);

        let far = Request::get("/imports?page=4294967295&per_page=100")
            .header(USER_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(far).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let far = json_body(res).await;
        assert_eq!(far["total"], 1);
        assert_eq!(far["items"].as_array().unwrap().len(), 0);

        let get = |user: &str| {
            Request::get(format!("/imports/{id}"))
                .header(USER_HEADER, user)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(app.clone().oneshot(get("1")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(get("2")).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recurring_detection_endpoint() {
        let (_, app) = app();
        let mut csv = String::from("Date,Description,Amount\n");
        for m in 1..=4 {
            csv.push_str(&format!("2024-{m:02}-15,SPOTIFY,-11.99\n"));
        }
        app.clone()
            .oneshot(upload(Some("1"), multipart_body("s.csv", &csv, &[])))
            .await
            .unwrap();

        let res = app
            .oneshot(
                Request::post("/recurring/detect?as_of=2024-04-20")
                    .header(USER_HEADER, "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        // Already registered during the import, so the rerun changes nothing.
        assert_eq!(body["detected"].as_array().unwrap().len(), 0);
        assert_eq!(body["updated"].as_array().unwrap().len(), 0);
        assert_eq!(body["recurring_transactions"].as_array().unwrap().len(), 4);
    }
}

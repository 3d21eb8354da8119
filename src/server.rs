//! warp routes over [`DataService`].

use bytes::BufMut;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use tracing::{error, info, warn};
use warp::{
    http::{header, HeaderValue, StatusCode},
    multipart::FormData,
    reject::Reject,
    Filter, Rejection, Reply,
};

use crate::auth::{Authenticator, Credentials, IssuedTokens, Principal};
use crate::error::ServiceError;
use crate::service::DataService;
use crate::store::Record;

const WELCOME: &str = "Welcome to the Data Upload and Query API!";

pub struct AppState {
    pub service: DataService,
    pub auth: Arc<dyn Authenticator>,
    /// Tokens minted through `/tokens`; `auth` must also accept these.
    pub tokens: Arc<IssuedTokens>,
    pub max_upload_bytes: u64,
}

#[derive(Debug)]
struct ApiError(ServiceError);

impl Reject for ApiError {}

fn reject(err: ServiceError) -> Rejection {
    warp::reject::custom(ApiError(err))
}

#[derive(Deserialize)]
struct QuestionInput {
    question: String,
}

#[derive(Deserialize)]
struct TokenInput {
    token: String,
}

#[derive(Deserialize)]
struct IngestRequest {
    source_name: String,
    records: Vec<Record>,
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&state))
}

fn authenticated(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Principal,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: Arc<AppState>| async move {
            let header = header
                .ok_or_else(|| reject(ServiceError::Unauthorized("Not authenticated".into())))?;
            let credentials = Credentials::from_header(&header).map_err(reject)?;
            state.auth.authenticate(&credentials).map_err(reject)
        })
}

/// Run store work on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, Rejection>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| reject(anyhow::Error::new(e).context("blocking task failed").into()))?
        .map_err(reject)
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let root = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "message": WELCOME })));

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&json!({ "status": "healthy", "service": "dataquery" })));

    let upload = warp::path("upload-csv")
        .and(warp::path::end())
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(warp::multipart::form().max_length(state.max_upload_bytes))
        .and(with_state(state.clone()))
        .and_then(upload_csv);

    let ingest = warp::path("ingest")
        .and(warp::path::end())
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(ingest_records);

    let list = warp::path("data")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| warp::reply::json(&state.service.list()));

    let one = warp::path!("data" / u64)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_row);

    let logs = warp::path("logs")
        .and(warp::path::end())
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .map(|_: Principal, state: Arc<AppState>| warp::reply::json(&state.service.logs()));

    let ask = warp::path("ask-data-ai")
        .and(warp::path::end())
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(ask_question);

    let issue = warp::path("tokens")
        .and(warp::path::end())
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .map(|principal: Principal, state: Arc<AppState>| {
            info!(principal = %principal.name, "token issued");
            warp::reply::json(&json!({ "token": state.tokens.issue() }))
        });

    let revoke = warp::path("tokens")
        .and(warp::path::end())
        .and(warp::delete())
        .and(authenticated(state.clone()))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .map(|_: Principal, input: TokenInput, state: Arc<AppState>| {
            warp::reply::json(&json!({ "revoked": state.tokens.revoke(&input.token) }))
        });

    let service = state.service.clone();
    root.or(health)
        .or(upload)
        .or(ingest)
        .or(list)
        .or(one)
        .or(logs)
        .or(ask)
        .or(issue)
        .or(revoke)
        .recover(handle_rejection)
        .with(warp::log::custom(move |info| {
            let service = service.clone();
            let method = info.method().as_str().to_string();
            let path = info.path().to_string();
            let status = info.status().as_u16();
            let elapsed = info.elapsed();
            // the durable log fsyncs each entry
            tokio::task::spawn_blocking(move || {
                service.record_request(&method, &path, status, elapsed)
            });
        }))
}

/// Find the `file` part and read it before pulling any later part.
async fn read_upload(mut form: FormData) -> Result<(String, Vec<u8>), ServiceError> {
    let malformed = |e: warp::Error| ServiceError::Parse(e.to_string());
    while let Some(part) = form.try_next().await.map_err(malformed)? {
        if part.name() != "file" {
            continue;
        }
        let filename = part.filename().unwrap_or_default().to_string();
        let bytes = part
            .stream()
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.put(chunk);
                Ok::<_, warp::Error>(acc)
            })
            .await
            .map_err(malformed)?;
        return Ok((filename, bytes));
    }
    Err(ServiceError::InvalidInput(
        "expected a multipart field named `file`".into(),
    ))
}

async fn upload_csv(
    principal: Principal,
    form: FormData,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let (filename, bytes) = read_upload(form).await.map_err(reject)?;
    info!(principal = %principal.name, file = %filename, bytes = bytes.len(), "upload received");
    let service = state.service.clone();
    let summary = run_blocking(move || service.upload_csv(&filename, &bytes)).await?;
    Ok(warp::reply::json(&summary))
}

async fn ingest_records(
    principal: Principal,
    request: IngestRequest,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    info!(principal = %principal.name, source = %request.source_name, records = request.records.len(), "ingest received");
    let service = state.service.clone();
    let rows = run_blocking(move || service.ingest(&request.source_name, request.records)).await?;
    let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
    Ok(warp::reply::json(&json!({
        "message": format!("{} rows stored successfully.", ids.len()),
        "ids": ids,
    })))
}

async fn get_row(id: u64, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let row = state.service.get(id).map_err(reject)?;
    Ok(warp::reply::json(&row))
}

async fn ask_question(
    _principal: Principal,
    input: QuestionInput,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let result = state.service.ask(&input.question).map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "question": result.question,
        "answer": result.message,
        "matched_item": result.matched_item_key,
        "matched_attribute": result.matched_attribute,
        "value": result.value,
    })))
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Validation(_)
        | ServiceError::InvalidInput(_)
        | ServiceError::UnsupportedFile(_)
        | ServiceError::EmptyFile
        | ServiceError::Parse(_)
        | ServiceError::Decode(_) => StatusCode::BAD_REQUEST,
        ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, detail) = if let Some(ApiError(e)) = err.find::<ApiError>() {
        if !e.is_client_error() {
            error!("request failed: {:#}", e);
        }
        (status_for(e), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Upload too large".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported media type".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed".to_string(),
        )
    } else {
        warn!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    let mut response =
        warp::reply::with_status(warp::reply::json(&json!({ "detail": detail })), status)
            .into_response();
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AnyOf, StaticCredentials};
    use crate::requestlog::RequestLog;
    use crate::store::RowStore;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::tempdir;

    const BOUNDARY: &str = "dataquery-test-boundary";

    fn state_with(service: DataService) -> Arc<AppState> {
        let tokens = Arc::new(IssuedTokens::new());
        let auth = AnyOf(vec![
            Box::new(StaticCredentials::new("admin", "secret")),
            Box::new(Arc::clone(&tokens)),
        ]);
        Arc::new(AppState {
            service,
            auth: Arc::new(auth),
            tokens,
            max_upload_bytes: 1024 * 1024,
        })
    }

    fn state() -> Arc<AppState> {
        state_with(DataService::in_memory())
    }

    /// Request log writes land off the request path; wait for them.
    async fn wait_for_logs(state: &Arc<AppState>, n: usize) {
        for _ in 0..200 {
            if state.service.logs().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} log entries, have {}", n, state.service.logs().len());
    }

    fn basic() -> String {
        format!("Basic {}", STANDARD.encode("admin:secret"))
    }

    fn multipart(filename: &str, content: &str) -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: text/csv\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = filename,
            c = content
        )
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    async fn upload(state: &Arc<AppState>, filename: &str, content: &str) -> (StatusCode, Value) {
        let resp = warp::test::request()
            .method("POST")
            .path("/upload-csv")
            .header("authorization", basic())
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(multipart(filename, content))
            .reply(&routes(state.clone()))
            .await;
        (resp.status(), json_body(resp.body()))
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let api = routes(state());
        let resp = warp::test::request().path("/").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(json_body(resp.body())["status"], "healthy");
    }

    #[tokio::test]
    async fn test_upload_then_ask() {
        let state = state();
        let (status, body) = upload(&state, "fruit.csv", "item_name,price\napple,1.5\n").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows_inserted"], 1);

        let resp = warp::test::request()
            .method("POST")
            .path("/ask-data-ai")
            .header("authorization", basic())
            .json(&json!({ "question": "What is the price of apple?" }))
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp.body());
        assert_eq!(body["answer"], "The price of apple is: 1.5");
        assert_eq!(body["question"], "what is the price of apple?");
        assert_eq!(body["matched_attribute"], "price");
    }

    #[tokio::test]
    async fn test_upload_skips_leading_parts() {
        let state = state();
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nweekly stock\r\n{rest}",
            b = BOUNDARY,
            rest = multipart("stock.csv", "item_name,stock\nkettle,4\n")
        );
        let resp = warp::test::request()
            .method("POST")
            .path("/upload-csv")
            .header("authorization", basic())
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(body)
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.service.list()[0].source_name, "stock.csv");
    }

    #[tokio::test]
    async fn test_upload_without_file_part() {
        let state = state();
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let resp = warp::test::request()
            .method("POST")
            .path("/upload-csv")
            .header("authorization", basic())
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(body)
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_issued_token_authenticates_until_revoked() {
        let state = state();
        let api = routes(state.clone());
        let resp = warp::test::request()
            .method("POST")
            .path("/tokens")
            .header("authorization", basic())
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let token = json_body(resp.body())["token"].as_str().unwrap().to_string();
        let bearer = format!("Bearer {}", token);

        let resp = warp::test::request()
            .path("/logs")
            .header("authorization", &bearer)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = warp::test::request()
            .method("DELETE")
            .path("/tokens")
            .header("authorization", basic())
            .json(&json!({ "token": token }))
            .reply(&api)
            .await;
        assert_eq!(json_body(resp.body())["revoked"], true);

        let resp = warp::test::request()
            .path("/logs")
            .header("authorization", &bearer)
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_rejections() {
        let state = state();
        let (status, _) = upload(&state, "fruit.txt", "item_name\napple\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = upload(&state, "fruit.csv", "item_name,price\napple,\n").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("missing"));

        assert!(state.service.list().is_empty());
    }

    #[tokio::test]
    async fn test_auth_required() {
        let api = routes(state());
        let resp = warp::test::request()
            .method("POST")
            .path("/ask-data-ai")
            .json(&json!({ "question": "price of apple" }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()["www-authenticate"], "Basic");

        let resp = warp::test::request()
            .path("/logs")
            .header("authorization", format!("Basic {}", STANDARD.encode("admin:wrong")))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_question() {
        let api = routes(state());
        let resp = warp::test::request()
            .method("POST")
            .path("/ask-data-ai")
            .header("authorization", basic())
            .json(&json!({ "question": "" }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_data_listing_and_lookup() {
        let state = state();
        upload(&state, "fruit.csv", "item_name,price\napple,1.5\npear,2\n").await;
        let api = routes(state.clone());

        let resp = warp::test::request().path("/data").reply(&api).await;
        let rows = json_body(resp.body());
        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["fields"]["item_name"], "pear");

        let resp = warp::test::request().path("/data/1").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp.body())["fields"]["price"], 1.5);

        let resp = warp::test::request().path("/data/99").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_json_ingest_is_all_or_nothing() {
        let state = state();
        let api = routes(state.clone());
        let resp = warp::test::request()
            .method("POST")
            .path("/ingest")
            .header("authorization", basic())
            .json(&json!({
                "source_name": "api",
                "records": [{ "item_name": "kiwi" }, { "item_name": "lime", "price": null }]
            }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.service.list().is_empty());

        let resp = warp::test::request()
            .method("POST")
            .path("/ingest")
            .header("authorization", basic())
            .json(&json!({
                "source_name": "api",
                "records": [{ "item_name": "kiwi", "stock": 3 }]
            }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp.body())["ids"], json!([1]));
    }

    #[tokio::test]
    async fn test_requests_are_logged() {
        let state = state();
        let api = routes(state.clone());
        warp::test::request().path("/data").reply(&api).await;
        wait_for_logs(&state, 1).await;
        warp::test::request().path("/data/7").reply(&api).await;
        wait_for_logs(&state, 2).await;

        let resp = warp::test::request()
            .path("/logs")
            .header("authorization", basic())
            .reply(&api)
            .await;
        let logs = json_body(resp.body());
        let logs = logs.as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["path"], "/data/7");
        assert_eq!(logs[0]["status_code"], 404);
        assert_eq!(logs[1]["method"], "GET");
    }

    #[tokio::test]
    async fn test_durable_request_log() {
        let tmp = tempdir().unwrap();
        let service = DataService::new(
            Arc::new(RowStore::open(tmp.path()).unwrap()),
            Arc::new(RequestLog::open(tmp.path()).unwrap()),
        );
        let state = state_with(service);
        let api = routes(state.clone());
        warp::test::request().path("/health").reply(&api).await;
        wait_for_logs(&state, 1).await;

        let reopened = RequestLog::open(tmp.path()).unwrap();
        let entries = reopened.list_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/health");
    }
}

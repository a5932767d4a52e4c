// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(dead_code)]

//! In-process stand-in for the storage service.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_test::TestServer;
use base64::{Engine, engine::general_purpose::STANDARD};
use jiff::SignedDuration;
use objsync_transfer::{Credentials, RetryConfig, TransferClient, TransferConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

pub const KEY_ID: &str = "key-id";
pub const APPLICATION_KEY: &str = "application-key";
pub const BUCKET_ID: &str = "bucket-1";
pub const BUCKET_NAME: &str = "photos";

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id:      String,
    pub bucket_id:    String,
    pub name:         String,
    pub content_type: String,
    pub data:         Vec<u8>,
    /// What the service reports in `X-Bz-Content-Sha1`.
    pub sha1:         String,
    pub file_info:    BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UploadedPart {
    pub number: u32,
    pub sha1:   String,
    pub data:   Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LargeSession {
    pub file_id:      String,
    pub bucket_id:    String,
    pub name:         String,
    pub content_type: String,
    pub file_info:    BTreeMap<String, String>,
    pub parts:        Vec<UploadedPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishCall {
    pub file_id:    String,
    pub part_sha1s: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub files:                  HashMap<String, StoredFile>,
    pub sessions:               HashMap<String, LargeSession>,
    pub finish_calls:           Vec<FinishCall>,
    pub next_id:                usize,
    pub account_token:          String,
    pub authorize_calls:        usize,
    pub upload_url_calls:       usize,
    pub upload_attempts:        usize,
    /// Statuses returned by the next upload requests, in order.
    pub upload_failures:        VecDeque<u16>,
    /// How many `b2_get_upload_url` calls fail before one succeeds.
    pub upload_url_failures:    usize,
    /// Reject the next API call with 401 once.
    pub expire_token:           bool,
    /// Upload requests for these names are rejected with 400.
    pub rejected_names:         HashSet<String>,
    /// Statuses returned by the next download requests, in order.
    pub download_failures:      VecDeque<u16>,
}

#[derive(Clone)]
pub struct MockService {
    pub state:     Arc<Mutex<MockState>>,
    pub part_size: u64,
}

impl MockService {
    fn new(part_size: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            part_size,
        }
    }

    pub async fn insert_file(&self, name: &str, data: &[u8], sha1: Option<&str>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let file_id = format!("4_z{}_f{}", BUCKET_ID, state.next_id);
        state.files.insert(file_id.clone(), StoredFile {
            file_id:      file_id.clone(),
            bucket_id:    BUCKET_ID.to_string(),
            name:         name.to_string(),
            content_type: "application/octet-stream".to_string(),
            data:         data.to_vec(),
            sha1:         sha1.map_or_else(|| sha1_hex(data), str::to_string),
            file_info:    BTreeMap::new(),
        });
        file_id
    }

    pub async fn file_named(&self, name: &str) -> Option<StoredFile> {
        let state = self.state.lock().await;
        state.files.values().find(|f| f.name == name).cloned()
    }
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": status.as_u16(), "code": code, "message": message })),
    )
        .into_response()
}

fn status_error(status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap();
    let code = match status.as_u16() {
        503 => "service_unavailable",
        429 => "too_many_requests",
        401 => "expired_auth_token",
        404 => "not_found",
        _ => "bad_request",
    };
    error(status, code, "injected failure")
}

fn file_json(file: &StoredFile) -> Value {
    json!({
        "accountId": "account-1",
        "action": "upload",
        "bucketId": file.bucket_id,
        "contentLength": file.data.len(),
        "contentSha1": file.sha1,
        "contentType": file.content_type,
        "fileId": file.file_id,
        "fileInfo": file.file_info,
        "fileName": file.name,
        "uploadTimestamp": 1_700_000_000_000_i64,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn authorize(State(mock): State<MockService>, headers: HeaderMap) -> Response {
    let expected = format!(
        "Basic {}",
        STANDARD.encode(format!("{KEY_ID}:{APPLICATION_KEY}"))
    );
    if header_str(&headers, "authorization") != Some(expected.as_str()) {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token", "invalid key");
    }

    let mut state = mock.state.lock().await;
    state.authorize_calls += 1;
    state.account_token = format!("account-token-{}", state.authorize_calls);
    let base = base_url(&headers);
    Json(json!({
        "accountId": "account-1",
        "authorizationToken": state.account_token,
        "apiUrl": base,
        "downloadUrl": base,
        "recommendedPartSize": mock.part_size,
        "absoluteMinimumPartSize": 1,
    }))
    .into_response()
}

/// Checks the account token on API and download calls.
fn check_account_token(state: &mut MockState, headers: &HeaderMap) -> Option<Response> {
    if state.expire_token {
        state.expire_token = false;
        return Some(error(
            StatusCode::UNAUTHORIZED,
            "expired_auth_token",
            "Authorization token has expired",
        ));
    }
    if header_str(headers, "authorization") != Some(state.account_token.as_str()) {
        return Some(error(
            StatusCode::UNAUTHORIZED,
            "bad_auth_token",
            "Invalid authorization token",
        ));
    }
    None
}

async fn get_upload_url(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    state.upload_url_calls += 1;
    if state.upload_url_failures > 0 {
        state.upload_url_failures -= 1;
        return error(StatusCode::BAD_REQUEST, "bad_request", "bucket is not writable");
    }
    let bucket_id = body["bucketId"].as_str().unwrap_or_default();
    Json(json!({
        "bucketId": bucket_id,
        "uploadUrl": format!("{}/upload/{bucket_id}", base_url(&headers)),
        "authorizationToken": format!("upload-token-{bucket_id}"),
    }))
    .into_response()
}

async fn upload_file(
    State(mock): State<MockService>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = mock.state.lock().await;
    state.upload_attempts += 1;
    if let Some(status) = state.upload_failures.pop_front() {
        return status_error(status);
    }
    if header_str(&headers, "authorization") != Some(format!("upload-token-{bucket_id}").as_str())
    {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token", "wrong upload token");
    }

    let Some(name) = header_str(&headers, "x-bz-file-name")
        .and_then(|v| urlencoding::decode(v).ok())
        .map(|v| v.into_owned())
    else {
        return error(StatusCode::BAD_REQUEST, "bad_request", "missing file name");
    };
    if state.rejected_names.contains(&name) {
        return error(StatusCode::BAD_REQUEST, "bad_request", "file name rejected");
    }
    let declared = header_str(&headers, "x-bz-content-sha1").unwrap_or_default();
    if declared != sha1_hex(&body) {
        return error(StatusCode::BAD_REQUEST, "bad_request", "sha1 did not match data");
    }

    let mut file_info = BTreeMap::new();
    if let Some(millis) = header_str(&headers, "x-bz-info-src_last_modified_millis") {
        file_info.insert("src_last_modified_millis".to_string(), millis.to_string());
    }
    state.next_id += 1;
    let file = StoredFile {
        file_id: format!("4_z{bucket_id}_f{}", state.next_id),
        bucket_id,
        name,
        content_type: header_str(&headers, "content-type")
            .unwrap_or_default()
            .to_string(),
        sha1: declared.to_string(),
        data: body.to_vec(),
        file_info,
    };
    let response = file_json(&file);
    state.files.insert(file.file_id.clone(), file);
    Json(response).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFile {
    bucket_id:    String,
    file_name:    String,
    content_type: String,
    #[serde(default)]
    file_info:    BTreeMap<String, String>,
}

async fn start_large_file(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Json(body): Json<StartLargeFile>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    state.next_id += 1;
    let session = LargeSession {
        file_id:      format!("4_z{}_large{}", body.bucket_id, state.next_id),
        bucket_id:    body.bucket_id,
        name:         body.file_name,
        content_type: body.content_type,
        file_info:    body.file_info,
        parts:        Vec::new(),
    };
    let response = json!({
        "accountId": "account-1",
        "action": "start",
        "bucketId": session.bucket_id,
        "contentLength": 0,
        "contentSha1": "none",
        "contentType": session.content_type,
        "fileId": session.file_id,
        "fileInfo": session.file_info,
        "fileName": session.name,
        "uploadTimestamp": 1_700_000_000_000_i64,
    });
    state.sessions.insert(session.file_id.clone(), session);
    Json(response).into_response()
}

async fn get_upload_part_url(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    let file_id = body["fileId"].as_str().unwrap_or_default();
    if !state.sessions.contains_key(file_id) {
        return error(StatusCode::BAD_REQUEST, "bad_request", "no such large file");
    }
    Json(json!({
        "fileId": file_id,
        "uploadUrl": format!("{}/upload_part/{file_id}", base_url(&headers)),
        "authorizationToken": format!("part-token-{file_id}"),
    }))
    .into_response()
}

async fn upload_part(
    State(mock): State<MockService>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = mock.state.lock().await;
    state.upload_attempts += 1;
    if let Some(status) = state.upload_failures.pop_front() {
        return status_error(status);
    }
    if header_str(&headers, "authorization") != Some(format!("part-token-{file_id}").as_str()) {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token", "wrong part token");
    }
    let Some(number) = header_str(&headers, "x-bz-part-number").and_then(|v| v.parse().ok())
    else {
        return error(StatusCode::BAD_REQUEST, "bad_request", "missing part number");
    };
    let declared = header_str(&headers, "x-bz-content-sha1")
        .unwrap_or_default()
        .to_string();
    if declared != sha1_hex(&body) {
        return error(StatusCode::BAD_REQUEST, "bad_request", "sha1 did not match data");
    }
    let Some(session) = state.sessions.get_mut(&file_id) else {
        return error(StatusCode::BAD_REQUEST, "bad_request", "no such large file");
    };
    session.parts.push(UploadedPart {
        number,
        sha1: declared.clone(),
        data: body.to_vec(),
    });
    Json(json!({
        "fileId": file_id,
        "partNumber": number,
        "contentLength": body.len(),
        "contentSha1": declared,
    }))
    .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFile {
    file_id:         String,
    part_sha1_array: Vec<String>,
}

async fn finish_large_file(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Json(body): Json<FinishLargeFile>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    state.finish_calls.push(FinishCall {
        file_id:    body.file_id.clone(),
        part_sha1s: body.part_sha1_array.clone(),
    });
    let Some(session) = state.sessions.remove(&body.file_id) else {
        return error(StatusCode::BAD_REQUEST, "bad_request", "no such large file");
    };
    let mut parts = session.parts.clone();
    parts.sort_by_key(|p| p.number);
    let sha1s: Vec<String> = parts.iter().map(|p| p.sha1.clone()).collect();
    if sha1s != body.part_sha1_array {
        return error(StatusCode::BAD_REQUEST, "bad_request", "part sha1s do not match");
    }

    let data: Vec<u8> = parts.iter().flat_map(|p| p.data.clone()).collect();
    let mut file_info = session.file_info;
    file_info.insert("large_file_sha1".to_string(), sha1_hex(&data));
    let file = StoredFile {
        file_id: session.file_id,
        bucket_id: session.bucket_id,
        name: session.name,
        content_type: session.content_type,
        data,
        sha1: "none".to_string(),
        file_info,
    };
    let response = file_json(&file);
    state.files.insert(file.file_id.clone(), file);
    Json(response).into_response()
}

async fn list_buckets(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    let buckets: Vec<Value> = match body["bucketName"].as_str() {
        Some(BUCKET_NAME) | None => {
            vec![json!({
                "bucketId": BUCKET_ID,
                "bucketName": BUCKET_NAME,
                "bucketType": "allPrivate",
            })]
        }
        Some(_) => Vec::new(),
    };
    Json(json!({ "buckets": buckets })).into_response()
}

fn file_response(file: &StoredFile) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-bz-file-id"),
        HeaderValue::from_str(&file.file_id).unwrap(),
    );
    headers.insert(
        HeaderName::from_static("x-bz-file-name"),
        HeaderValue::from_str(&urlencoding::encode(&file.name)).unwrap(),
    );
    headers.insert(
        HeaderName::from_static("x-bz-content-sha1"),
        HeaderValue::from_str(&file.sha1).unwrap(),
    );
    headers.insert(
        HeaderName::from_static("x-bz-upload-timestamp"),
        HeaderValue::from_static("1700000000000"),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.content_type).unwrap(),
    );
    for (key, value) in &file.file_info {
        headers.insert(
            HeaderName::from_bytes(format!("x-bz-info-{key}").as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    (StatusCode::OK, headers, Bytes::from(file.data.clone())).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ById {
    file_id: String,
}

async fn download_by_id(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Query(query): Query<ById>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(status) = state.download_failures.pop_front() {
        return status_error(status);
    }
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    match state.files.get(&query.file_id) {
        Some(file) => file_response(file),
        None => error(StatusCode::NOT_FOUND, "not_found", "file not present"),
    }
}

async fn download_by_name(
    State(mock): State<MockService>,
    headers: HeaderMap,
    Path((bucket_name, file_name)): Path<(String, String)>,
) -> Response {
    let mut state = mock.state.lock().await;
    if let Some(status) = state.download_failures.pop_front() {
        return status_error(status);
    }
    if let Some(rejection) = check_account_token(&mut state, &headers) {
        return rejection;
    }
    if bucket_name != BUCKET_NAME {
        return error(StatusCode::NOT_FOUND, "not_found", "bucket not present");
    }
    match state.files.values().find(|f| f.name == file_name) {
        Some(file) => file_response(file),
        None => error(StatusCode::NOT_FOUND, "not_found", "file not present"),
    }
}

pub struct TestService {
    pub server: TestServer,
    pub mock:   MockService,
}

impl TestService {
    /// Starts the mock service with the given recommended part size.
    pub fn start(part_size: u64) -> Self {
        objsync_common_telemetry::init_default_ut_logging();

        let mock = MockService::new(part_size);
        let app = Router::new()
            .route("/b2api/v2/b2_authorize_account", get(authorize))
            .route("/b2api/v2/b2_get_upload_url", post(get_upload_url))
            .route("/b2api/v2/b2_start_large_file", post(start_large_file))
            .route("/b2api/v2/b2_get_upload_part_url", post(get_upload_part_url))
            .route("/b2api/v2/b2_finish_large_file", post(finish_large_file))
            .route("/b2api/v2/b2_list_buckets", post(list_buckets))
            .route("/b2api/v2/b2_download_file_by_id", get(download_by_id))
            .route("/upload/{bucket_id}", post(upload_file))
            .route("/upload_part/{file_id}", post(upload_part))
            .route("/file/{bucket_name}/{*file_name}", get(download_by_name))
            .layer(DefaultBodyLimit::disable())
            .with_state(mock.clone());

        // Create a test server with HTTP transport for real network access
        let server = TestServer::builder()
            .http_transport()
            .try_build(app)
            .expect("failed to create test server");
        Self { server, mock }
    }

    pub fn api_url(&self) -> String {
        self.server
            .server_address()
            .expect("server should have HTTP address")
            .to_string()
            .trim_end_matches('/')
            .to_string()
    }

    /// Config pointing at the mock with fast retries.
    pub fn config(&self) -> TransferConfig {
        TransferConfig::builder()
            .api_url(self.api_url())
            .retry(
                RetryConfig::builder()
                    .max_retries(3)
                    .base_delay(SignedDuration::from_millis(5))
                    .max_delay(SignedDuration::from_millis(50))
                    .build(),
            )
            .build()
    }

    pub fn client(&self) -> TransferClient { self.client_with(self.config()) }

    pub fn client_with(&self, config: TransferConfig) -> TransferClient {
        TransferClient::new(config, Credentials::new(KEY_ID, APPLICATION_KEY))
            .expect("failed to build client")
    }
}

use crate::areas::repository::Repository;
use crate::artifacts::objects::object_id::ObjectId;
use crate::gateway::GatewayState;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::protocol::Service;
use crate::protocol::advertisement::{dumb_advertisement, smart_advertisement};
use crate::protocol::receive_pack::receive_pack as apply_push;
use crate::protocol::upload_pack::upload_pack as negotiate_fetch;
use crate::sync::changes::notifications_for_push;
use crate::sync::notification::SyncHub;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;

const NO_CACHE: [(HeaderName, &str); 3] = [
    (header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT"),
    (header::PRAGMA, "no-cache"),
    (header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate"),
];
const CACHE_FOREVER: [(HeaderName, &str); 1] = [(header::CACHE_CONTROL, "public, max-age=31536000")];

#[derive(Debug, Deserialize)]
pub struct InfoRefsQuery {
    service: Option<String>,
}

/// Clone hint for humans browsing to the repository.
pub async fn info(
    State(state): State<GatewayState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> GatewayResult<Response> {
    state.open_repository(&repo)?;

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let path = uri.path().trim_end_matches('/');

    Ok(text(format!("git clone http://{host}{path}"), false))
}

pub async fn head(
    State(state): State<GatewayState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let repository = state.open_repository(&repo)?;
    state.authorize(&repo, &headers, false)?;

    let head = repository.refs().head_path();
    let content = std::fs::read_to_string(&head).map_err(|_| GatewayError::NotFound("HEAD".to_string()))?;
    Ok(text(content, true))
}

pub async fn info_refs(
    State(state): State<GatewayState>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let repository = state.open_repository(&repo)?;

    let Some(service) = query.service else {
        state.authorize(&repo, &headers, false)?;
        let refs = blocking(move || Ok(dumb_advertisement(&repository)?)).await?;
        return Ok(text(refs, true));
    };

    let service = Service::parse(&service)
        .ok_or_else(|| GatewayError::Forbidden(format!("Unsupported service {service}")))?;
    state.authorize(&repo, &headers, service.is_push())?;

    let advertisement = blocking(move || Ok(smart_advertisement(&repository, service)?)).await?;
    Ok((
        NO_CACHE,
        [(header::CONTENT_TYPE, service.advertisement_content_type())],
        advertisement,
    )
        .into_response())
}

/// Dumb access below `objects/`.
pub async fn objects(
    State(state): State<GatewayState>,
    Path((repo, rest)): Path<(String, String)>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let repository = state.open_repository(&repo)?;
    state.authorize(&repo, &headers, false)?;

    let rest = rest.trim_start_matches('/');
    let objects_path = repository.database().objects_path().to_path_buf();
    let not_found = || GatewayError::NotFound(format!("objects/{rest}"));

    match rest.split('/').collect::<Vec<_>>().as_slice() {
        ["info", "alternates" | "http-alternates"] => {
            let content = std::fs::read_to_string(objects_path.join(rest)).map_err(|_| not_found())?;
            Ok(text(content, true))
        }
        ["info", "packs"] => {
            let mut packs = String::new();
            if let Ok(entries) = std::fs::read_dir(objects_path.join("pack")) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".pack") {
                        packs.push_str(&format!("P {name}\n"));
                    }
                }
            }
            Ok(text(packs, true))
        }
        ["pack", name] if is_pack_file(name) => {
            let content_type = if name.ends_with(".idx") {
                "application/x-git-packed-objects-toc"
            } else {
                "application/x-git-packed-objects"
            };
            let content = std::fs::read(objects_path.join("pack").join(name)).map_err(|_| not_found())?;
            Ok((CACHE_FOREVER, [(header::CONTENT_TYPE, content_type)], content).into_response())
        }
        [hi, lo] if is_hex(hi, 2) && is_hex(lo, 38) => {
            let oid = ObjectId::try_parse(format!("{hi}{lo}")).map_err(|_| not_found())?;
            let content = blocking(move || {
                repository
                    .database()
                    .load_compressed(&oid)
                    .map_err(|error| GatewayError::Internal(format!("{error:#}")))
            })
            .await?
            .ok_or_else(not_found)?;
            Ok((
                CACHE_FOREVER,
                [(header::CONTENT_TYPE, "application/x-git-loose-object")],
                content,
            )
                .into_response())
        }
        _ => Err(not_found()),
    }
}

pub async fn upload_pack(
    State(state): State<GatewayState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Response> {
    let repository = state.open_repository(&repo)?;
    state.authorize(&repo, &headers, false)?;

    let body = request_body(&headers, body, state.max_pack_size())?;
    let result = blocking(move || Ok(negotiate_fetch(&repository, &body)?)).await?;

    Ok(rpc_result(Service::UploadPack, result))
}

pub async fn receive_pack(
    State(state): State<GatewayState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Response> {
    let repository = state.open_repository(&repo)?;
    state.authorize(&repo, &headers, true)?;

    let max_pack_size = state.max_pack_size();
    let body = request_body(&headers, body, max_pack_size)?;
    let hub = Arc::clone(state.hub());
    let report = blocking(move || push(&repository, &body, max_pack_size, &hub)).await?;

    Ok(rpc_result(Service::ReceivePack, report))
}

/// Apply a push, then announce what it changed.
fn push(
    repository: &Arc<Repository>,
    body: &[u8],
    max_object_size: usize,
    hub: &SyncHub,
) -> GatewayResult<Vec<u8>> {
    let outcome = apply_push(repository, body, max_object_size)?;
    tracing::info!(
        backend = %repository.id(),
        accepted = outcome.accepted.len(),
        rejected = outcome.statuses.len() - outcome.accepted.len(),
        "push applied"
    );

    if !outcome.accepted.is_empty() {
        // refs already moved, so a failure here only loses notifications
        match notifications_for_push(repository, &outcome.accepted) {
            Ok(notifications) => {
                let report = hub.dispatch(&notifications);
                tracing::debug!(
                    notifications = notifications.len(),
                    delivered = report.delivered,
                    failed = report.failed,
                    "dispatched sync notifications"
                );
            }
            Err(error) => {
                tracing::error!(backend = %repository.id(), %error, "computing sync notifications failed");
            }
        }
    }

    Ok(outcome.report)
}

async fn blocking<T, F>(f: F) -> GatewayResult<T>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|error| GatewayError::Internal(format!("worker failed: {error}")))?
}

/// The request body, inflated when the client sent it gzip-encoded.
fn request_body(headers: &HeaderMap, body: Bytes, limit: usize) -> GatewayResult<Bytes> {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));
    if !gzipped {
        return Ok(body);
    }

    let mut inflated = Vec::new();
    flate2::read::GzDecoder::new(&body[..])
        .take(limit as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|error| GatewayError::BadRequest(format!("invalid gzip body: {error}")))?;
    if inflated.len() > limit {
        return Err(GatewayError::PayloadTooLarge(limit));
    }

    Ok(inflated.into())
}

fn rpc_result(service: Service, body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        NO_CACHE,
        [(header::CONTENT_TYPE, service.result_content_type())],
        body,
    )
        .into_response()
}

fn text(content: String, no_cache: bool) -> Response {
    let content_type = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
    if no_cache {
        (NO_CACHE, content_type, content).into_response()
    } else {
        (content_type, content).into_response()
    }
}

fn is_hex(value: &str, length: usize) -> bool {
    value.len() == length && value.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn is_pack_file(name: &str) -> bool {
    name.strip_prefix("pack-")
        .and_then(|name| name.strip_suffix(".pack").or_else(|| name.strip_suffix(".idx")))
        .is_some_and(|hex| is_hex(hex, 40))
}

//! Singularity Library API.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{body_reader, data, json_body, reader_body, AppState, Caller};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::jobs::{Job, JobId};
use crate::model::{ContainerId, EntityId, ImageId, UploadId, UploadSession};
use crate::service::Access;
use crate::tags::LATEST;

/// Router for `/v1` Library operations
///
/// The `/v2/imagefile` upload routes share a prefix with the OCI routes and
/// are reached through [`dispatch_imagefile`].
pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/images", post(create_image))
        .route("/v1/images/{id}", get(get_image).delete(delete_image))
        .route("/v1/tags/{container}", get(get_tags).post(set_tag))
        .route("/v1/imagefile/{*path}", get(pull_image).post(legacy_upload))
        .route("/v1/manifests/{container}", get(list_manifests))
        .route("/v1/groups", post(create_group))
        .route("/v1/jobs/quota", post(enqueue_quota))
        .route("/v1/jobs/expire-uploads", post(enqueue_expiry))
        .route("/v1/jobs/{id}", get(job_status))
}

#[derive(Debug, Deserialize)]
struct ArchQuery {
    arch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateImage {
    /// Container id, or an `entity/collection/container` path.
    container: String,
    hash: String,
    arch: Option<String>,
}

/// Library clients send either `sha256.<hex>` or a bare hex digest.
fn parse_checksum(value: &str) -> RegistryResult<Digest> {
    if Digest::is_reference(value) {
        Digest::parse(value)
    } else {
        Digest::from_hex(value)
    }
}

async fn create_image(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateImage>,
) -> RegistryResult<Response> {
    let registry = &state.registry;
    let container = match request.container.parse::<ContainerId>() {
        Ok(id) => registry.container_by_id(id, caller.identity(), Access::Write).await?,
        Err(_) => registry.ensure_container(&request.container, caller.identity()).await?,
    };
    let digest = parse_checksum(&request.hash)?;
    let image = registry
        .create_image(caller.identity(), &container, digest, request.arch)
        .await?;
    Ok(data(image).into_response())
}

async fn get_image(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> RegistryResult<Response> {
    let id: ImageId = id.parse()?;
    let image = state.registry.get_image(caller.identity(), id).await?;
    Ok(data(image).into_response())
}

async fn delete_image(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> RegistryResult<Response> {
    let id: ImageId = id.parse()?;
    state.registry.delete_image(caller.identity(), id).await?;
    Ok(data(json!({})).into_response())
}

async fn get_tags(
    State(state): State<AppState>,
    caller: Caller,
    Path(container): Path<String>,
    Query(query): Query<ArchQuery>,
) -> RegistryResult<Response> {
    let container: ContainerId = container.parse()?;
    let tags = state
        .registry
        .tag_map(caller.identity(), container, query.arch.as_deref())
        .await?;
    Ok(data(tags).into_response())
}

#[derive(Debug, Deserialize)]
struct SetTag {
    tag: String,
    #[serde(rename = "imageID")]
    image_id: String,
    arch: Option<String>,
}

async fn set_tag(
    State(state): State<AppState>,
    caller: Caller,
    Path(container): Path<String>,
    Json(request): Json<SetTag>,
) -> RegistryResult<Response> {
    let container: ContainerId = container.parse()?;
    let image: ImageId = request.image_id.parse()?;
    let tag = state
        .registry
        .set_tag(
            caller.identity(),
            container,
            &request.tag,
            image,
            request.arch.as_deref(),
        )
        .await?;
    Ok(data(tag).into_response())
}

/// `<entity>/<collection>/<container>:<tag>`, tag defaulting to `latest`.
fn split_reference(path: &str) -> (&str, &str) {
    match path.rsplit_once(':') {
        Some((container, reference)) if !reference.is_empty() => (container, reference),
        Some((container, _)) => (container, LATEST),
        None => (path, LATEST),
    }
}

async fn pull_image(
    State(state): State<AppState>,
    caller: Caller,
    Path(path): Path<String>,
    Query(query): Query<ArchQuery>,
) -> RegistryResult<Response> {
    let (container, reference) = split_reference(&path);
    let (image, reader) = state
        .registry
        .pull(caller.identity(), container, reference, query.arch.as_deref())
        .await?;

    let mut response = reader_body(reader).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = image.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

async fn legacy_upload(
    State(state): State<AppState>,
    caller: Caller,
    Path(path): Path<String>,
    body: Body,
) -> RegistryResult<Response> {
    let id: ImageId = path.parse()?;
    let image = state
        .registry
        .upload_image(caller.identity(), id, body_reader(body))
        .await?;
    Ok(data(image).into_response())
}

async fn list_manifests(
    State(state): State<AppState>,
    caller: Caller,
    Path(container): Path<String>,
) -> RegistryResult<Response> {
    let container: ContainerId = container.parse()?;
    let manifests = state
        .registry
        .list_manifests(caller.identity(), container)
        .await?;
    Ok(data(manifests).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateGroup {
    name: String,
    #[serde(default)]
    members: Vec<String>,
}

async fn create_group(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateGroup>,
) -> RegistryResult<Response> {
    let group = state
        .registry
        .create_group(caller.identity(), &request.name, request.members)
        .await?;
    Ok(data(group).into_response())
}

#[derive(Debug, Deserialize)]
struct QuotaQuery {
    entity: Option<EntityId>,
}

async fn enqueue_quota(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<QuotaQuery>,
) -> RegistryResult<Response> {
    let id = state.registry.enqueue(
        caller.identity(),
        Job::RecalculateQuota {
            entity: query.entity,
        },
    )?;
    Ok((StatusCode::ACCEPTED, data(json!({ "id": id }))).into_response())
}

async fn enqueue_expiry(State(state): State<AppState>, caller: Caller) -> RegistryResult<Response> {
    let id = state.registry.enqueue(caller.identity(), Job::ExpireUploads)?;
    Ok((StatusCode::ACCEPTED, data(json!({ "id": id }))).into_response())
}

async fn job_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> RegistryResult<Response> {
    let id: JobId = id.parse()?;
    let status = state.registry.job_status(caller.identity(), id)?;
    Ok(data(status).into_response())
}

// `/v2/imagefile` upload protocol

#[derive(Debug, Deserialize)]
struct StartUpload {
    filesize: Option<u64>,
    sha256sum: Option<String>,
    md5sum: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadUrl {
    #[serde(rename = "uploadURL")]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct StartMultipart {
    filesize: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MultipartStarted {
    #[serde(rename = "uploadID")]
    upload_id: UploadId,
    total_parts: u32,
    part_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartRequest {
    #[serde(rename = "uploadID")]
    upload_id: UploadId,
    part_number: u32,
    part_size: Option<u64>,
    sha256sum: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletedPart {
    part_number: u32,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteMultipart {
    #[serde(rename = "uploadID")]
    upload_id: UploadId,
    #[serde(default)]
    completed_parts: Vec<CompletedPart>,
}

#[derive(Debug, Deserialize)]
struct AbortMultipart {
    #[serde(rename = "uploadID")]
    upload_id: UploadId,
}

fn upload_url(session: &UploadSession) -> String {
    format!("/v2/imagefile/_upload/{}", session.id)
}

/// Route a `/v2/imagefile/<rest>` request.
pub(super) async fn dispatch_imagefile(
    state: AppState,
    caller: Caller,
    method: Method,
    rest: &str,
    body: Body,
) -> RegistryResult<Response> {
    let registry = &state.registry;
    let identity = caller.identity();

    if let Some(upload) = rest.strip_prefix("_upload/") {
        if method != Method::PUT {
            return Err(RegistryError::NotAcceptable(format!("{method} on upload")));
        }
        let upload: UploadId = upload.parse()?;
        let session = registry.receive_upload(upload, body_reader(body)).await?;
        let mut response = data(json!({})).into_response();
        if let Some(digest) = &session.received_digest {
            let etag = HeaderValue::from_str(&format!("\"{}\"", digest.hex()))
                .map_err(|err| RegistryError::Internal(err.to_string()))?;
            response.headers_mut().insert(header::ETAG, etag);
        }
        return Ok(response);
    }

    let (image, action) = match rest.split_once('/') {
        Some((image, action)) => (image, action),
        None => (rest, ""),
    };
    let image: ImageId = image.parse()?;

    match (method, action) {
        (Method::POST, "") => {
            let request: StartUpload = json_body(body).await?;
            let sha256sum = request.sha256sum.as_deref().map(parse_checksum).transpose()?;
            let session = registry
                .start_upload(identity, image, request.filesize, sha256sum, request.md5sum)
                .await?;
            Ok(data(UploadUrl {
                upload_url: upload_url(&session),
            })
            .into_response())
        }
        (Method::PUT, "_complete") => {
            let image = registry.complete_upload(identity, image).await?;
            Ok(data(image).into_response())
        }
        (Method::POST, "_multipart") => {
            let request: StartMultipart = json_body(body).await?;
            let session = registry
                .start_multipart(identity, image, request.filesize)
                .await?;
            Ok(data(MultipartStarted {
                upload_id: session.id,
                total_parts: session.total_parts.unwrap_or(1),
                part_size: registry.config().multipart_upload_chunk,
            })
            .into_response())
        }
        (Method::PUT, "_multipart") => {
            let request: PartRequest = json_body(body).await?;
            let sha256sum = request.sha256sum.as_deref().map(parse_checksum).transpose()?;
            let chunk = registry
                .multipart_part(
                    identity,
                    image,
                    request.upload_id,
                    request.part_number,
                    request.part_size,
                    sha256sum,
                )
                .await?;
            Ok(data(json!({ "presignedURL": upload_url(&chunk) })).into_response())
        }
        (Method::PUT, "_multipart_complete") => {
            let request: CompleteMultipart = json_body(body).await?;
            let completed: Vec<(u32, String)> = request
                .completed_parts
                .into_iter()
                .map(|part| (part.part_number, part.token))
                .collect();
            let image = registry
                .complete_multipart(identity, image, request.upload_id, &completed)
                .await?;
            Ok(data(image).into_response())
        }
        (Method::PUT, "_multipart_abort") => {
            let request: AbortMultipart = json_body(body).await?;
            registry
                .abort_multipart(identity, image, request.upload_id)
                .await?;
            Ok(data(json!({})).into_response())
        }
        (method, action) => Err(RegistryError::NotFound(format!(
            "{method} /v2/imagefile/{{id}}/{action}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_default_to_latest() {
        assert_eq!(split_reference("a/b/c:v1"), ("a/b/c", "v1"));
        assert_eq!(split_reference("a/b/c"), ("a/b/c", "latest"));
        assert_eq!(split_reference("c:"), ("c", "latest"));
        assert_eq!(
            split_reference("a/b/c:sha256.abc"),
            ("a/b/c", "sha256.abc")
        );
    }

    #[test]
    fn checksums_accept_both_forms() {
        let digest = Digest::of(b"x");
        assert_eq!(parse_checksum(digest.hex()).unwrap(), digest);
        assert_eq!(parse_checksum(&digest.to_string()).unwrap(), digest);
        assert!(parse_checksum("md5.abc").is_err());
    }
}

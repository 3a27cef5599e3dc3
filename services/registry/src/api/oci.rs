//! OCI Distribution API.
//!
//! Repository names contain slashes, so everything under `/v2/` arrives at
//! one wildcard route and is split by its trailing segments.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::{body_reader, library, read_document, reader_body, AppState, Caller};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::model::UploadId;
use crate::service::{manifest_media_type, BlobFetch};

const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");
const CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Prefix for blob download redirects.
const DOWNLOAD_PREFIX: &str = "__download/";

/// Prefix for upload sessions handed out by `POST .../blobs/uploads/`.
const UPLOAD_PREFIX: &str = "__uploads/";

#[derive(Debug, Clone, PartialEq, Eq)]
enum OciRoute {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    BlobUploadStart { name: String },
    /// `name` is absent for the `__uploads/<id>` form.
    BlobUpload { name: Option<String>, upload: String },
    Tags { name: String },
    Download { token: String },
    ImageFile { rest: String },
}

fn split_at<'a>(path: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let idx = path.rfind(marker)?;
    let name = &path[..idx];
    let rest = &path[idx + marker.len()..];
    (!name.is_empty() && !rest.is_empty()).then_some((name, rest))
}

fn parse_oci_path(path: &str) -> Option<OciRoute> {
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some(rest) = path.strip_prefix("imagefile/") {
        return Some(OciRoute::ImageFile {
            rest: rest.to_string(),
        });
    }
    if let Some(token) = path.strip_prefix(DOWNLOAD_PREFIX) {
        return Some(OciRoute::Download {
            token: token.to_string(),
        });
    }
    if let Some(upload) = path.strip_prefix(UPLOAD_PREFIX) {
        return Some(OciRoute::BlobUpload {
            name: None,
            upload: upload.to_string(),
        });
    }

    if let Some(name) = path
        .strip_suffix("/blobs/uploads/")
        .or_else(|| path.strip_suffix("/blobs/uploads"))
    {
        if !name.is_empty() {
            return Some(OciRoute::BlobUploadStart {
                name: name.to_string(),
            });
        }
    }
    if let Some((name, upload)) = split_at(path, "/blobs/uploads/") {
        return Some(OciRoute::BlobUpload {
            name: Some(name.to_string()),
            upload: upload.to_string(),
        });
    }
    if let Some((name, digest)) = split_at(path, "/blobs/") {
        return Some(OciRoute::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }
    if let Some((name, reference)) = split_at(path, "/manifests/") {
        return Some(OciRoute::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }
    if let Some(name) = path.strip_suffix("/tags/list") {
        if !name.is_empty() {
            return Some(OciRoute::Tags {
                name: name.to_string(),
            });
        }
    }

    None
}

fn header_value(value: &str) -> RegistryResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| RegistryError::Internal(format!("invalid header value {value:?}: {err}")))
}

fn method_not_allowed(method: &Method) -> RegistryError {
    RegistryError::InvalidRequest(format!("method {method} not allowed"))
}

/// `GET /v2/`
pub(super) async fn base() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(API_VERSION, HeaderValue::from_static("registry/2.0"))],
        "",
    )
}

/// Every other `/v2/` request.
pub(super) async fn dispatch(
    method: Method,
    State(state): State<AppState>,
    caller: Caller,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Body,
) -> RegistryResult<Response> {
    let route = parse_oci_path(&path)
        .ok_or_else(|| RegistryError::NotFound(format!("/v2/{path}")))?;
    tracing::debug!(%method, path = %path, "oci request");

    let response = match route {
        OciRoute::ImageFile { rest } => {
            library::dispatch_imagefile(state, caller, method.clone(), &rest, body).await
        }
        OciRoute::Download { token } => match method {
            Method::GET => download(&state, &token).await,
            _ => Err(method_not_allowed(&method)),
        },
        OciRoute::Manifest { name, reference } => match method {
            Method::GET | Method::HEAD => {
                get_manifest(&state, &caller, &method, &name, &reference).await
            }
            Method::PUT => put_manifest(&state, &caller, &name, &reference, body).await,
            Method::DELETE => {
                state
                    .registry
                    .delete_manifest(caller.identity(), &name, &reference)
                    .await?;
                Ok(StatusCode::ACCEPTED.into_response())
            }
            _ => Err(method_not_allowed(&method)),
        },
        OciRoute::Blob { name, digest } => match method {
            Method::GET => get_blob(&state, &caller, &name, &digest).await,
            Method::HEAD => head_blob(&state, &caller, &name, &digest).await,
            _ => Err(method_not_allowed(&method)),
        },
        OciRoute::BlobUploadStart { name } => match method {
            Method::POST => start_upload(&state, &caller, &name, &params, body).await,
            _ => Err(method_not_allowed(&method)),
        },
        OciRoute::BlobUpload { name, upload } => {
            let upload: UploadId = upload
                .parse()
                .map_err(|_| RegistryError::UploadNotFound(upload.clone()))?;
            match method {
                Method::GET => upload_status(&state, upload).await,
                Method::PATCH => patch_upload(&state, upload, body).await,
                Method::PUT => put_upload(&state, name.as_deref(), upload, &params, body).await,
                Method::DELETE => {
                    state.registry.cancel_blob_upload(upload).await?;
                    Ok(StatusCode::NO_CONTENT.into_response())
                }
                _ => Err(method_not_allowed(&method)),
            }
        }
        OciRoute::Tags { name } => match method {
            Method::GET => {
                let tags = state.registry.tag_names(caller.identity(), &name).await?;
                Ok(Json(json!({ "name": name, "tags": tags })).into_response())
            }
            _ => Err(method_not_allowed(&method)),
        },
    };

    if let Err(error) = &response {
        tracing::debug!(%method, path = %path, status = %error.status_code(), %error, "oci request failed");
    }
    response
}

fn upload_location(upload: UploadId) -> String {
    format!("/v2/{UPLOAD_PREFIX}{upload}")
}

/// Inclusive byte range received so far.
fn received_range(received: u64) -> String {
    format!("0-{}", received.saturating_sub(1))
}

fn upload_headers(upload: UploadId, received: u64) -> RegistryResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, header_value(&upload_location(upload))?);
    headers.insert(UPLOAD_UUID, header_value(&upload.to_string())?);
    headers.insert(header::RANGE, header_value(&received_range(received))?);
    Ok(headers)
}

fn blob_created(name: &str, digest: &Digest) -> RegistryResult<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        header_value(&format!("/v2/{name}/blobs/{}", digest.to_wire()))?,
    );
    headers.insert(CONTENT_DIGEST, header_value(&digest.to_wire())?);
    Ok((StatusCode::CREATED, headers).into_response())
}

fn digest_param(params: &HashMap<String, String>) -> RegistryResult<Option<Digest>> {
    params
        .get("digest")
        .map(|digest| Digest::from_wire(digest))
        .transpose()
}

async fn start_upload(
    state: &AppState,
    caller: &Caller,
    name: &str,
    params: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    if let Some(digest) = digest_param(params)? {
        state
            .registry
            .push_blob(caller.identity(), name, &digest, body_reader(body))
            .await?;
        return blob_created(name, &digest);
    }

    let session = state.registry.start_blob_upload(caller.identity(), name).await?;
    let headers = upload_headers(session.id, 0)?;
    Ok((StatusCode::ACCEPTED, headers).into_response())
}

async fn upload_status(state: &AppState, upload: UploadId) -> RegistryResult<Response> {
    let session = state.registry.upload_status(upload).await?;
    let headers = upload_headers(session.id, session.received_size)?;
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

async fn patch_upload(state: &AppState, upload: UploadId, body: Body) -> RegistryResult<Response> {
    let session = state.registry.append_blob(upload, body_reader(body)).await?;
    let headers = upload_headers(session.id, session.received_size)?;
    Ok((StatusCode::ACCEPTED, headers).into_response())
}

async fn put_upload(
    state: &AppState,
    name: Option<&str>,
    upload: UploadId,
    params: &HashMap<String, String>,
    body: Body,
) -> RegistryResult<Response> {
    let digest = digest_param(params)?
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".into()))?;
    let image = state
        .registry
        .finish_blob(upload, &digest, body_reader(body))
        .await?;
    let name = match name {
        Some(name) => name.to_string(),
        None => state.registry.container_path(image.container_id).await?.to_string(),
    };
    blob_created(&name, &digest)
}

async fn head_blob(
    state: &AppState,
    caller: &Caller,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    let digest = Digest::from_wire(digest)?;
    let size = state
        .registry
        .stat_blob(caller.identity(), name, &digest)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(CONTENT_DIGEST, header_value(&digest.to_wire())?);
    Ok((StatusCode::OK, headers).into_response())
}

async fn get_blob(
    state: &AppState,
    caller: &Caller,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    let digest = Digest::from_wire(digest)?;
    let fetch = state
        .registry
        .fetch_blob(caller.identity(), name, &digest)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_DIGEST, header_value(&digest.to_wire())?);
    match fetch {
        BlobFetch::Inline(bytes) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            Ok((StatusCode::OK, headers, bytes).into_response())
        }
        BlobFetch::Redirect(token) => {
            headers.insert(
                header::LOCATION,
                header_value(&format!("/v2/{DOWNLOAD_PREFIX}{token}"))?,
            );
            Ok((StatusCode::TEMPORARY_REDIRECT, headers).into_response())
        }
    }
}

async fn download(state: &AppState, token: &str) -> RegistryResult<Response> {
    let (image, reader) = state.registry.redeem_download(token).await?;

    let mut response = reader_body(reader).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_DIGEST, header_value(&image.digest.to_wire())?);
    if let Some(size) = image.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

async fn get_manifest(
    state: &AppState,
    caller: &Caller,
    method: &Method,
    name: &str,
    reference: &str,
) -> RegistryResult<Response> {
    let manifest = state
        .registry
        .get_manifest(caller.identity(), name, reference)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header_value(&manifest_media_type(&manifest))?,
    );
    headers.insert(CONTENT_DIGEST, header_value(&manifest.hash.to_wire())?);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(manifest.content.len()),
    );

    if *method == Method::HEAD {
        return Ok((StatusCode::OK, headers).into_response());
    }
    Ok((StatusCode::OK, headers, manifest.content).into_response())
}

async fn put_manifest(
    state: &AppState,
    caller: &Caller,
    name: &str,
    reference: &str,
    body: Body,
) -> RegistryResult<Response> {
    let bytes = read_document(body).await?;
    let content = String::from_utf8(bytes.to_vec())
        .map_err(|_| RegistryError::InvalidManifest("manifest is not UTF-8".into()))?;
    let manifest = state
        .registry
        .put_manifest(caller.identity(), name, reference, content)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        header_value(&format!("/v2/{name}/manifests/{}", manifest.hash.to_wire()))?,
    );
    headers.insert(CONTENT_DIGEST, header_value(&manifest.hash.to_wire())?);
    Ok((StatusCode::CREATED, headers).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_routes() {
        assert_eq!(
            parse_oci_path("alice/default/tools/manifests/latest"),
            Some(OciRoute::Manifest {
                name: "alice/default/tools".into(),
                reference: "latest".into(),
            })
        );
        assert_eq!(
            parse_oci_path("tools/blobs/sha256:abc"),
            Some(OciRoute::Blob {
                name: "tools".into(),
                digest: "sha256:abc".into(),
            })
        );
        assert_eq!(
            parse_oci_path("a/b/tools/blobs/uploads/"),
            Some(OciRoute::BlobUploadStart {
                name: "a/b/tools".into()
            })
        );
        assert_eq!(
            parse_oci_path("a/b/tools/blobs/uploads/1234"),
            Some(OciRoute::BlobUpload {
                name: Some("a/b/tools".into()),
                upload: "1234".into(),
            })
        );
        assert_eq!(
            parse_oci_path("__uploads/1234"),
            Some(OciRoute::BlobUpload {
                name: None,
                upload: "1234".into(),
            })
        );
        assert_eq!(
            parse_oci_path("a/b/tools/tags/list"),
            Some(OciRoute::Tags {
                name: "a/b/tools".into()
            })
        );
        assert_eq!(
            parse_oci_path("__download/abcd"),
            Some(OciRoute::Download {
                token: "abcd".into()
            })
        );
        assert_eq!(
            parse_oci_path("imagefile/1234/_complete"),
            Some(OciRoute::ImageFile {
                rest: "1234/_complete".into()
            })
        );
        assert_eq!(parse_oci_path("tools/manifests/"), None);
        assert_eq!(parse_oci_path("tools"), None);
    }

    #[test]
    fn ranges_are_inclusive() {
        assert_eq!(received_range(0), "0-0");
        assert_eq!(received_range(1), "0-0");
        assert_eq!(received_range(10), "0-9");
    }
}

//! Integration tests for the Library and OCI surfaces

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use camino::Utf8Path;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use sif_registry::{RegistryBuilder, RegistryConfig, TokenAuthenticator};
use storage::MemoryStorage;
use tempfile::TempDir;
use tower::ServiceExt;

const ALICE: &str = "Bearer alice-token";
const ROOT: &str = "Bearer root-token";

/// Helper to create a test registry
async fn test_registry() -> (axum::Router, TempDir) {
    test_registry_with(RegistryConfig::default()).await
}

async fn test_registry_with(config: RegistryConfig) -> (axum::Router, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        image_path: Utf8Path::from_path(tmp.path()).unwrap().to_owned(),
        ..config
    };
    let auth = TokenAuthenticator::default()
        .with_token("alice-token", "alice", false)
        .with_token("root-token", "root", true);
    let app = RegistryBuilder::new()
        .config(config)
        .storage(MemoryStorage::new().into())
        .authenticator(Arc::new(auth))
        .build()
        .await
        .unwrap();
    (app, tmp)
}

fn wire_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn library_digest(data: &[u8]) -> String {
    format!("sha256.{}", hex::encode(Sha256::digest(data)))
}

async fn send(app: &axum::Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn request(method: &str, uri: impl AsRef<str>, auth: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri.as_ref());
    match auth {
        Some(auth) => builder.header(header::AUTHORIZATION, auth),
        None => builder,
    }
}

fn json_request(method: &str, uri: impl AsRef<str>, auth: Option<&str>, body: Value) -> Request<Body> {
    request(method, uri, auth)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn location(response: &Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// Push `data` as an OCI blob in two chunks.
async fn push_blob(app: &axum::Router, name: &str, data: &[u8]) -> String {
    let digest = wire_digest(data);

    let response = send(
        app,
        request("POST", format!("/v2/{name}/blobs/uploads/"), Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["range"], "0-0");
    let upload_url = location(&response);

    let (head, tail) = data.split_at(data.len() / 2);
    let response = send(
        app,
        request("PATCH", &upload_url, Some(ALICE))
            .body(Body::from(head.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.headers()["range"],
        format!("0-{}", head.len().saturating_sub(1)).as_str()
    );

    let response = send(
        app,
        request("PUT", format!("{upload_url}?digest={digest}"), Some(ALICE))
            .body(Body::from(tail.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
    digest
}

/// Register, upload and complete a Library image, returning its id.
async fn push_library_image(app: &axum::Router, container: &str, data: &[u8]) -> String {
    let response = send(
        app,
        json_request(
            "POST",
            "/v1/images",
            Some(ALICE),
            json!({ "container": container, "hash": library_digest(data) }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let image = body_json(response).await;
    let id = image["data"]["id"].as_str().unwrap().to_string();

    let response = send(
        app,
        json_request(
            "POST",
            format!("/v2/imagefile/{id}"),
            Some(ALICE),
            json!({ "filesize": data.len(), "sha256sum": hex::encode(Sha256::digest(data)) }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let upload = body_json(response).await;
    let upload_url = upload["data"]["uploadURL"].as_str().unwrap().to_string();

    let response = send(
        app,
        request("PUT", &upload_url, None)
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        app,
        request("PUT", format!("/v2/imagefile/{id}/_complete"), Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let image = body_json(response).await;
    assert_eq!(image["data"]["uploadState"], "completed");
    id
}

#[tokio::test]
async fn test_api_version_check() {
    let (app, _tmp) = test_registry().await;

    let response = send(&app, Request::builder().uri("/v2/").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_anonymous_push_is_unauthorized() {
    let (app, _tmp) = test_registry().await;

    let response = send(
        &app,
        request("POST", "/v2/alice/default/tools/blobs/uploads/", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");

    let response = send(
        &app,
        request("GET", "/v2/", Some("Bearer wrong"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    // The version check needs no credentials at all.
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_blob_upload_and_download() {
    let (app, _tmp) = test_registry().await;
    let name = "alice/default/tools";
    let data = b"Hello, OCI Registry!";
    let digest = push_blob(&app, name, data).await;

    let response = send(
        &app,
        request("HEAD", format!("/v2/{name}/blobs/{digest}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        data.len().to_string().as_str()
    );

    let response = send(
        &app,
        request("GET", format!("/v2/{name}/blobs/{digest}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let download = location(&response);
    assert!(download.starts_with("/v2/__download/"));

    // Tokens can be redeemed more than once until they expire.
    for _ in 0..2 {
        let response = send(
            &app,
            request("GET", &download, None).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_bytes(response).await[..], data);
    }
}

#[tokio::test]
async fn test_monolithic_blob_upload() {
    let (app, _tmp) = test_registry().await;
    let data = b"one request";
    let digest = wire_digest(data);

    let response = send(
        &app,
        request(
            "POST",
            format!("/v2/alice/default/tools/blobs/uploads/?digest={digest}"),
            Some(ALICE),
        )
        .body(Body::from(Bytes::from_static(data)))
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        location(&response),
        format!("/v2/alice/default/tools/blobs/{digest}")
    );
}

#[tokio::test]
async fn test_blob_digest_mismatch() {
    let (app, _tmp) = test_registry().await;
    let wrong = wire_digest(b"something else");

    let response = send(
        &app,
        request(
            "POST",
            format!("/v2/alice/default/tools/blobs/uploads/?digest={wrong}"),
            Some(ALICE),
        )
        .body(Body::from("actual bytes"))
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
}

#[tokio::test]
async fn test_upload_cancel() {
    let (app, _tmp) = test_registry().await;

    let response = send(
        &app,
        request("POST", "/v2/alice/default/tools/blobs/uploads/", Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let upload_url = location(&response);

    let response = send(
        &app,
        request("DELETE", &upload_url, Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(
        &app,
        request("PATCH", &upload_url, Some(ALICE))
            .body(Body::from("late"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}

#[tokio::test]
async fn test_manifest_upload_and_download() {
    let (app, _tmp) = test_registry().await;
    let name = "alice/default/tools";
    let layer = push_blob(&app, name, b"layer contents").await;

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.sylabs.sif.config.v1+json",
            "size": 2,
            "digest": wire_digest(b"{}")
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "size": 14,
            "digest": layer
        }]
    })
    .to_string();

    let response = send(
        &app,
        request("PUT", format!("/v2/{name}/manifests/v1"), Some(ALICE))
            .header(header::CONTENT_TYPE, "application/vnd.oci.image.manifest.v1+json")
            .body(Body::from(manifest.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let digest = wire_digest(manifest.as_bytes());
    assert_eq!(response.headers()["docker-content-digest"], digest.as_str());

    for reference in ["v1", digest.as_str()] {
        let response = send(
            &app,
            request("GET", format!("/v2/{name}/manifests/{reference}"), None)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.oci.image.manifest.v1+json"
        );
        assert_eq!(&body_bytes(response).await[..], manifest.as_bytes());
    }

    let response = send(
        &app,
        request("GET", format!("/v2/{name}/tags/list"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "name": name, "tags": ["v1"] })
    );

    // The config blob is served inline without ever being pushed.
    let response = send(
        &app,
        request("GET", format!("/v2/{name}/blobs/{}", wire_digest(b"{}")), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"{}");
}

#[tokio::test]
async fn test_manifest_with_unknown_layer() {
    let (app, _tmp) = test_registry().await;

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "size": 1,
            "digest": wire_digest(b"never pushed")
        }]
    });

    let response = send(
        &app,
        request("PUT", "/v2/alice/default/tools/manifests/v1", Some(ALICE))
            .body(Body::from(manifest.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_blob_not_found() {
    let (app, _tmp) = test_registry().await;
    push_blob(&app, "alice/default/tools", b"exists").await;

    let response = send(
        &app,
        request(
            "GET",
            format!("/v2/alice/default/tools/blobs/{}", wire_digest(b"missing")),
            None,
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_not_found() {
    let (app, _tmp) = test_registry().await;
    push_blob(&app, "alice/default/tools", b"exists").await;

    let response = send(
        &app,
        request("GET", "/v2/alice/default/tools/manifests/nope", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_digest() {
    let (app, _tmp) = test_registry().await;
    push_blob(&app, "alice/default/tools", b"exists").await;

    let response = send(
        &app,
        request("GET", "/v2/alice/default/tools/blobs/sha256:nothex", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_library_push_and_pull() {
    let (app, _tmp) = test_registry().await;
    let data = b"a small SIF image";
    let id = push_library_image(&app, "alice/default/tools", data).await;

    let response = send(
        &app,
        request("GET", "/v1/imagefile/alice/default/tools:latest", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        data.len().to_string().as_str()
    );
    assert_eq!(&body_bytes(response).await[..], data);

    // Default tag is latest, digests work as references.
    for path in [
        "/v1/imagefile/alice/default/tools".to_string(),
        format!("/v1/imagefile/alice/default/tools:{}", library_digest(data)),
    ] {
        let response = send(&app, request("GET", path, None).body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(
        &app,
        request("GET", format!("/v1/images/{id}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let image = body_json(response).await;
    assert_eq!(image["data"]["downloadCount"], 3);
    assert_eq!(image["data"]["size"], data.len());
}

#[tokio::test]
async fn test_library_images_are_served_over_oci() {
    let (app, _tmp) = test_registry().await;
    let data = b"sif served as a layer";
    push_library_image(&app, "alice/default/tools", data).await;

    let response = send(
        &app,
        request("GET", "/v2/alice/default/tools/manifests/latest", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let manifest = body_json(response).await;
    assert_eq!(
        manifest["layers"][0]["mediaType"],
        "application/vnd.sylabs.sif.layer.v1.sif"
    );
    assert_eq!(manifest["layers"][0]["digest"], wire_digest(data));
    assert_eq!(manifest["config"]["digest"], wire_digest(b"{}"));

    let response = send(
        &app,
        request(
            "GET",
            format!("/v2/alice/default/tools/blobs/{}", wire_digest(data)),
            None,
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let response = send(
        &app,
        request("GET", location(&response), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(&body_bytes(response).await[..], data);

    let response = send(
        &app,
        request("GET", "/v1/manifests/not-a-uuid", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_library_duplicate_image() {
    let (app, _tmp) = test_registry().await;
    let data = b"pushed twice";
    push_library_image(&app, "alice/default/tools", data).await;

    let response = send(
        &app,
        json_request(
            "POST",
            "/v1/images",
            Some(ALICE),
            json!({ "container": "alice/default/tools", "hash": library_digest(data) }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_library_multipart_upload() {
    let config = RegistryConfig {
        multipart_upload_chunk: 4,
        ..Default::default()
    };
    let (app, _tmp) = test_registry_with(config).await;
    let data = b"0123456789";

    let response = send(
        &app,
        json_request(
            "POST",
            "/v1/images",
            Some(ALICE),
            json!({ "container": "tools", "hash": library_digest(data), "arch": "arm64" }),
        ),
    )
    .await;
    let image = body_json(response).await;
    let id = image["data"]["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        json_request(
            "POST",
            format!("/v2/imagefile/{id}/_multipart"),
            Some(ALICE),
            json!({ "filesize": data.len() }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let started = body_json(response).await;
    assert_eq!(started["data"]["totalParts"], 3);
    assert_eq!(started["data"]["partSize"], 4);
    let upload_id = started["data"]["uploadID"].as_str().unwrap().to_string();

    let mut completed = Vec::new();
    for (index, part) in data.chunks(4).enumerate() {
        let part_number = index + 1;
        let response = send(
            &app,
            json_request(
                "PUT",
                format!("/v2/imagefile/{id}/_multipart"),
                Some(ALICE),
                json!({
                    "uploadID": upload_id,
                    "partNumber": part_number,
                    "partSize": part.len(),
                    "sha256sum": hex::encode(Sha256::digest(part)),
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let presigned = body_json(response).await;
        let url = presigned["data"]["presignedURL"].as_str().unwrap().to_string();

        let response = send(
            &app,
            request("PUT", url, None)
                .body(Body::from(part.to_vec()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(etag, format!("\"{}\"", hex::encode(Sha256::digest(part))));
        completed.push(json!({ "partNumber": part_number, "token": etag }));
    }

    let response = send(
        &app,
        json_request(
            "PUT",
            format!("/v2/imagefile/{id}/_multipart_complete"),
            Some(ALICE),
            json!({ "uploadID": upload_id, "completedParts": completed }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        request("GET", "/v1/imagefile/alice/default/tools:latest?arch=arm64", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], data);
}

#[tokio::test]
async fn test_tags_and_image_delete() {
    let (app, _tmp) = test_registry().await;
    let id = push_library_image(&app, "alice/default/tools", b"tag me").await;

    let response = send(
        &app,
        request("GET", format!("/v1/images/{id}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let image = body_json(response).await;
    let container = image["data"]["containerId"].as_str().unwrap().to_string();

    let response = send(
        &app,
        json_request(
            "POST",
            format!("/v1/tags/{container}"),
            Some(ALICE),
            json!({ "tag": "stable", "imageID": id }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        request("GET", format!("/v1/tags/{container}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let tags = body_json(response).await;
    assert_eq!(tags["data"]["stable"], id.as_str());
    assert_eq!(tags["data"]["latest"], id.as_str());

    let response = send(
        &app,
        request("DELETE", format!("/v1/images/{id}"), None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        request("DELETE", format!("/v1/images/{id}"), Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        request("GET", "/v1/imagefile/alice/default/tools:stable", None)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_jobs_need_an_admin() {
    let (app, _tmp) = test_registry().await;

    let response = send(
        &app,
        request("POST", "/v1/jobs/expire-uploads", Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &app,
        request("POST", "/v1/jobs/quota", Some(ROOT))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let queued = body_json(response).await;
    let id = queued["data"]["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        request("GET", format!("/v1/jobs/{id}"), Some(ALICE))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["data"]["kind"], "recalculate_quota");
}

#[tokio::test]
async fn test_groups_are_admin_only() {
    let (app, _tmp) = test_registry().await;

    let body = json!({ "name": "lab", "members": ["alice"] });
    let response = send(&app, json_request("POST", "/v1/groups", Some(ALICE), body.clone())).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, json_request("POST", "/v1/groups", Some(ROOT), body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let group = body_json(response).await;
    assert_eq!(group["data"]["name"], "lab");
}

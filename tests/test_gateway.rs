// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
mod common;

use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::Full;
use serde_json::json;

use lfs_gateway::lfs::{HashAlgorithm, Oid};
use lfs_gateway::storage::key_for;

use common::{
    init_logger, sha256_hex, TestServer, LFS_MIME, READER_TOKEN, WRITER_TOKEN,
};

const HELLO: &[u8] = b"Hello, S3!";

fn hello_oid() -> String {
    sha256_hex(HELLO)
}

fn storage_key(oid: &str) -> lfs_gateway::storage::StorageKey {
    let oid: Oid = oid.parse().unwrap();
    key_for(&oid, &HashAlgorithm::sha256())
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_download_miss() {
    let _guard = init_logger();
    let server = TestServer::spawn().await;
    let oid = hello_oid();

    let resp = server
        .batch(
            "acme/widgets",
            WRITER_TOKEN,
            json!({
                "operation": "download",
                "objects": [{"oid": oid, "size": 10}],
            }),
        )
        .await;

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.headers[header::CONTENT_TYPE], LFS_MIME);

    let body = resp.json();
    assert_eq!(body["transfer"], "basic");
    assert_eq!(body["hash_algo"], "sha256");
    assert_eq!(body["objects"][0]["oid"], oid.as_str());
    assert_eq!(body["objects"][0]["size"], 10);
    assert_eq!(body["objects"][0]["error"]["code"], 404);
    assert_eq!(body["objects"][0]["error"]["message"], "object not found");
    assert!(body["objects"][0].get("actions").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_then_download() {
    let server = TestServer::spawn().await;
    let oid = hello_oid();

    let resp = server.upload("acme/widgets", WRITER_TOKEN, &oid, HELLO).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(server.storage.contains(&storage_key(&oid)));
    assert_eq!(
        storage_key(&oid).as_str(),
        format!("objects/sha256/{}/{}/{}", &oid[..2], &oid[2..4], oid)
    );

    let resp = server.download("acme/widgets", WRITER_TOKEN, &oid).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.headers[header::CONTENT_LENGTH], "10");
    assert_eq!(&resp.body[..], HELLO);

    // Same object again: acknowledged without another write.
    let resp = server.upload("acme/widgets", WRITER_TOKEN, &oid, HELLO).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(server.storage.put_count(), 1);

    // The batch API now reports it as present.
    let resp = server
        .batch(
            "acme/widgets",
            WRITER_TOKEN,
            json!({
                "operation": "upload",
                "objects": [{"oid": oid, "size": 10}],
            }),
        )
        .await;
    let body = resp.json();
    assert!(body["objects"][0].get("actions").is_none());
    assert!(body["objects"][0].get("error").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_mismatch_is_rejected_and_discarded() {
    let server = TestServer::spawn().await;
    let oid = hello_oid();

    let resp = server
        .upload("acme/widgets", WRITER_TOKEN, &oid, b"tampered!!")
        .await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!server.storage.contains(&storage_key(&oid)));

    let resp = server.download("acme/widgets", WRITER_TOKEN, &oid).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_objects_survive_uploads_from_other_repos() {
    let server = TestServer::spawn().await;
    server.db.allow("acme", "gadgets");
    let oid = hello_oid();

    let resp = server.upload("acme/widgets", WRITER_TOKEN, &oid, HELLO).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(server.storage.put_count(), 1);

    // Same OID, wrong bytes, from a repo that has no record of it.
    let resp = server
        .upload("acme/gadgets", WRITER_TOKEN, &oid, b"tampered!!")
        .await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(server.storage.contains(&storage_key(&oid)));

    let resp = server.download("acme/widgets", WRITER_TOKEN, &oid).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(&resp.body[..], HELLO);

    let resp = server.download("acme/gadgets", WRITER_TOKEN, &oid).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    // The honest upload is verified against the body and recorded for the
    // second repo without rewriting the shared object.
    let resp = server.upload("acme/gadgets", WRITER_TOKEN, &oid, HELLO).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(server.storage.put_count(), 1);

    let resp = server.download("acme/gadgets", WRITER_TOKEN, &oid).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(&resp.body[..], HELLO);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_upload_plans_actions_in_order() {
    let server = TestServer::spawn().await;
    let present = hello_oid();
    let missing = sha256_hex(b"not yet uploaded");

    server
        .upload("acme/widgets", WRITER_TOKEN, &present, HELLO)
        .await;

    let resp = server
        .batch(
            "acme/widgets.git",
            WRITER_TOKEN,
            json!({
                "operation": "upload",
                "transfers": ["basic", "tus"],
                "objects": [
                    {"oid": missing, "size": 16},
                    {"oid": present, "size": 10},
                    {"oid": present, "size": 11},
                    {"oid": missing, "size": 16},
                ],
            }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let body = resp.json();
    let objects = body["objects"].as_array().unwrap();
    assert_eq!(objects.len(), 4);

    let upload = &objects[0]["actions"]["upload"];
    assert_eq!(
        upload["href"],
        server.url(&format!("/acme/widgets/info/lfs/objects/{}", missing))
    );
    assert_eq!(
        upload["header"]["authorization"],
        format!("Bearer {}", WRITER_TOKEN)
    );
    assert_eq!(
        objects[0]["actions"]["verify"]["href"],
        server.url("/acme/widgets/info/lfs/objects/verify")
    );

    assert!(objects[1].get("actions").is_none());
    assert_eq!(objects[2]["error"]["code"], 409);
    assert_eq!(objects[3]["oid"], missing.as_str());
    assert!(objects[3]["actions"]["upload"].is_object());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_hash_algorithm() {
    let server = TestServer::spawn().await;

    let resp = server
        .batch(
            "acme/widgets",
            WRITER_TOKEN,
            json!({
                "operation": "download",
                "hash_algo": "sha512",
                "objects": [],
            }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::CONFLICT);
    assert_eq!(resp.headers[header::CONTENT_TYPE], LFS_MIME);

    let resp = server
        .batch(
            "acme/widgets",
            WRITER_TOKEN,
            json!({
                "operation": "download",
                "hash_algo": "../etc",
                "objects": [],
            }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credentials_are_challenged() {
    let server = TestServer::spawn().await;

    let resp = server
        .request(
            Method::POST,
            "/acme/widgets/info/lfs/objects/batch",
            None,
            r#"{"operation":"download","objects":[]}"#,
        )
        .await;

    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers[header::WWW_AUTHENTICATE],
        "Bearer realm=\"git-lfs\""
    );
    assert_eq!(resp.headers["lfs-authenticate"], "Basic realm=\"git-lfs\"");

    let body = resp.json();
    assert!(body["message"].is_string());
    assert_eq!(
        body["request_id"],
        resp.headers["x-request-id"].to_str().unwrap()
    );

    let resp = server
        .download("acme/widgets", "bogus-token", &hello_oid())
        .await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_auth_carries_the_token() {
    let server = TestServer::spawn().await;
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("git:{}", WRITER_TOKEN));

    let req = Request::post(server.url("/acme/widgets/info/lfs/objects/batch"))
        .header(header::AUTHORIZATION, format!("Basic {}", basic))
        .body(Full::new(Bytes::from(
            r#"{"operation":"download","objects":[]}"#,
        )))
        .unwrap();

    let resp = server.send(req).await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn policies_and_allowlist_are_enforced() {
    let server = TestServer::spawn().await;
    let oid = hello_oid();

    // Download-only principal.
    let resp = server
        .batch(
            "acme/widgets",
            READER_TOKEN,
            json!({
                "operation": "upload",
                "objects": [{"oid": oid, "size": 10}],
            }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);

    let resp = server.upload("acme/widgets", READER_TOKEN, &oid, HELLO).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(server.storage.put_count(), 0);

    // Covered by policy but not allow-listed.
    let resp = server
        .batch(
            "acme/gadgets",
            WRITER_TOKEN,
            json!({
                "operation": "download",
                "objects": [{"oid": oid, "size": 10}],
            }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn readiness_reports_each_dependency() {
    let server = TestServer::spawn().await;

    let resp = server
        .request(Method::GET, "/readyz", None, Bytes::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    server.kv.set_offline(true);

    let resp = server
        .request(Method::GET, "/readyz", None, Bytes::new())
        .await;
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.json(),
        json!({"postgres": "ok", "redis": "unhealthy", "s3": "ok"})
    );

    let resp = server
        .request(Method::GET, "/healthz", None, Bytes::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(&resp.body[..], b"ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn verify_checks_the_stored_object() {
    let server = TestServer::spawn().await;
    let oid = hello_oid();
    let verify = "/acme/widgets/info/lfs/objects/verify";

    let resp = server
        .request(
            Method::POST,
            verify,
            Some(WRITER_TOKEN),
            json!({"oid": oid, "size": 10}).to_string(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    server.upload("acme/widgets", WRITER_TOKEN, &oid, HELLO).await;

    let resp = server
        .request(
            Method::POST,
            verify,
            Some(WRITER_TOKEN),
            json!({"oid": oid, "size": 11}).to_string(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let resp = server
        .request(
            Method::POST,
            verify,
            Some(WRITER_TOKEN),
            json!({"oid": oid, "size": 10}).to_string(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    // The reader has no verify grant.
    let resp = server
        .request(
            Method::POST,
            verify,
            Some(READER_TOKEN),
            json!({"oid": oid, "size": 10}).to_string(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_ids_are_echoed() {
    let server = TestServer::spawn().await;

    let req = Request::get(server.url("/healthz"))
        .header("x-request-id", "trace-me-123")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = server.send(req).await;
    assert_eq!(resp.headers["x-request-id"], "trace-me-123");

    let resp = server
        .request(Method::GET, "/healthz", None, Bytes::new())
        .await;
    assert!(!resp.headers["x-request-id"].is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_routes_are_not_found() {
    let server = TestServer::spawn().await;

    let resp = server
        .request(Method::GET, "/nope", None, Bytes::new())
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = server
        .request(
            Method::GET,
            "/acme/widgets/info/lfs/objects/not-hex",
            Some(WRITER_TOKEN),
            Bytes::new(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_accepting() {
    let server = TestServer::spawn_with(|builder| {
        builder.shutdown_timeout(Duration::from_millis(200));
    })
    .await;
    let addr: SocketAddr = server.server.addr();

    let resp = server
        .request(Method::GET, "/healthz", None, Bytes::new())
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let common::TestServer { server, .. } = server;
    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap();

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

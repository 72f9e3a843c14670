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

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::Full;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lfs_gateway::access::{AccessPolicy, Permission, SubjectSelector};
use lfs_gateway::auth::oauth::OAuthConfig;

use common::{sha256_hex, TestResponse, TestServer};

const APP: &str = "https://app.example.com/done";

async fn github() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .and(body_string_contains("code=good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"access_token": "gho_abc", "token_type": "bearer"}),
        ))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", "Bearer gho_abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"login": "octocat", "id": 583231})),
        )
        .mount(&server)
        .await;

    server
}

async fn gateway(github: &MockServer) -> TestServer {
    let config = OAuthConfig {
        client_id: "client".into(),
        client_secret: "shh".into(),
        authorize_url: format!("{}/login/oauth/authorize", github.uri()),
        token_url: format!("{}/login/oauth/access_token", github.uri()),
        api_url: github.uri(),
        allowed_redirect_uris: vec![APP.into()],
        ..OAuthConfig::default()
    };

    TestServer::spawn_with(|builder| {
        builder.oauth(config);
    })
    .await
}

async fn get(
    server: &TestServer,
    path: &str,
    cookie: Option<&str>,
) -> TestResponse {
    let mut req = Request::get(server.url(path));
    if let Some(cookie) = cookie {
        req = req.header(header::COOKIE, cookie);
    }
    server.send(req.body(Full::new(Bytes::new())).unwrap()).await
}

/// Runs the login redirect and returns the issued state.
async fn start_login(server: &TestServer) -> String {
    let resp = get(
        server,
        &format!("/auth/github/login?redirect_uri={}", APP),
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::FOUND);

    let location =
        Url::parse(resp.headers[header::LOCATION].to_str().unwrap()).unwrap();
    assert_eq!(location.path(), "/login/oauth/authorize");

    let param = |name: &str| {
        location
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    assert_eq!(param("client_id").as_deref(), Some("client"));
    assert_eq!(
        param("redirect_uri"),
        Some(server.url("/auth/github/callback"))
    );

    param("state").unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn state_is_single_use() {
    let github = github().await;
    let server = gateway(&github).await;

    let state = start_login(&server).await;
    let callback = format!("/auth/github/callback?code=good&state={}", state);

    let resp = get(&server, &callback, None).await;
    assert_eq!(resp.status, StatusCode::FOUND);
    assert_eq!(resp.headers[header::LOCATION], APP);

    let cookie = resp.headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("lfs_session="));
    assert!(cookie.contains("HttpOnly"));

    let resp = get(&server, &callback, None).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert!(resp.headers.get(header::SET_COOKIE).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn session_cookie_authenticates() {
    let github = github().await;
    let server = gateway(&github).await;

    server.db.add_policy(AccessPolicy {
        issuer: "https://github.com".into(),
        selector: SubjectSelector::Subject("octocat".into()),
        repo_pattern: "acme/widgets".into(),
        actions: [Permission::Download].into_iter().collect(),
    });

    let state = start_login(&server).await;
    let resp = get(
        &server,
        &format!("/auth/github/callback?code=good&state={}", state),
        None,
    )
    .await;
    let set_cookie = resp.headers[header::SET_COOKIE].to_str().unwrap();
    let cookie = set_cookie.split(';').next().unwrap().to_owned();
    let session_id = cookie.trim_start_matches("lfs_session=").to_owned();

    let resp = get(&server, "/auth/session", Some(&cookie)).await;
    assert_eq!(resp.status, StatusCode::OK);
    let body = resp.json();
    assert_eq!(body["subject"], "octocat");
    assert_eq!(body["kind"], "session");
    assert!(!resp.body.is_empty());
    assert!(!String::from_utf8_lossy(&resp.body).contains(&session_id));

    let req = Request::post(
        server.url("/acme/widgets/info/lfs/objects/batch"),
    )
    .header(header::COOKIE, &cookie)
    .body(Full::new(Bytes::from(
        json!({
            "operation": "download",
            "objects": [{"oid": sha256_hex(b"x"), "size": 1}],
        })
        .to_string(),
    )))
    .unwrap();
    let resp = server.send(req).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["objects"][0]["error"]["code"], 404);

    // Logging out revokes the session server-side.
    let req = Request::builder()
        .method(Method::DELETE)
        .uri(server.url("/auth/session"))
        .header(header::COOKIE, &cookie)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = server.send(req).await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    assert!(resp.headers[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .contains("Max-Age=0"));

    let resp = get(&server, "/auth/session", Some(&cookie)).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_redirects_are_refused() {
    let github = github().await;
    let server = gateway(&github).await;

    let resp = get(
        &server,
        "/auth/github/login?redirect_uri=https://evil.example.com/done",
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert!(resp.headers.get(header::LOCATION).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_code_is_unauthorized() {
    let github = github().await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"error": "bad_verification_code"})),
        )
        .mount(&github)
        .await;
    let server = gateway(&github).await;

    let state = start_login(&server).await;
    let resp = get(
        &server,
        &format!("/auth/github/callback?code=stale&state={}", state),
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn login_is_absent_without_oauth() {
    let server = TestServer::spawn().await;
    let resp = get(&server, "/auth/github/login", None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

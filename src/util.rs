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
use std::fmt;

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Buf};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;
use crate::logger::is_sensitive_key;

pub type BoxBody = UnsyncBoxBody<Bytes, Error>;

/// Outbound client used for JWKS and OAuth provider calls.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Largest JSON body accepted from a client.
pub const JSON_LIMIT: usize = 10 * 1024 * 1024;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpsConnector::new())
}

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Reads a JSON document out of a request body, refusing bodies over
/// [`JSON_LIMIT`].
pub async fn from_json<T, B>(body: B) -> Result<T, Error>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = Limited::new(body, JSON_LIMIT)
        .collect()
        .await
        .map_err(|e| Error::Body(e.to_string()))?
        .aggregate();

    Ok(serde_json::from_reader(body.reader())?)
}

pub fn into_json<T>(value: &T) -> Result<Bytes, Error>
where
    T: Serialize,
{
    Ok(serde_json::to_vec_pretty(value)?.into())
}

/// Displays a header map with credential-bearing values hidden.
pub struct RedactedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Display for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for (name, value) in self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;

            let name = name.as_str();
            let secret = is_sensitive_key(name)
                || name == "cookie"
                || name == "set-cookie";
            if secret {
                write!(f, "{}: [REDACTED]", name)?;
            } else {
                write!(
                    f,
                    "{}: {}",
                    name,
                    String::from_utf8_lossy(value.as_bytes())
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;

    #[test]
    fn redacts_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        headers.insert(header::COOKIE, "lfs_session=xyz".parse().unwrap());
        headers.insert(header::USER_AGENT, "git-lfs/3.4".parse().unwrap());

        let shown = RedactedHeaders(&headers).to_string();
        assert!(!shown.contains("abc"));
        assert!(!shown.contains("xyz"));
        assert!(shown.contains("authorization: [REDACTED]"));
        assert!(shown.contains("user-agent: git-lfs/3.4"));
    }

    #[tokio::test]
    async fn json_limit_enforced() {
        let big = format!("\"{}\"", "a".repeat(JSON_LIMIT + 1));
        let res: Result<String, Error> =
            from_json(Full::new(Bytes::from(big))).await;
        assert!(matches!(res, Err(Error::Body(_))));

        let ok: String =
            from_json(Full::new(Bytes::from("\"hi\""))).await.unwrap();
        assert_eq!(ok, "hi");
    }
}

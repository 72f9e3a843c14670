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

//! Request logging and secret redaction.

use std::fmt;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use serde_json::{Map, Value};
use tower::Service;
use tracing::field::{Field, Visit};
use tracing::{Event, Instrument, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{
    FmtContext, FormatEvent, FormatFields, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

use crate::hyperext::{ClientInfo, TrustedProxies};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Replacement for any redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values never reach the log. Matching is a case-insensitive
/// substring test.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "password",
    "secret",
    "authorization",
    "session_id",
    "oauth_state",
    "oidc_state",
    "client_secret",
    "access_key_id",
    "secret_access_key",
    "api_key",
    "private_key",
    "email",
    "oidc_subject",
    "credential",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Masks the value of every sensitive key, descending into nested objects and
/// arrays of objects.
pub fn mask_sensitive_attrs(attrs: Map<String, Value>) -> Map<String, Value> {
    attrs
        .into_iter()
        .map(|(key, value)| {
            let value = if is_sensitive_key(&key) {
                Value::String(REDACTED.into())
            } else {
                mask_value(value)
            };
            (key, value)
        })
        .collect()
}

fn mask_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(mask_sensitive_attrs(map)),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(mask_value).collect())
        }
        other => other,
    }
}

/// The id assigned to each request. Echoed back in `X-Request-Id` and in
/// LFS error bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    /// Reuses a well-formed incoming id, otherwise mints a new one.
    fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|v| v.to_str().ok())
            .filter(|v| {
                !v.is_empty()
                    && v.len() <= 128
                    && v.bytes().all(|b| b.is_ascii_graphic())
            })
            .map(|v| RequestId(v.to_owned()))
            .unwrap_or_else(|| RequestId(uuid::Uuid::new_v4().to_string()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Middleware that assigns request ids, resolves the client address, and
/// logs every request on completion.
#[derive(Clone)]
pub struct Logger<S> {
    remote_addr: SocketAddr,
    proxies: TrustedProxies,
    service: S,
}

impl<S> Logger<S> {
    pub fn new(
        remote_addr: SocketAddr,
        proxies: TrustedProxies,
        service: S,
    ) -> Self {
        Logger {
            remote_addr,
            proxies,
            service,
        }
    }
}

impl<S, B, ResBody> Service<Request<B>> for Logger<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let start = Instant::now();

        let client = self
            .proxies
            .client_info(self.remote_addr.ip(), req.headers());
        let request_id =
            RequestId::from_header(req.headers().get(REQUEST_ID_HEADER));

        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        req.extensions_mut().insert::<ClientInfo>(client);
        req.extensions_mut().insert(request_id.clone());

        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %method,
            path = %path,
        );

        let fut = self.service.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                let latency_ms = start.elapsed().as_millis() as u64;

                match result {
                    Ok(mut resp) => {
                        let status = resp.status().as_u16();
                        if status >= 500 {
                            tracing::warn!(
                                status,
                                latency_ms,
                                client_ip = %client.ip,
                                "request failed"
                            );
                        } else {
                            tracing::info!(
                                status,
                                latency_ms,
                                client_ip = %client.ip,
                                "request completed"
                            );
                        }

                        if let Ok(value) = HeaderValue::from_str(&request_id.0)
                        {
                            resp.headers_mut().insert(REQUEST_ID_HEADER, value);
                        }

                        Ok(resp)
                    }
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            latency_ms,
                            client_ip = %client.ip,
                            "request errored"
                        );
                        Err(err)
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Output style of the log formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Event formatter that runs every field through [`mask_sensitive_attrs`]
/// before writing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactingFormat {
    format: LogFormat,
}

impl RedactingFormat {
    pub fn new(format: LogFormat) -> Self {
        RedactingFormat { format }
    }
}

#[derive(Default)]
struct FieldCollector {
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_owned(), value);
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        // Structured values logged as JSON text are expanded so that their
        // own keys are masked too.
        let trimmed = value.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(value) {
                self.insert(field, parsed);
                return;
            }
        }
        self.insert(field, Value::String(value.to_owned()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_error(
        &mut self,
        field: &Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_str(field, &format!("{:?}", value));
    }
}

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

impl<S, N> FormatEvent<S, N> for RedactingFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let mut fields = mask_sensitive_attrs(collector.fields);
        let message = fields.remove("message");

        let mut spans = Vec::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let ext = span.extensions();
                let rendered = ext
                    .get::<FormattedFields<N>>()
                    .map(|f| f.fields.clone())
                    .unwrap_or_default();
                spans.push((span.name(), rendered));
            }
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        match self.format {
            LogFormat::Json => {
                let mut out = Map::new();
                out.insert("timestamp".into(), Value::String(timestamp));
                out.insert(
                    "level".into(),
                    Value::String(level_str(meta.level()).into()),
                );
                out.insert(
                    "target".into(),
                    Value::String(meta.target().into()),
                );
                if let Some(message) = message {
                    out.insert("message".into(), message);
                }
                if !spans.is_empty() {
                    let spans = spans
                        .into_iter()
                        .map(|(name, fields)| {
                            let mut span = Map::new();
                            span.insert("name".into(), name.into());
                            if !fields.is_empty() {
                                span.insert("fields".into(), fields.into());
                            }
                            Value::Object(span)
                        })
                        .collect();
                    out.insert("spans".into(), Value::Array(spans));
                }
                out.insert("fields".into(), Value::Object(fields));

                let line = serde_json::to_string(&Value::Object(out))
                    .map_err(|_| fmt::Error)?;
                writeln!(writer, "{}", line)
            }
            LogFormat::Text => {
                write!(
                    writer,
                    "{} {:>5} {}: ",
                    timestamp,
                    level_str(meta.level()),
                    meta.target()
                )?;

                for (name, fields) in &spans {
                    if fields.is_empty() {
                        write!(writer, "{}: ", name)?;
                    } else {
                        write!(writer, "{}{{{}}}: ", name, fields)?;
                    }
                }

                match message {
                    Some(Value::String(s)) => write!(writer, "{}", s)?,
                    Some(other) => write!(writer, "{}", other)?,
                    None => {}
                }

                for (key, value) in &fields {
                    match value {
                        Value::String(s) => write!(writer, " {}={}", key, s)?,
                        other => write!(writer, " {}={}", key, other)?,
                    }
                }

                writeln!(writer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn masks_sensitive_keys_case_insensitively() {
        let masked = mask_sensitive_attrs(obj(json!({
            "Authorization": "Bearer abc",
            "db_password": "hunter2",
            "OIDC_SUBJECT": "repo:acme/widgets",
            "user_email": "a@b.c",
            "path": "/acme/widgets",
            "status": 200,
        })));

        assert_eq!(masked["Authorization"], json!(REDACTED));
        assert_eq!(masked["db_password"], json!(REDACTED));
        assert_eq!(masked["OIDC_SUBJECT"], json!(REDACTED));
        assert_eq!(masked["user_email"], json!(REDACTED));
        assert_eq!(masked["path"], json!("/acme/widgets"));
        assert_eq!(masked["status"], json!(200));
    }

    #[test]
    fn masks_inside_groups() {
        let masked = mask_sensitive_attrs(obj(json!({
            "principal": {
                "kind": "oidc",
                "claims": {"repository": "acme/widgets", "access_token": "x"},
            },
            "hops": [{"api_key": "k", "host": "h"}],
        })));

        assert_eq!(masked["principal"]["kind"], json!("oidc"));
        assert_eq!(
            masked["principal"]["claims"]["repository"],
            json!("acme/widgets")
        );
        assert_eq!(
            masked["principal"]["claims"]["access_token"],
            json!(REDACTED)
        );
        assert_eq!(masked["hops"][0]["api_key"], json!(REDACTED));
        assert_eq!(masked["hops"][0]["host"], json!("h"));
    }

    #[test]
    fn sensitive_group_is_masked_whole() {
        let masked = mask_sensitive_attrs(obj(json!({
            "credentials": {"user": "u"},
        })));
        assert_eq!(masked["credentials"], json!(REDACTED));
    }

    #[test]
    fn request_id_reused_when_sane() {
        let good = HeaderValue::from_static("abc-123");
        assert_eq!(RequestId::from_header(Some(&good)).0, "abc-123");

        let bad = HeaderValue::from_static("has space");
        let id = RequestId::from_header(Some(&bad));
        assert_ne!(id.0, "has space");
        assert!(uuid::Uuid::parse_str(&id.0).is_ok());

        assert!(uuid::Uuid::parse_str(&RequestId::from_header(None).0).is_ok());
    }

    #[test]
    fn formatter_redacts_event_fields() {
        use std::io;
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::fmt::MakeWriter;

        #[derive(Clone, Default)]
        struct Buf(Arc<Mutex<Vec<u8>>>);

        impl io::Write for Buf {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl<'a> MakeWriter<'a> for Buf {
            type Writer = Buf;

            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        let buf = Buf::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(RedactingFormat::new(LogFormat::Json))
            .with_writer(buf.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                client_secret = "s3cr3t",
                owner = "acme",
                principal = r#"{"kind":"session","session_id":"abc"}"#,
                "login"
            );
        });

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let line: Value = serde_json::from_str(out.trim()).unwrap();

        assert_eq!(line["message"], json!("login"));
        assert_eq!(line["fields"]["client_secret"], json!(REDACTED));
        assert_eq!(line["fields"]["owner"], json!("acme"));
        assert_eq!(line["fields"]["principal"]["session_id"], json!(REDACTED));
        assert!(!out.contains("s3cr3t"));
    }
}

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
use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logger::mask_sensitive_attrs;

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    #[display("oidc")]
    Oidc,
    #[display("session")]
    Session,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,

    /// Who vouched for the subject: the OIDC issuer, or the OAuth provider for
    /// browser sessions.
    pub issuer: String,
    pub subject: String,

    #[serde(default)]
    pub claims: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Unix seconds.
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Principal {
    /// A claim as a string. `sub` and `iss` always resolve, even when they
    /// were not copied into the claim set.
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        match name {
            "sub" => Some(&self.subject),
            "iss" => Some(&self.issuer),
            _ => self.claims.get(name).and_then(Value::as_str),
        }
    }

    /// Seconds left before the credential expires, zero if it already has.
    pub fn remaining_secs(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at - now).unwrap_or(0)
    }

    /// A JSON rendering safe to show back to the caller: session ids and
    /// sensitive claims are masked.
    pub fn masked(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Value::Object(mask_sensitive_attrs(map)),
            _ => Value::Object(Map::new()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_principal(subject: &str) -> Principal {
    Principal {
        kind: PrincipalKind::Oidc,
        issuer: "https://token.actions.githubusercontent.com".into(),
        subject: subject.into(),
        claims: BTreeMap::new(),
        session_id: None,
        issued_at: 0,
        expires_at: i64::MAX,
    }
}

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

//! Git LFS wire types.
//!
//! See also:
//! https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Media type of every batch and verify request and response.
pub const LFS_MIME: &str = "application/vnd.git-lfs+json";

/// Why an object id or hash algorithm name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid oid")]
    InvalidOid,
    #[error("invalid hash algorithm")]
    InvalidHashAlgorithm,
}

/// A content-addressed object id: at least four hex digits.
///
/// The original casing is kept; storage keys and cache keys use the id exactly
/// as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of hex digits in the id.
    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the id's width matches the digest width of `algo`.
    /// Algorithms this server cannot compute accept any width.
    pub fn fits(&self, algo: &HashAlgorithm) -> bool {
        algo.hex_width().map_or(true, |w| w == self.width())
    }
}

impl FromStr for Oid {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyError::InvalidOid);
        }

        Ok(Oid(s.to_owned()))
    }
}

impl TryFrom<String> for Oid {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short name of a hash algorithm such as `sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HashAlgorithm(String);

impl HashAlgorithm {
    pub fn sha256() -> Self {
        HashAlgorithm("sha256".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if uploads using this algorithm can be verified here.
    pub fn is_sha256(&self) -> bool {
        self.0.eq_ignore_ascii_case("sha256")
    }

    /// Width in hex digits of the algorithm's digest, if known.
    pub fn hex_width(&self) -> Option<usize> {
        if self.is_sha256() {
            Some(64)
        } else {
            None
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::sha256()
    }
}

impl FromStr for HashAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && !s.contains("..")
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');

        if valid {
            Ok(HashAlgorithm(s.to_owned()))
        } else {
            Err(KeyError::InvalidHashAlgorithm)
        }
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HashAlgorithm> for String {
    fn from(algo: HashAlgorithm) -> Self {
        algo.0
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[display("download")]
    Download,
    #[display("upload")]
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transfer {
    Basic,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestObject {
    pub oid: Oid,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfers: Vec<Transfer>,

    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<Ref>,

    pub objects: Vec<RequestObject>,

    /// Kept as a raw string so that a malformed name can be told apart from
    /// one this server merely does not support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub href: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseObject {
    pub oid: Oid,
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ResponseObject {
    pub fn error(
        object: RequestObject,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        ResponseObject {
            oid: object.oid,
            size: object.size,
            authenticated: None,
            actions: None,
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub transfer: Transfer,
    pub objects: Vec<ResponseObject>,
    pub hash_algo: HashAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub oid: Oid,
    pub size: u64,
}

/// Body of every non-2xx batch or verify response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

/// Where a single object is in its upload.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    #[display("announced")]
    Announced,
    #[display("uploading")]
    Uploading,
    #[display("verifying")]
    Verifying,
    #[display("committed")]
    Committed,
    #[display("rejected_size")]
    RejectedSize,
    #[display("rejected_hash")]
    RejectedHash,
    #[display("storage_error")]
    StorageError,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            UploadState::Announced
                | UploadState::Uploading
                | UploadState::Verifying
        )
    }

    /// Returns the next state if `to` is reachable from `self`.
    pub fn advance(self, to: UploadState) -> Option<UploadState> {
        use UploadState::*;

        let ok = match (self, to) {
            (Announced, Uploading) => true,
            (Uploading, Verifying) => true,
            (Verifying, Committed) => true,
            (Uploading, RejectedSize | StorageError) => true,
            (Verifying, RejectedHash | StorageError) => true,
            _ => false,
        };

        ok.then_some(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_accepts_mixed_case_hex() {
        assert!("ABCDef01".parse::<Oid>().is_ok());
        assert_eq!("abc".parse::<Oid>(), Err(KeyError::InvalidOid));
        assert_eq!("abcg".parse::<Oid>(), Err(KeyError::InvalidOid));
        assert_eq!("".parse::<Oid>(), Err(KeyError::InvalidOid));
    }

    #[test]
    fn oid_width_checked_against_known_algorithms() {
        let short: Oid = "abcd".parse().unwrap();
        let full: Oid = "a".repeat(64).parse().unwrap();
        let other: HashAlgorithm = "blake3".parse().unwrap();

        assert!(!short.fits(&HashAlgorithm::sha256()));
        assert!(full.fits(&HashAlgorithm::sha256()));
        assert!(short.fits(&other));
    }

    #[test]
    fn hash_algorithm_grammar() {
        assert!("sha256".parse::<HashAlgorithm>().is_ok());
        assert!("SHA-512".parse::<HashAlgorithm>().is_ok());
        assert_eq!(
            "../etc".parse::<HashAlgorithm>(),
            Err(KeyError::InvalidHashAlgorithm)
        );
        assert_eq!(
            "a..b".parse::<HashAlgorithm>(),
            Err(KeyError::InvalidHashAlgorithm)
        );
        assert_eq!(
            "sha 256".parse::<HashAlgorithm>(),
            Err(KeyError::InvalidHashAlgorithm)
        );
    }

    #[test]
    fn batch_request_defaults() {
        let req: BatchRequest = serde_json::from_str(
            r#"{"operation":"upload","objects":[{"oid":"abcd","size":1}]}"#,
        )
        .unwrap();

        assert_eq!(req.operation, Operation::Upload);
        assert!(req.transfers.is_empty());
        assert!(req.hash_algo.is_none());
        assert_eq!(req.objects.len(), 1);
    }

    #[test]
    fn batch_request_rejects_bad_oid() {
        let res: Result<BatchRequest, _> = serde_json::from_str(
            r#"{"operation":"download","objects":[{"oid":"xyz!","size":1}]}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn unknown_transfers_are_tolerated() {
        let req: BatchRequest = serde_json::from_value(serde_json::json!({
            "operation": "download",
            "transfers": ["lfs-standalone-file", "basic"],
            "objects": [],
        }))
        .unwrap();

        assert_eq!(req.transfers, vec![Transfer::Unknown, Transfer::Basic]);
    }

    #[test]
    fn response_omits_empty_fields() {
        let obj = ResponseObject {
            oid: "abcd".parse().unwrap(),
            size: 10,
            authenticated: None,
            actions: None,
            error: None,
        };

        assert_eq!(
            serde_json::to_string(&obj).unwrap(),
            r#"{"oid":"abcd","size":10}"#
        );
    }

    #[test]
    fn upload_state_transitions() {
        use UploadState::*;

        assert_eq!(Announced.advance(Uploading), Some(Uploading));
        assert_eq!(Uploading.advance(Verifying), Some(Verifying));
        assert_eq!(Verifying.advance(Committed), Some(Committed));
        assert_eq!(Verifying.advance(RejectedHash), Some(RejectedHash));
        assert_eq!(Announced.advance(Committed), None);
        assert_eq!(Committed.advance(Uploading), None);
        assert!(Committed.is_terminal());
        assert!(RejectedSize.is_terminal());
        assert!(!Verifying.is_terminal());
    }
}

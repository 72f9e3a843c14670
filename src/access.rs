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
//! Decides whether a principal may act on a repository.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};
use wildmatch::WildMatch;

use crate::auth::principal::Principal;
use crate::db::{MetadataError, MetadataRepo, PolicyRepo};
use crate::error::ErrorKind;
use crate::lfs::Operation;

#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[display("download")]
    Download,
    #[display("upload")]
    Upload,
    #[display("verify")]
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action `{0}`")]
pub struct UnknownPermission(String);

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Permission::Download),
            "upload" => Ok(Permission::Upload),
            "verify" => Ok(Permission::Verify),
            other => Err(UnknownPermission(other.to_owned())),
        }
    }
}

impl From<Operation> for Permission {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Download => Permission::Download,
            Operation::Upload => Permission::Upload,
        }
    }
}

/// Which principals a policy speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectSelector {
    /// The principal's subject, exactly.
    Subject(String),

    /// Any principal carrying this string claim, such as
    /// `repository_owner=acme`.
    Claim { name: String, value: String },
}

/// An allow-policy. There are no deny policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub issuer: String,
    pub selector: SubjectSelector,

    /// `owner/repo`, a glob such as `acme/*`, or `*`.
    pub repo_pattern: String,
    pub actions: BTreeSet<Permission>,
}

impl AccessPolicy {
    pub fn applies_to(&self, principal: &Principal) -> bool {
        if self.issuer != principal.issuer {
            return false;
        }

        match &self.selector {
            SubjectSelector::Subject(subject) => *subject == principal.subject,
            SubjectSelector::Claim { name, value } => {
                principal.claim_str(name) == Some(value.as_str())
            }
        }
    }

    pub fn covers(&self, owner: &str, repo: &str) -> bool {
        let pattern = self.repo_pattern.as_str();
        if pattern == "*" {
            return true;
        }

        let full = format!("{}/{}", owner, repo);
        if pattern == full {
            return true;
        }

        WildMatch::new(pattern).matches(&full)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("authorisation_unavailable")]
    Unavailable(#[source] MetadataError),

    #[error("{subject} may not {permission} {owner}/{repo}")]
    Denied {
        subject: String,
        permission: Permission,
        owner: String,
        repo: String,
    },
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::Unavailable(_) => ErrorKind::DependencyUnavailable,
            AccessError::Denied { .. } => ErrorKind::Forbidden,
        }
    }
}

/// Everything a principal may do on one repository. Computed once per
/// request so a batch does not repeat policy lookups per object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grants {
    pub permitted: BTreeSet<Permission>,
    pub allowlisted: bool,
}

impl Grants {
    pub fn allows(&self, permission: Permission) -> bool {
        self.allowlisted && self.permitted.contains(&permission)
    }
}

pub struct AccessService {
    policies: Arc<dyn PolicyRepo>,
    repo: Arc<dyn MetadataRepo>,

    /// When false every repository counts as allow-listed.
    allowlist_enabled: bool,
}

impl AccessService {
    pub fn new(
        policies: Arc<dyn PolicyRepo>,
        repo: Arc<dyn MetadataRepo>,
        allowlist_enabled: bool,
    ) -> Self {
        AccessService {
            policies,
            repo,
            allowlist_enabled,
        }
    }

    /// True if the repository may be served at all.
    pub async fn is_allowlisted(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<bool, AccessError> {
        if !self.allowlist_enabled {
            return Ok(true);
        }

        self.repo
            .is_allowed(owner, repo)
            .await
            .map_err(AccessError::Unavailable)
    }

    pub async fn grants(
        &self,
        principal: &Principal,
        owner: &str,
        repo: &str,
    ) -> Result<Grants, AccessError> {
        let allowlisted = self.is_allowlisted(owner, repo).await?;
        if !allowlisted {
            return Ok(Grants {
                permitted: BTreeSet::new(),
                allowlisted,
            });
        }

        let policies = self
            .policies
            .policies_for_issuer(&principal.issuer)
            .await
            .map_err(AccessError::Unavailable)?;

        let permitted = policies
            .iter()
            .filter(|p| p.applies_to(principal) && p.covers(owner, repo))
            .flat_map(|p| p.actions.iter().copied())
            .collect();

        Ok(Grants {
            permitted,
            allowlisted,
        })
    }

    pub async fn authorize(
        &self,
        principal: &Principal,
        owner: &str,
        repo: &str,
        permission: Permission,
    ) -> Result<(), AccessError> {
        let grants = self.grants(principal, owner, repo).await?;
        Self::check(&grants, principal, owner, repo, permission)
    }

    pub fn check(
        grants: &Grants,
        principal: &Principal,
        owner: &str,
        repo: &str,
        permission: Permission,
    ) -> Result<(), AccessError> {
        if grants.allows(permission) {
            return Ok(());
        }

        event!(
            Level::INFO,
            kind = %principal.kind,
            issuer = %principal.issuer,
            permission = %permission,
            owner,
            repo,
            allowlisted = grants.allowlisted,
            "access denied"
        );

        Err(AccessError::Denied {
            subject: principal.subject.clone(),
            permission,
            owner: owner.to_owned(),
            repo: repo.to_owned(),
        })
    }
}

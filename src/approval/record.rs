use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::task::task::Requester;

/// Globally unique approval identifier.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct ApprovalId(Ulid);

impl ApprovalId {
    #[allow(clippy::new_without_default)] // a fresh id per call, Default would mislead
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered risk classification used by the auto-approve rule.
#[derive(
    Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    AutoApproved,
}

impl ApprovalStatus {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::AutoApproved => "auto_approved",
        };
        write!(f, "{s}")
    }
}

/// Requests without an explicit expiry live for 15 minutes.
pub fn default_approval_ttl() -> Duration {
    Duration::minutes(15)
}

/// A privileged operation waiting for a decision.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub request_type: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub requested_by: Requester,
    pub requested_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub auto_approve_threshold: Option<RiskLevel>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        request_type: impl Into<String>,
        title: impl Into<String>,
        requested_by: Requester,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            title: title.into(),
            description: String::new(),
            details: BTreeMap::new(),
            requested_by,
            requested_at: Utc::now(),
            risk_level,
            auto_approve_threshold: None,
            expires_at: None,
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_auto_approve_threshold(self, threshold: RiskLevel) -> Self {
        Self {
            auto_approve_threshold: Some(threshold),
            ..self
        }
    }

    pub fn with_expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }
}

/// The out-of-band decision attached to a terminal record.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ApprovalRecord {
    pub id: ApprovalId,
    pub request: ApprovalRequest,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub response: Option<ApprovalResponse>,
}

impl ApprovalRecord {
    /// A fresh pending record; a missing expiry gets the default TTL.
    pub fn new(mut request: ApprovalRequest) -> Self {
        request
            .expires_at
            .get_or_insert(request.requested_at + default_approval_ttl());
        Self {
            id: ApprovalId::new(),
            request,
            status: ApprovalStatus::Pending,
            response: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending
            && self.request.expires_at.is_some_and(|at| at <= now)
    }
}

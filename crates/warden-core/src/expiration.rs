//! Expiration evaluation
//!
//! A resource is expired when it carries every required tag and its
//! `expirationDate` lies at least `grace_days` whole days before today (UTC).
//! Day counting is calendar-date based; time of day is ignored once both
//! sides are in UTC.

use crate::error::{Result, WardenError};
use crate::resource::CloudResource;
use crate::tags::{TAG_BUILD_ID, TAG_EXPIRATION_DATE, TAG_JOB};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_GRACE_DAYS: i64 = 2;

/// Offset-aware formats accepted besides RFC 3339
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"];

/// Formats without an offset, interpreted as UTC
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

/// Parse an ISO-8601 `expirationDate` value into UTC
///
/// A trailing `Z` is accepted as `+00:00`. Values without an offset are taken
/// as UTC; a bare date is midnight UTC.
pub fn parse_expiration_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let normalized = match value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        Some(stripped) => format!("{stripped}+00:00"),
        None => value.to_string(),
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(&normalized, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

/// Whole calendar days between the expiration date and `now`, both in UTC
pub fn days_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now.date_naive() - expires_at.date_naive()).num_days()
}

/// Expiration thresholds for one class of resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationPolicy {
    pub grace_days: i64,

    /// Tags that must all be present; `expirationDate` is always required
    pub required_tags: Vec<String>,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::for_vpcs()
    }
}

impl ExpirationPolicy {
    /// VPCs and OIDC providers: `expirationDate` + `prow.k8s.io/build-id`
    pub fn for_vpcs() -> Self {
        Self {
            grace_days: DEFAULT_GRACE_DAYS,
            required_tags: vec![TAG_EXPIRATION_DATE.to_string(), TAG_BUILD_ID.to_string()],
        }
    }

    /// Elastic IPs, IAM roles and instance profiles: `expirationDate` + `prow.k8s.io/job`
    pub fn for_global() -> Self {
        Self {
            grace_days: DEFAULT_GRACE_DAYS,
            required_tags: vec![TAG_EXPIRATION_DATE.to_string(), TAG_JOB.to_string()],
        }
    }

    pub fn with_grace_days(mut self, days: i64) -> Self {
        self.grace_days = days;
        self
    }
}

/// A resource found expired, with the facts that made it so
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiredResource {
    pub resource: CloudResource,
    pub expires_at: DateTime<Utc>,
    pub days_expired: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExpirationEvaluator {
    policy: ExpirationPolicy,
}

impl ExpirationEvaluator {
    pub fn new(policy: ExpirationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    /// Evaluate one resource
    ///
    /// `Ok(None)` when a required tag is missing or the grace period has not
    /// passed. A present but unparseable `expirationDate` is an error.
    pub fn evaluate(
        &self,
        resource: &CloudResource,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredResource>> {
        let has_required = resource.tags.has(TAG_EXPIRATION_DATE)
            && self
                .policy
                .required_tags
                .iter()
                .all(|tag| resource.tags.has(tag));
        if !has_required {
            return Ok(None);
        }

        let raw = resource.tags.get_or(TAG_EXPIRATION_DATE, "");
        let expires_at =
            parse_expiration_date(raw).ok_or_else(|| WardenError::MalformedExpirationTag {
                resource_id: resource.id.clone(),
                value: raw.to_string(),
            })?;

        let days = days_expired(expires_at, now);
        if days < self.policy.grace_days {
            return Ok(None);
        }

        Ok(Some(ExpiredResource {
            resource: resource.clone(),
            expires_at,
            days_expired: days,
        }))
    }

    /// Malformed tags count as not expired
    pub fn is_expired(&self, resource: &CloudResource, now: DateTime<Utc>) -> bool {
        match self.evaluate(resource, now) {
            Ok(verdict) => verdict.is_some(),
            Err(e) => {
                warn!(resource_id = %resource.id, error = %e, "Skipping resource with bad expiration tag");
                false
            }
        }
    }

    /// Expired resources sorted by expiration timestamp, oldest first
    ///
    /// Ties keep their listing order.
    pub fn expired_oldest_first(
        &self,
        resources: &[CloudResource],
        now: DateTime<Utc>,
    ) -> Vec<ExpiredResource> {
        let mut expired: Vec<ExpiredResource> = resources
            .iter()
            .filter_map(|resource| match self.evaluate(resource, now) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(resource_id = %resource.id, error = %e, "Skipping resource with bad expiration tag");
                    None
                }
            })
            .collect();
        expired.sort_by_key(|e| e.expires_at);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;
    use chrono::TimeZone;

    fn vpc(id: &str, expiration: &str) -> CloudResource {
        CloudResource::new(id, ResourceType::Vpc, "us-west-2")
            .with_tag(TAG_EXPIRATION_DATE, expiration)
            .with_tag(TAG_BUILD_ID, "1001")
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_parse_formats() {
        let expected = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(parse_expiration_date("2024-01-01T00:00Z"), Some(expected));
        assert_eq!(parse_expiration_date("2024-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_expiration_date("2024-01-01T00:00:00.000+00:00"), Some(expected));
        assert_eq!(parse_expiration_date("2024-01-01T02:00+02:00"), Some(expected));
        assert_eq!(parse_expiration_date("2024-01-01T00:00:00"), Some(expected));
        assert_eq!(parse_expiration_date("2024-01-01"), Some(expected));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_expiration_date(""), None);
        assert_eq!(parse_expiration_date("next tuesday"), None);
        assert_eq!(parse_expiration_date("2024-13-45T00:00Z"), None);
    }

    #[test]
    fn test_expired_boundary_is_date_based() {
        let evaluator = ExpirationEvaluator::default();
        let r = vpc("vpc-1", "2024-01-01T00:00Z");

        assert!(evaluator.is_expired(&r, at(2024, 1, 3, 0, 0, 0)));
        assert!(!evaluator.is_expired(&r, at(2024, 1, 2, 23, 59, 59)));
    }

    #[test]
    fn test_days_expired_reported() {
        let evaluator = ExpirationEvaluator::default();
        let r = vpc("vpc-1", "2024-01-01T18:30Z");

        let expired = evaluator
            .evaluate(&r, at(2024, 1, 6, 1, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(expired.days_expired, 5);
    }

    #[test]
    fn test_offset_shifts_utc_date() {
        let evaluator = ExpirationEvaluator::default();
        // 2024-01-01T23:00-05:00 is 2024-01-02T04:00Z
        let r = vpc("vpc-1", "2024-01-01T23:00-05:00");

        assert!(!evaluator.is_expired(&r, at(2024, 1, 3, 12, 0, 0)));
        assert!(evaluator.is_expired(&r, at(2024, 1, 4, 0, 0, 0)));
    }

    #[test]
    fn test_missing_required_tag_is_not_expired() {
        let evaluator = ExpirationEvaluator::default();
        let untagged = CloudResource::new("vpc-2", ResourceType::Vpc, "us-west-2")
            .with_tag(TAG_EXPIRATION_DATE, "2020-01-01T00:00Z");

        assert_eq!(evaluator.evaluate(&untagged, at(2024, 1, 1, 0, 0, 0)).unwrap(), None);
        assert!(!evaluator.is_expired(&untagged, at(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_expiration_date_always_required() {
        let evaluator = ExpirationEvaluator::new(ExpirationPolicy {
            grace_days: 0,
            required_tags: vec![],
        });
        let r = CloudResource::new("vpc-3", ResourceType::Vpc, "us-west-2");

        assert!(!evaluator.is_expired(&r, at(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_malformed_tag_is_error_not_expired() {
        let evaluator = ExpirationEvaluator::default();
        let r = vpc("vpc-4", "soon");

        let err = evaluator.evaluate(&r, at(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, WardenError::MalformedExpirationTag { .. }));
        assert!(!evaluator.is_expired(&r, at(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_global_policy_requires_job_tag() {
        let evaluator = ExpirationEvaluator::new(ExpirationPolicy::for_global());
        let role = CloudResource::new("ci-role", ResourceType::IamRole, "")
            .with_tag(TAG_EXPIRATION_DATE, "2024-01-01T00:00Z");
        let with_job = role.clone().with_tag(TAG_JOB, "e2e-aws");

        assert!(!evaluator.is_expired(&role, at(2024, 2, 1, 0, 0, 0)));
        assert!(evaluator.is_expired(&with_job, at(2024, 2, 1, 0, 0, 0)));
    }

    #[test]
    fn test_oldest_first_ordering() {
        let evaluator = ExpirationEvaluator::default();
        let resources = vec![
            vpc("vpc-c", "2024-01-03T00:00Z"),
            vpc("vpc-a", "2024-01-01T00:00Z"),
            vpc("vpc-fresh", "2024-03-01T00:00Z"),
            vpc("vpc-bad", "whenever"),
            vpc("vpc-b", "2024-01-01T00:00Z"),
        ];

        let ids: Vec<String> = evaluator
            .expired_oldest_first(&resources, at(2024, 2, 1, 0, 0, 0))
            .into_iter()
            .map(|e| e.resource.id)
            .collect();
        assert_eq!(ids, vec!["vpc-a", "vpc-b", "vpc-c"]);
    }
}

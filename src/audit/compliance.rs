//! Compliance events derived from audit entries.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::entry::{AuditAction, AuditLogEntry, ResourceType};
use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceEventType {
    DataAccess,
    SecurityIncident,
    DataDeletion,
    IntegrityViolation,
}

impl ComplianceEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceEventType::DataAccess => "data_access",
            ComplianceEventType::SecurityIncident => "security_incident",
            ComplianceEventType::DataDeletion => "data_deletion",
            ComplianceEventType::IntegrityViolation => "integrity_violation",
        }
    }
}

impl std::str::FromStr for ComplianceEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data_access" => Ok(ComplianceEventType::DataAccess),
            "security_incident" => Ok(ComplianceEventType::SecurityIncident),
            "data_deletion" => Ok(ComplianceEventType::DataDeletion),
            "integrity_violation" => Ok(ComplianceEventType::IntegrityViolation),
            other => Err(anyhow!("unknown compliance event type: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(anyhow!("unknown severity: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceEvent {
    pub id: String,
    pub audit_entry_id: String,
    pub event_type: ComplianceEventType,
    pub severity: Severity,
    pub description: String,
    pub affected_resources: Vec<String>,
    pub frameworks: Vec<String>,
    pub reporting_required: bool,
    pub created_at: u64,
    pub reported_at: Option<u64>,
}

impl ComplianceEvent {
    pub fn needs_immediate_report(&self) -> bool {
        self.severity == Severity::Critical && self.reporting_required
    }
}

/// A compliance event before it is bound to an id and a source entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComplianceDraft {
    pub event_type: ComplianceEventType,
    pub severity: Severity,
    pub description: String,
    pub affected_resources: Vec<String>,
    pub frameworks: Vec<String>,
    pub reporting_required: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ComplianceFilter {
    pub event_type: Option<ComplianceEventType>,
    pub min_severity: Option<Severity>,
    pub unreported_only: bool,
}

impl ComplianceFilter {
    pub fn matches(&self, event: &ComplianceEvent) -> bool {
        self.event_type.map_or(true, |t| event.event_type == t)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && (!self.unreported_only || event.reported_at.is_none())
    }
}

/// Sink for events regulators must hear about.
pub trait ComplianceReporter: Send + Sync {
    fn report(&self, event: &ComplianceEvent) -> Result<()>;
}

/// Default reporter: surfaces the event on the error log.
#[derive(Debug, Default)]
pub struct LogComplianceReporter;

impl ComplianceReporter for LogComplianceReporter {
    fn report(&self, event: &ComplianceEvent) -> Result<()> {
        log::error!(
            "compliance report: {} {} ({}) resources={:?} frameworks={:?}",
            event.severity.as_str(),
            event.event_type.as_str(),
            event.description,
            event.affected_resources,
            event.frameworks
        );
        Ok(())
    }
}

fn is_sensitive_resource(resource_type: ResourceType) -> bool {
    matches!(resource_type, ResourceType::Pii | ResourceType::Evidence)
}

fn is_security_sensitive(action: AuditAction) -> bool {
    matches!(
        action,
        AuditAction::Login
            | AuditAction::Export
            | AuditAction::Encrypt
            | AuditAction::Decrypt
            | AuditAction::Rotate
            | AuditAction::Delete
            | AuditAction::Escalate
            | AuditAction::PermissionChange
            | AuditAction::Verify
    )
}

fn frameworks_for(resource_type: ResourceType) -> Vec<String> {
    match resource_type {
        ResourceType::Pii => vec!["GDPR".to_string(), "CCPA".to_string()],
        ResourceType::Evidence => vec!["CJIS".to_string()],
        _ => vec!["SOC2".to_string()],
    }
}

/// Derive zero or more compliance events from one appended entry.
pub fn derive_events(entry: &AuditLogEntry) -> Vec<ComplianceDraft> {
    let mut drafts = Vec::new();
    let resource = format!("{}:{}", entry.resource_type, entry.resource_id);

    if entry.success
        && is_sensitive_resource(entry.resource_type)
        && matches!(
            entry.action,
            AuditAction::Read | AuditAction::Export | AuditAction::Decrypt
        )
    {
        drafts.push(ComplianceDraft {
            event_type: ComplianceEventType::DataAccess,
            severity: if entry.resource_type == ResourceType::Pii {
                Severity::Medium
            } else {
                Severity::Low
            },
            description: format!("{} {} by {}", entry.action, resource, entry.actor_id),
            affected_resources: vec![resource.clone()],
            frameworks: frameworks_for(entry.resource_type),
            reporting_required: false,
        });
    }

    if !entry.success && is_security_sensitive(entry.action) {
        let integrity = entry.error_code.as_deref() == Some(ErrorKind::IntegrityViolation.code());
        drafts.push(ComplianceDraft {
            event_type: ComplianceEventType::SecurityIncident,
            severity: if integrity {
                Severity::Critical
            } else {
                Severity::High
            },
            description: format!(
                "failed {} on {} by {}: {}",
                entry.action,
                resource,
                entry.actor_id,
                entry.error.as_deref().unwrap_or("unknown error")
            ),
            affected_resources: vec![resource.clone()],
            frameworks: frameworks_for(entry.resource_type),
            reporting_required: true,
        });
    }

    if entry.success && entry.action == AuditAction::Delete && entry.resource_type == ResourceType::Pii
    {
        drafts.push(ComplianceDraft {
            event_type: ComplianceEventType::DataDeletion,
            severity: Severity::Medium,
            description: format!("deleted {} by {}", resource, entry.actor_id),
            affected_resources: vec![resource],
            frameworks: frameworks_for(entry.resource_type),
            reporting_required: false,
        });
    }

    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActorContext, AuditRecord};

    fn entry(action: AuditAction, resource_type: ResourceType) -> AuditLogEntry {
        let record = AuditRecord::new(
            &ActorContext::new("bob", "investigator"),
            action,
            resource_type,
            "r-1",
            "test",
        );
        AuditLogEntry::unsigned("audit_x".into(), 1, 10, record)
    }

    #[test]
    fn pii_read_is_data_access() {
        let drafts = derive_events(&entry(AuditAction::Read, ResourceType::Pii));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].event_type, ComplianceEventType::DataAccess);
        assert!(!drafts[0].reporting_required);
    }

    #[test]
    fn document_read_derives_nothing() {
        assert!(derive_events(&entry(AuditAction::Read, ResourceType::Document)).is_empty());
    }

    #[test]
    fn failed_decrypt_with_tag_failure_is_critical() {
        let mut e = entry(AuditAction::Decrypt, ResourceType::Evidence);
        e.success = false;
        e.error_code = Some(ErrorKind::IntegrityViolation.code().to_string());
        let drafts = derive_events(&e);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].event_type, ComplianceEventType::SecurityIncident);
        assert_eq!(drafts[0].severity, Severity::Critical);
        assert!(drafts[0].reporting_required);
    }

    #[test]
    fn failed_rotate_is_high_incident() {
        let mut e = entry(AuditAction::Rotate, ResourceType::MasterKey);
        e.success = false;
        e.error_code = Some(ErrorKind::KeyNotFound.code().to_string());
        let drafts = derive_events(&e);
        assert_eq!(drafts[0].severity, Severity::High);
    }

    #[test]
    fn pii_delete_is_data_deletion() {
        let drafts = derive_events(&entry(AuditAction::Delete, ResourceType::Pii));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].event_type, ComplianceEventType::DataDeletion);
    }
}

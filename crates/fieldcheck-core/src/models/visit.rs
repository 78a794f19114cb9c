use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::{OwnedResource, ResourceScope};

/// Visit state. Unknown values from the backend are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VisitStatus {
    #[default]
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Other(String),
}

impl From<String> for VisitStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "scheduled" => VisitStatus::Scheduled,
            "in_progress" => VisitStatus::InProgress,
            "completed" => VisitStatus::Completed,
            "cancelled" | "canceled" => VisitStatus::Cancelled,
            _ => VisitStatus::Other(s),
        }
    }
}

impl From<VisitStatus> for String {
    fn from(status: VisitStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitStatus::Scheduled => write!(f, "scheduled"),
            VisitStatus::InProgress => write!(f, "in_progress"),
            VisitStatus::Completed => write!(f, "completed"),
            VisitStatus::Cancelled => write!(f, "cancelled"),
            VisitStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub label: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub id: String,
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    /// Consultant's personal notes about the customer.
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub consultant_id: Option<String>,
    #[serde(default)]
    pub filial: Option<String>,
    #[serde(default)]
    pub status: VisitStatus,
    #[serde(default)]
    pub visited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
}

crate::maskable!(Visit {
    customer_email,
    customer_phone,
    notes,
});

impl OwnedResource for Visit {
    fn scope(&self) -> ResourceScope {
        ResourceScope {
            owner_id: self.consultant_id.clone(),
            filial: self.filial.clone(),
        }
    }
}

impl Visit {
    /// (done, total) checklist items
    pub fn checklist_progress(&self) -> (usize, usize) {
        let done = self.checklist.iter().filter(|i| i.done).count();
        (done, self.checklist.len())
    }

    pub fn is_checklist_complete(&self) -> bool {
        self.checklist.iter().all(|i| i.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_visit_row() {
        let json = r#"{"id":"v1","customer_name":"Padaria Central","customer_email":"contato@padaria.com","customer_phone":"11 5555-0101","notes":"prefers mornings","consultant_id":"u1","filial":"SP","status":"in_progress","visited_at":"2026-03-02T13:00:00Z","checklist":[{"label":"Showcase","done":true},{"label":"Price list"}]}"#;
        let visit: Visit = serde_json::from_str(json).unwrap();
        assert_eq!(visit.status, VisitStatus::InProgress);
        assert_eq!(visit.checklist_progress(), (1, 2));
        assert!(!visit.is_checklist_complete());
        assert_eq!(visit.scope().owner_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_unknown_status_preserved() {
        let visit: Visit = serde_json::from_str(r#"{"id":"v2","customer_name":"X","status":"rescheduled"}"#).unwrap();
        assert_eq!(visit.status, VisitStatus::Other("rescheduled".into()));
        assert_eq!(serde_json::to_value(&visit.status).unwrap(), "rescheduled");
        assert!(visit.is_checklist_complete());
    }
}

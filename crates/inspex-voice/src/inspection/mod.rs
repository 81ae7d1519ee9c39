//! Inspection tool pack.
//!
//! The model drives an inspection through four tools: `run_inspection`
//! captures a photo and sends it to the vision backend, `edit_findings`
//! lets the inspector correct what came back, and `report_anomalies` /
//! `order_parts` submit the (possibly edited) result. The full result of
//! the latest inspection lives in a [`FindingsStore`]; the model only ever
//! sees a short spoken summary of it.

mod backend;
mod tools;

pub use backend::{
    AnomalyReport, FilePhotoSource, HttpInspectionBackend, InspectionBackend, InspectionRequest,
    PartOrderLine, PartsOrder, PhotoSource,
};
pub use tools::{
    register_inspection_tools, EditFindingsTool, OrderPartsTool, ReportAnomaliesTool,
    RunInspectionTool,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

const MAX_SPOKEN_FINDINGS: usize = 5;
const MAX_SPOKEN_PARTS: usize = 3;
const MAX_IMPACT_CHARS: usize = 120;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One finding from the vision backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    /// fail, monitor, normal or pass
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A replacement part suggested for a finding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartNeed {
    #[serde(default)]
    pub part_name: Option<String>,
    #[serde(default)]
    pub component_tag: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Full inspection result as returned by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionResult {
    #[serde(default)]
    pub overall_status: Option<String>,
    #[serde(default)]
    pub component_identified: Option<String>,
    #[serde(default)]
    pub operational_impact: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub anomalies: Vec<Anomaly>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parts: Vec<PartNeed>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InspectionResult {
    /// Numbered one-line findings, `"#1 fail: cracked weld"`.
    pub fn numbered_findings(&self) -> Vec<String> {
        self.anomalies
            .iter()
            .enumerate()
            .map(|(i, a)| {
                format!(
                    "#{} {}: {}",
                    i + 1,
                    a.severity.as_deref().unwrap_or("?"),
                    a.issue.as_deref().unwrap_or("?")
                )
            })
            .collect()
    }

    /// Drop parts whose component no longer has a matching finding.
    /// Returns the number of parts removed.
    pub fn refresh_parts(&mut self) -> usize {
        let components: HashSet<&str> = self
            .anomalies
            .iter()
            .map(|a| a.component.as_deref().unwrap_or(""))
            .collect();
        let before = self.parts.len();
        let kept: Vec<PartNeed> = self
            .parts
            .iter()
            .filter(|p| components.contains(p.component_tag.as_deref().unwrap_or("")))
            .cloned()
            .collect();
        self.parts = kept;
        before - self.parts.len()
    }
}

/// Cut a full result down to what the model should read out.
pub fn trim_for_speech(result: &InspectionResult) -> Value {
    let findings: Vec<String> = result
        .anomalies
        .iter()
        .take(MAX_SPOKEN_FINDINGS)
        .enumerate()
        .map(|(i, a)| {
            format!(
                "#{} {}: {}",
                i + 1,
                a.severity.as_deref().unwrap_or("?"),
                a.issue.as_deref().unwrap_or("unknown issue")
            )
        })
        .collect();

    let parts: Vec<&str> = result
        .parts
        .iter()
        .take(MAX_SPOKEN_PARTS)
        .map(|p| p.part_name.as_deref().unwrap_or("part"))
        .collect();

    let impact: String = result
        .operational_impact
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(MAX_IMPACT_CHARS)
        .collect();

    json!({
        "status": result.overall_status.as_deref().unwrap_or("unknown"),
        "component": result.component_identified.as_deref().unwrap_or("unknown"),
        "impact": impact,
        "findings": findings,
        "parts_needed": parts,
    })
}

/// How a finding is edited
#[derive(Debug, Clone, PartialEq)]
pub enum FindingEdit {
    Remove,
    Update {
        issue: Option<String>,
        severity: Option<String>,
        description: Option<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EditError {
    #[error("No inspection results to edit. Run an inspection first.")]
    NoInspection,
    #[error("Finding #{number} does not exist. There are {count} findings.")]
    NoSuchFinding { number: i64, count: usize },
}

/// The most recent completed inspection, shared by the tools that read or
/// mutate it. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct FindingsStore {
    inner: Arc<Mutex<Option<InspectionResult>>>,
}

impl FindingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<InspectionResult>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, result: InspectionResult) {
        *self.lock() = Some(result);
    }

    pub fn snapshot(&self) -> Option<InspectionResult> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// Apply an edit to the 1-based `number`th finding in place.
    pub fn edit(&self, number: i64, edit: FindingEdit) -> Result<Value, EditError> {
        let mut guard = self.lock();
        let result = guard.as_mut().ok_or(EditError::NoInspection)?;

        let count = result.anomalies.len();
        if number < 1 || number as usize > count {
            return Err(EditError::NoSuchFinding { number, count });
        }
        let idx = (number - 1) as usize;

        match edit {
            FindingEdit::Remove => {
                let removed = result.anomalies.remove(idx);
                let dropped_parts = result.refresh_parts();
                info!(finding = number, dropped_parts, "✂️ Finding removed");
                Ok(json!({
                    "status": "removed",
                    "removed": removed.issue.unwrap_or_default(),
                    "remaining_findings": result.numbered_findings(),
                }))
            }
            FindingEdit::Update {
                issue,
                severity,
                description,
            } => {
                let finding = &mut result.anomalies[idx];
                let mut changes = Vec::new();
                if let Some(new) = issue.filter(|s| !s.is_empty()) {
                    let old = finding.issue.replace(new.clone()).unwrap_or_default();
                    changes.push(format!("issue: '{old}' -> '{new}'"));
                }
                if let Some(new) = severity.filter(|s| !s.is_empty()) {
                    let old = finding.severity.replace(new.clone()).unwrap_or_default();
                    changes.push(format!("severity: '{old}' -> '{new}'"));
                }
                if let Some(new) = description.filter(|s| !s.is_empty()) {
                    finding.description = Some(new);
                    changes.push("description updated".to_string());
                }
                let dropped_parts = result.refresh_parts();
                info!(finding = number, dropped_parts, "✏️ Finding updated: {}", changes.join(", "));
                Ok(json!({
                    "status": "updated",
                    "changes": changes,
                    "updated_findings": result.numbered_findings(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InspectionResult {
        serde_json::from_value(json!({
            "overall_status": "fail",
            "component_identified": "rim",
            "operational_impact": "x".repeat(300),
            "anomalies": [
                {"component": "rim", "issue": "severe rim corrosion", "severity": "fail"},
                {"component": "lug", "issue": "missing lug nut", "severity": "monitor"},
                {"component": "tire", "issue": "sidewall cut", "severity": "monitor"},
                {"component": "rim", "issue": "bent flange", "severity": "fail"},
                {"component": "hub", "issue": "grease leak", "severity": "normal"},
                {"component": "hub", "issue": "paint wear", "severity": "pass"}
            ],
            "parts": [
                {"part_name": "Rim assembly", "component_tag": "rim"},
                {"part_name": "Lug nut", "component_tag": "lug", "quantity": 4},
                {"part_name": "Hub seal", "component_tag": "hub"},
                {"part_name": "Tire", "component_tag": "tire"}
            ],
            "confidence": 0.82
        }))
        .unwrap()
    }

    #[test]
    fn test_trim_limits_and_numbering() {
        let trimmed = trim_for_speech(&sample());
        assert_eq!(trimmed["status"], "fail");
        assert_eq!(trimmed["component"], "rim");
        assert_eq!(trimmed["impact"].as_str().unwrap().len(), 120);
        let findings = trimmed["findings"].as_array().unwrap();
        assert_eq!(findings.len(), 5);
        assert_eq!(findings[0], "#1 fail: severe rim corrosion");
        assert_eq!(trimmed["parts_needed"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_null_lists_and_unknown_fields() {
        let r: InspectionResult =
            serde_json::from_value(json!({"overall_status": "pass", "anomalies": null, "parts": null}))
                .unwrap();
        assert!(r.anomalies.is_empty());
        assert_eq!(sample().extra["confidence"], 0.82);
        assert_eq!(trim_for_speech(&r)["component"], "unknown");
    }

    #[test]
    fn test_remove_refreshes_parts() {
        let store = FindingsStore::new();
        store.replace(sample());
        let out = store.edit(2, FindingEdit::Remove).unwrap();
        assert_eq!(out["status"], "removed");
        assert_eq!(out["removed"], "missing lug nut");

        let after = store.snapshot().unwrap();
        assert_eq!(after.anomalies.len(), 5);
        let names: Vec<_> = after.parts.iter().filter_map(|p| p.part_name.clone()).collect();
        assert_eq!(names, vec!["Rim assembly", "Hub seal", "Tire"]);
    }

    #[test]
    fn test_update_changes_fields() {
        let store = FindingsStore::new();
        store.replace(sample());
        let out = store
            .edit(
                1,
                FindingEdit::Update {
                    issue: Some("surface scratch".to_string()),
                    severity: Some("monitor".to_string()),
                    description: None,
                },
            )
            .unwrap();
        assert_eq!(out["changes"].as_array().unwrap().len(), 2);
        assert_eq!(out["updated_findings"][0], "#1 monitor: surface scratch");
    }

    #[test]
    fn test_edit_errors() {
        let store = FindingsStore::new();
        assert_eq!(store.edit(1, FindingEdit::Remove), Err(EditError::NoInspection));
        store.replace(sample());
        assert_eq!(
            store.edit(7, FindingEdit::Remove),
            Err(EditError::NoSuchFinding { number: 7, count: 6 })
        );
        assert!(store.edit(0, FindingEdit::Remove).is_err());
    }
}

//! The inspection tools as [`LiveTool`]s.

use super::backend::{AnomalyReport, InspectionBackend, InspectionRequest, PartOrderLine, PartsOrder, PhotoSource};
use super::{trim_for_speech, FindingEdit, FindingsStore};
use crate::config::EquipmentContext;
use crate::tools::{LiveTool, ToolCallDispatcher, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const NO_INSPECTION: &str = "No inspection results available. Run an inspection first.";

fn confirmed(args: &Value) -> bool {
    args.get("confirmed").and_then(Value::as_bool).unwrap_or(false)
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Register all four inspection tools against one shared findings store.
pub fn register_inspection_tools(
    dispatcher: &mut ToolCallDispatcher,
    photos: Arc<dyn PhotoSource>,
    backend: Arc<dyn InspectionBackend>,
    store: FindingsStore,
    equipment: EquipmentContext,
) {
    dispatcher.register(Arc::new(RunInspectionTool {
        photos,
        backend: backend.clone(),
        store: store.clone(),
        equipment: equipment.clone(),
    }));
    dispatcher.register(Arc::new(ReportAnomaliesTool {
        backend: backend.clone(),
        store: store.clone(),
        equipment: equipment.clone(),
    }));
    dispatcher.register(Arc::new(EditFindingsTool { store: store.clone() }));
    dispatcher.register(Arc::new(OrderPartsTool {
        backend,
        store,
        equipment,
    }));
}

/// Capture a photo and run the vision inspection on it
pub struct RunInspectionTool {
    pub photos: Arc<dyn PhotoSource>,
    pub backend: Arc<dyn InspectionBackend>,
    pub store: FindingsStore,
    pub equipment: EquipmentContext,
}

#[async_trait]
impl LiveTool for RunInspectionTool {
    fn name(&self) -> &str {
        "run_inspection"
    }

    fn description(&self) -> &str {
        "Run an AI inspection on a CAT equipment component. \
         Call this when the user describes damage or asks to inspect something."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "voice_text": {
                    "type": "STRING",
                    "description": "What the inspector said about the damage"
                },
                "equipment_id": {
                    "type": "STRING",
                    "description": "Equipment ID e.g. CAT-320-002"
                }
            },
            "required": ["voice_text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let voice_text = string_arg(&args, "voice_text").unwrap_or_default();
        let equipment_id = string_arg(&args, "equipment_id")
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.equipment.equipment_id.clone());

        let image = self.photos.capture().await?;
        let result = self
            .backend
            .inspect(InspectionRequest {
                image,
                voice_text,
                equipment_id,
                equipment_model: self.equipment.equipment_model.clone(),
            })
            .await?;

        info!(
            status = result.overall_status.as_deref().unwrap_or("unknown"),
            anomalies = result.anomalies.len(),
            parts = result.parts.len(),
            "🔍 Inspection complete"
        );
        let spoken = trim_for_speech(&result);
        self.store.replace(result);
        Ok(spoken)
    }
}

/// Save the current findings to the task
pub struct ReportAnomaliesTool {
    pub backend: Arc<dyn InspectionBackend>,
    pub store: FindingsStore,
    pub equipment: EquipmentContext,
}

#[async_trait]
impl LiveTool for ReportAnomaliesTool {
    fn name(&self) -> &str {
        "report_anomalies"
    }

    fn description(&self) -> &str {
        "Save the inspection findings (anomalies) to the task database. \
         Call this AFTER run_inspection when the inspector confirms they want to report the findings."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "confirmed": {
                    "type": "BOOLEAN",
                    "description": "True if the inspector confirmed reporting"
                }
            },
            "required": ["confirmed"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        if !confirmed(&args) {
            return Ok(json!({"status": "skipped", "message": "Inspector declined to report"}));
        }
        let result = self
            .store
            .snapshot()
            .ok_or_else(|| ToolError::Precondition(NO_INSPECTION.to_string()))?;

        let report = AnomalyReport {
            task_id: self.equipment.task_id,
            inspection_id: self.equipment.inspection_id,
            overall_status: result.overall_status.unwrap_or_else(|| "monitor".to_string()),
            operational_impact: result.operational_impact.unwrap_or_default(),
            anomalies: result.anomalies,
        };
        Ok(self.backend.report_anomalies(report).await?)
    }
}

/// Correct or remove a finding before it is reported
pub struct EditFindingsTool {
    pub store: FindingsStore,
}

#[async_trait]
impl LiveTool for EditFindingsTool {
    fn name(&self) -> &str {
        "edit_findings"
    }

    fn description(&self) -> &str {
        "Modify an inspection finding. Use when the inspector wants to correct, \
         change severity, or remove a finding. Call BEFORE report_anomalies."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "action": {
                    "type": "STRING",
                    "description": "'update' to change a finding, 'remove' to delete it"
                },
                "finding_number": {
                    "type": "INTEGER",
                    "description": "Which finding to edit (1, 2, 3, etc.)"
                },
                "new_issue": {"type": "STRING", "description": "New issue text (for update action)"},
                "new_severity": {
                    "type": "STRING",
                    "description": "New severity: fail, monitor, normal, or pass"
                },
                "new_description": {"type": "STRING", "description": "New description text (for update action)"}
            },
            "required": ["action", "finding_number"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        // the model sometimes sends numbers as floats or strings
        let number = match args.get("finding_number") {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ToolError::InvalidArguments("finding_number is required".to_string()))?;

        let action = string_arg(&args, "action").unwrap_or_else(|| "update".to_string());
        let edit = match action.as_str() {
            "remove" => FindingEdit::Remove,
            "update" => FindingEdit::Update {
                issue: string_arg(&args, "new_issue"),
                severity: string_arg(&args, "new_severity"),
                description: string_arg(&args, "new_description"),
            },
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "Unknown action: {other}. Use 'update' or 'remove'."
                )))
            }
        };

        self.store
            .edit(number, edit)
            .map_err(|e| ToolError::Precondition(e.to_string()))
    }
}

/// Order the replacement parts for the current findings
pub struct OrderPartsTool {
    pub backend: Arc<dyn InspectionBackend>,
    pub store: FindingsStore,
    pub equipment: EquipmentContext,
}

#[async_trait]
impl LiveTool for OrderPartsTool {
    fn name(&self) -> &str {
        "order_parts"
    }

    fn description(&self) -> &str {
        "Check inventory and order replacement parts for the inspection. \
         Call this AFTER report_anomalies when the inspector confirms they want to order parts."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "confirmed": {
                    "type": "BOOLEAN",
                    "description": "True if the inspector confirmed ordering parts"
                }
            },
            "required": ["confirmed"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        if !confirmed(&args) {
            return Ok(json!({"status": "skipped", "message": "Inspector declined to order parts"}));
        }
        let result = self
            .store
            .snapshot()
            .ok_or_else(|| ToolError::Precondition(NO_INSPECTION.to_string()))?;

        let parts = result
            .parts
            .into_iter()
            .map(|p| PartOrderLine {
                part_name: p.part_name.unwrap_or_default(),
                component_tag: p.component_tag.unwrap_or_default(),
                quantity: p.quantity.unwrap_or(1),
                urgency: p.urgency.unwrap_or_else(|| "monitor".to_string()),
            })
            .collect();

        let order = PartsOrder {
            inspection_id: self.equipment.inspection_id,
            parts,
        };
        Ok(self.backend.order_parts(order).await?)
    }
}

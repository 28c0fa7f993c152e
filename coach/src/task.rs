use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    Help,
    FullFeedback,
    PreloadVision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Table,
    LineGraph,
    BarChart,
    PieChart,
    Flowchart,
    Maps,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::Table,
        TaskType::LineGraph,
        TaskType::BarChart,
        TaskType::PieChart,
        TaskType::Flowchart,
        TaskType::Maps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Table => "table",
            TaskType::LineGraph => "line-graph",
            TaskType::BarChart => "bar-chart",
            TaskType::PieChart => "pie-chart",
            TaskType::Flowchart => "flowchart",
            TaskType::Maps => "maps",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|task| task.as_str() == value)
    }

    pub fn is_chart(self) -> bool {
        matches!(
            self,
            TaskType::LineGraph | TaskType::BarChart | TaskType::PieChart
        )
    }

    pub fn is_diagram(self) -> bool {
        matches!(self, TaskType::Flowchart | TaskType::Maps)
    }

    /// Folder holding sample visuals and cached analyses for this task type.
    pub fn folder(self) -> String {
        format!("/{}", self.as_str())
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Submit,
    Poll,
    SubmitAscii,
}

/// Inbound request body shared by every handler flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub request_type: Option<RequestType>,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default, rename = "job_id")]
    pub job_id: Option<String>,
}

impl TaskRequest {
    pub fn new(request_type: RequestType, task_type: TaskType, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            request_type: Some(request_type),
            task_type: Some(task_type),
            ..Self::default()
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_names() {
        let request: TaskRequest = serde_json::from_value(json!({
            "content": "Sales rose",
            "requestType": "full-feedback",
            "taskType": "bar-chart",
            "phase": "submit-ascii",
            "job_id": "job_1_ab"
        }))
        .unwrap();
        assert_eq!(request.request_type, Some(RequestType::FullFeedback));
        assert_eq!(request.task_type, Some(TaskType::BarChart));
        assert_eq!(request.phase, Some(Phase::SubmitAscii));
        assert_eq!(request.job_id.as_deref(), Some("job_1_ab"));
    }

    #[test]
    fn rejects_unknown_task_type() {
        let result = serde_json::from_value::<TaskRequest>(json!({
            "content": "x",
            "requestType": "help",
            "taskType": "scatter-plot"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn classifies_task_types() {
        assert!(TaskType::PieChart.is_chart());
        assert!(!TaskType::Table.is_chart());
        assert!(TaskType::Maps.is_diagram());
        assert_eq!(TaskType::parse("line-graph"), Some(TaskType::LineGraph));
        assert_eq!(TaskType::Flowchart.folder(), "/flowchart");
    }
}

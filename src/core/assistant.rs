//! Request and response payloads exchanged with the AI assistant service.
//!
//! Nothing here talks to the service; callers serialize these with
//! `serde_json` and send them however they like.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseContext {
    pub course_name: String,
    pub section_name: String,
    pub section_description: String,
    pub exercise_code: String,
    pub exercise_instructions: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub execution_error: Option<String>,
}

/// Static description of the exercise an editor is mounted on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExerciseInfo {
    pub course_name: String,
    pub section_name: String,
    pub section_description: String,
    pub exercise_instructions: String,
}

impl CourseContext {
    pub fn new(exercise: &ExerciseInfo, code: &str, execution_error: Option<String>) -> Self {
        Self {
            course_name: exercise.course_name.clone(),
            section_name: exercise.section_name.clone(),
            section_description: exercise.section_description.clone(),
            exercise_code: code.to_string(),
            exercise_instructions: exercise.exercise_instructions.clone(),
            execution_error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            sender,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub context: Option<CourseContext>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conversation_history: Vec<ChatMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub response: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Debug,
    Optimize,
    Explain,
    #[default]
    General,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAnalysisRequest {
    pub code: String,
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
}

impl CodeAnalysisRequest {
    /// `None` for empty or whitespace-only code; there is nothing to analyze.
    pub fn from_code(code: &str, analysis_type: AnalysisType) -> Option<Self> {
        if code.trim().is_empty() {
            return None;
        }
        Some(Self {
            code: code.to_string(),
            analysis_type,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAnalysisResponse {
    pub analysis: String,
    pub code: String,
    #[serde(rename = "type")]
    pub analysis_type: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// Keeps the running conversation so each request carries the history.
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    history: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the next request and records the learner's message.
    pub fn ask(&mut self, message: impl Into<String>, context: Option<CourseContext>) -> AssistantRequest {
        let message = message.into();
        let request = AssistantRequest {
            message: message.clone(),
            context,
            conversation_history: self.history.clone(),
        };
        self.history.push(ChatMessage::new(Sender::User, message));
        request
    }

    /// Records the assistant's answer, or its error text when the call failed.
    pub fn record(&mut self, response: &AssistantResponse) {
        let content = match (&response.error, response.success) {
            (Some(error), false) => error.clone(),
            _ => response.response.clone(),
        };
        self.history.push(ChatMessage::new(Sender::Ai, content));
    }

    /// Records a code analysis as an assistant message.
    pub fn record_analysis(&mut self, response: &CodeAnalysisResponse) {
        let content = match (&response.error, response.success) {
            (Some(error), false) => error.clone(),
            _ => response.analysis.clone(),
        };
        self.history.push(ChatMessage::new(Sender::Ai, content));
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn exercise() -> ExerciseInfo {
        ExerciseInfo {
            course_name: "Python 101".to_string(),
            section_name: "Loops".to_string(),
            section_description: "for and while".to_string(),
            exercise_instructions: "Print 1 to 3".to_string(),
        }
    }

    #[test]
    fn test_course_context_is_camel_case() {
        let context = CourseContext::new(
            &exercise(),
            "for i in range(3): print(i)",
            Some("NameError: name 'x' is not defined".to_string()),
        );

        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!({
                "courseName": "Python 101",
                "sectionName": "Loops",
                "sectionDescription": "for and while",
                "exerciseCode": "for i in range(3): print(i)",
                "exerciseInstructions": "Print 1 to 3",
                "executionError": "NameError: name 'x' is not defined",
            })
        );
    }

    #[test]
    fn test_missing_execution_error_is_omitted() {
        let context = CourseContext::new(&exercise(), "", None);
        let value = serde_json::to_value(&context).unwrap();
        assert!(value.get("executionError").is_none());
    }

    #[test]
    fn test_analysis_request_requires_code() {
        assert!(CodeAnalysisRequest::from_code("  \n\t", AnalysisType::Debug).is_none());

        let request = CodeAnalysisRequest::from_code("print(1)", AnalysisType::Optimize).unwrap();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "code": "print(1)", "type": "optimize" })
        );
    }

    #[test]
    fn test_conversation_carries_history() {
        let mut conversation = Conversation::new();
        let first = conversation.ask("why does it fail?", None);
        assert!(first.conversation_history.is_empty());

        conversation.record(&AssistantResponse {
            response: "x is undefined".to_string(),
            success: true,
            error: None,
            provider: Some("test".to_string()),
        });
        let second = conversation.ask("how do I fix it?", None);

        assert_eq!(second.conversation_history.len(), 2);
        assert_eq!(second.conversation_history[0].sender, Sender::User);
        assert_eq!(second.conversation_history[1].content, "x is undefined");
        let value = serde_json::to_value(&second).unwrap();
        assert_eq!(value["conversationHistory"][1]["sender"], "ai");
        assert!(value.get("context").is_none());
    }

    #[test]
    fn test_responses_deserialize() {
        let response: CodeAnalysisResponse = serde_json::from_value(json!({
            "analysis": "looks fine",
            "code": "print(1)",
            "type": "explain",
            "success": true,
        }))
        .unwrap();

        assert!(response.success);
        assert_eq!(response.analysis_type, "explain");
        assert_eq!(response.error, None);

        let mut conversation = Conversation::new();
        conversation.record_analysis(&CodeAnalysisResponse {
            success: false,
            error: Some("provider down".to_string()),
            ..response
        });
        assert_eq!(conversation.history()[0].content, "provider down");
        assert_eq!(conversation.history()[0].sender, Sender::Ai);
    }
}

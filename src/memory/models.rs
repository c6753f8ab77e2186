use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::error::Error;

pub(crate) const MAX_LABEL_CHARS: usize = 200;
pub(crate) const MAX_FOLDER_CHARS: usize = 200;
pub(crate) const MAX_QUERY_LIMIT: u32 = 1000;
pub(crate) const DEFAULT_FOLDER: &str = "/";
pub(crate) const DEFAULT_QUERY_LIMIT: u32 = 10;
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 50;
pub(crate) const DEFAULT_PRUNE_AFTER_DAYS: u32 = 90;
pub(crate) const DEFAULT_PRUNE_IMPORTANCE: f64 = 3.0;

/// Confidence a label suggestion needs before `auto_label` applies it.
pub const DEFAULT_LABEL_CONFIDENCE: f64 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Pinned,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Pinned => "pinned",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Payload for storing a new conversation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewConversation {
    pub label: String,
    pub folder: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewConversation {
    pub fn new(label: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            label: label.into(),
            folder: DEFAULT_FOLDER.to_owned(),
            messages,
            metadata: None,
        }
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_label(&self.label)?;
        validate_folder(&self.folder)?;
        if self.messages.is_empty() {
            return Err(invalid("messages", "a conversation needs at least one message"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub label: String,
    pub folder: String,
    pub status: ConversationStatus,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Filters and paging for listing conversations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            label: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListQuery {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(label) = &self.label {
            validate_label(label)?;
        }
        if self.page == 0 {
            return Err(invalid("page", "page must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(invalid("page_size", "page_size must be at least 1"));
        }
        Ok(())
    }
}

/// Semantic query used to assemble context from stored conversations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextQuery {
    pub query: String,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

impl ContextQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_QUERY_LIMIT,
            filters: None,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn filters(mut self, filters: Value) -> Self {
        self.filters = Some(filters);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(invalid("query", "query must not be empty"));
        }
        if !(1..=MAX_QUERY_LIMIT).contains(&self.limit) {
            return Err(invalid(
                "limit",
                format!("limit must be between 1 and {MAX_QUERY_LIMIT}, got {}", self.limit),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub conversation_id: String,
    pub message_id: String,
    pub score: f64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub label: String,
    pub folder: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Markdown,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ExportRequest {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            label: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match &self.label {
            Some(label) => validate_label(label),
            None => Ok(()),
        }
    }
}

/// One conversation as emitted by the streaming export, one per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    #[serde(alias = "id")]
    pub conversation_id: String,
    pub label: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
    #[serde(default)]
    pub checks: BTreeMap<String, Value>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}

/// Message importance on a 1 to 10 scale, as judged by the service's model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportanceScore {
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub model: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLevel {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl SummaryLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub level: SummaryLevel,
    pub model: String,
    pub tokens_used: u64,
}

/// Selects stale, low-importance conversations as pruning candidates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PruningQuery {
    pub threshold_days: u32,
    pub importance_threshold: f64,
}

impl Default for PruningQuery {
    fn default() -> Self {
        Self {
            threshold_days: DEFAULT_PRUNE_AFTER_DAYS,
            importance_threshold: DEFAULT_PRUNE_IMPORTANCE,
        }
    }
}

impl PruningQuery {
    pub fn threshold_days(mut self, threshold_days: u32) -> Self {
        self.threshold_days = threshold_days;
        self
    }

    pub fn importance_threshold(mut self, importance_threshold: f64) -> Self {
        self.importance_threshold = importance_threshold;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.threshold_days == 0 {
            return Err(invalid("threshold_days", "threshold_days must be at least 1"));
        }
        if !(1.0..=10.0).contains(&self.importance_threshold) {
            return Err(invalid(
                "importance_threshold",
                format!(
                    "importance_threshold must be between 1 and 10, got {}",
                    self.importance_threshold
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruningRecommendation {
    Keep,
    Archive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PruningSuggestion {
    pub conversation_id: String,
    pub conversation_label: String,
    pub last_accessed: DateTime<Utc>,
    pub message_count: u64,
    pub token_estimate: u64,
    pub importance_score: f64,
    pub preview: String,
    pub recommendation: PruningRecommendation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelSuggestion {
    pub label: String,
    pub confidence: f64,
    pub is_existing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub(crate) fn validate_confidence(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(invalid(
            "threshold",
            format!("threshold must be between 0 and 1, got {threshold}"),
        ));
    }
    Ok(())
}

/// The first suggestion, in service order, confident enough to apply.
pub(crate) fn first_confident(
    suggestions: &[LabelSuggestion],
    threshold: f64,
) -> Option<&LabelSuggestion> {
    suggestions
        .iter()
        .find(|suggestion| suggestion.confidence >= threshold)
}

#[derive(Serialize)]
pub(crate) struct LabelUpdate<'a> {
    pub(crate) label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) folder: Option<&'a str>,
}

#[derive(Serialize)]
pub(crate) struct StatusUpdate {
    pub(crate) status: ConversationStatus,
}

#[derive(Deserialize)]
pub(crate) struct ResultsEnvelope<T> {
    pub(crate) results: Vec<T>,
}

#[derive(Deserialize)]
pub(crate) struct ContentEnvelope {
    pub(crate) content: String,
}

fn default_folder() -> String {
    DEFAULT_FOLDER.to_owned()
}

fn invalid(field: &'static str, message: impl Into<String>) -> Error {
    Error::InvalidInput {
        field,
        message: message.into(),
    }
}

pub(crate) fn validate_label(label: &str) -> Result<()> {
    let chars = label.chars().count();
    if chars == 0 || chars > MAX_LABEL_CHARS {
        return Err(invalid(
            "label",
            format!("label must be 1 to {MAX_LABEL_CHARS} characters, got {chars}"),
        ));
    }
    Ok(())
}

pub(crate) fn validate_folder(folder: &str) -> Result<()> {
    let chars = folder.chars().count();
    if chars > MAX_FOLDER_CHARS {
        return Err(invalid(
            "folder",
            format!("folder must be at most {MAX_FOLDER_CHARS} characters, got {chars}"),
        ));
    }
    Ok(())
}

/// Ids become a single path segment, so separators are refused.
pub(crate) fn validate_id(field: &'static str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(invalid(field, format!("{field} must not be empty")));
    }
    if id
        .chars()
        .any(|ch| matches!(ch, '/' | '?' | '#' | '%') || ch.is_whitespace() || ch.is_control())
    {
        return Err(invalid(field, format!("{field} contains a reserved character: {id:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    fn field_of(error: Error) -> &'static str {
        match error {
            Error::InvalidInput { field, .. } => field,
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn new_conversation_defaults_to_root_folder() {
        let payload = NewConversation::new("work", vec![Message::user("hi")]);
        let encoded = serde_json::to_value(&payload).expect("serializable");
        assert_eq!(
            encoded,
            json!({
                "label": "work",
                "folder": "/",
                "messages": [{"role": "user", "content": "hi"}],
            })
        );
    }

    #[test]
    fn new_conversation_validation() {
        let ok = NewConversation::new("work", vec![Message::user("hi")]);
        assert!(ok.validate().is_ok());

        let empty_label = NewConversation::new("", vec![Message::user("hi")]);
        assert_eq!(field_of(empty_label.validate().expect_err("empty label")), "label");

        let long_label = NewConversation::new("x".repeat(201), vec![Message::user("hi")]);
        assert_eq!(field_of(long_label.validate().expect_err("long label")), "label");

        let at_limit = NewConversation::new("é".repeat(200), vec![Message::user("hi")]);
        assert!(at_limit.validate().is_ok());

        let long_folder =
            NewConversation::new("work", vec![Message::user("hi")]).folder("f".repeat(201));
        assert_eq!(field_of(long_folder.validate().expect_err("long folder")), "folder");

        let no_messages = NewConversation::new("work", Vec::new());
        let error = no_messages.validate().expect_err("no messages");
        assert_eq!(error.code(), ErrorCode::InvalidInput);
        assert_eq!(field_of(error), "messages");
    }

    #[test]
    fn context_query_limit_bounds() {
        assert!(ContextQuery::new("rust").validate().is_ok());
        assert!(ContextQuery::new("rust").limit(1000).validate().is_ok());
        assert_eq!(
            field_of(ContextQuery::new("rust").limit(0).validate().expect_err("zero")),
            "limit"
        );
        assert_eq!(
            field_of(ContextQuery::new("rust").limit(1001).validate().expect_err("too big")),
            "limit"
        );
        assert_eq!(
            field_of(ContextQuery::new("  ").validate().expect_err("blank")),
            "query"
        );
    }

    #[test]
    fn list_query_paging_must_be_positive() {
        assert!(ListQuery::default().validate().is_ok());
        assert_eq!(
            field_of(ListQuery::default().page(0).validate().expect_err("page 0")),
            "page"
        );
        assert_eq!(
            field_of(ListQuery::default().page_size(0).validate().expect_err("size 0")),
            "page_size"
        );
        let encoded = serde_urlencoded::to_string(ListQuery::default().label("work"))
            .expect("encodable");
        assert_eq!(encoded, "label=work&page=1&page_size=50");
    }

    #[test]
    fn ids_must_be_single_path_segments() {
        assert!(validate_id("id", "3f2b9c1e-1111-4222-8333-444455556666").is_ok());
        assert_eq!(field_of(validate_id("id", "").expect_err("empty")), "id");
        assert_eq!(field_of(validate_id("id", "a/b").expect_err("slash")), "id");
        assert_eq!(field_of(validate_id("message_id", "a b").expect_err("space")), "message_id");
    }

    #[test]
    fn conversation_decodes_service_payload() {
        let conversation: Conversation = serde_json::from_value(json!({
            "id": "c-1",
            "label": "work",
            "folder": "/projects",
            "status": "pinned",
            "message_count": 3,
            "created_at": "2026-01-02T03:04:05Z",
        }))
        .expect("valid conversation");
        assert_eq!(conversation.status, ConversationStatus::Pinned);
        assert_eq!(conversation.message_count, 3);
        assert_eq!(conversation.created_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn export_record_tolerates_sparse_lines() {
        let record: ExportRecord =
            serde_json::from_str(r#"{"id":"c-9","label":"notes"}"#).expect("sparse record");
        assert_eq!(record.conversation_id, "c-9");
        assert_eq!(record.folder, "/");
        assert!(record.messages.is_empty());
        assert!(record.created_at.is_none());
    }

    #[test]
    fn export_request_encodes_lowercase_format() {
        let encoded = serde_urlencoded::to_string(ExportRequest::new(ExportFormat::Json).label("work"))
            .expect("encodable");
        assert_eq!(encoded, "format=json&label=work");
        let encoded = serde_urlencoded::to_string(ExportRequest::default()).expect("encodable");
        assert_eq!(encoded, "format=markdown");
    }

    #[test]
    fn status_update_body_shape() {
        let body = serde_json::to_value(StatusUpdate {
            status: ConversationStatus::Archived,
        })
        .expect("serializable");
        assert_eq!(body, json!({"status": "archived"}));
    }

    #[test]
    fn pruning_query_defaults_and_bounds() {
        let encoded = serde_urlencoded::to_string(PruningQuery::default()).expect("encodable");
        assert_eq!(encoded, "threshold_days=90&importance_threshold=3.0");
        assert!(PruningQuery::default().validate().is_ok());
        assert_eq!(
            field_of(PruningQuery::default().threshold_days(0).validate().expect_err("zero days")),
            "threshold_days"
        );
        assert_eq!(
            field_of(
                PruningQuery::default()
                    .importance_threshold(11.0)
                    .validate()
                    .expect_err("above scale")
            ),
            "importance_threshold"
        );
        assert!(
            PruningQuery::default()
                .importance_threshold(f64::NAN)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn intelligence_payloads_decode() {
        let suggestion: PruningSuggestion = serde_json::from_value(json!({
            "conversation_id": "c-3",
            "conversation_label": "old notes",
            "last_accessed": "2025-11-02T08:00:00Z",
            "message_count": 12,
            "token_estimate": 2400,
            "importance_score": 2.5,
            "preview": "lunch plans",
            "recommendation": "archive",
        }))
        .expect("valid suggestion");
        assert_eq!(suggestion.recommendation, PruningRecommendation::Archive);

        let summary: SummaryResponse = serde_json::from_value(json!({
            "summary": "shipped the retry layer",
            "level": "weekly",
            "model": "llama3",
            "tokens_used": 512,
        }))
        .expect("valid summary");
        assert_eq!(summary.level, SummaryLevel::Weekly);

        let score: ImportanceScore =
            serde_json::from_value(json!({"score": 8.0, "model": "llama3"})).expect("valid score");
        assert!(score.reasoning.is_none());
    }

    #[test]
    fn first_confident_keeps_service_order() {
        let suggestion = |label: &str, confidence: f64| LabelSuggestion {
            label: label.to_owned(),
            confidence,
            is_existing: false,
            reason: None,
        };
        let suggestions = vec![
            suggestion("misc", 0.4),
            suggestion("work", 0.7),
            suggestion("projects", 0.95),
        ];
        assert_eq!(
            first_confident(&suggestions, DEFAULT_LABEL_CONFIDENCE).map(|s| s.label.as_str()),
            Some("work")
        );
        assert!(first_confident(&suggestions, 0.99).is_none());
        assert!(validate_confidence(1.5).is_err());
        assert!(validate_confidence(f64::NAN).is_err());
        assert!(validate_confidence(0.0).is_ok());
    }
}

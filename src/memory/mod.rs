//! Typed operations of the memory service.
//!
//! Every operation validates its input, builds a [`RequestDescriptor`] and
//! runs it through the shared core, so retries, rate limiting and pooling
//! apply exactly as for hand-built requests. Invalid input fails with
//! [`Error::InvalidInput`](crate::Error::InvalidInput) before any network
//! exchange.

mod models;

pub use self::models::{
    ContextQuery, Conversation, ConversationStatus, DEFAULT_LABEL_CONFIDENCE, ExportFormat,
    ExportRecord, ExportRequest, HealthStatus, ImportanceScore, LabelSuggestion, ListQuery, Message,
    MessageRole, NewConversation, PruningQuery, PruningRecommendation, PruningSuggestion,
    QueryResponse, QueryResult, SummaryLevel, SummaryResponse,
};

use self::models::{
    ContentEnvelope, LabelUpdate, ResultsEnvelope, StatusUpdate, first_confident,
    validate_confidence, validate_folder, validate_id, validate_label,
};
use crate::Result;
use crate::blocking::{BlockingClient, BlockingStream};
use crate::client::Client;
use crate::context::CallContext;
use crate::request::{RequestBuilder, RequestDescriptor};
use crate::stream::JsonRecords;

const CONVERSATIONS_PATH: &str = "/api/v1/conversations";
const SMART_QUERY_PATH: &str = "/api/v1/query/smart";
const EXPORT_PATH: &str = "/api/v1/export";
const EXPORT_STREAM_PATH: &str = "/api/v1/export/stream";
const MESSAGES_PATH: &str = "/api/v1/messages";
const PRUNE_SUGGESTIONS_PATH: &str = "/api/v1/prune/suggestions";
const HEALTH_PATH: &str = "/health";

fn conversation_path(id: &str) -> Result<String> {
    validate_id("id", id)?;
    Ok(format!("{CONVERSATIONS_PATH}/{id}"))
}

/// Builds the descriptors shared by the async and blocking clients.
#[derive(Clone, Debug, Default)]
struct Requests {
    context: Option<CallContext>,
}

impl Requests {
    fn finish(&self, builder: RequestBuilder) -> RequestDescriptor {
        match &self.context {
            Some(context) => builder.context(context.clone()).build(),
            None => builder.build(),
        }
    }

    fn create_conversation(
        &self,
        conversation: &NewConversation,
        idempotency_key: Option<&str>,
    ) -> Result<RequestDescriptor> {
        conversation.validate()?;
        let mut builder = RequestDescriptor::post(CONVERSATIONS_PATH).json(conversation)?;
        if let Some(key) = idempotency_key {
            builder = builder.idempotency_key(key)?;
        }
        Ok(self.finish(builder))
    }

    fn get_conversation(&self, id: &str) -> Result<RequestDescriptor> {
        Ok(self.finish(RequestDescriptor::get(conversation_path(id)?)))
    }

    fn list_conversations(&self, query: &ListQuery) -> Result<RequestDescriptor> {
        query.validate()?;
        Ok(self.finish(RequestDescriptor::get(CONVERSATIONS_PATH).query(query)?))
    }

    fn update_label(&self, id: &str, label: &str, folder: Option<&str>) -> Result<RequestDescriptor> {
        let path = format!("{}/label", conversation_path(id)?);
        validate_label(label)?;
        if let Some(folder) = folder {
            validate_folder(folder)?;
        }
        let builder = RequestDescriptor::put(path).json(&LabelUpdate { label, folder })?;
        Ok(self.finish(builder))
    }

    fn update_status(&self, id: &str, status: ConversationStatus) -> Result<RequestDescriptor> {
        let path = format!("{}/status", conversation_path(id)?);
        let builder = RequestDescriptor::put(path).json(&StatusUpdate { status })?;
        Ok(self.finish(builder))
    }

    fn delete_conversation(&self, id: &str) -> Result<RequestDescriptor> {
        Ok(self.finish(RequestDescriptor::delete(conversation_path(id)?)))
    }

    fn assemble_context(&self, query: &ContextQuery) -> Result<RequestDescriptor> {
        query.validate()?;
        let builder = RequestDescriptor::post(SMART_QUERY_PATH)
            .json(query)?
            .idempotent(true);
        Ok(self.finish(builder))
    }

    fn export(&self, request: &ExportRequest, path: &str) -> Result<RequestDescriptor> {
        request.validate()?;
        Ok(self.finish(RequestDescriptor::get(path).query(request)?))
    }

    fn health(&self) -> RequestDescriptor {
        self.finish(RequestDescriptor::get(HEALTH_PATH))
    }

    // Scoring and label suggestion only compute, so they are safe to replay.
    fn score_message_importance(&self, message_id: &str) -> Result<RequestDescriptor> {
        validate_id("message_id", message_id)?;
        let builder = RequestDescriptor::post(format!("{MESSAGES_PATH}/{message_id}/importance"))
            .idempotent(true);
        Ok(self.finish(builder))
    }

    fn generate_summary(&self, id: &str, level: SummaryLevel) -> Result<RequestDescriptor> {
        let path = format!("{}/summary", conversation_path(id)?);
        let builder = RequestDescriptor::post(path).query_pair("level", level.as_str());
        Ok(self.finish(builder))
    }

    fn pruning_suggestions(&self, query: &PruningQuery) -> Result<RequestDescriptor> {
        query.validate()?;
        Ok(self.finish(RequestDescriptor::get(PRUNE_SUGGESTIONS_PATH).query(query)?))
    }

    fn suggest_labels(&self, id: &str) -> Result<RequestDescriptor> {
        let path = format!("{}/suggest-labels", conversation_path(id)?);
        Ok(self.finish(RequestDescriptor::post(path).idempotent(true)))
    }
}

fn results<T>(envelope: ResultsEnvelope<T>) -> Vec<T> {
    envelope.results
}

/// Async client for the memory service's conversation API.
#[derive(Clone, Debug)]
pub struct MemoryClient {
    client: Client,
    requests: Requests,
}

impl MemoryClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            requests: Requests::default(),
        }
    }

    /// A copy whose calls all run under `context`.
    pub fn with_context(&self, context: CallContext) -> Self {
        Self {
            client: self.client.clone(),
            requests: Requests {
                context: Some(context),
            },
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Stores a conversation. Not retried after an ambiguous failure; use
    /// [`create_conversation_with_key`](Self::create_conversation_with_key)
    /// for a replay-safe create.
    pub async fn create_conversation(&self, conversation: &NewConversation) -> Result<Conversation> {
        let descriptor = self.requests.create_conversation(conversation, None)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn create_conversation_with_key(
        &self,
        conversation: &NewConversation,
        idempotency_key: &str,
    ) -> Result<Conversation> {
        let descriptor = self
            .requests
            .create_conversation(conversation, Some(idempotency_key))?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let descriptor = self.requests.get_conversation(id)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn list_conversations(&self, query: &ListQuery) -> Result<Vec<Conversation>> {
        let descriptor = self.requests.list_conversations(query)?;
        self.client.execute_json(&descriptor).await.map(results)
    }

    pub async fn update_label(&self, id: &str, label: &str, folder: Option<&str>) -> Result<()> {
        let descriptor = self.requests.update_label(id, label, folder)?;
        self.client.execute(&descriptor).await.map(drop)
    }

    pub async fn pin(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.update_status(id, ConversationStatus::Pinned)?;
        self.client.execute(&descriptor).await.map(drop)
    }

    pub async fn archive(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.update_status(id, ConversationStatus::Archived)?;
        self.client.execute(&descriptor).await.map(drop)
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.delete_conversation(id)?;
        self.client.execute(&descriptor).await.map(drop)
    }

    pub async fn assemble_context(&self, query: &ContextQuery) -> Result<QueryResponse> {
        let descriptor = self.requests.assemble_context(query)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn export(&self, request: &ExportRequest) -> Result<String> {
        let descriptor = self.requests.export(request, EXPORT_PATH)?;
        let envelope: ContentEnvelope = self.client.execute_json(&descriptor).await?;
        Ok(envelope.content)
    }

    /// Streams the export one conversation at a time. Records are read from
    /// the connection only as the caller pulls them.
    pub async fn export_stream(&self, request: &ExportRequest) -> Result<JsonRecords<ExportRecord>> {
        let descriptor = self.requests.export(request, EXPORT_STREAM_PATH)?;
        Ok(self.client.stream(&descriptor).await?.json())
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        self.client.execute_json(&self.requests.health()).await
    }

    pub async fn score_message_importance(&self, message_id: &str) -> Result<ImportanceScore> {
        let descriptor = self.requests.score_message_importance(message_id)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn generate_summary(&self, id: &str, level: SummaryLevel) -> Result<SummaryResponse> {
        let descriptor = self.requests.generate_summary(id, level)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn get_pruning_suggestions(
        &self,
        query: &PruningQuery,
    ) -> Result<Vec<PruningSuggestion>> {
        let descriptor = self.requests.pruning_suggestions(query)?;
        self.client.execute_json(&descriptor).await
    }

    pub async fn suggest_labels(&self, id: &str) -> Result<Vec<LabelSuggestion>> {
        let descriptor = self.requests.suggest_labels(id)?;
        self.client.execute_json(&descriptor).await
    }

    /// Applies the first suggestion whose confidence reaches `threshold` and
    /// returns its label, or `None` when no suggestion qualifies.
    pub async fn auto_label(&self, id: &str, threshold: f64) -> Result<Option<String>> {
        validate_confidence(threshold)?;
        let suggestions = self.suggest_labels(id).await?;
        let Some(chosen) = first_confident(&suggestions, threshold) else {
            return Ok(None);
        };
        self.update_label(id, &chosen.label, None).await?;
        Ok(Some(chosen.label.clone()))
    }
}

/// Blocking counterpart of [`MemoryClient`].
#[derive(Clone, Debug)]
pub struct BlockingMemoryClient {
    client: BlockingClient,
    requests: Requests,
}

impl BlockingMemoryClient {
    pub fn new(client: BlockingClient) -> Self {
        Self {
            client,
            requests: Requests::default(),
        }
    }

    pub fn with_context(&self, context: CallContext) -> Self {
        Self {
            client: self.client.clone(),
            requests: Requests {
                context: Some(context),
            },
        }
    }

    pub fn client(&self) -> &BlockingClient {
        &self.client
    }

    pub fn create_conversation(&self, conversation: &NewConversation) -> Result<Conversation> {
        let descriptor = self.requests.create_conversation(conversation, None)?;
        self.client.execute_json(&descriptor)
    }

    pub fn create_conversation_with_key(
        &self,
        conversation: &NewConversation,
        idempotency_key: &str,
    ) -> Result<Conversation> {
        let descriptor = self
            .requests
            .create_conversation(conversation, Some(idempotency_key))?;
        self.client.execute_json(&descriptor)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let descriptor = self.requests.get_conversation(id)?;
        self.client.execute_json(&descriptor)
    }

    pub fn list_conversations(&self, query: &ListQuery) -> Result<Vec<Conversation>> {
        let descriptor = self.requests.list_conversations(query)?;
        self.client.execute_json(&descriptor).map(results)
    }

    pub fn update_label(&self, id: &str, label: &str, folder: Option<&str>) -> Result<()> {
        let descriptor = self.requests.update_label(id, label, folder)?;
        self.client.execute(&descriptor).map(drop)
    }

    pub fn pin(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.update_status(id, ConversationStatus::Pinned)?;
        self.client.execute(&descriptor).map(drop)
    }

    pub fn archive(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.update_status(id, ConversationStatus::Archived)?;
        self.client.execute(&descriptor).map(drop)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let descriptor = self.requests.delete_conversation(id)?;
        self.client.execute(&descriptor).map(drop)
    }

    pub fn assemble_context(&self, query: &ContextQuery) -> Result<QueryResponse> {
        let descriptor = self.requests.assemble_context(query)?;
        self.client.execute_json(&descriptor)
    }

    pub fn export(&self, request: &ExportRequest) -> Result<String> {
        let descriptor = self.requests.export(request, EXPORT_PATH)?;
        let envelope: ContentEnvelope = self.client.execute_json(&descriptor)?;
        Ok(envelope.content)
    }

    pub fn export_stream(
        &self,
        request: &ExportRequest,
    ) -> Result<BlockingStream<JsonRecords<ExportRecord>>> {
        let descriptor = self.requests.export(request, EXPORT_STREAM_PATH)?;
        Ok(self.client.stream(&descriptor)?.json())
    }

    pub fn health(&self) -> Result<HealthStatus> {
        self.client.execute_json(&self.requests.health())
    }

    pub fn score_message_importance(&self, message_id: &str) -> Result<ImportanceScore> {
        let descriptor = self.requests.score_message_importance(message_id)?;
        self.client.execute_json(&descriptor)
    }

    pub fn generate_summary(&self, id: &str, level: SummaryLevel) -> Result<SummaryResponse> {
        let descriptor = self.requests.generate_summary(id, level)?;
        self.client.execute_json(&descriptor)
    }

    pub fn get_pruning_suggestions(
        &self,
        query: &PruningQuery,
    ) -> Result<Vec<PruningSuggestion>> {
        let descriptor = self.requests.pruning_suggestions(query)?;
        self.client.execute_json(&descriptor)
    }

    pub fn suggest_labels(&self, id: &str) -> Result<Vec<LabelSuggestion>> {
        let descriptor = self.requests.suggest_labels(id)?;
        self.client.execute_json(&descriptor)
    }

    pub fn auto_label(&self, id: &str, threshold: f64) -> Result<Option<String>> {
        validate_confidence(threshold)?;
        let suggestions = self.suggest_labels(id)?;
        let Some(chosen) = first_confident(&suggestions, threshold) else {
            return Ok(None);
        };
        self.update_label(id, &chosen.label, None)?;
        Ok(Some(chosen.label.clone()))
    }
}

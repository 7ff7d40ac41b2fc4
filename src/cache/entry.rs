//! Cached context entries and their scoring metadata
//!
//! A [`CacheEntry`] is the indivisible unit of context shared with model
//! providers. Entries carry their token cost, an inline relevance score,
//! and a retention tier; the optimizer owns the entry table and everyone
//! else works on snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Create a new random entry ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an entry ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content classification for cached context
///
/// The type drives token-counting ratios and the type-expert scoring
/// component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    SystemPrompt,
    ClaudeMd,
    UserMessage,
    AssistantMessage,
    FileRead,
    FileWrite,
    ToolResult,
    BashOutput,
    SearchResult,
    ContextSummary,
    AgentState,
    MemorySnapshot,
    CompressedHistory,
    SemanticIndex,
    EmbeddingCache,
    Other,
}

impl EntryType {
    /// Approximate characters-per-token ratio for this content type
    ///
    /// Prose tokenizes close to 4 chars/token; code and structured tool
    /// output run denser.
    pub fn chars_per_token(&self) -> f32 {
        match self {
            EntryType::SystemPrompt
            | EntryType::ClaudeMd
            | EntryType::UserMessage
            | EntryType::AssistantMessage
            | EntryType::ContextSummary => 4.0,
            EntryType::FileRead
            | EntryType::FileWrite
            | EntryType::ToolResult
            | EntryType::BashOutput
            | EntryType::SearchResult
            | EntryType::SemanticIndex => 3.5,
            EntryType::AgentState
            | EntryType::MemorySnapshot
            | EntryType::CompressedHistory
            | EntryType::EmbeddingCache => 3.0,
            EntryType::Other => 4.0,
        }
    }

    /// Type-expert relevance bonus in [0, 1]
    pub fn expert_score(&self) -> f32 {
        match self {
            EntryType::SystemPrompt => 1.0,
            EntryType::ClaudeMd => 0.95,
            EntryType::UserMessage => 0.8,
            EntryType::AssistantMessage => 0.7,
            EntryType::ContextSummary => 0.75,
            EntryType::AgentState => 0.7,
            EntryType::FileRead | EntryType::FileWrite => 0.6,
            EntryType::ToolResult => 0.55,
            EntryType::SearchResult => 0.5,
            EntryType::BashOutput => 0.45,
            EntryType::MemorySnapshot => 0.5,
            EntryType::CompressedHistory => 0.4,
            EntryType::SemanticIndex | EntryType::EmbeddingCache => 0.35,
            EntryType::Other => 0.3,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryType::SystemPrompt => "system_prompt",
            EntryType::ClaudeMd => "claude_md",
            EntryType::UserMessage => "user_message",
            EntryType::AssistantMessage => "assistant_message",
            EntryType::FileRead => "file_read",
            EntryType::FileWrite => "file_write",
            EntryType::ToolResult => "tool_result",
            EntryType::BashOutput => "bash_output",
            EntryType::SearchResult => "search_result",
            EntryType::ContextSummary => "context_summary",
            EntryType::AgentState => "agent_state",
            EntryType::MemorySnapshot => "memory_snapshot",
            EntryType::CompressedHistory => "compressed_history",
            EntryType::SemanticIndex => "semantic_index",
            EntryType::EmbeddingCache => "embedding_cache",
            EntryType::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Retention tier: progression is monotonically colder except by explicit
/// promotion on access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    Archived,
}

impl Tier {
    /// Next colder tier, if any
    pub fn colder(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => Some(Tier::Archived),
            Tier::Archived => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// How a compressed payload was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Proportional head/tail elision at the target tier's ratio
    HeadTail,
}

/// Compressed form of an entry's content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedPayload {
    /// Elided content retained for the entry
    pub content: String,

    /// Token count before compression
    pub original_tokens: usize,

    /// Token count charged while compressed; always <= original_tokens
    pub compressed_tokens: usize,

    pub method: CompressionMethod,
}

/// Caller-supplied metadata attached at insertion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Origin of the content (hook, worker, tool)
    pub source: String,

    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub file_path: Option<String>,
    pub tool_name: Option<String>,
}

/// Per-component relevance breakdown, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub recency: f32,
    pub frequency: f32,
    pub semantic: f32,
    pub attention: f32,
    pub expert: f32,
}

/// Relevance score stored inline on the entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceScore {
    /// Weighted sum of the components, in [0, 1]
    pub overall: f32,

    pub components: ScoreComponents,
    pub scored_at: DateTime<Utc>,

    /// Fraction of components that contributed signal
    pub confidence: f32,
}

impl RelevanceScore {
    /// Initial score for a freshly inserted entry
    pub fn initial() -> Self {
        Self {
            overall: 1.0,
            components: ScoreComponents {
                recency: 1.0,
                frequency: 0.0,
                semantic: 0.0,
                attention: 0.0,
                expert: 0.0,
            },
            scored_at: Utc::now(),
            confidence: 0.2,
        }
    }
}

/// An indivisible unit of cached context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    // === Identity ===
    /// Unique identifier
    pub id: EntryId,

    /// Content classification
    pub entry_type: EntryType,

    // === Payload ===
    /// Raw content
    pub content: String,

    /// Token count of the raw content
    pub tokens: usize,

    /// Compressed form, present while stored at a compressing tier
    pub compressed: Option<CompressedPayload>,

    // === Metadata ===
    pub metadata: EntryMetadata,

    // === Scoring ===
    pub score: RelevanceScore,

    // === Lifecycle ===
    pub tier: Tier,
    pub access_count: u32,
    pub last_accessed_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Create a fresh hot entry with the initial score
    pub fn new(
        entry_type: EntryType,
        content: String,
        tokens: usize,
        metadata: EntryMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            entry_type,
            content,
            tokens,
            compressed: None,
            metadata,
            score: RelevanceScore::initial(),
            tier: Tier::Hot,
            access_count: 1,
            last_accessed_at: now,
            timestamp: now,
        }
    }

    /// Tokens currently charged against the context window
    pub fn effective_tokens(&self) -> usize {
        self.compressed
            .as_ref()
            .map(|c| c.compressed_tokens)
            .unwrap_or(self.tokens)
    }

    /// Seconds since the entry was last accessed
    pub fn idle_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_accessed_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_creation() {
        let id1 = EntryId::new();
        let id2 = EntryId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_expert_scores_ordered() {
        assert_eq!(EntryType::SystemPrompt.expert_score(), 1.0);
        assert_eq!(EntryType::Other.expert_score(), 0.3);
        assert!(EntryType::UserMessage.expert_score() > EntryType::BashOutput.expert_score());
    }

    #[test]
    fn test_tier_progression() {
        assert_eq!(Tier::Hot.colder(), Some(Tier::Warm));
        assert_eq!(Tier::Warm.colder(), Some(Tier::Cold));
        assert_eq!(Tier::Cold.colder(), Some(Tier::Archived));
        assert_eq!(Tier::Archived.colder(), None);
    }

    #[test]
    fn test_effective_tokens_prefers_compressed() {
        let mut entry = CacheEntry::new(
            EntryType::FileRead,
            "x".repeat(400),
            100,
            EntryMetadata::default(),
        );
        assert_eq!(entry.effective_tokens(), 100);

        entry.compressed = Some(CompressedPayload {
            content: "x".repeat(300),
            original_tokens: 100,
            compressed_tokens: 75,
            method: CompressionMethod::HeadTail,
        });
        assert_eq!(entry.effective_tokens(), 75);
    }

    #[test]
    fn test_entry_serde_roundtrip() {
        let entry = CacheEntry::new(
            EntryType::ToolResult,
            "grep output".to_string(),
            3,
            EntryMetadata {
                source: "hook".to_string(),
                tool_name: Some("Grep".to_string()),
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.tier, Tier::Hot);
        assert_eq!(back.access_count, 1);
    }
}

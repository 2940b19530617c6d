use serde::{Deserialize, Serialize};

/// Priority order for prompt injection: instruction > preference > fact >
/// context (higher = included first, same ordering the rendering side uses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Instruction,
    Preference,
    Fact,
    Context,
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instruction => write!(f, "instruction"),
            Self::Preference => write!(f, "preference"),
            Self::Fact => write!(f, "fact"),
            Self::Context => write!(f, "context"),
        }
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instruction" => Ok(Self::Instruction),
            "preference" => Ok(Self::Preference),
            "fact" => Ok(Self::Fact),
            "context" => Ok(Self::Context),
            other => Err(format!("unknown memory category: {other}")),
        }
    }
}

/// How the memory was acquired. Deciding *what* to learn from a
/// conversation is an external collaborator's job; this crate only stores
/// and retrieves whatever the caller already decided to learn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    UserSaid,
    Inferred,
    AdminSet,
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserSaid => write!(f, "user_said"),
            Self::Inferred => write!(f, "inferred"),
            Self::AdminSet => write!(f, "admin_set"),
        }
    }
}

impl std::str::FromStr for MemorySource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_said" => Ok(Self::UserSaid),
            "inferred" => Ok(Self::Inferred),
            "admin_set" => Ok(Self::AdminSet),
            other => Err(format!("unknown memory source: {other}")),
        }
    }
}

/// Single memory entry for a user (`data/memories.json` record shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub user_id: String,
    pub category: MemoryCategory,
    pub key: String,
    pub value: String,
    /// 0.0-1.0 confidence score. Higher confidence wins on upsert.
    pub confidence: f64,
    pub source: MemorySource,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Coarse usage stats the orchestrator can surface without pulling in the
/// full memory store's query surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryStats {
    pub user_id: String,
    pub total_memories: usize,
    pub by_category: std::collections::HashMap<String, usize>,
}

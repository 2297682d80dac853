use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Last continuation token (`thoughtSignature`) seen per conversation.
///
/// Entries live as long as the gateway instance and are overwritten, never
/// merged.
pub struct ContinuationStore {
    instance_id: String,
    signatures: DashMap<String, String>,
}

impl Default for ContinuationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationStore {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            signatures: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Key for a conversation; calls without one share the instance key
    pub fn conversation_key(&self, conversation_id: Option<&str>) -> String {
        match conversation_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.instance_id.clone(),
        }
    }

    /// Provider `sessionId` for a conversation
    pub fn session_id(&self, conversation_id: Option<&str>) -> String {
        match conversation_id.map(str::trim) {
            Some(id) if !id.is_empty() => format!("{}-{}", self.instance_id, id),
            _ => self.instance_id.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.signatures.get(key).map(|entry| entry.value().clone())
    }

    pub fn record(&self, key: &str, signature: &str) {
        if signature.is_empty() {
            return;
        }
        debug!(conversation = key, "recorded continuation token");
        self.signatures.insert(key.to_string(), signature.to_string());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub openapi_sha256: &'static str,
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        openapi_sha256: GENERATED_OPENAPI_SHA256,
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(path, sha256, body)| ContractSchemaManifest { path, sha256, body })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    AfterResponse,
    Periodic,
    NewConversation,
    BeforeNewChat,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        TriggerKind::AfterResponse,
        TriggerKind::Periodic,
        TriggerKind::NewConversation,
        TriggerKind::BeforeNewChat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::AfterResponse => "after_response",
            TriggerKind::Periodic => "periodic",
            TriggerKind::NewConversation => "new_conversation",
            TriggerKind::BeforeNewChat => "before_new_chat",
        }
    }
}

/// Advisory only: hosts render `high` as blocking and the rest as dismissible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriority {
    Low,
    Medium,
    High,
}

impl TriggerPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerPriority::Low => "low",
            TriggerPriority::Medium => "medium",
            TriggerPriority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Live counters reported by the chat view on every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConversationSignals {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub last_message_role: Option<MessageRole>,
    #[serde(default)]
    pub is_new_conversation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActiveTrigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub conversation_id: String,
    pub priority: TriggerPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FeedbackStats {
    pub total_feedbacks: u64,
    pub conversations_with_feedback: u64,
    pub avg_feedbacks_per_conversation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FeedbackLevelView {
    pub level: u8,
    pub name: String,
    pub next_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionStatsResponse {
    pub stats: FeedbackStats,
    pub level: FeedbackLevelView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TriggerResponse {
    pub active_trigger: Option<ActiveTrigger>,
}

/// Completion of a shown prompt. Rating, resolution and comment are recorded
/// in the decision journal only; forwarding them is the host's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompleteTriggerRequest {
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeforeNewChatRequest {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BeforeNewChatResponse {
    pub blocked: bool,
    pub active_trigger: Option<ActiveTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TriggerProfileView {
    pub after_every_n_responses: u64,
    pub periodic_check: u64,
    pub new_conversation_delay: u64,
    pub before_new_chat_threshold: u64,
    pub min_time_between_prompts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub openapi_sha256: String,
    pub contracts_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
    pub trigger_kinds: Vec<TriggerKind>,
    pub profile: TriggerProfileView,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::PathBuf;

    #[test]
    fn active_trigger_uses_type_field_and_omits_missing_message_id() {
        let trigger = ActiveTrigger {
            kind: TriggerKind::AfterResponse,
            conversation_id: "c1".to_string(),
            priority: TriggerPriority::Medium,
            message_id: None,
        };
        assert_eq!(
            serde_json::to_value(&trigger).unwrap(),
            json!({"type": "after_response", "conversation_id": "c1", "priority": "medium"})
        );
    }

    #[test]
    fn signals_default_missing_fields() {
        let signals: ConversationSignals =
            serde_json::from_value(json!({"conversation_id": "c1"})).unwrap();
        assert_eq!(signals.message_count, 0);
        assert_eq!(signals.last_message_role, None);
        assert!(!signals.is_new_conversation);
    }

    #[test]
    fn signals_reject_unknown_fields() {
        let err = serde_json::from_value::<ConversationSignals>(
            json!({"conversation_id": "c1", "messages": 3}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn trigger_kind_names_match_serde() {
        for kind in TriggerKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn manifest_embeds_every_schema() {
        let manifest = contracts_manifest_v1();
        assert_eq!(manifest.openapi_sha256.len(), 64);
        assert_eq!(manifest.contracts_set_sha256.len(), 64);
        assert!(manifest
            .schemas
            .iter()
            .any(|s| s.path == "../contracts/v1/active-trigger.schema.json"));
    }

    #[test]
    fn schema_files_are_valid_json_schema() {
        for entry in std::fs::read_dir(repo_path("contracts/v1")).unwrap() {
            let path = entry.unwrap().path();
            if !path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
            {
                continue;
            }
            let text = std::fs::read_to_string(&path).unwrap();
            let schema: Value = serde_json::from_str(&text).unwrap();
            let _validator = jsonschema::validator_for(&schema)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", path.display()));
        }
    }

    #[test]
    fn serialized_trigger_matches_its_schema() {
        let text = std::fs::read_to_string(repo_path("contracts/v1/active-trigger.schema.json"))
            .unwrap();
        let schema: Value = serde_json::from_str(&text).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let trigger = ActiveTrigger {
            kind: TriggerKind::NewConversation,
            conversation_id: "c2".to_string(),
            priority: TriggerPriority::High,
            message_id: Some("m1".to_string()),
        };
        assert!(validator.is_valid(&serde_json::to_value(&trigger).unwrap()));
    }

    #[test]
    fn openapi_ref_targets_exist() {
        let openapi_path = repo_path("openapi/v1.yaml");
        let openapi_text = std::fs::read_to_string(&openapi_path).unwrap();
        let openapi: serde_yaml::Value = serde_yaml::from_str(&openapi_text).unwrap();
        let schemas = openapi
            .get("components")
            .and_then(|v| v.get("schemas"))
            .and_then(|v| v.as_mapping())
            .unwrap();

        for value in schemas.values() {
            if let Some(reference) = value.get("$ref").and_then(|v| v.as_str()) {
                let ref_path = openapi_path.parent().unwrap().join(reference);
                assert!(
                    ref_path.exists(),
                    "missing OpenAPI ref target: {}",
                    ref_path.display()
                );
            }
        }
    }

    fn repo_path(relative: &str) -> PathBuf {
        let mut base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        base.push("../..");
        base.push(relative);
        base
    }
}

use std::collections::BTreeSet;

use askia_contracts::{
    ActiveTrigger, ConversationSignals, FeedbackLevelView, FeedbackStats, MessageRole,
    TriggerKind, TriggerPriority, TriggerProfileView,
};
use serde_json::Value;
use sha2::{Digest, Sha256};

mod scheduler;

pub use scheduler::FeedbackScheduler;

/// Rules evaluated on every update, in this order. The last match wins.
pub const RULE_ORDER: [TriggerKind; 3] = [
    TriggerKind::AfterResponse,
    TriggerKind::Periodic,
    TriggerKind::NewConversation,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerProfile {
    pub after_every_n_responses: u64,
    pub periodic_check: u64,
    pub new_conversation_delay: u64,
    pub before_new_chat_threshold: u64,
    pub min_time_between_prompts_ms: i64,
}

impl TriggerProfile {
    pub const fn standard() -> Self {
        Self {
            after_every_n_responses: 3,
            periodic_check: 5,
            new_conversation_delay: 2,
            before_new_chat_threshold: 4,
            min_time_between_prompts_ms: 60_000,
        }
    }

    pub const fn relaxed() -> Self {
        Self {
            after_every_n_responses: 6,
            periodic_check: 8,
            new_conversation_delay: 4,
            before_new_chat_threshold: 6,
            min_time_between_prompts_ms: 120_000,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(Self::standard()),
            "relaxed" => Some(Self::relaxed()),
            _ => None,
        }
    }

    pub fn view(&self) -> TriggerProfileView {
        TriggerProfileView {
            after_every_n_responses: self.after_every_n_responses,
            periodic_check: self.periodic_check,
            new_conversation_delay: self.new_conversation_delay,
            before_new_chat_threshold: self.before_new_chat_threshold,
            min_time_between_prompts_ms: self.min_time_between_prompts_ms,
        }
    }
}

impl Default for TriggerProfile {
    fn default() -> Self {
        Self::standard()
    }
}

/// Feedback history of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerState {
    pub feedback_count: u64,
    pub last_feedback_at_ms: Option<i64>,
    pub completed_kinds: BTreeSet<TriggerKind>,
}

impl TriggerState {
    pub fn is_completed(&self, kind: TriggerKind) -> bool {
        self.completed_kinds.contains(&kind)
    }

    /// True when no feedback was ever completed here or the minimum gap has passed.
    pub fn interval_elapsed(&self, now_ms: i64, profile: &TriggerProfile) -> bool {
        match self.last_feedback_at_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= profile.min_time_between_prompts_ms,
        }
    }

    pub fn record_completion(&mut self, kind: TriggerKind, now_ms: i64) {
        self.feedback_count += 1;
        self.last_feedback_at_ms = Some(now_ms);
        self.completed_kinds.insert(kind);
    }
}

pub fn priority_for(kind: TriggerKind) -> TriggerPriority {
    match kind {
        TriggerKind::AfterResponse => TriggerPriority::Medium,
        TriggerKind::Periodic => TriggerPriority::Low,
        TriggerKind::NewConversation | TriggerKind::BeforeNewChat => TriggerPriority::High,
    }
}

pub fn trigger_for(kind: TriggerKind, conversation_id: &str) -> ActiveTrigger {
    ActiveTrigger {
        kind,
        conversation_id: conversation_id.to_string(),
        priority: priority_for(kind),
        message_id: None,
    }
}

/// Empty or whitespace-only ids name no conversation.
pub fn is_blank_conversation(conversation_id: &str) -> bool {
    conversation_id.trim().is_empty()
}

/// Conversation id the rules should act on; blank ids count as absent.
pub fn effective_conversation(signals: &ConversationSignals) -> Option<&str> {
    signals
        .conversation_id
        .as_deref()
        .filter(|id| !is_blank_conversation(id))
}

/// Evaluates a single rule. `BeforeNewChat` is imperative and never matches here.
pub fn evaluate_rule(
    kind: TriggerKind,
    signals: &ConversationSignals,
    state: &TriggerState,
    profile: &TriggerProfile,
    now_ms: i64,
) -> Option<ActiveTrigger> {
    let conversation_id = effective_conversation(signals)?;
    if state.is_completed(kind) {
        return None;
    }
    let count = signals.message_count;
    let matched = match kind {
        TriggerKind::AfterResponse => {
            signals.last_message_role == Some(MessageRole::Assistant)
                && count > 0
                && is_multiple(count, profile.after_every_n_responses)
                && state.interval_elapsed(now_ms, profile)
        }
        TriggerKind::Periodic => {
            profile.periodic_check > 0
                && count >= profile.periodic_check
                && is_multiple(count, profile.periodic_check)
                && state.interval_elapsed(now_ms, profile)
        }
        TriggerKind::NewConversation => {
            signals.is_new_conversation && count >= profile.new_conversation_delay
        }
        TriggerKind::BeforeNewChat => false,
    };
    matched.then(|| trigger_for(kind, conversation_id))
}

/// Runs every rule in [`RULE_ORDER`] and returns the last match.
pub fn evaluate_rules(
    signals: &ConversationSignals,
    state: &TriggerState,
    profile: &TriggerProfile,
    now_ms: i64,
) -> Option<ActiveTrigger> {
    RULE_ORDER
        .iter()
        .filter_map(|kind| evaluate_rule(*kind, signals, state, profile, now_ms))
        .last()
}

fn is_multiple(count: u64, divisor: u64) -> bool {
    count.checked_rem(divisor) == Some(0)
}

pub fn summarize<'a, I>(states: I) -> FeedbackStats
where
    I: IntoIterator<Item = &'a TriggerState>,
{
    let (total, conversations) = states
        .into_iter()
        .filter(|s| s.feedback_count > 0)
        .fold((0u64, 0u64), |(total, n), s| (total + s.feedback_count, n + 1));
    FeedbackStats {
        total_feedbacks: total,
        conversations_with_feedback: conversations,
        avg_feedbacks_per_conversation: format_average(total, conversations),
    }
}

/// One decimal place of the `f64` quotient. `"0"` when there is nothing to average.
///
/// The quotient is rounded by its exact binary value, so `1.15` (stored just
/// below) gives `"1.1"`. A quotient sitting exactly on a half rounds up.
pub fn format_average(total: u64, count: u64) -> String {
    if count == 0 {
        return "0".to_string();
    }
    let avg = total as f64 / count as f64;
    // Exact halves at one decimal are odd multiples of 0.25.
    let quarters = avg * 4.0;
    if quarters.fract() == 0.0 && quarters % 2.0 == 1.0 {
        let tenths = (avg * 10.0).ceil() as u64;
        return format!("{}.{}", tenths / 10, tenths % 10);
    }
    format!("{avg:.1}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackLevel {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
    Master,
}

impl FeedbackLevel {
    pub fn for_total(total_feedbacks: u64) -> Self {
        match total_feedbacks {
            100.. => FeedbackLevel::Master,
            50.. => FeedbackLevel::Expert,
            25.. => FeedbackLevel::Advanced,
            10.. => FeedbackLevel::Intermediate,
            _ => FeedbackLevel::Beginner,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            FeedbackLevel::Beginner => 1,
            FeedbackLevel::Intermediate => 2,
            FeedbackLevel::Advanced => 3,
            FeedbackLevel::Expert => 4,
            FeedbackLevel::Master => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeedbackLevel::Beginner => "beginner",
            FeedbackLevel::Intermediate => "intermediate",
            FeedbackLevel::Advanced => "advanced",
            FeedbackLevel::Expert => "expert",
            FeedbackLevel::Master => "master",
        }
    }

    pub fn next_threshold(self) -> u64 {
        match self {
            FeedbackLevel::Beginner => 10,
            FeedbackLevel::Intermediate => 25,
            FeedbackLevel::Advanced => 50,
            FeedbackLevel::Expert => 100,
            FeedbackLevel::Master => 200,
        }
    }

    pub fn view(self) -> FeedbackLevelView {
        FeedbackLevelView {
            level: self.rank(),
            name: self.name().to_string(),
            next_threshold: self.next_threshold(),
        }
    }
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

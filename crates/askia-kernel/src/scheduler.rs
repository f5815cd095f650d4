use std::collections::{BTreeMap, HashMap};

use askia_contracts::{
    ActiveTrigger, ConversationSignals, FeedbackStats, MessageRole, TriggerKind,
};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    evaluate_rule, is_blank_conversation, summarize, trigger_for, TriggerProfile, TriggerState,
    RULE_ORDER,
};

/// Inputs a rule last ran with. Fields a rule does not read stay at their defaults,
/// so changing them does not re-run that rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RuleDeps {
    conversation_id: Option<String>,
    message_count: u64,
    last_message_role: Option<MessageRole>,
    is_new_conversation: bool,
    history_revision: u64,
}

impl RuleDeps {
    fn for_rule(kind: TriggerKind, signals: &ConversationSignals, history_revision: u64) -> Self {
        let mut deps = RuleDeps {
            conversation_id: signals.conversation_id.clone(),
            message_count: signals.message_count,
            history_revision,
            ..RuleDeps::default()
        };
        match kind {
            TriggerKind::AfterResponse => deps.last_message_role = signals.last_message_role,
            TriggerKind::NewConversation => deps.is_new_conversation = signals.is_new_conversation,
            TriggerKind::Periodic | TriggerKind::BeforeNewChat => {}
        }
        deps
    }
}

/// Feedback-prompt scheduler for one browser session.
///
/// Holds the per-conversation trigger history and the single active trigger.
/// Every operation is total: unknown conversations read as fresh history.
#[derive(Debug, Clone)]
pub struct FeedbackScheduler {
    profile: TriggerProfile,
    history: HashMap<String, TriggerState>,
    active: Option<ActiveTrigger>,
    signals: ConversationSignals,
    history_revision: u64,
    last_run: BTreeMap<TriggerKind, RuleDeps>,
}

impl FeedbackScheduler {
    pub fn new(profile: TriggerProfile) -> Self {
        Self {
            profile,
            history: HashMap::new(),
            active: None,
            signals: ConversationSignals::default(),
            history_revision: 0,
            last_run: BTreeMap::new(),
        }
    }

    pub fn profile(&self) -> &TriggerProfile {
        &self.profile
    }

    pub fn active(&self) -> Option<&ActiveTrigger> {
        self.active.as_ref()
    }

    pub fn signals(&self) -> &ConversationSignals {
        &self.signals
    }

    /// Feeds the latest counters and re-runs every rule whose inputs changed.
    ///
    /// A matching rule overwrites the active slot; a rule that does not match
    /// leaves it alone, so a trigger raised earlier survives until it is
    /// completed or dismissed.
    pub fn observe(
        &mut self,
        signals: ConversationSignals,
        now: DateTime<Utc>,
    ) -> Option<&ActiveTrigger> {
        let now_ms = now.timestamp_millis();
        self.signals = signals;

        for kind in RULE_ORDER {
            let deps = RuleDeps::for_rule(kind, &self.signals, self.history_revision);
            if self.last_run.get(&kind) == Some(&deps) {
                continue;
            }
            self.last_run.insert(kind, deps);

            let state = self.state_for(self.signals.conversation_id.as_deref());
            if let Some(trigger) = evaluate_rule(kind, &self.signals, &state, &self.profile, now_ms)
            {
                debug!(
                    kind = kind.as_str(),
                    conversation_id = %trigger.conversation_id,
                    message_count = self.signals.message_count,
                    "feedback trigger matched"
                );
                self.active = Some(trigger);
            }
        }
        self.active.as_ref()
    }

    /// Records a finished feedback for `kind` and clears the active trigger.
    /// A blank conversation id changes nothing.
    pub fn complete_trigger(
        &mut self,
        conversation_id: &str,
        kind: TriggerKind,
        now: DateTime<Utc>,
    ) {
        if is_blank_conversation(conversation_id) {
            return;
        }
        self.history
            .entry(conversation_id.to_string())
            .or_default()
            .record_completion(kind, now.timestamp_millis());
        self.history_revision += 1;
        self.active = None;
        debug!(kind = kind.as_str(), conversation_id, "feedback trigger completed");
    }

    /// Clears the active trigger; history is untouched.
    pub fn dismiss_trigger(&mut self) {
        if let Some(trigger) = self.active.take() {
            debug!(
                kind = trigger.kind.as_str(),
                conversation_id = %trigger.conversation_id,
                "feedback trigger dismissed"
            );
        }
    }

    /// Asks for feedback before the host starts a new conversation.
    ///
    /// Returns `true` when the host must hold the navigation until the prompt
    /// is resolved. Uses the message count of the latest [`observe`](Self::observe).
    pub fn trigger_before_new_chat(&mut self, conversation_id: &str) -> bool {
        if is_blank_conversation(conversation_id)
            || self.signals.message_count < self.profile.before_new_chat_threshold
        {
            return false;
        }
        if self.state_for(Some(conversation_id)).is_completed(TriggerKind::BeforeNewChat) {
            return false;
        }
        self.active = Some(trigger_for(TriggerKind::BeforeNewChat, conversation_id));
        true
    }

    pub fn stats(&self) -> FeedbackStats {
        summarize(self.history.values())
    }

    pub fn history(&self, conversation_id: &str) -> TriggerState {
        self.state_for(Some(conversation_id))
    }

    /// Forgets everything, as a page reload would.
    pub fn reset(&mut self) {
        *self = Self::new(self.profile);
    }

    fn state_for(&self, conversation_id: Option<&str>) -> TriggerState {
        conversation_id
            .and_then(|id| self.history.get(id))
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for FeedbackScheduler {
    fn default() -> Self {
        Self::new(TriggerProfile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askia_contracts::TriggerPriority;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn signals(
        conversation_id: &str,
        count: u64,
        role: Option<MessageRole>,
        is_new: bool,
    ) -> ConversationSignals {
        ConversationSignals {
            conversation_id: Some(conversation_id.to_string()),
            message_count: count,
            last_message_role: role,
            is_new_conversation: is_new,
        }
    }

    fn assistant(conversation_id: &str, count: u64) -> ConversationSignals {
        signals(conversation_id, count, Some(MessageRole::Assistant), false)
    }

    fn user(conversation_id: &str, count: u64) -> ConversationSignals {
        signals(conversation_id, count, Some(MessageRole::User), false)
    }

    #[test]
    fn after_response_fires_on_third_message() {
        let mut s = FeedbackScheduler::default();
        assert!(s.observe(user("c1", 1), t0()).is_none());
        assert!(s.observe(assistant("c1", 2), t0()).is_none());
        let active = s.observe(assistant("c1", 3), t0()).cloned();
        assert_eq!(
            active,
            Some(ActiveTrigger {
                kind: TriggerKind::AfterResponse,
                conversation_id: "c1".to_string(),
                priority: TriggerPriority::Medium,
                message_id: None,
            })
        );
    }

    #[test]
    fn completed_after_response_never_refires() {
        let mut s = FeedbackScheduler::default();
        s.observe(assistant("c1", 3), t0());
        s.complete_trigger("c1", TriggerKind::AfterResponse, t0());
        assert!(s.active().is_none());

        s.observe(user("c1", 4), t0() + Duration::seconds(10));
        s.observe(user("c1", 5), t0() + Duration::seconds(20));
        assert!(s.active().is_none(), "periodic is still inside the interval");
        assert!(s.observe(assistant("c1", 6), t0() + Duration::seconds(30)).is_none());

        assert!(s.observe(user("c1", 8), t0() + Duration::minutes(5)).is_none());
        assert!(s.observe(assistant("c1", 9), t0() + Duration::minutes(5)).is_none());
    }

    #[test]
    fn new_conversation_fires_regardless_of_recent_feedback() {
        let mut s = FeedbackScheduler::default();
        s.observe(assistant("c1", 3), t0());
        s.complete_trigger("c1", TriggerKind::AfterResponse, t0());

        s.observe(signals("c2", 1, Some(MessageRole::User), true), t0());
        let active = s
            .observe(signals("c2", 2, Some(MessageRole::Assistant), true), t0() + Duration::seconds(1))
            .cloned()
            .unwrap();
        assert_eq!(active.kind, TriggerKind::NewConversation);
        assert_eq!(active.conversation_id, "c2");
        assert_eq!(active.priority, TriggerPriority::High);
    }

    #[test]
    fn before_new_chat_below_threshold_is_refused() {
        let mut s = FeedbackScheduler::default();
        s.observe(assistant("c3", 3), t0());
        let before = s.active().cloned();
        assert!(!s.trigger_before_new_chat("c3"));
        assert_eq!(s.active().cloned(), before);
    }

    #[test]
    fn before_new_chat_blocks_once_per_conversation() {
        let mut s = FeedbackScheduler::default();
        s.observe(user("c1", 4), t0());
        assert!(s.trigger_before_new_chat("c1"));
        assert_eq!(
            s.active().map(|t| (t.kind, t.priority)),
            Some((TriggerKind::BeforeNewChat, TriggerPriority::High))
        );

        s.complete_trigger("c1", TriggerKind::BeforeNewChat, t0());
        assert!(!s.trigger_before_new_chat("c1"));
        assert!(s.active().is_none());
        assert!(!s.trigger_before_new_chat(""));
    }

    #[test]
    fn dismiss_keeps_history_and_allows_refire_on_next_update() {
        let mut s = FeedbackScheduler::default();
        s.observe(signals("c2", 2, Some(MessageRole::Assistant), true), t0());
        assert_eq!(s.active().map(|t| t.kind), Some(TriggerKind::NewConversation));

        s.dismiss_trigger();
        assert!(s.active().is_none());
        assert_eq!(s.history("c2"), TriggerState::default());

        // Same inputs are not an update.
        assert!(s.observe(signals("c2", 2, Some(MessageRole::Assistant), true), t0()).is_none());
        assert_eq!(
            s.observe(signals("c2", 3, Some(MessageRole::User), true), t0()).map(|t| t.kind),
            Some(TriggerKind::NewConversation)
        );
    }

    #[test]
    fn non_matching_pass_keeps_previous_trigger() {
        let mut s = FeedbackScheduler::default();
        s.observe(assistant("c1", 3), t0());
        assert_eq!(
            s.observe(user("c1", 4), t0()).map(|t| t.kind),
            Some(TriggerKind::AfterResponse)
        );
    }

    #[test]
    fn role_change_only_reruns_after_response() {
        let profile = TriggerProfile {
            min_time_between_prompts_ms: 0,
            ..TriggerProfile::standard()
        };
        let mut s = FeedbackScheduler::new(profile);
        s.observe(user("c1", 15), t0());
        assert_eq!(s.active().map(|t| t.kind), Some(TriggerKind::Periodic));
        s.dismiss_trigger();

        // Periodic does not read the role, so it stays quiet; AfterResponse does.
        assert_eq!(
            s.observe(assistant("c1", 15), t0()).map(|t| t.kind),
            Some(TriggerKind::AfterResponse)
        );
    }

    #[test]
    fn completion_reruns_rules_with_unchanged_signals() {
        let mut s = FeedbackScheduler::default();
        let new_chat = signals("c2", 3, Some(MessageRole::Assistant), true);
        assert_eq!(
            s.observe(new_chat.clone(), t0()).map(|t| t.kind),
            Some(TriggerKind::NewConversation)
        );

        s.complete_trigger("c2", TriggerKind::AfterResponse, t0());
        assert!(s.active().is_none());
        assert_eq!(
            s.observe(new_chat, t0()).map(|t| t.kind),
            Some(TriggerKind::NewConversation)
        );
    }

    #[test]
    fn time_alone_does_not_reevaluate() {
        let mut s = FeedbackScheduler::default();
        s.observe(user("c1", 1), t0());
        s.complete_trigger("c1", TriggerKind::NewConversation, t0());
        assert!(s.observe(user("c1", 5), t0()).is_none());
        assert!(s.observe(user("c1", 5), t0() + Duration::hours(1)).is_none());
    }

    #[test]
    fn idle_conversation_id_suppresses_everything() {
        let mut s = FeedbackScheduler::default();
        let idle = ConversationSignals {
            conversation_id: None,
            message_count: 6,
            last_message_role: Some(MessageRole::Assistant),
            is_new_conversation: true,
        };
        assert!(s.observe(idle, t0()).is_none());
    }

    #[test]
    fn stats_across_conversations() {
        let mut s = FeedbackScheduler::default();
        assert_eq!(s.stats().avg_feedbacks_per_conversation, "0");

        s.complete_trigger("a", TriggerKind::AfterResponse, t0());
        s.complete_trigger("a", TriggerKind::Periodic, t0());
        s.complete_trigger("b", TriggerKind::NewConversation, t0());
        let stats = s.stats();
        assert_eq!(stats.total_feedbacks, 3);
        assert_eq!(stats.conversations_with_feedback, 2);
        assert_eq!(stats.avg_feedbacks_per_conversation, "1.5");
    }

    #[test]
    fn blank_conversation_completion_is_ignored() {
        let mut s = FeedbackScheduler::default();
        s.observe(assistant("c1", 3), t0());
        assert!(s.active().is_some());

        s.complete_trigger("", TriggerKind::Periodic, t0());
        s.complete_trigger("  ", TriggerKind::AfterResponse, t0());
        let stats = s.stats();
        assert_eq!(stats.total_feedbacks, 0);
        assert_eq!(stats.conversations_with_feedback, 0);
        assert_eq!(stats.avg_feedbacks_per_conversation, "0");
        assert!(s.active().is_some());
        assert!(!s.trigger_before_new_chat(" "));
    }

    #[test]
    fn history_for_unknown_conversation_is_fresh() {
        let s = FeedbackScheduler::default();
        assert_eq!(s.history("missing"), TriggerState::default());
    }

    #[test]
    fn completion_updates_history() {
        let mut s = FeedbackScheduler::default();
        s.complete_trigger("c1", TriggerKind::Periodic, t0());
        let state = s.history("c1");
        assert_eq!(state.feedback_count, 1);
        assert_eq!(state.last_feedback_at_ms, Some(t0().timestamp_millis()));
        assert!(state.is_completed(TriggerKind::Periodic));
    }

    #[test]
    fn reset_forgets_history_but_keeps_profile() {
        let mut s = FeedbackScheduler::new(TriggerProfile::relaxed());
        s.complete_trigger("c1", TriggerKind::Periodic, t0());
        s.observe(user("c1", 6), t0());
        s.reset();
        assert_eq!(s.stats().total_feedbacks, 0);
        assert_eq!(s.signals(), &ConversationSignals::default());
        assert_eq!(s.profile(), &TriggerProfile::relaxed());
    }
}

use std::collections::HashSet;
use std::fmt;
use std::ops::Index;

use super::debug::DebugInfo;
use super::types::{Message, Role, ToolHistoryEntry};
use crate::reference::{SourceRef, SourceRegistry};
use crate::tokenizer::SharedTokenizer;

/// Options for [`MessageList::keep`].
#[derive(Debug, Clone, PartialEq)]
pub struct KeepOptions {
    /// Soft floor on retained non-system messages.
    pub min_messages: usize,
    /// Cap on retained non-system messages, applied only when exceeded.
    pub max_messages: Option<usize>,
    /// System notice inserted when anything was dropped.
    pub truncation_notice: Option<String>,
}

impl KeepOptions {
    pub const DEFAULT_NOTICE: &'static str = "Earlier messages were truncated to fit the context window.";

    pub fn new(min_messages: usize, max_messages: Option<usize>) -> Self {
        Self {
            min_messages,
            max_messages,
            truncation_notice: None,
        }
    }

    pub fn with_notice(mut self, notice: impl Into<String>) -> Self {
        self.truncation_notice = Some(notice.into());
        self
    }
}

impl Default for KeepOptions {
    fn default() -> Self {
        Self::new(0, None)
    }
}

/// Ordered messages bound to the tokenizer used to count them.
#[derive(Clone)]
pub struct MessageList {
    messages: Vec<Message>,
    tokenizer: SharedTokenizer,
}

impl fmt::Debug for MessageList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageList")
            .field("tokenizer", &self.tokenizer.name())
            .field("messages", &self.messages)
            .finish()
    }
}

impl MessageList {
    pub fn new(tokenizer: SharedTokenizer) -> Self {
        Self {
            messages: Vec::new(),
            tokenizer,
        }
    }

    pub fn from_messages(messages: Vec<Message>, tokenizer: SharedTokenizer) -> Self {
        Self {
            messages,
            tokenizer,
        }
    }

    pub fn tokenizer(&self) -> &SharedTokenizer {
        &self.tokenizer
    }

    /// Rebind to another tokenizer. Counts follow immediately.
    pub fn with_tokenizer(mut self, tokenizer: SharedTokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    fn derive(&self, messages: Vec<Message>) -> Self {
        Self {
            messages,
            tokenizer: self.tokenizer.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Message> {
        self.messages.iter_mut()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_vec(self) -> Vec<Message> {
        self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn insert(&mut self, index: usize, message: Message) {
        self.messages.insert(index, message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn remove(&mut self, index: usize) -> Message {
        self.messages.remove(index)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn retain(&mut self, predicate: impl FnMut(&Message) -> bool) {
        self.messages.retain(predicate);
    }

    pub fn filter(&self, predicate: impl Fn(&Message) -> bool) -> Self {
        self.derive(self.messages.iter().filter(|m| predicate(m)).cloned().collect())
    }

    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn first_where(&self, predicate: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.messages.iter().find(|m| predicate(m))
    }

    pub fn last_where(&self, predicate: impl Fn(&Message) -> bool) -> Option<&Message> {
        self.messages.iter().rev().find(|m| predicate(m))
    }

    pub fn last_where_mut(&mut self, predicate: impl Fn(&Message) -> bool) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| predicate(m))
    }

    /// Stable sort into a new list.
    pub fn sorted_by_key<K: Ord>(&self, key: impl FnMut(&Message) -> K) -> Self {
        let mut messages = self.messages.clone();
        messages.sort_by_key(key);
        self.derive(messages)
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.messages
            .iter()
            .flat_map(|m| m.tokens(self.tokenizer.as_ref()))
            .collect()
    }

    pub fn token_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.token_count(self.tokenizer.as_ref()))
            .sum()
    }

    /// Sources referenced across the list, deduplicated in first-seen order.
    pub fn sources(&self) -> Vec<SourceRef> {
        let mut registry = SourceRegistry::new();
        for message in &self.messages {
            for source in &message.sources {
                registry.register(source.clone());
            }
        }
        registry.into_sources()
    }

    /// Group non-system message indices into droppable units. An assistant
    /// message that called tools forms one unit with the tool results that
    /// answer it.
    fn units(&self) -> Vec<Vec<usize>> {
        let mut units: Vec<Vec<usize>> = Vec::new();
        let mut open_calls: HashSet<&str> = HashSet::new();

        for (index, message) in self.messages.iter().enumerate() {
            match message.role {
                Role::System => continue,
                Role::Tool
                    if message
                        .tool_call_id
                        .as_deref()
                        .is_some_and(|id| open_calls.contains(id)) =>
                {
                    if let Some(unit) = units.last_mut() {
                        unit.push(index);
                    }
                }
                _ => {
                    open_calls = message.tool_calls.iter().map(|c| c.id.as_str()).collect();
                    units.push(vec![index]);
                }
            }
        }
        units
    }

    /// Number of leading units to drop so the rest fits `budget`.
    fn units_to_drop(&self, units: &[Vec<usize>], unit_tokens: &[usize], budget: usize, options: &KeepOptions) -> usize {
        let mut retained: usize = units.iter().map(|u| u.len()).sum();
        let mut tokens = self.token_count();
        let mut dropped = 0;

        while dropped < units.len() {
            let over_max = options.max_messages.is_some_and(|max| retained > max);
            if !over_max && tokens <= budget {
                break;
            }
            let size = units[dropped].len();
            if retained < size || retained - size < options.min_messages {
                break;
            }
            tokens -= unit_tokens[dropped];
            retained -= size;
            dropped += 1;
        }
        dropped
    }

    /// Drop the oldest non-system messages until the list fits `budget`.
    ///
    /// System messages are always kept in place and counted. At least
    /// `min_messages` non-system messages survive even when that exceeds the
    /// budget. When nothing has to go, the list comes back unchanged.
    pub fn keep(&self, budget: usize, options: &KeepOptions) -> Self {
        let units = self.units();
        let tokenizer = self.tokenizer.as_ref();
        let unit_tokens: Vec<usize> = units
            .iter()
            .map(|u| u.iter().map(|i| self.messages[*i].token_count(tokenizer)).sum())
            .collect();

        let mut dropped = self.units_to_drop(&units, &unit_tokens, budget, options);
        if dropped == 0 {
            return self.clone();
        }

        let notice = options.truncation_notice.as_ref().map(|text| Message::system(text.clone()));
        if let Some(notice) = notice.as_ref() {
            let reserved = notice.token_count(tokenizer);
            dropped = self.units_to_drop(&units, &unit_tokens, budget.saturating_sub(reserved), options);
        }

        let removed: HashSet<usize> = units[..dropped].iter().flatten().copied().collect();
        let mut kept: Vec<Message> = Vec::with_capacity(self.messages.len() - removed.len() + 1);
        let mut notice = notice;
        for (index, message) in self.messages.iter().enumerate() {
            if removed.contains(&index) {
                continue;
            }
            if message.role != Role::System {
                if let Some(notice) = notice.take() {
                    kept.push(notice);
                }
            }
            kept.push(message.clone());
        }
        if let Some(notice) = notice {
            kept.push(notice);
        }

        let result = self.derive(kept);
        let total = result.token_count();
        if total > budget {
            tracing::warn!(
                "Context still holds {} tokens over a budget of {} after keeping the minimum of {} messages",
                total,
                budget,
                options.min_messages
            );
        }
        log::debug!(
            "Dropped {} messages to fit {} tokens ({} retained)",
            removed.len(),
            budget,
            result.len()
        );
        result
    }

    /// Remove repeated system messages, keeping the first of each content.
    pub fn dedup_system(&self) -> Self {
        let mut seen: HashSet<Option<&str>> = HashSet::new();
        let messages = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System || seen.insert(m.content.as_deref()))
            .cloned()
            .collect();
        self.derive(messages)
    }

    /// Remove assistant messages with neither content nor tool calls.
    pub fn drop_empty_assistants(&self) -> Self {
        self.filter(|m| !(m.role == Role::Assistant && m.is_empty()))
    }

    /// Re-insert tool exchanges persisted in `_tool_calls` right after the
    /// message that owns them.
    pub fn expand(&self) -> Self {
        let mut expanded = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            expanded.push(message.clone());
            let history: Vec<ToolHistoryEntry> = message
                .debug
                .get_as(DebugInfo::TOOL_CALLS)
                .unwrap_or_default();
            expanded.extend(history.into_iter().map(Message::from));
        }
        self.derive(expanded)
    }
}

impl Index<usize> for MessageList {
    type Output = Message;

    fn index(&self, index: usize) -> &Self::Output {
        &self.messages[index]
    }
}

impl IntoIterator for MessageList {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a> IntoIterator for &'a MessageList {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::{ToolCall, MESSAGE_OVERHEAD_TOKENS};
    use crate::tokenizer::CharTokenizer;
    use proptest::prelude::*;

    fn list(messages: Vec<Message>) -> MessageList {
        MessageList::from_messages(messages, CharTokenizer::shared())
    }

    fn texts(list: &MessageList) -> Vec<&str> {
        list.iter().map(|m| m.text()).collect()
    }

    // each "xxxxx" message costs 5 + overhead
    fn cost(chars: usize) -> usize {
        chars + MESSAGE_OVERHEAD_TOKENS
    }

    #[test]
    fn keep_returns_unchanged_when_within_budget() {
        let messages = list(vec![Message::system("sys"), Message::user("hello")]);
        let kept = messages.keep(1000, &KeepOptions::new(1, None).with_notice("cut"));
        assert_eq!(texts(&kept), vec!["sys", "hello"]);
    }

    #[test]
    fn keep_drops_oldest_non_system_first() {
        let messages = list(vec![
            Message::system("S"),
            Message::user("aaaaa"),
            Message::assistant("bbbbb"),
            Message::user("ccccc"),
        ]);
        let budget = cost(1) + 2 * cost(5);
        let kept = messages.keep(budget, &KeepOptions::new(0, None));
        assert_eq!(texts(&kept), vec!["S", "bbbbb", "ccccc"]);
        assert!(kept.token_count() <= budget);
    }

    #[test]
    fn keep_retains_system_messages_in_place() {
        let messages = list(vec![
            Message::user("aaaaa"),
            Message::system("S1"),
            Message::user("bbbbb"),
            Message::system("S2"),
            Message::user("ccccc"),
        ]);
        let kept = messages.keep(0, &KeepOptions::new(1, None));
        assert_eq!(texts(&kept), vec!["S1", "S2", "ccccc"]);
    }

    #[test]
    fn keep_honours_soft_floor() {
        let messages = list(vec![
            Message::user("aaaaa"),
            Message::assistant("bbbbb"),
            Message::user("ccccc"),
        ]);
        let kept = messages.keep(1, &KeepOptions::new(2, None));
        assert_eq!(texts(&kept), vec!["bbbbb", "ccccc"]);
    }

    #[test]
    fn keep_applies_max_only_when_exceeded() {
        let messages = list(vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ]);
        let same = messages.keep(1000, &KeepOptions::new(0, Some(3)));
        assert_eq!(same.len(), 3);

        let capped = messages.keep(1000, &KeepOptions::new(0, Some(2)));
        assert_eq!(texts(&capped), vec!["b", "c"]);
    }

    #[test]
    fn keep_inserts_notice_and_reserves_its_tokens() {
        let messages = list(vec![
            Message::system("S"),
            Message::user("aaaaa"),
            Message::assistant("bbbbb"),
            Message::user("ccccc"),
        ]);
        let budget = cost(1) + 2 * cost(5);
        let kept = messages.keep(budget, &KeepOptions::new(0, None).with_notice("cut"));
        assert_eq!(texts(&kept), vec!["S", "cut", "ccccc"]);
        assert_eq!(kept[1].role, Role::System);
        assert!(kept.token_count() <= budget);
    }

    #[test]
    fn keep_drops_tool_results_with_their_call() {
        let call = ToolCall::new("call_1", "Sum", "{}");
        let messages = list(vec![
            Message::user("q1"),
            Message::assistant_with_tool_calls(None, vec![call]),
            Message::tool("call_1", "5"),
            Message::assistant("five"),
            Message::user("q2"),
        ]);
        // budget leaves room for the last two messages only
        let budget = cost(4) + cost(2);
        let kept = messages.keep(budget, &KeepOptions::new(0, None));
        assert_eq!(texts(&kept), vec!["five", "q2"]);
        assert!(kept.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn dedup_system_keeps_first_occurrence() {
        let messages = list(vec![
            Message::system("boilerplate"),
            Message::user("hi"),
            Message::system("boilerplate"),
            Message::system("other"),
        ]);
        let deduped = messages.dedup_system();
        assert_eq!(texts(&deduped), vec!["boilerplate", "hi", "other"]);
    }

    #[test]
    fn drop_empty_assistants_keeps_tool_callers() {
        let messages = list(vec![
            Message::assistant(""),
            Message::assistant_with_tool_calls(None, vec![ToolCall::new("c", "Sum", "{}")]),
            Message::assistant("ok"),
        ]);
        let cleaned = messages.drop_empty_assistants();
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned[0].has_tool_calls());
    }

    #[test]
    fn expand_reinserts_tool_history() {
        let mut user = Message::user("sum 2 and 3");
        let history = vec![
            ToolHistoryEntry::from(&Message::assistant_with_tool_calls(
                None,
                vec![ToolCall::new("call_1", "Sum", r#"{"x":2,"y":3}"#)],
            )),
            ToolHistoryEntry::from(&Message::tool("call_1", "5")),
        ];
        user.debug.set_as(DebugInfo::TOOL_CALLS, &history).unwrap();

        let expanded = list(vec![user, Message::assistant("5")]).expand();
        let roles: Vec<Role> = expanded.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[test]
    fn filter_and_sort_do_not_touch_source() {
        let messages = list(vec![Message::user("b"), Message::user("a")]);
        let sorted = messages.sorted_by_key(|m| m.text().to_string());
        let users = messages.filter(|m| m.text() == "a");
        assert_eq!(texts(&sorted), vec!["a", "b"]);
        assert_eq!(users.len(), 1);
        assert_eq!(texts(&messages), vec!["b", "a"]);
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (0..3u8, "[a-z]{0,30}").prop_map(|(role, text)| match role {
            0 => Message::system(text),
            1 => Message::user(text),
            _ => Message::assistant(text),
        })
    }

    /// Plain messages mixed with assistant tool calls and their results.
    fn arb_conversation() -> impl Strategy<Value = Vec<Message>> {
        proptest::collection::vec((0..4u8, "[a-z]{0,30}", 1..4usize), 0..15).prop_map(|turns| {
            let mut messages = Vec::new();
            for (turn, (kind, text, calls)) in turns.into_iter().enumerate() {
                match kind {
                    0 => messages.push(Message::system(text)),
                    1 => messages.push(Message::user(text)),
                    2 => messages.push(Message::assistant(text)),
                    _ => {
                        let ids: Vec<String> = (0..calls).map(|i| format!("call_{}_{}", turn, i)).collect();
                        let tool_calls = ids.iter().map(|id| ToolCall::new(id, "Sum", "{}")).collect();
                        messages.push(Message::assistant_with_tool_calls(None, tool_calls));
                        messages.extend(ids.iter().map(|id| Message::tool(id, text.clone())));
                    }
                }
            }
            messages
        })
    }

    /// Size of the oldest unit `keep` could still drop.
    fn first_unit_size(list: &MessageList) -> usize {
        let mut rest = list.iter().filter(|m| m.role != Role::System);
        let Some(first) = rest.next() else {
            return 0;
        };
        let ids: HashSet<&str> = first.tool_calls.iter().map(|c| c.id.as_str()).collect();
        1 + rest
            .take_while(|m| m.role == Role::Tool && m.tool_call_id.as_deref().is_some_and(|id| ids.contains(id)))
            .count()
    }

    proptest! {
        #[test]
        fn keep_with_notice_and_tool_exchanges_fits_budget_or_stops_at_floor(
            messages in arb_conversation(),
            budget in 0usize..400,
            min in 0usize..5,
        ) {
            let list = list(messages);
            let options = KeepOptions::new(min, None).with_notice("cut");
            let kept = list.keep(budget, &options);
            let non_system = kept.iter().filter(|m| m.role != Role::System).count();
            prop_assert!(
                kept.token_count() <= budget
                    || non_system == 0
                    || non_system < min + first_unit_size(&kept)
            );
        }

        #[test]
        fn keep_never_orphans_tool_results(
            messages in arb_conversation(),
            budget in 0usize..400,
            min in 0usize..5,
        ) {
            let list = list(messages);
            let kept = list.keep(budget, &KeepOptions::new(min, None).with_notice("cut"));
            let mut called: HashSet<String> = HashSet::new();
            for message in kept.iter() {
                called.extend(message.tool_calls.iter().map(|c| c.id.clone()));
                if message.role == Role::Tool {
                    let id = message.tool_call_id.clone().unwrap_or_default();
                    prop_assert!(called.contains(&id), "orphan tool result {}", id);
                }
            }
            let calls: usize = kept.iter().map(|m| m.tool_calls.len()).sum();
            let results = kept.iter().filter(|m| m.role == Role::Tool).count();
            prop_assert_eq!(calls, results);
        }

        #[test]
        fn keep_fits_budget_or_stops_at_floor(
            messages in proptest::collection::vec(arb_message(), 0..20),
            budget in 0usize..300,
            min in 0usize..5,
        ) {
            let list = list(messages);
            let kept = list.keep(budget, &KeepOptions::new(min, None));
            let non_system = kept.iter().filter(|m| m.role != Role::System).count();
            let original_non_system = list.iter().filter(|m| m.role != Role::System).count();
            prop_assert!(
                kept.token_count() <= budget
                    || non_system == min.min(original_non_system)
            );
        }

        #[test]
        fn keep_preserves_order_and_system_messages(
            messages in proptest::collection::vec(arb_message(), 0..20),
            budget in 0usize..300,
            min in 0usize..5,
        ) {
            let list = list(messages);
            let kept = list.keep(budget, &KeepOptions::new(min, None));

            let system_before: Vec<String> = list.iter().filter(|m| m.role == Role::System).map(|m| m.id.clone()).collect();
            let system_after: Vec<String> = kept.iter().filter(|m| m.role == Role::System).map(|m| m.id.clone()).collect();
            prop_assert_eq!(system_before, system_after);

            let positions: Vec<usize> = kept
                .iter()
                .map(|m| list.iter().position(|o| o.id == m.id).unwrap())
                .collect();
            prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

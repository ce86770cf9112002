//! Core domain types and the command timeline pipeline primitives for Strobe.

pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    pub type MessageId = u64;

    pub const API_RESPONSE_TYPE: &str = "api.response";

    /// One instrumentation event recorded in the timeline.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Command {
        pub message_id: MessageId,
        #[serde(rename = "type")]
        pub r#type: String,
        pub date: DateTime<Utc>,
        #[serde(default)]
        pub payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub connection_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub delta_time: Option<u64>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pub important: bool,
    }

    impl Command {
        pub fn is_type(&self, command_type: &str) -> bool {
            self.r#type == command_type
        }
    }

    /// A command that has been received but not yet assigned a message id.
    #[derive(Clone, Debug, PartialEq)]
    pub struct IncomingCommand {
        pub r#type: String,
        pub date: DateTime<Utc>,
        pub payload: Value,
        pub connection_id: Option<u64>,
        pub delta_time: Option<u64>,
        pub important: bool,
    }

    impl IncomingCommand {
        pub fn new(command_type: impl Into<String>, payload: Value, date: DateTime<Utc>) -> Self {
            Self {
                r#type: command_type.into(),
                date,
                payload,
                connection_id: None,
                delta_time: None,
                important: false,
            }
        }

        pub fn into_command(self, message_id: MessageId) -> Command {
            Command {
                message_id,
                r#type: self.r#type,
                date: self.date,
                payload: self.payload,
                connection_id: self.connection_id,
                delta_time: self.delta_time,
                important: self.important,
            }
        }
    }

    /// Borrowed view over an `api.response` payload.
    ///
    /// Every field is optional: senders are not required to fill in all of them and
    /// the exporters render whatever is present.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct ApiCall<'a> {
        pub method: Option<&'a str>,
        pub url: Option<&'a str>,
        pub request_headers: Option<&'a Map<String, Value>>,
        pub request_data: Option<&'a Value>,
        pub status: Option<&'a Value>,
        pub response_headers: Option<&'a Map<String, Value>>,
        pub response_body: Option<&'a Value>,
        pub duration: Option<&'a Value>,
    }

    impl<'a> ApiCall<'a> {
        pub fn from_payload(payload: &'a Value) -> Self {
            let request = payload.get("request");
            let response = payload.get("response");
            Self {
                method: request.and_then(|r| r.get("method")).and_then(Value::as_str),
                url: request.and_then(|r| r.get("url")).and_then(Value::as_str),
                request_headers: request.and_then(|r| r.get("headers")).and_then(Value::as_object),
                request_data: request.and_then(|r| r.get("data")).filter(|data| is_present(data)),
                status: response.and_then(|r| r.get("status")),
                response_headers: response
                    .and_then(|r| r.get("headers"))
                    .and_then(Value::as_object),
                response_body: response.and_then(|r| r.get("body")),
                duration: payload.get("duration"),
            }
        }

        pub fn method_or_default(&self) -> String {
            self.method
                .map(str::trim)
                .filter(|method| !method.is_empty())
                .unwrap_or("GET")
                .to_ascii_uppercase()
        }
    }

    /// Falsy JSON values (`null`, `""`, `false`, `0`) count as "no body". Empty
    /// objects and arrays are truthy and still count.
    pub fn is_present(value: &Value) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(flag) => *flag,
            Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
            Value::String(text) => !text.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Text rendering of a scalar for report lines: strings unquoted, `null` empty.
    pub fn display_value(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }
}

pub mod store {
    use std::collections::HashSet;

    use crate::strobe_core::types::{Command, IncomingCommand, MessageId};
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum StoreError {
        #[error("duplicate message id {0}")]
        DuplicateMessageId(MessageId),
    }

    /// Append-only, arrival-ordered command log.
    ///
    /// Message ids keep increasing across `clear`, so an id is never reused for the
    /// lifetime of the store.
    #[derive(Debug)]
    pub struct CommandStore {
        commands: Vec<Command>,
        next_id: MessageId,
    }

    impl Default for CommandStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CommandStore {
        pub fn new() -> Self {
            Self { commands: Vec::new(), next_id: 1 }
        }

        pub fn append(&mut self, incoming: IncomingCommand) -> &Command {
            let message_id = self.next_id;
            self.next_id += 1;
            self.commands.push(incoming.into_command(message_id));
            &self.commands[self.commands.len() - 1]
        }

        /// Loads previously exported commands, keeping their ids. All-or-nothing.
        pub fn import(&mut self, commands: Vec<Command>) -> Result<usize, StoreError> {
            let mut seen: HashSet<MessageId> =
                self.commands.iter().map(|command| command.message_id).collect();
            for command in &commands {
                if !seen.insert(command.message_id) {
                    return Err(StoreError::DuplicateMessageId(command.message_id));
                }
            }

            let count = commands.len();
            if let Some(max) = commands.iter().map(|command| command.message_id).max() {
                self.next_id = self.next_id.max(max.saturating_add(1));
            }
            self.commands.extend(commands);
            Ok(count)
        }

        pub fn clear(&mut self) {
            self.commands.clear();
        }

        pub fn commands(&self) -> &[Command] {
            &self.commands
        }

        pub fn len(&self) -> usize {
            self.commands.len()
        }

        pub fn is_empty(&self) -> bool {
            self.commands.is_empty()
        }
    }
}

pub mod filters {
    use std::collections::BTreeSet;

    use crate::strobe_core::types::{Command, MessageId};
    use crate::strobe_resolver::{CommandRegistry, ProjectionError};
    use regex::{Regex, RegexBuilder};
    use thiserror::Error;

    /// Search text and hidden command types. Survives store clears.
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct FilterState {
        search_text: String,
        hidden_types: BTreeSet<String>,
    }

    impl FilterState {
        pub fn new(search_text: impl Into<String>, hidden_types: BTreeSet<String>) -> Self {
            Self { search_text: search_text.into(), hidden_types }
        }

        pub fn search_text(&self) -> &str {
            &self.search_text
        }

        pub fn hidden_types(&self) -> &BTreeSet<String> {
            &self.hidden_types
        }

        pub fn is_hidden(&self, command_type: &str) -> bool {
            self.hidden_types.contains(command_type)
        }

        pub fn set_search(&mut self, search_text: impl Into<String>) -> bool {
            let search_text = search_text.into();
            if self.search_text == search_text {
                return false;
            }
            self.search_text = search_text;
            true
        }

        pub fn hide_type(&mut self, command_type: impl Into<String>) -> bool {
            self.hidden_types.insert(command_type.into())
        }

        pub fn show_type(&mut self, command_type: &str) -> bool {
            self.hidden_types.remove(command_type)
        }

        pub fn toggle_type(&mut self, command_type: &str) {
            if !self.hidden_types.remove(command_type) {
                self.hidden_types.insert(command_type.to_string());
            }
        }

        pub fn reset(&mut self) {
            self.search_text.clear();
            self.hidden_types.clear();
        }

        pub fn apply<'a>(
            &self,
            commands: &'a [Command],
            registry: &CommandRegistry,
        ) -> Result<Vec<&'a Command>, FilterError> {
            filter_commands(commands, &self.search_text, &self.hidden_types, registry)
        }
    }

    #[derive(Debug, Error, Clone, PartialEq)]
    pub enum FilterError {
        #[error("invalid regex pattern `{pattern}`: {message}")]
        InvalidRegex { pattern: String, message: String },
        #[error("cannot search command {message_id} ({command_type}): {source}")]
        Projection {
            message_id: MessageId,
            command_type: String,
            #[source]
            source: ProjectionError,
        },
    }

    /// Stable filter over `commands`: drops hidden types, then applies the search.
    pub fn filter_commands<'a>(
        commands: &'a [Command],
        search_text: &str,
        hidden_types: &BTreeSet<String>,
        registry: &CommandRegistry,
    ) -> Result<Vec<&'a Command>, FilterError> {
        let indices = filter_indices(commands, search_text, hidden_types, registry)?;
        Ok(indices.into_iter().map(|idx| &commands[idx]).collect())
    }

    fn filter_indices(
        commands: &[Command],
        search_text: &str,
        hidden_types: &BTreeSet<String>,
        registry: &CommandRegistry,
    ) -> Result<Vec<usize>, FilterError> {
        let query = CompiledQuery::compile(search_text)?;
        let mut matched = Vec::new();

        for (idx, command) in commands.iter().enumerate() {
            if query.matches(command, hidden_types, registry)? {
                matched.push(idx);
            }
        }

        Ok(matched)
    }

    /// A search text compiled once and reused for every command it is tested against.
    #[derive(Clone, Debug)]
    pub(crate) struct CompiledQuery(Option<QueryMatcher>);

    impl CompiledQuery {
        pub(crate) fn compile(search_text: &str) -> Result<Self, FilterError> {
            let query = search_text.trim();
            if query.is_empty() {
                return Ok(Self(None));
            }

            if let Some(pattern) = strip_regex_delimiters(query) {
                return Ok(Self(Some(QueryMatcher::Regex(compile_regex(pattern)?))));
            }

            Ok(Self(Some(QueryMatcher::Substring(query.to_lowercase()))))
        }

        pub(crate) fn matches(
            &self,
            command: &Command,
            hidden_types: &BTreeSet<String>,
            registry: &CommandRegistry,
        ) -> Result<bool, FilterError> {
            if hidden_types.contains(&command.r#type) {
                return Ok(false);
            }

            let Some(query) = &self.0 else {
                return Ok(true);
            };
            let text = registry.search_text(command).map_err(|source| FilterError::Projection {
                message_id: command.message_id,
                command_type: command.r#type.clone(),
                source,
            })?;
            Ok(query.is_match(&text))
        }
    }

    fn strip_regex_delimiters(query: &str) -> Option<&str> {
        query.strip_prefix('/').and_then(|q| q.strip_suffix('/'))
    }

    fn compile_regex(pattern: &str) -> Result<Regex, FilterError> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|error| FilterError::InvalidRegex {
                pattern: pattern.to_string(),
                message: error.to_string(),
            })
    }

    #[derive(Clone, Debug)]
    enum QueryMatcher {
        Substring(String),
        Regex(Regex),
    }

    impl QueryMatcher {
        fn is_match(&self, text: &str) -> bool {
            match self {
                Self::Substring(query) => text.to_lowercase().contains(query),
                Self::Regex(regex) => regex.is_match(text),
            }
        }
    }
}

pub mod order {
    /// Presentation order for the filtered sequence. Never touches the store.
    pub fn apply_order<T>(mut sequence: Vec<T>, reversed: bool) -> Vec<T> {
        if reversed {
            sequence.reverse();
        }
        sequence
    }
}

pub mod events {
    use std::sync::Arc;

    use crate::strobe_core::types::IncomingCommand;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Event {
        CommandReceived(IncomingCommand),
        TimelineCleared,
    }

    pub trait EventBus {
        type Error;
        type Subscription;

        fn emit(&self, event: Event) -> Result<(), Self::Error>;
        fn subscribe(&self) -> Result<Self::Subscription, Self::Error>;
    }

    impl<T> EventBus for &T
    where
        T: EventBus + ?Sized,
    {
        type Error = T::Error;
        type Subscription = T::Subscription;

        fn emit(&self, event: Event) -> Result<(), Self::Error> {
            (**self).emit(event)
        }

        fn subscribe(&self) -> Result<Self::Subscription, Self::Error> {
            (**self).subscribe()
        }
    }

    impl<T> EventBus for Arc<T>
    where
        T: EventBus + ?Sized,
    {
        type Error = T::Error;
        type Subscription = T::Subscription;

        fn emit(&self, event: Event) -> Result<(), Self::Error> {
            (**self).emit(event)
        }

        fn subscribe(&self) -> Result<Self::Subscription, Self::Error> {
            (**self).subscribe()
        }
    }
}

pub use events::{Event, EventBus};
pub use filters::{filter_commands, FilterError, FilterState};
pub use order::apply_order;
pub use store::{CommandStore, StoreError};
pub use types::{
    display_value, is_present, ApiCall, Command, IncomingCommand, MessageId, API_RESPONSE_TYPE,
};

#[cfg(test)]
mod tests {
    use super::filters::{filter_commands, FilterError, FilterState};
    use super::order::apply_order;
    use super::store::{CommandStore, StoreError};
    use super::types::{is_present, ApiCall, Command, IncomingCommand};
    use crate::strobe_resolver::CommandRegistry;
    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;

    fn incoming(command_type: &str, payload: Value) -> IncomingCommand {
        let date = Utc.timestamp_millis_opt(1_700_000_000_000).single().expect("valid date");
        IncomingCommand::new(command_type, payload, date)
    }

    #[fixture]
    fn registry() -> CommandRegistry {
        CommandRegistry::with_builtin()
    }

    #[fixture]
    fn store() -> CommandStore {
        let mut store = CommandStore::new();
        store.append(incoming("log", json!({"level": "debug", "message": "Hello there"})));
        store.append(incoming(
            "state.action.dispatch",
            json!({"action": {"type": "LOGIN_REQUEST", "user": "sam"}}),
        ));
        store.append(incoming(
            "api.response",
            json!({
                "duration": 12,
                "request": {"method": "GET", "url": "http://x/y", "headers": {}, "data": null},
                "response": {"status": 200, "headers": {}, "body": "{}"}
            }),
        ));
        store.append(incoming("custom.thing", json!({"note": "hello from custom"})));
        store
    }

    fn types(commands: &[&Command]) -> Vec<String> {
        commands.iter().map(|command| command.r#type.clone()).collect()
    }

    #[test]
    fn append_assigns_monotonic_ids() {
        let mut store = CommandStore::new();
        let first = store.append(incoming("log", json!({}))).message_id;
        let second = store.append(incoming("log", json!({}))).message_id;
        store.clear();
        let third = store.append(incoming("log", json!({}))).message_id;

        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn import_preserves_ids_and_rejects_duplicates() {
        let mut source = CommandStore::new();
        source.append(incoming("log", json!({"message": "a"})));
        source.append(incoming("log", json!({"message": "b"})));
        let exported = source.commands().to_vec();

        let mut store = CommandStore::new();
        assert_eq!(store.import(exported.clone()), Ok(2));
        assert_eq!(store.commands(), exported.as_slice());
        assert_eq!(store.append(incoming("log", json!({}))).message_id, 3);

        let err = store.import(vec![exported[0].clone()]).unwrap_err();
        assert_eq!(err, StoreError::DuplicateMessageId(1));
        assert_eq!(store.len(), 3);
    }

    #[rstest]
    fn empty_search_only_drops_hidden_types(store: CommandStore, registry: CommandRegistry) {
        let hidden: BTreeSet<String> = ["log".to_string(), "api.response".to_string()].into();
        let filtered = filter_commands(store.commands(), "", &hidden, &registry).unwrap();
        assert_eq!(types(&filtered), vec!["state.action.dispatch", "custom.thing"]);

        let everything = filter_commands(store.commands(), "   ", &BTreeSet::new(), &registry).unwrap();
        assert_eq!(everything.len(), store.len());
    }

    #[rstest]
    #[case("hello", vec!["log", "custom.thing"])]
    #[case("HELLO", vec!["log", "custom.thing"])]
    #[case("login_request", vec!["state.action.dispatch"])]
    #[case("http://x/y", vec!["api.response"])]
    #[case("/^hello there$/", Vec::<&str>::new())]
    #[case("/hello\\s+there/", vec!["log"])]
    fn search_matches_type_projection(
        store: CommandStore,
        registry: CommandRegistry,
        #[case] query: &str,
        #[case] expected: Vec<&str>,
    ) {
        let filtered = filter_commands(store.commands(), query, &BTreeSet::new(), &registry).unwrap();
        assert_eq!(types(&filtered), expected);
    }

    #[rstest]
    fn search_and_hidden_types_combine(store: CommandStore, registry: CommandRegistry) {
        let mut state = FilterState::default();
        state.set_search("hello");
        state.hide_type("custom.thing");

        let filtered = state.apply(store.commands(), &registry).unwrap();
        assert_eq!(types(&filtered), vec!["log"]);
    }

    #[rstest]
    fn invalid_regex_returns_error(store: CommandStore, registry: CommandRegistry) {
        let result = filter_commands(store.commands(), "/[a-/", &BTreeSet::new(), &registry);
        assert!(matches!(result, Err(FilterError::InvalidRegex { .. })));
    }

    #[rstest]
    fn malformed_payload_returns_projection_error(registry: CommandRegistry) {
        let mut store = CommandStore::new();
        store.append(incoming("api.response", json!("not an object")));

        let result = filter_commands(store.commands(), "x", &BTreeSet::new(), &registry);
        assert!(matches!(result, Err(FilterError::Projection { message_id: 1, .. })));

        let unsearched = filter_commands(store.commands(), "", &BTreeSet::new(), &registry);
        assert_eq!(unsearched.unwrap().len(), 1);
    }

    #[test]
    fn toggle_type_flips_visibility() {
        let mut state = FilterState::default();
        state.toggle_type("log");
        assert!(state.is_hidden("log"));
        state.toggle_type("log");
        assert!(!state.is_hidden("log"));
    }

    #[rstest]
    fn double_reverse_is_identity(store: CommandStore) {
        let sequence: Vec<u64> = store.commands().iter().map(|c| c.message_id).collect();
        let reversed = apply_order(sequence.clone(), true);
        assert_eq!(reversed, vec![4, 3, 2, 1]);
        assert_eq!(apply_order(reversed, true), sequence);
        assert_eq!(apply_order(sequence.clone(), false), sequence);
    }

    #[test]
    fn command_serializes_with_camel_case_fields() {
        let mut store = CommandStore::new();
        let command = store.append(incoming("log", json!({"message": "hi"}))).clone();
        let value = serde_json::to_value(&command).unwrap();

        assert_eq!(value["messageId"], 1);
        assert_eq!(value["type"], "log");
        assert_eq!(value["date"], "2023-11-14T22:13:20Z");
        assert!(value.get("important").is_none());

        let parsed: Command = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn api_call_view_reads_nested_fields() {
        let payload = json!({
            "duration": 12,
            "request": {"method": "post", "url": "http://x/y", "headers": {"A": "1"}, "data": ""},
            "response": {"status": 201, "headers": {}, "body": null}
        });
        let call = ApiCall::from_payload(&payload);

        assert_eq!(call.method_or_default(), "POST");
        assert_eq!(call.url, Some("http://x/y"));
        assert!(call.request_data.is_none());
        assert_eq!(call.status, Some(&json!(201)));
        assert_eq!(call.request_headers.map(|h| h.len()), Some(1));
    }

    #[rstest]
    #[case(json!(null), false)]
    #[case(json!(""), false)]
    #[case(json!(false), false)]
    #[case(json!(0), false)]
    #[case(json!(0.0), false)]
    #[case(json!(true), true)]
    #[case(json!(-1), true)]
    #[case(json!("0"), true)]
    #[case(json!([]), true)]
    #[case(json!({}), true)]
    fn request_data_follows_truthiness(#[case] data: Value, #[case] present: bool) {
        assert_eq!(is_present(&data), present);
        let payload = json!({"request": {"url": "http://x", "data": data}});
        assert_eq!(ApiCall::from_payload(&payload).request_data.is_some(), present);
    }
}

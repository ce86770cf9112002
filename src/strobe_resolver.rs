//! Command type resolver: capability contracts keyed by command type.
//!
//! Each registered [`CommandType`] knows how to title, summarize, render and project a
//! command into searchable text. Types without a registration resolve to
//! [`Resolved::Unknown`]; the timeline skips rendering them but they stay in the store
//! and in every export.

use std::collections::HashMap;

use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use serde_json::Value;
use thiserror::Error;

use crate::strobe_core::types::{display_value, ApiCall, Command, API_RESPONSE_TYPE};
use crate::strobe_export::{pretty_body, replay_command};

const SUMMARY_LIMIT: usize = 160;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("expected an object payload, found {found}")]
    NotAnObject { found: &'static str },
    #[error("missing `{field}` in payload")]
    MissingField { field: &'static str },
}

/// Capability contract a command type supplies to the timeline.
pub trait CommandType: Send + Sync {
    fn type_name(&self) -> &str;

    fn title(&self, _command: &Command) -> String {
        self.type_name().to_ascii_uppercase()
    }

    /// One-line summary shown in the timeline list.
    fn summary(&self, command: &Command) -> String;

    /// Detail view for the selected command.
    fn render(&self, command: &Command) -> Vec<Line<'static>> {
        json_lines(&command.payload)
    }

    /// Text the search predicate runs against.
    fn search_text(&self, command: &Command) -> Result<String, ProjectionError>;
}

/// Outcome of a type lookup.
pub enum Resolved<'a> {
    Known(&'a dyn CommandType),
    Unknown,
}

impl<'a> Resolved<'a> {
    pub fn known(self) -> Option<&'a dyn CommandType> {
        match self {
            Self::Known(contract) => Some(contract),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

pub struct CommandRegistry {
    types: HashMap<String, Box<dyn CommandType>>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self { types: HashMap::new() }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(LogCommand));
        registry.register(Box::new(ApiResponseCommand));
        registry.register(Box::new(StateActionCommand { type_name: "state.action.dispatch" }));
        registry.register(Box::new(StateActionCommand { type_name: "state.action.complete" }));
        for fields in BUILTIN_FIELD_TYPES {
            registry.register(Box::new(fields.clone()));
        }
        registry
    }

    /// Registers a contract, returning the one it replaced.
    pub fn register(&mut self, contract: Box<dyn CommandType>) -> Option<Box<dyn CommandType>> {
        self.types.insert(contract.type_name().to_string(), contract)
    }

    pub fn resolve(&self, command_type: &str) -> Resolved<'_> {
        match self.types.get(command_type) {
            Some(contract) => Resolved::Known(contract.as_ref()),
            None => Resolved::Unknown,
        }
    }

    /// Searchable projection of a command: its type followed by the contract's text.
    /// Unregistered types fall back to the compact payload JSON.
    pub fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
        let body = match self.resolve(&command.r#type) {
            Resolved::Known(contract) => contract.search_text(command)?,
            Resolved::Unknown => command.payload.to_string(),
        };
        Ok(format!("{} {}", command.r#type, body))
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn require_object(payload: &Value) -> Result<&serde_json::Map<String, Value>, ProjectionError> {
    payload.as_object().ok_or(ProjectionError::NotAnObject { found: json_kind(payload) })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    value.chars().take(max_len).collect()
}

fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_lines(value: &Value) -> Vec<Line<'static>> {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    text.lines().map(|line| Line::raw(line.to_string())).collect()
}

fn label_line(label: &'static str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(value),
    ])
}

struct LogCommand;

impl LogCommand {
    fn message(command: &Command) -> String {
        match command.payload.get("message") {
            Some(message) => text_of(message),
            None => text_of(&command.payload),
        }
    }

    fn level(command: &Command) -> &str {
        command.payload.get("level").and_then(Value::as_str).unwrap_or("debug")
    }
}

impl CommandType for LogCommand {
    fn type_name(&self) -> &str {
        "log"
    }

    fn title(&self, command: &Command) -> String {
        Self::level(command).to_ascii_uppercase()
    }

    fn summary(&self, command: &Command) -> String {
        truncate(&single_line(&Self::message(command)), SUMMARY_LIMIT)
    }

    fn render(&self, command: &Command) -> Vec<Line<'static>> {
        let color = match Self::level(command) {
            "error" => Color::Red,
            "warn" => Color::Yellow,
            _ => Color::Reset,
        };
        let mut lines: Vec<Line<'static>> = Self::message(command)
            .lines()
            .map(|line| Line::styled(line.to_string(), Style::default().fg(color)))
            .collect();
        if let Some(stack) = command.payload.get("stack") {
            lines.push(Line::raw(""));
            lines.extend(json_lines(stack));
        }
        lines
    }

    fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
        Ok(format!("{} {}", Self::level(command), Self::message(command)))
    }
}

struct ApiResponseCommand;

impl CommandType for ApiResponseCommand {
    fn type_name(&self) -> &str {
        API_RESPONSE_TYPE
    }

    fn title(&self, _command: &Command) -> String {
        "API RESPONSE".to_string()
    }

    fn summary(&self, command: &Command) -> String {
        let call = ApiCall::from_payload(&command.payload);
        let mut summary = format!(
            "{} {} {}",
            call.method_or_default(),
            call.url.unwrap_or_default(),
            display_value(call.status)
        );
        if call.duration.is_some() {
            summary.push_str(&format!(" ({}ms)", display_value(call.duration)));
        }
        truncate(summary.trim(), SUMMARY_LIMIT)
    }

    fn render(&self, command: &Command) -> Vec<Line<'static>> {
        let call = ApiCall::from_payload(&command.payload);
        let mut lines = vec![
            label_line("Method: ", call.method_or_default()),
            label_line("URL: ", call.url.unwrap_or_default().to_string()),
            label_line("Status: ", display_value(call.status)),
            label_line("Duration: ", format!("{}ms", display_value(call.duration))),
        ];
        if let Some(data) = call.request_data {
            lines.push(Line::raw(""));
            lines.push(label_line("Request Body:", String::new()));
            lines.extend(pretty_body(data).lines().map(|line| Line::raw(line.to_string())));
        }
        if let Some(body) = call.response_body {
            lines.push(Line::raw(""));
            lines.push(label_line("Response Body:", String::new()));
            lines.extend(pretty_body(body).lines().map(|line| Line::raw(line.to_string())));
        }
        lines.push(Line::raw(""));
        lines.push(Line::styled(
            replay_command(&command.payload),
            Style::default().fg(Color::DarkGray),
        ));
        lines
    }

    fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
        let payload = require_object(&command.payload)?;
        let request = payload.get("request").ok_or(ProjectionError::MissingField { field: "request" })?;
        require_object(request)?;
        let response =
            payload.get("response").ok_or(ProjectionError::MissingField { field: "response" })?;
        require_object(response)?;

        let call = ApiCall::from_payload(&command.payload);
        let mut text = format!(
            "{} {} {}",
            call.method_or_default(),
            call.url.unwrap_or_default(),
            display_value(call.status)
        );
        if let Some(data) = call.request_data {
            text.push(' ');
            text.push_str(&text_of(data));
        }
        if let Some(body) = call.response_body {
            text.push(' ');
            text.push_str(&text_of(body));
        }
        Ok(text)
    }
}

struct StateActionCommand {
    type_name: &'static str,
}

impl StateActionCommand {
    fn action_type(command: &Command) -> Option<&str> {
        command
            .payload
            .get("action")
            .and_then(|action| action.get("type"))
            .and_then(Value::as_str)
    }
}

impl CommandType for StateActionCommand {
    fn type_name(&self) -> &str {
        self.type_name
    }

    fn title(&self, _command: &Command) -> String {
        "ACTION".to_string()
    }

    fn summary(&self, command: &Command) -> String {
        let name = command
            .payload
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| Self::action_type(command))
            .unwrap_or_default();
        match command.payload.get("ms").and_then(Value::as_u64) {
            Some(ms) => format!("{name} ({ms}ms)"),
            None => name.to_string(),
        }
    }

    fn render(&self, command: &Command) -> Vec<Line<'static>> {
        match command.payload.get("action") {
            Some(action) => json_lines(action),
            None => json_lines(&command.payload),
        }
    }

    fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
        let payload = require_object(&command.payload)?;
        let action = payload.get("action").map(Value::to_string).unwrap_or_default();
        let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
        Ok(format!("{} {name} {action}", Self::action_type(command).unwrap_or_default()))
    }
}

/// Contract for payload shapes that only need a few fields pulled out by JSON pointer.
#[derive(Clone, Debug)]
struct FieldCommand {
    type_name: &'static str,
    title: &'static str,
    summary: &'static [&'static str],
    search: &'static [&'static str],
}

impl FieldCommand {
    fn collect(command: &Command, pointers: &[&str]) -> Vec<String> {
        pointers
            .iter()
            .filter_map(|pointer| command.payload.pointer(pointer))
            .filter(|value| !value.is_null())
            .map(text_of)
            .collect()
    }
}

impl CommandType for FieldCommand {
    fn type_name(&self) -> &str {
        self.type_name
    }

    fn title(&self, _command: &Command) -> String {
        self.title.to_string()
    }

    fn summary(&self, command: &Command) -> String {
        truncate(&single_line(&Self::collect(command, self.summary).join(" ")), SUMMARY_LIMIT)
    }

    fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
        require_object(&command.payload)?;
        Ok(Self::collect(command, self.search).join(" "))
    }
}

const BUILTIN_FIELD_TYPES: &[FieldCommand] = &[
    FieldCommand {
        type_name: "display",
        title: "DISPLAY",
        summary: &["/name", "/preview"],
        search: &["/name", "/preview", "/value"],
    },
    FieldCommand {
        type_name: "image",
        title: "IMAGE",
        summary: &["/caption", "/filename"],
        search: &["/caption", "/filename", "/uri"],
    },
    FieldCommand {
        type_name: "state.values.change",
        title: "STATE CHANGE",
        summary: &["/changes/0/path"],
        search: &["/changes"],
    },
    FieldCommand {
        type_name: "state.values.response",
        title: "STATE",
        summary: &["/path"],
        search: &["/path", "/value"],
    },
    FieldCommand {
        type_name: "state.keys.response",
        title: "KEYS",
        summary: &["/path"],
        search: &["/path", "/keys"],
    },
    FieldCommand {
        type_name: "client.intro",
        title: "CONNECTION",
        summary: &["/name", "/platform"],
        search: &["/name", "/platform", "/reactotronVersion"],
    },
    FieldCommand {
        type_name: "benchmark.report",
        title: "BENCHMARK",
        summary: &["/title"],
        search: &["/title", "/steps"],
    },
    FieldCommand {
        type_name: "asyncStorage.mutation",
        title: "ASYNC STORAGE",
        summary: &["/action"],
        search: &["/action", "/data"],
    },
    FieldCommand {
        type_name: "saga.task.complete",
        title: "SAGA",
        summary: &["/triggerType", "/description"],
        search: &["/triggerType", "/description", "/children"],
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strobe_core::types::IncomingCommand;
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    fn command(command_type: &str, payload: Value) -> Command {
        IncomingCommand::new(command_type, payload, Utc::now()).into_command(7)
    }

    struct CustomType;

    impl CommandType for CustomType {
        fn type_name(&self) -> &str {
            "custom.metric"
        }

        fn summary(&self, command: &Command) -> String {
            command.payload["name"].as_str().unwrap_or_default().to_string()
        }

        fn search_text(&self, command: &Command) -> Result<String, ProjectionError> {
            Ok(self.summary(command))
        }
    }

    #[rstest]
    #[case("log")]
    #[case("api.response")]
    #[case("state.action.dispatch")]
    #[case("client.intro")]
    fn builtin_types_resolve(#[case] command_type: &str) {
        let registry = CommandRegistry::with_builtin();
        assert!(registry.resolve(command_type).is_known());
    }

    #[test]
    fn unknown_type_resolves_to_unknown() {
        let registry = CommandRegistry::with_builtin();
        assert!(matches!(registry.resolve("never.registered"), Resolved::Unknown));

        let cmd = command("never.registered", json!({"a": "needle"}));
        let text = registry.search_text(&cmd).unwrap();
        assert_eq!(text, r#"never.registered {"a":"needle"}"#);
    }

    #[test]
    fn register_replaces_and_returns_previous() {
        let mut registry = CommandRegistry::empty();
        assert!(registry.register(Box::new(CustomType)).is_none());
        assert!(registry.register(Box::new(CustomType)).is_some());
        assert_eq!(registry.registered_types(), vec!["custom.metric"]);

        let cmd = command("custom.metric", json!({"name": "fps"}));
        let contract = registry.resolve("custom.metric").known().unwrap();
        assert_eq!(contract.title(&cmd), "CUSTOM.METRIC");
        assert_eq!(contract.summary(&cmd), "fps");
    }

    #[test]
    fn api_response_summary_and_projection() {
        let registry = CommandRegistry::with_builtin();
        let cmd = command(
            "api.response",
            json!({
                "duration": 12,
                "request": {"method": "get", "url": "http://x/y", "headers": {}},
                "response": {"status": 200, "headers": {}, "body": {"ok": true}}
            }),
        );
        let contract = registry.resolve("api.response").known().unwrap();
        assert_eq!(contract.summary(&cmd), "GET http://x/y 200 (12ms)");

        let text = registry.search_text(&cmd).unwrap();
        assert!(text.contains("http://x/y"));
        assert!(text.contains(r#"{"ok":true}"#));

        let rendered: Vec<String> = contract.render(&cmd).iter().map(|line| line.to_string()).collect();
        assert!(rendered.iter().any(|line| line == "Status: 200"));
        assert!(rendered.last().unwrap().starts_with("curl -X GET 'http://x/y'"));
    }

    #[rstest]
    #[case(json!("oops"), ProjectionError::NotAnObject { found: "string" })]
    #[case(json!({"response": {}}), ProjectionError::MissingField { field: "request" })]
    #[case(json!({"request": {}, "response": 3}), ProjectionError::NotAnObject { found: "number" })]
    fn api_response_projection_rejects_malformed_payload(
        #[case] payload: Value,
        #[case] expected: ProjectionError,
    ) {
        let registry = CommandRegistry::with_builtin();
        let err = registry.search_text(&command("api.response", payload)).unwrap_err();
        assert_eq!(err, expected);
    }

    #[test]
    fn log_title_uses_level() {
        let registry = CommandRegistry::with_builtin();
        let cmd = command("log", json!({"level": "warn", "message": "careful\nnow"}));
        let contract = registry.resolve("log").known().unwrap();
        assert_eq!(contract.title(&cmd), "WARN");
        assert_eq!(contract.summary(&cmd), "careful now");
        assert_eq!(contract.render(&cmd).len(), 2);
    }

    #[test]
    fn field_command_uses_pointers() {
        let registry = CommandRegistry::with_builtin();
        let cmd = command("display", json!({"name": "CART", "preview": "3 items", "value": [1, 2]}));
        let contract = registry.resolve("display").known().unwrap();
        assert_eq!(contract.summary(&cmd), "CART 3 items");
        assert_eq!(registry.search_text(&cmd).unwrap(), "display CART 3 items [1,2]");
    }
}

//! Timeline exports: the raw JSON log and the API-call report.
//!
//! Rendering is pure. [`Exporter`] adds the side effects (destination prompt, file
//! write, user notices) behind small traits so the TUI, the CLI and tests can each
//! plug in their own.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::SecondsFormat;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::strobe_core::types::{display_value, ApiCall, Command, API_RESPONSE_TYPE};

pub const NO_API_CALLS_TITLE: &str = "No API Calls";
pub const NO_API_CALLS_MESSAGE: &str = "No API calls found in the timeline to export.";
pub const REPORT_SEPARATOR: &str = "------";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionGroup {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
}

const JSON_FILES: ExtensionGroup = ExtensionGroup { name: "JSON Files", extensions: &["json"] };
const TEXT_FILES: ExtensionGroup = ExtensionGroup { name: "Text Files", extensions: &["txt"] };
const ALL_FILES: ExtensionGroup = ExtensionGroup { name: "All Files", extensions: &["*"] };

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    pub title: String,
    pub default_dir: PathBuf,
    pub default_name: String,
    pub filters: Vec<ExtensionGroup>,
}

impl SaveOptions {
    pub fn timeline_log(default_dir: &Path, epoch_millis: i64) -> Self {
        Self {
            title: "Export Timeline Log".to_string(),
            default_dir: default_dir.to_path_buf(),
            default_name: format!("timeline-log-{epoch_millis}.json"),
            filters: vec![JSON_FILES, ALL_FILES],
        }
    }

    pub fn api_calls(default_dir: &Path, epoch_millis: i64) -> Self {
        Self {
            title: "Export API Calls".to_string(),
            default_dir: default_dir.to_path_buf(),
            default_name: format!("api-calls-{epoch_millis}.txt"),
            filters: vec![TEXT_FILES, ALL_FILES],
        }
    }

    pub fn default_path(&self) -> PathBuf {
        self.default_dir.join(&self.default_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, title: title.into(), message: message.into() }
    }
}

pub trait DestinationChooser: Send + Sync {
    /// `None` means the user cancelled.
    fn choose_save_destination(&self, options: SaveOptions) -> BoxFuture<'_, Option<PathBuf>>;
}

pub trait FileWriter: Send + Sync {
    fn write_text<'a>(&'a self, path: &'a Path, content: &'a str) -> BoxFuture<'a, io::Result<()>>;
}

pub trait NoticePresenter: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to serialize timeline: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    RawLog,
    ApiCalls,
}

/// A snapshot of the store handed to an export worker.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub kind: ExportKind,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Written { path: PathBuf, count: usize },
    Cancelled,
    Empty,
}

/// Pretty-printed JSON array of every command, in store order.
pub fn render_raw_log(commands: &[Command]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(commands)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReport {
    pub text: String,
    pub count: usize,
}

/// Human-readable report of every `api.response` command, or `None` when there are none.
pub fn render_api_report(commands: &[Command]) -> Option<ApiReport> {
    let mut text = String::new();
    let mut count = 0;

    for command in commands.iter().filter(|command| command.is_type(API_RESPONSE_TYPE)) {
        count += 1;
        write_report_block(&mut text, count, command);
    }

    (count > 0).then_some(ApiReport { text, count })
}

fn write_report_block(out: &mut String, index: usize, command: &Command) {
    let call = ApiCall::from_payload(&command.payload);

    out.push_str(&format!("API Call #{index}\n"));
    out.push_str(&format!(
        "Timestamp: {}\n",
        command.date.to_rfc3339_opts(SecondsFormat::Millis, true)
    ));
    out.push_str(&format!("Method: {}\n", call.method.unwrap_or_default()));
    out.push_str(&format!("URL: {}\n", single_line(call.url.unwrap_or_default())));
    out.push_str(&format!("Status: {}\n", display_value(call.status)));
    out.push_str(&format!("Duration: {}ms\n", display_value(call.duration)));

    if let Some(headers) = call.request_headers {
        out.push_str("Request Headers:\n");
        write_headers(out, headers);
    }

    if let Some(data) = call.request_data {
        out.push_str("Request Body:\n");
        out.push_str(&pretty_body(data));
        out.push('\n');
    }

    out.push_str("Response Headers:\n");
    if let Some(headers) = call.response_headers {
        write_headers(out, headers);
    }

    out.push_str("Response Body:\n");
    if let Some(body) = call.response_body {
        out.push_str(&pretty_body(body));
    }
    out.push('\n');

    out.push_str("cURL Command:\n");
    out.push_str(&replay_command(&command.payload));
    out.push('\n');
    out.push_str(REPORT_SEPARATOR);
    out.push_str("\n\n");
}

fn write_headers(out: &mut String, headers: &Map<String, Value>) {
    for (key, value) in headers {
        out.push_str(&format!("  {}: {}\n", single_line(key), single_line(&display_value(Some(value)))));
    }
}

/// Pretty JSON for a body. Strings are decoded first; text that is not JSON is
/// returned as is.
pub fn pretty_body(body: &Value) -> String {
    let decoded = match body {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(decoded) => decoded,
            Err(_) => return text.clone(),
        },
        other => other.clone(),
    };
    serde_json::to_string_pretty(&decoded).unwrap_or_else(|_| decoded.to_string())
}

/// Single-line curl invocation that replays the request of an `api.response` payload.
pub fn replay_command(payload: &Value) -> String {
    let call = ApiCall::from_payload(payload);
    let mut command = format!(
        "curl -X {} {}",
        call.method_or_default(),
        shell_quote(&single_line(call.url.unwrap_or_default()))
    );

    if let Some(headers) = call.request_headers {
        for (key, value) in headers {
            command.push_str(" -H ");
            let header = format!("{key}: {}", display_value(Some(value)));
            command.push_str(&shell_quote(&single_line(&header)));
        }
    }

    if let Some(data) = call.request_data {
        command.push_str(" --data ");
        command.push_str(&shell_quote(&replay_body(data)));
    }

    command
}

fn replay_body(data: &Value) -> String {
    match data {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(decoded) => decoded.to_string(),
            Err(_) => single_line(text),
        },
        other => other.to_string(),
    }
}

fn single_line(text: &str) -> String {
    text.replace('\r', "\\r").replace('\n', "\\n")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Export directory: the configured one, then the user's Downloads, then the cwd.
pub fn default_export_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .or_else(dirs::download_dir)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Exporter<D, W, N, C> {
    chooser: D,
    writer: W,
    notices: N,
    export_dir: PathBuf,
    clock: C,
}

impl<D, W, N, C> Exporter<D, W, N, C>
where
    D: DestinationChooser,
    W: FileWriter,
    N: NoticePresenter,
    C: Fn() -> i64 + Send + Sync,
{
    pub fn new(chooser: D, writer: W, notices: N, export_dir: PathBuf, clock: C) -> Self {
        Self { chooser, writer, notices, export_dir, clock }
    }

    pub async fn export_raw_log(&self, commands: &[Command]) -> Result<ExportOutcome, ExportError> {
        let content = render_raw_log(commands)?;
        let options = SaveOptions::timeline_log(&self.export_dir, (self.clock)());
        self.write_to_chosen(options, content, commands.len()).await
    }

    pub async fn export_api_calls(&self, commands: &[Command]) -> Result<ExportOutcome, ExportError> {
        let Some(report) = render_api_report(commands) else {
            self.notices.notify(Notice::new(NoticeKind::Info, NO_API_CALLS_TITLE, NO_API_CALLS_MESSAGE));
            return Ok(ExportOutcome::Empty);
        };
        let options = SaveOptions::api_calls(&self.export_dir, (self.clock)());
        self.write_to_chosen(options, report.text, report.count).await
    }

    pub async fn run(&self, job: ExportJob) -> Result<ExportOutcome, ExportError> {
        match job.kind {
            ExportKind::RawLog => self.export_raw_log(&job.commands).await,
            ExportKind::ApiCalls => self.export_api_calls(&job.commands).await,
        }
    }

    async fn write_to_chosen(
        &self,
        options: SaveOptions,
        content: String,
        count: usize,
    ) -> Result<ExportOutcome, ExportError> {
        let title = options.title.clone();
        let Some(path) = self.chooser.choose_save_destination(options).await else {
            debug!(export = %title, "export cancelled");
            return Ok(ExportOutcome::Cancelled);
        };

        if let Err(source) = self.writer.write_text(&path, &content).await {
            let error = ExportError::Write { path, source };
            warn!(export = %title, error = %error, "export failed");
            self.notices.notify(Notice::new(NoticeKind::Error, "Export Failed", error.to_string()));
            return Err(error);
        }

        info!(export = %title, path = %path.display(), count, "export written");
        self.notices.notify(Notice::new(
            NoticeKind::Info,
            "Export Complete",
            format!("Exported {count} entries to {}", path.display()),
        ));
        Ok(ExportOutcome::Written { path, count })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileWriter;

impl FileWriter for TokioFileWriter {
    fn write_text<'a>(&'a self, path: &'a Path, content: &'a str) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(tokio::fs::write(path, content))
    }
}

/// Non-interactive chooser: a fixed path, or the suggested default.
#[derive(Debug, Clone, Default)]
pub struct PresetDestination(pub Option<PathBuf>);

impl DestinationChooser for PresetDestination {
    fn choose_save_destination(&self, options: SaveOptions) -> BoxFuture<'_, Option<PathBuf>> {
        let path = self.0.clone().unwrap_or_else(|| options.default_path());
        Box::pin(async move { Some(path) })
    }
}

/// Prompt forwarded to whoever owns the screen.
#[derive(Debug)]
pub struct DestinationRequest {
    pub options: SaveOptions,
    pub reply: oneshot::Sender<Option<PathBuf>>,
}

#[derive(Debug, Clone)]
pub struct ChannelChooser {
    requests: mpsc::UnboundedSender<DestinationRequest>,
}

impl ChannelChooser {
    pub fn new(requests: mpsc::UnboundedSender<DestinationRequest>) -> Self {
        Self { requests }
    }
}

impl DestinationChooser for ChannelChooser {
    fn choose_save_destination(&self, options: SaveOptions) -> BoxFuture<'_, Option<PathBuf>> {
        Box::pin(async move {
            let (reply, response) = oneshot::channel();
            if self.requests.send(DestinationRequest { options, reply }).is_err() {
                return None;
            }
            response.await.ok().flatten()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChannelNotices {
    notices: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotices {
    pub fn new(notices: mpsc::UnboundedSender<Notice>) -> Self {
        Self { notices }
    }
}

impl NoticePresenter for ChannelNotices {
    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

/// Notices for headless use go to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotices;

impl NoticePresenter for LogNotices {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Info => info!(title = %notice.title, "{}", notice.message),
            NoticeKind::Warning => warn!(title = %notice.title, "{}", notice.message),
            NoticeKind::Error => tracing::error!(title = %notice.title, "{}", notice.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strobe_core::types::IncomingCommand;
    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};
    use serde_json::json;
    use std::sync::Mutex;

    fn command(message_id: u64, command_type: &str, payload: Value) -> Command {
        let date = Utc.timestamp_millis_opt(1_700_000_000_123).single().expect("valid date");
        IncomingCommand::new(command_type, payload, date).into_command(message_id)
    }

    #[fixture]
    fn api_payload() -> Value {
        json!({
            "duration": 12,
            "request": {
                "method": "POST",
                "url": "http://x/y",
                "headers": {"Content-Type": "application/json", "X-Trace": "a'b"},
                "data": "{\"name\": \"sam\"}"
            },
            "response": {
                "status": 201,
                "headers": {"server": "demo"},
                "body": "{\"id\":1}"
            }
        })
    }

    #[derive(Default)]
    struct RecordingNotices {
        notices: Mutex<Vec<Notice>>,
    }

    impl NoticePresenter for &RecordingNotices {
        fn notify(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct CancelChooser;

    impl DestinationChooser for CancelChooser {
        fn choose_save_destination(&self, _options: SaveOptions) -> BoxFuture<'_, Option<PathBuf>> {
            Box::pin(async { None })
        }
    }

    #[derive(Default)]
    struct PanicChooser;

    impl DestinationChooser for PanicChooser {
        fn choose_save_destination(&self, options: SaveOptions) -> BoxFuture<'_, Option<PathBuf>> {
            panic!("chooser must not be prompted: {}", options.title);
        }
    }

    #[test]
    fn raw_log_of_empty_store_is_empty_array() {
        assert_eq!(render_raw_log(&[]).unwrap(), "[]");
    }

    #[test]
    fn raw_log_uses_two_space_indent() {
        let text = render_raw_log(&[command(1, "log", json!({"message": "hi"}))]).unwrap();
        assert!(text.starts_with("[\n  {\n    \"messageId\": 1,"));
        let parsed: Vec<Command> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[rstest]
    fn api_report_block_layout(api_payload: Value) {
        let commands = vec![
            command(1, "log", json!({"message": "skip"})),
            command(2, "api.response", api_payload),
        ];
        let report = render_api_report(&commands).unwrap();
        assert_eq!(report.count, 1);

        let expected = "API Call #1\n\
Timestamp: 2023-11-14T22:13:20.123Z\n\
Method: POST\n\
URL: http://x/y\n\
Status: 201\n\
Duration: 12ms\n\
Request Headers:\n  Content-Type: application/json\n  X-Trace: a'b\n\
Request Body:\n{\n  \"name\": \"sam\"\n}\n\
Response Headers:\n  server: demo\n\
Response Body:\n{\n  \"id\": 1\n}\n\
cURL Command:\n\
curl -X POST 'http://x/y' -H 'Content-Type: application/json' -H 'X-Trace: a'\\''b' --data '{\"name\":\"sam\"}'\n\
------\n\n";
        assert_eq!(report.text, expected);
    }

    #[test]
    fn api_report_skips_missing_request_sections() {
        let payload = json!({
            "duration": 3,
            "request": {"method": "GET", "url": "http://x", "data": null},
            "response": {"status": 200, "headers": {}, "body": "plain text"}
        });
        let report = render_api_report(&[command(1, "api.response", payload)]).unwrap();
        assert!(!report.text.contains("Request Headers:"));
        assert!(!report.text.contains("Request Body:"));
        assert!(report.text.contains("Response Body:\nplain text\n"));
    }

    #[test]
    fn api_report_keeps_header_values_on_one_line() {
        let payload = json!({
            "request": {"method": "GET", "url": "http://x\nEvil: 1", "headers": {"X-Multi": "a\nb"}},
            "response": {"status": 200, "headers": {"Set-Cookie": "c=1\r\nd=2"}, "body": null}
        });
        let report = render_api_report(&[command(1, "api.response", payload.clone())]).unwrap();

        assert!(report.text.contains("URL: http://x\\nEvil: 1\n"));
        assert!(report.text.contains("Request Headers:\n  X-Multi: a\\nb\nResponse Headers:"));
        assert!(report.text.contains("Response Headers:\n  Set-Cookie: c=1\\r\\nd=2\nResponse Body:"));
        assert!(!replay_command(&payload).contains('\n'));
    }

    #[test]
    fn api_report_is_none_without_api_calls() {
        assert!(render_api_report(&[command(1, "log", json!({}))]).is_none());
    }

    #[rstest]
    #[case(json!({"request": {"url": "http://a"}}), "curl -X GET 'http://a'")]
    #[case(json!({"request": {"method": "delete", "url": "http://a"}}), "curl -X DELETE 'http://a'")]
    #[case(
        json!({"request": {"method": "PUT", "url": "http://a", "data": {"k": [1, 2]}}}),
        "curl -X PUT 'http://a' --data '{\"k\":[1,2]}'"
    )]
    #[case(
        json!({"request": {"method": "POST", "url": "http://a", "data": "line1\nit's"}}),
        "curl -X POST 'http://a' --data 'line1\\nit'\\''s'"
    )]
    #[case(
        json!({"request": {"url": "http://a/\r\nx", "headers": {"X-Multi": "a\nb"}}}),
        "curl -X GET 'http://a/\\r\\nx' -H 'X-Multi: a\\nb'"
    )]
    fn replay_command_cases(#[case] payload: Value, #[case] expected: &str) {
        assert_eq!(replay_command(&payload), expected);
    }

    #[test]
    fn pretty_body_falls_back_to_literal() {
        assert_eq!(pretty_body(&json!("not json {")), "not json {");
        assert_eq!(pretty_body(&json!({"a": 1})), "{\n  \"a\": 1\n}");
    }

    #[tokio::test]
    async fn export_raw_log_writes_chosen_file() {
        let dir = tempfile::tempdir().unwrap();
        let notices = RecordingNotices::default();
        let exporter =
            Exporter::new(PresetDestination(None), TokioFileWriter, &notices, dir.path().to_path_buf(), || 42);

        let outcome = exporter.export_raw_log(&[]).await.unwrap();
        let path = dir.path().join("timeline-log-42.json");
        assert_eq!(outcome, ExportOutcome::Written { path: path.clone(), count: 0 });
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert_eq!(notices.notices.lock().unwrap()[0].kind, NoticeKind::Info);
    }

    #[tokio::test]
    async fn empty_api_export_notifies_without_prompting() {
        let notices = RecordingNotices::default();
        let exporter = Exporter::new(PanicChooser, TokioFileWriter, &notices, PathBuf::from("."), || 0);

        let outcome = exporter.export_api_calls(&[command(1, "log", json!({}))]).await.unwrap();
        assert_eq!(outcome, ExportOutcome::Empty);
        assert_eq!(
            notices.notices.lock().unwrap().as_slice(),
            &[Notice::new(NoticeKind::Info, NO_API_CALLS_TITLE, NO_API_CALLS_MESSAGE)]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn cancelled_destination_is_silent(api_payload: Value) {
        let notices = RecordingNotices::default();
        let exporter = Exporter::new(CancelChooser, TokioFileWriter, &notices, PathBuf::from("."), || 0);

        let outcome = exporter.export_api_calls(&[command(1, "api.response", api_payload)]).await.unwrap();
        assert_eq!(outcome, ExportOutcome::Cancelled);
        assert!(notices.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_reports_error_notice() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("log.json");
        let notices = RecordingNotices::default();
        let exporter = Exporter::new(
            PresetDestination(Some(target.clone())),
            TokioFileWriter,
            &notices,
            dir.path().to_path_buf(),
            || 0,
        );

        let err = exporter.export_raw_log(&[]).await.unwrap_err();
        assert!(matches!(err, ExportError::Write { ref path, .. } if *path == target));
        let recorded = notices.notices.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, NoticeKind::Error);
    }

    #[tokio::test]
    async fn channel_chooser_round_trips_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chooser = ChannelChooser::new(tx);

        let responder = tokio::spawn(async move {
            let request: DestinationRequest = rx.recv().await.unwrap();
            assert_eq!(request.options.title, "Export API Calls");
            request.reply.send(Some(PathBuf::from("/tmp/out.txt"))).unwrap();
        });

        let chosen = chooser.choose_save_destination(SaveOptions::api_calls(Path::new("/tmp"), 7)).await;
        responder.await.unwrap();
        assert_eq!(chosen, Some(PathBuf::from("/tmp/out.txt")));
    }

    #[test]
    fn save_options_defaults() {
        let options = SaveOptions::timeline_log(Path::new("/downloads"), 1234);
        assert_eq!(options.default_path(), PathBuf::from("/downloads/timeline-log-1234.json"));
        assert_eq!(options.filters, vec![JSON_FILES, ALL_FILES]);
        assert_eq!(default_export_dir(Some(Path::new("/x"))), PathBuf::from("/x"));
    }
}

//! Ratatui interface for Strobe.

use std::collections::VecDeque;
use std::path::PathBuf;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::strobe_core::types::{Command, IncomingCommand, API_RESPONSE_TYPE};
use crate::strobe_export::{
    replay_command, DestinationRequest, ExportJob, ExportKind, Notice, NoticeKind,
};
use crate::strobe_timeline::Timeline;

const TITLE_WIDTH: usize = 14;

/// Key handling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Search,
    TypePicker,
    Prompt,
}

/// Input buffer with a cursor (byte offset, always on a char boundary).
#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub buffer: String,
    pub cursor: usize,
}

impl InputState {
    pub fn set(&mut self, value: impl Into<String>) {
        self.buffer = value.into();
        self.cursor = self.buffer.len();
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    pub fn insert_str(&mut self, value: &str) {
        self.buffer.insert_str(self.cursor, value);
        self.cursor += value.len();
    }

    pub fn backspace(&mut self) {
        if let Some((idx, _)) = self.buffer[..self.cursor].char_indices().next_back() {
            self.buffer.remove(idx);
            self.cursor = idx;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickerItem {
    pub label: String,
    pub visible: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PickerState {
    pub items: Vec<PickerItem>,
    pub selected: usize,
}

impl PickerState {
    fn move_selection(&mut self, delta: i32) {
        self.selected = step(self.selected, delta, self.items.len());
    }
}

/// A save prompt waiting for the user.
#[derive(Debug)]
pub struct PromptState {
    pub request: DestinationRequest,
    pub input: InputState,
}

/// Clipboard access for copy and paste.
pub trait Clipboard: Send {
    fn get(&mut self) -> Result<String, TuiError>;
    fn set(&mut self, contents: &str) -> Result<(), TuiError>;
}

/// System clipboard using arboard, opened on first use.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self { inner: None }
    }

    fn ensure(&mut self) -> Result<&mut arboard::Clipboard, TuiError> {
        let clipboard = match self.inner.take() {
            Some(clipboard) => clipboard,
            None => arboard::Clipboard::new()?,
        };
        Ok(self.inner.insert(clipboard))
    }
}

impl Clipboard for SystemClipboard {
    fn get(&mut self) -> Result<String, TuiError> {
        Ok(self.ensure()?.get_text()?)
    }

    fn set(&mut self, contents: &str) -> Result<(), TuiError> {
        Ok(self.ensure()?.set_text(contents.to_string())?)
    }
}

/// Possible actions requiring work outside the key handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Export(ExportKind),
    Copy,
    Paste,
    Quit,
}

/// Outcome after executing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    ExportQueued(ExportKind),
    Copied,
    Pasted,
    Quit,
}

/// Errors raised by the TUI.
#[derive(Debug, Error)]
pub enum TuiError {
    #[error("clipboard error: {0}")]
    Clipboard(#[from] arboard::Error),
    #[error("no export worker is running")]
    ExportUnavailable,
    #[error("no selected command")]
    NoSelection,
    #[error("no action to perform")]
    NoAction,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Tui {
    pub timeline: Timeline,
    pub mode: Mode,
    pub selected: usize,
    pub search: InputState,
    pub picker: PickerState,
    pub prompt: Option<PromptState>,
    pub notice: Option<Notice>,
    follow_tail: bool,
    queued_prompts: VecDeque<DestinationRequest>,
    exports: Option<mpsc::UnboundedSender<ExportJob>>,
    clipboard: Box<dyn Clipboard>,
}

impl Tui {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            mode: Mode::Normal,
            selected: 0,
            search: InputState::default(),
            picker: PickerState::default(),
            prompt: None,
            notice: None,
            follow_tail: true,
            queued_prompts: VecDeque::new(),
            exports: None,
            clipboard: Box::new(SystemClipboard::new()),
        }
    }

    pub fn with_clipboard(mut self, clipboard: Box<dyn Clipboard>) -> Self {
        self.clipboard = clipboard;
        self
    }

    pub fn with_exports(mut self, exports: mpsc::UnboundedSender<ExportJob>) -> Self {
        self.exports = Some(exports);
        self
    }

    /// Visible commands that have a registered renderer, in presentation order.
    pub fn rows(&self) -> Vec<&Command> {
        let registry = self.timeline.registry();
        self.timeline
            .visible()
            .into_iter()
            .filter(|command| registry.resolve(&command.r#type).is_known())
            .collect()
    }

    pub fn selected_command(&self) -> Option<&Command> {
        self.rows().get(self.selected).copied()
    }

    pub fn push_command(&mut self, incoming: IncomingCommand) {
        self.timeline.append(incoming);
        self.clamp_selection();
    }

    pub fn clear_timeline(&mut self) {
        self.timeline.clear();
        self.selected = 0;
        self.follow_tail = true;
    }

    pub fn push_notice(&mut self, notice: Notice) {
        self.notice = Some(notice);
    }

    pub fn push_prompt(&mut self, request: DestinationRequest) {
        self.queued_prompts.push_back(request);
        if self.prompt.is_none() {
            self.open_next_prompt();
        }
    }

    /// Advances the search debouncer; call once per UI tick.
    pub fn tick(&mut self) {
        if self.timeline.tick() {
            self.clamp_selection();
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Action::Quit;
        }

        match self.mode {
            Mode::Normal => self.handle_normal(key),
            Mode::Search => self.handle_search(key),
            Mode::TypePicker => self.handle_picker(key),
            Mode::Prompt => self.handle_prompt(key),
        }
    }

    pub fn perform_action(&mut self, action: Action) -> Result<ActionOutcome, TuiError> {
        match action {
            Action::None => Err(TuiError::NoAction),
            Action::Export(kind) => {
                let exports = self.exports.as_ref().ok_or(TuiError::ExportUnavailable)?;
                let job = ExportJob { kind, commands: self.timeline.commands().to_vec() };
                exports.send(job).map_err(|_| TuiError::ExportUnavailable)?;
                debug!(?kind, commands = self.timeline.commands().len(), "export queued");
                Ok(ActionOutcome::ExportQueued(kind))
            }
            Action::Copy => {
                self.copy_selected()?;
                Ok(ActionOutcome::Copied)
            }
            Action::Paste => {
                self.paste_into_search()?;
                Ok(ActionOutcome::Pasted)
            }
            Action::Quit => Ok(ActionOutcome::Quit),
        }
    }

    /// API calls copy as a replayable curl line, everything else as payload JSON.
    fn copy_selected(&mut self) -> Result<(), TuiError> {
        let command = self.selected_command().ok_or(TuiError::NoSelection)?;
        let contents = if command.r#type == API_RESPONSE_TYPE {
            replay_command(&command.payload)
        } else {
            serde_json::to_string_pretty(&command.payload).unwrap_or_else(|_| command.payload.to_string())
        };
        let message_id = command.message_id;
        self.clipboard.set(&contents)?;
        self.notice = Some(Notice::new(NoticeKind::Info, "Copied", format!("command #{message_id}")));
        Ok(())
    }

    fn paste_into_search(&mut self) -> Result<(), TuiError> {
        let pasted = self.clipboard.get()?;
        let line = pasted.lines().next().unwrap_or_default();
        self.search.insert_str(line);
        self.timeline.type_search(self.search.buffer.clone());
        Ok(())
    }

    fn handle_normal(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Char('q') => return Action::Quit,
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Char('g') | KeyCode::Home => {
                self.selected = 0;
                self.follow_tail = false;
            }
            KeyCode::Char('G') | KeyCode::End => self.select_last(),
            KeyCode::Char('/') => {
                self.search.set(self.timeline.typed_search());
                self.mode = Mode::Search;
            }
            KeyCode::Char('r') => {
                self.timeline.toggle_reversed();
                self.clamp_selection();
            }
            KeyCode::Char('f') => self.open_type_picker(),
            KeyCode::Char('c') => self.clear_timeline(),
            KeyCode::Char('u') => {
                self.timeline.reset_filters();
                self.search.clear();
                self.clamp_selection();
            }
            KeyCode::Char('e') => return Action::Export(ExportKind::RawLog),
            KeyCode::Char('a') => return Action::Export(ExportKind::ApiCalls),
            KeyCode::Char('y') => return Action::Copy,
            KeyCode::Esc => self.notice = None,
            _ => {}
        }
        Action::None
    }

    fn handle_search(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Enter => {
                self.timeline.commit_search();
                self.mode = Mode::Normal;
                self.clamp_selection();
            }
            KeyCode::Esc => {
                if self.search.buffer.is_empty() {
                    self.mode = Mode::Normal;
                } else {
                    self.search.clear();
                    self.timeline.set_search("");
                    self.clamp_selection();
                }
            }
            KeyCode::Backspace => {
                self.search.backspace();
                self.timeline.type_search(self.search.buffer.clone());
            }
            KeyCode::Char('v') if key.modifiers.contains(KeyModifiers::CONTROL) => return Action::Paste,
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.search.insert_str(c.encode_utf8(&mut [0; 4]));
                self.timeline.type_search(self.search.buffer.clone());
            }
            _ => {}
        }
        Action::None
    }

    fn open_type_picker(&mut self) {
        let filters = self.timeline.filters();
        let items = self
            .timeline
            .known_types()
            .into_iter()
            .map(|label| PickerItem { visible: !filters.is_hidden(&label), label })
            .collect();
        self.picker = PickerState { items, selected: 0 };
        self.mode = Mode::TypePicker;
    }

    fn handle_picker(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => self.mode = Mode::Normal,
            KeyCode::Char('j') | KeyCode::Down => self.picker.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.picker.move_selection(-1),
            KeyCode::Char(' ') | KeyCode::Enter => {
                if let Some(item) = self.picker.items.get_mut(self.picker.selected) {
                    self.timeline.toggle_type(&item.label);
                    item.visible = !self.timeline.filters().is_hidden(&item.label);
                    self.clamp_selection();
                }
            }
            _ => {}
        }
        Action::None
    }

    fn open_next_prompt(&mut self) {
        self.prompt = self.queued_prompts.pop_front().map(|request| {
            let mut input = InputState::default();
            input.set(request.options.default_path().display().to_string());
            PromptState { request, input }
        });
        self.mode = if self.prompt.is_some() { Mode::Prompt } else { Mode::Normal };
    }

    fn answer_prompt(&mut self, path: Option<PathBuf>) {
        if let Some(prompt) = self.prompt.take() {
            // The export task may have gone away; nothing to do then.
            let _ = prompt.request.reply.send(path);
        }
        self.open_next_prompt();
    }

    fn handle_prompt(&mut self, key: KeyEvent) -> Action {
        let Some(prompt) = self.prompt.as_mut() else {
            self.mode = Mode::Normal;
            return Action::None;
        };

        match key.code {
            KeyCode::Enter => {
                let value = prompt.input.buffer.trim();
                let path = (!value.is_empty()).then(|| PathBuf::from(value));
                self.answer_prompt(path);
            }
            KeyCode::Esc => self.answer_prompt(None),
            KeyCode::Backspace => prompt.input.backspace(),
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                prompt.input.insert_str(c.encode_utf8(&mut [0; 4]));
            }
            _ => {}
        }
        Action::None
    }

    fn move_selection(&mut self, delta: i32) {
        let len = self.rows().len();
        self.selected = step(self.selected, delta, len);
        self.follow_tail = len > 0 && self.selected + 1 == len;
    }

    fn select_last(&mut self) {
        self.selected = self.rows().len().saturating_sub(1);
        self.follow_tail = true;
    }

    fn clamp_selection(&mut self) {
        let len = self.rows().len();
        if self.follow_tail || self.selected >= len {
            self.selected = len.saturating_sub(1);
        }
    }

    pub fn render(&mut self, frame: &mut Frame<'_>) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)])
            .split(frame.area());

        self.render_search_bar(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        match self.mode {
            Mode::TypePicker => self.render_picker(frame),
            Mode::Prompt => self.render_prompt(frame),
            Mode::Normal | Mode::Search => {}
        }
    }

    fn render_search_bar(&self, frame: &mut Frame<'_>, area: Rect) {
        let active = self.mode == Mode::Search;
        let mut spans = vec![Span::styled("Search: ", dimmed())];
        spans.push(Span::styled(self.timeline.typed_search().to_string(), bold()));
        if active {
            spans.push(Span::styled(" ", Style::default().add_modifier(Modifier::REVERSED)));
        }
        if self.timeline.search_pending() {
            spans.push(Span::styled("  …", dimmed()));
        }

        let hidden = self.timeline.filters().hidden_types();
        if !hidden.is_empty() {
            spans.push(Span::styled(format!("  hidden: {}", hidden.len()), dimmed()));
        }

        let block = Block::default()
            .borders(Borders::ALL)
            .title("─ Strobe ─")
            .border_style(if active { Style::default().fg(Color::Green) } else { dimmed() });
        frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
    }

    fn render_main(&self, frame: &mut Frame<'_>, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);
        self.render_timeline(frame, chunks[0]);
        self.render_detail(frame, chunks[1]);
    }

    fn render_timeline(&self, frame: &mut Frame<'_>, area: Rect) {
        let rows = self.rows();
        let total = rows.len();
        let pos = if total == 0 { 0 } else { self.selected.saturating_add(1).min(total) };
        let order = if self.timeline.is_reversed() { "newest first" } else { "oldest first" };
        let block = Block::default()
            .borders(Borders::ALL)
            .title(format!("─ Timeline ({order}) ─"))
            .title_bottom(Line::from(format!("─ {pos} of {total} ─")).right_aligned());

        if rows.is_empty() {
            let empty = Paragraph::new(vec![
                Line::styled("No Activity", bold()),
                Line::raw(""),
                Line::styled("Waiting for commands from a connected app.", dimmed()),
            ])
            .alignment(Alignment::Center)
            .block(block);
            frame.render_widget(empty, area);
            return;
        }

        let registry = self.timeline.registry();
        let items: Vec<ListItem> = rows
            .iter()
            .filter_map(|command| {
                let contract = registry.resolve(&command.r#type).known()?;
                let title = contract.title(command);
                let mut spans = vec![
                    Span::styled(command.date.format("%H:%M:%S%.3f").to_string(), dimmed()),
                    Span::raw(" "),
                    Span::styled(format!("{title:<TITLE_WIDTH$}"), title_style(command)),
                    Span::raw(" "),
                    Span::raw(contract.summary(command)),
                ];
                if command.important {
                    spans.insert(0, Span::styled("! ", Style::default().fg(Color::Yellow)));
                }
                Some(ListItem::new(Line::from(spans)))
            })
            .collect();

        let mut state = ListState::default();
        state.select(Some(self.selected));
        let list = List::new(items)
            .block(block)
            .highlight_style(Style::default().fg(Color::Black).bg(Color::White).add_modifier(Modifier::BOLD));
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn render_detail(&self, frame: &mut Frame<'_>, area: Rect) {
        let Some(command) = self.selected_command() else {
            frame.render_widget(Block::default().borders(Borders::ALL).title("─ Detail ─"), area);
            return;
        };
        let Some(contract) = self.timeline.registry().resolve(&command.r#type).known() else {
            return;
        };

        let mut lines = vec![
            Line::from(vec![
                Span::styled(format!("#{} ", command.message_id), dimmed()),
                Span::styled(command.r#type.clone(), bold()),
            ]),
            Line::styled(command.date.to_rfc3339(), dimmed()),
            Line::raw(""),
        ];
        lines.extend(contract.render(command));

        let block = Block::default()
            .borders(Borders::ALL)
            .title(format!("─ {} ─", contract.title(command)));
        frame.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
    }

    fn render_footer(&self, frame: &mut Frame<'_>, area: Rect) {
        if let Some(notice) = &self.notice {
            let style = match notice.kind {
                NoticeKind::Info => Style::default().fg(Color::Cyan),
                NoticeKind::Warning => Style::default().fg(Color::Yellow),
                NoticeKind::Error => Style::default().fg(Color::Red),
            };
            let line = Line::from(vec![
                Span::styled(format!("{}: ", notice.title), style.add_modifier(Modifier::BOLD)),
                Span::styled(notice.message.clone(), style),
            ]);
            frame.render_widget(Paragraph::new(line), area);
            return;
        }

        if let Some(error) = self.timeline.filter_error() {
            let line = Line::styled(format!("filter error: {error}"), Style::default().fg(Color::Red));
            frame.render_widget(Paragraph::new(line), area);
            return;
        }

        let mut spans: Vec<Span<'static>> = Vec::new();
        let push_item = |spans: &mut Vec<Span<'static>>, label: &'static str, key: &'static str| {
            if !spans.is_empty() {
                spans.push(Span::styled(" | ", dimmed()));
            }
            spans.push(Span::styled(label, dimmed()));
            spans.push(Span::raw(":"));
            spans.push(Span::styled(key, bold()));
        };

        match self.mode {
            Mode::Search => {
                push_item(&mut spans, "Apply", "Enter");
                push_item(&mut spans, "Paste", "^V");
                push_item(&mut spans, "Clear/Close", "Esc");
            }
            Mode::TypePicker => {
                push_item(&mut spans, "Move", "j/k");
                push_item(&mut spans, "Toggle", "Space");
                push_item(&mut spans, "Close", "Esc");
            }
            Mode::Prompt => {
                push_item(&mut spans, "Save", "Enter");
                push_item(&mut spans, "Cancel", "Esc");
            }
            Mode::Normal => {
                push_item(&mut spans, "Move", "j/k");
                push_item(&mut spans, "Search", "/");
                push_item(&mut spans, "Reverse", "r");
                push_item(&mut spans, "Types", "f");
                push_item(&mut spans, "Reset", "u");
                push_item(&mut spans, "Clear", "c");
                push_item(&mut spans, "Export", "e");
                push_item(&mut spans, "API", "a");
                push_item(&mut spans, "Copy", "y");
                push_item(&mut spans, "Quit", "q");
            }
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn render_picker(&self, frame: &mut Frame<'_>) {
        let area = centered_rect(50, 60, frame.area());
        frame.render_widget(Clear, area);

        let items: Vec<ListItem> = if self.picker.items.is_empty() {
            vec![ListItem::new("No command types yet")]
        } else {
            self.picker
                .items
                .iter()
                .map(|item| {
                    let marker = if item.visible { "[x] " } else { "[ ] " };
                    ListItem::new(format!("{marker}{}", item.label))
                })
                .collect()
        };
        let mut state = ListState::default();
        if !self.picker.items.is_empty() {
            state.select(Some(self.picker.selected));
        }
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title("─ Command Types ─"))
            .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn render_prompt(&self, frame: &mut Frame<'_>) {
        let Some(prompt) = &self.prompt else {
            return;
        };
        let area = centered_rect(70, 30, frame.area());
        frame.render_widget(Clear, area);

        let filters = prompt
            .request
            .options
            .filters
            .iter()
            .map(|group| format!("{} ({})", group.name, group.extensions.join(", ")))
            .collect::<Vec<_>>()
            .join(" · ");
        let lines = vec![
            Line::from(vec![
                Span::styled("Save to: ", dimmed()),
                Span::styled(prompt.input.buffer.clone(), bold()),
            ]),
            Line::raw(""),
            Line::styled(filters, dimmed()),
        ];
        let block = Block::default()
            .borders(Borders::ALL)
            .title(format!("─ {} ─", prompt.request.options.title))
            .border_style(Style::default().fg(Color::Green));
        frame.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), area);
    }
}

fn title_style(command: &Command) -> Style {
    let color = match command.r#type.as_str() {
        "api.response" => Color::Cyan,
        "state.action.dispatch" | "state.action.complete" => Color::Magenta,
        "log" => match command.payload.get("level").and_then(|level| level.as_str()) {
            Some("error") => Color::Red,
            Some("warn") => Color::Yellow,
            _ => Color::Green,
        },
        _ => Color::Blue,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn dimmed() -> Style {
    Style::default().fg(Color::DarkGray)
}

fn bold() -> Style {
    Style::default().add_modifier(Modifier::BOLD)
}

fn step(current: usize, delta: i32, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let next = current as i64 + i64::from(delta);
    next.clamp(0, len as i64 - 1) as usize
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

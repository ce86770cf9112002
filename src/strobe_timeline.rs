//! The timeline pipeline: store, filter state, order flag and debounced search in one
//! owner, with every mutation going through a named operation that refreshes the
//! visible sequence.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::debounce::{Clock, DebouncedInput, SystemClock, DEFAULT_QUIESCENCE};
use crate::strobe_core::filters::CompiledQuery;
use crate::strobe_core::order::apply_order;
use crate::strobe_core::store::{CommandStore, StoreError};
use crate::strobe_core::types::{Command, IncomingCommand, MessageId};
use crate::strobe_core::FilterState;
use crate::strobe_resolver::CommandRegistry;

pub struct Timeline {
    store: CommandStore,
    filters: FilterState,
    reversed: bool,
    query: DebouncedInput,
    registry: Arc<CommandRegistry>,
    matched: Vec<usize>,
    // `None` while the current query cannot be evaluated.
    compiled: Option<CompiledQuery>,
    filter_error: Option<String>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(Arc::new(CommandRegistry::with_builtin()), DEFAULT_QUIESCENCE, Arc::new(SystemClock))
    }
}

impl Timeline {
    pub fn new(registry: Arc<CommandRegistry>, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: CommandStore::new(),
            filters: FilterState::default(),
            reversed: false,
            query: DebouncedInput::new(debounce, clock),
            registry,
            matched: Vec::new(),
            compiled: CompiledQuery::compile("").ok(),
            filter_error: None,
        }
    }

    /// Starts with the given filter state (e.g. hidden types from config).
    pub fn with_filters(mut self, filters: FilterState) -> Self {
        self.query.reset(filters.search_text());
        self.filters = filters;
        self.recompute();
        self
    }

    /// Stores the command and tests only it against the current filter.
    pub fn append(&mut self, incoming: IncomingCommand) -> MessageId {
        let message_id = self.store.append(incoming).message_id;
        let index = self.store.len() - 1;

        let Some(compiled) = &self.compiled else {
            self.matched.push(index);
            return message_id;
        };
        let command = &self.store.commands()[index];
        match compiled.matches(command, self.filters.hidden_types(), &self.registry) {
            Ok(true) => self.matched.push(index),
            Ok(false) => {}
            Err(error) => self.fall_back(error.to_string()),
        }
        message_id
    }

    pub fn import(&mut self, commands: Vec<Command>) -> Result<usize, StoreError> {
        let count = self.store.import(commands)?;
        self.recompute();
        Ok(count)
    }

    /// Empties the store. Filters and ordering are kept.
    pub fn clear(&mut self) {
        self.store.clear();
        self.recompute();
    }

    /// Raw keystroke-rate input; reaches the filter after the quiet window.
    pub fn type_search(&mut self, value: impl Into<String>) {
        self.query.handle_input(value);
    }

    /// Commits a search immediately, dropping any pending keystrokes.
    pub fn set_search(&mut self, value: impl Into<String>) {
        let value = value.into();
        self.query.reset(value.clone());
        if self.filters.set_search(value) {
            self.recompute();
        }
    }

    /// Commits whatever is pending in the search box right away.
    pub fn commit_search(&mut self) -> bool {
        match self.query.flush() {
            Some(value) => self.apply_search(value),
            None => false,
        }
    }

    /// Advances the debouncer. Returns true when the visible sequence changed.
    pub fn tick(&mut self) -> bool {
        match self.query.poll() {
            Some(value) => self.apply_search(value),
            None => false,
        }
    }

    fn apply_search(&mut self, value: String) -> bool {
        if !self.filters.set_search(value) {
            return false;
        }
        debug!(search = %self.filters.search_text(), "search committed");
        self.recompute();
        true
    }

    pub fn hide_type(&mut self, command_type: impl Into<String>) {
        if self.filters.hide_type(command_type) {
            self.recompute();
        }
    }

    pub fn show_type(&mut self, command_type: &str) {
        if self.filters.show_type(command_type) {
            self.recompute();
        }
    }

    pub fn toggle_type(&mut self, command_type: &str) {
        self.filters.toggle_type(command_type);
        self.recompute();
    }

    pub fn reset_filters(&mut self) {
        self.filters.reset();
        self.query.reset("");
        self.recompute();
    }

    pub fn toggle_reversed(&mut self) {
        self.reversed = !self.reversed;
    }

    /// Changes the quiet window without dropping a pending search.
    pub fn set_debounce(&mut self, window: Duration) {
        self.query.reconfigure(window);
    }

    fn recompute(&mut self) {
        let outcome = CompiledQuery::compile(self.filters.search_text()).and_then(|compiled| {
            let mut matched = Vec::new();
            for (idx, command) in self.store.commands().iter().enumerate() {
                if compiled.matches(command, self.filters.hidden_types(), &self.registry)? {
                    matched.push(idx);
                }
            }
            Ok((compiled, matched))
        });

        match outcome {
            Ok((compiled, matched)) => {
                self.matched = matched;
                self.compiled = Some(compiled);
                self.filter_error = None;
            }
            Err(error) => self.fall_back(error.to_string()),
        }
    }

    fn fall_back(&mut self, error: String) {
        warn!(error = %error, "filter evaluation failed, showing all commands");
        self.matched = (0..self.store.len()).collect();
        self.compiled = None;
        self.filter_error = Some(error);
    }

    /// Visible commands in presentation order.
    pub fn visible(&self) -> Vec<&Command> {
        let commands = self.store.commands();
        apply_order(self.matched.iter().map(|&idx| &commands[idx]).collect(), self.reversed)
    }

    pub fn visible_len(&self) -> usize {
        self.matched.len()
    }

    pub fn commands(&self) -> &[Command] {
        self.store.commands()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn filters(&self) -> &FilterState {
        &self.filters
    }

    pub fn typed_search(&self) -> &str {
        self.query.typed()
    }

    pub fn debounce_window(&self) -> Duration {
        self.query.window()
    }

    pub fn search_pending(&self) -> bool {
        self.query.is_pending()
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn filter_error(&self) -> Option<&str> {
        self.filter_error.as_deref()
    }

    /// Every type seen in the store plus every hidden type, sorted.
    pub fn known_types(&self) -> Vec<String> {
        let mut types: BTreeSet<String> =
            self.store.commands().iter().map(|command| command.r#type.clone()).collect();
        types.extend(self.filters.hidden_types().iter().cloned());
        types.into_iter().collect()
    }
}

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

mod debounce;
mod engine;
mod layout;
mod scheduler;

pub use debounce::{Debouncer, FireOutcome};
pub use engine::{
    CallbackFn, CallbackRef, EMPTY, EventRecord, IN_VIEW, LazyOptions, Params, PendingWatch,
    Settings, TestFn, TestRef, parse_name_list,
};
pub use layout::{Rect, Viewport};
pub use scheduler::PendingTimer;

pub(crate) use engine::Watch;
pub(crate) use scheduler::{ScheduledTask, TaskKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Config(String),
    UnknownTest(String),
    UnknownCallback(String),
    ElementNotFound(String),
    Scheduler(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::UnknownTest(name) => write!(f, "unknown test function: {name}"),
            Self::UnknownCallback(name) => write!(f, "unknown callback function: {name}"),
            Self::ElementNotFound(what) => write!(f, "element not found: {what}"),
            Self::Scheduler(msg) => write!(f, "scheduler error: {msg}"),
        }
    }
}

impl StdError for Error {}

/// Copyable handle to an element in the harness. Handles stay valid for the
/// harness's lifetime; elements are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub(crate) usize);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
    rect: Rect,
}

/// Deterministic host for the lazy-load engine: a mock element store with
/// bounding rects and a viewport, window-level event dispatch, a manually
/// advanced millisecond clock with a one-shot timer queue, the test/callback
/// registries, and a trace log for observing what the engine did.
///
/// Registries and the disabled flag are mutable only during the setup phase,
/// before the first `lazy_load` call; invocations treat them as read-only.
#[derive(Debug)]
pub struct Harness {
    elements: Vec<Element>,
    id_index: HashMap<String, ElementId>,
    viewport: Viewport,
    pub(crate) tests_cache: HashMap<String, TestFn>,
    pub(crate) callbacks_cache: HashMap<String, CallbackFn>,
    pub(crate) disabled: bool,
    pub(crate) engine_started: bool,
    pub(crate) watches: Vec<Watch>,
    pub(crate) watch_listeners: HashMap<String, Vec<i64>>,
    pub(crate) next_watch_id: i64,
    pub(crate) task_queue: Vec<ScheduledTask>,
    pub(crate) now_ms: i64,
    pub(crate) timer_step_limit: usize,
    pub(crate) next_timer_id: i64,
    pub(crate) next_task_order: i64,
    pub(crate) trace: bool,
    pub(crate) trace_events: bool,
    pub(crate) trace_timers: bool,
    pub(crate) trace_engine: bool,
    pub(crate) trace_logs: Vec<String>,
    pub(crate) trace_log_limit: usize,
    pub(crate) trace_to_stderr: bool,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let mut tests_cache = HashMap::new();
        tests_cache.insert(
            IN_VIEW.to_string(),
            TestFn::new(|harness, element, _, _| layout::in_view(harness, element)),
        );
        let mut callbacks_cache = HashMap::new();
        callbacks_cache.insert(EMPTY.to_string(), CallbackFn::new(|_, _, _, _| {}));

        Self {
            elements: Vec::new(),
            id_index: HashMap::new(),
            viewport: Viewport::default(),
            tests_cache,
            callbacks_cache,
            disabled: false,
            engine_started: false,
            watches: Vec::new(),
            watch_listeners: HashMap::new(),
            next_watch_id: 1,
            task_queue: Vec::new(),
            now_ms: 0,
            timer_step_limit: 10_000,
            next_timer_id: 1,
            next_task_order: 0,
            trace: false,
            trace_events: true,
            trace_timers: true,
            trace_engine: true,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        }
    }

    pub fn create_element(&mut self, tag_name: &str) -> ElementId {
        let id = ElementId(self.elements.len());
        self.elements.push(Element {
            tag_name: tag_name.to_string(),
            attrs: HashMap::new(),
            rect: Rect::default(),
        });
        id
    }

    pub fn create_element_with_id(&mut self, tag_name: &str, id: &str) -> Result<ElementId> {
        if id.is_empty() {
            return Err(Error::Config("element ids must be non-empty".into()));
        }
        if self.id_index.contains_key(id) {
            return Err(Error::Config(format!("duplicate element id: {id}")));
        }
        let element = self.create_element(tag_name);
        self.elements[element.0]
            .attrs
            .insert("id".to_string(), id.to_string());
        self.id_index.insert(id.to_string(), element);
        Ok(element)
    }

    pub fn element_by_id(&self, id: &str) -> Result<ElementId> {
        self.id_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::ElementNotFound(format!("#{id}")))
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tag_name(&self, element: ElementId) -> Option<String> {
        self.elements
            .get(element.0)
            .map(|element| element.tag_name.clone())
    }

    pub fn attribute(&self, element: ElementId, name: &str) -> Option<String> {
        self.elements
            .get(element.0)
            .and_then(|element| element.attrs.get(name).cloned())
    }

    /// Setting `"id"` follows the same rules as `create_element_with_id`:
    /// the id must be non-empty and not taken by another element.
    pub fn set_attribute(&mut self, element: ElementId, name: &str, value: &str) -> Result<()> {
        if name == "id" {
            if value.is_empty() {
                return Err(Error::Config("element ids must be non-empty".into()));
            }
            if let Some(existing) = self.id_index.get(value) {
                if *existing != element {
                    return Err(Error::Config(format!("duplicate element id: {value}")));
                }
            }
            let previous = self.element(element)?.attrs.get("id").cloned();
            if let Some(previous) = previous {
                self.id_index.remove(&previous);
            }
            self.id_index.insert(value.to_string(), element);
        }
        self.element_mut(element)?
            .attrs
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_attribute(&mut self, element: ElementId, name: &str) -> Result<bool> {
        let removed = self.element_mut(element)?.attrs.remove(name);
        if name == "id" {
            if let Some(previous) = &removed {
                self.id_index.remove(previous);
            }
        }
        Ok(removed.is_some())
    }

    pub fn set_bounding_rect(&mut self, element: ElementId, rect: Rect) -> Result<()> {
        self.element_mut(element)?.rect = rect;
        Ok(())
    }

    pub fn bounding_rect(&self, element: ElementId) -> Option<Rect> {
        self.elements.get(element.0).map(|element| element.rect)
    }

    pub fn set_viewport(&mut self, width: f64, height: f64) {
        self.viewport = Viewport { width, height };
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Runs the default visibility test directly.
    pub fn element_in_view(&self, element: ElementId) -> bool {
        layout::in_view(self, element)
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace_logs)
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace_to_stderr = enabled;
    }

    pub fn set_trace_events(&mut self, enabled: bool) {
        self.trace_events = enabled;
    }

    pub fn set_trace_timers(&mut self, enabled: bool) {
        self.trace_timers = enabled;
    }

    pub fn set_trace_engine(&mut self, enabled: bool) {
        self.trace_engine = enabled;
    }

    pub fn set_trace_log_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::Config(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.trace_log_limit = max_entries;
        while self.trace_logs.len() > self.trace_log_limit {
            self.trace_logs.remove(0);
        }
        Ok(())
    }

    pub(crate) fn trace_event_line(&mut self, line: String) {
        if self.trace && self.trace_events {
            self.trace_line(line);
        }
    }

    pub(crate) fn trace_timer_line(&mut self, line: String) {
        if self.trace && self.trace_timers {
            self.trace_line(line);
        }
    }

    pub(crate) fn trace_engine_line(&mut self, line: String) {
        if self.trace && self.trace_engine {
            self.trace_line(line);
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.trace {
            if self.trace_to_stderr {
                eprintln!("{line}");
            }
            if self.trace_logs.len() >= self.trace_log_limit {
                self.trace_logs.remove(0);
            }
            self.trace_logs.push(line);
        }
    }

    pub(crate) fn element(&self, element: ElementId) -> Result<&Element> {
        self.elements
            .get(element.0)
            .ok_or_else(|| Error::ElementNotFound(format!("handle {}", element.0)))
    }

    fn element_mut(&mut self, element: ElementId) -> Result<&mut Element> {
        self.elements
            .get_mut(element.0)
            .ok_or_else(|| Error::ElementNotFound(format!("handle {}", element.0)))
    }
}

use std::fmt;
use std::rc::Rc;

use super::*;

/// Registry key of the default visibility test.
pub const IN_VIEW: &str = "IN_VIEW";

/// Registry key of the default no-op callback.
pub const EMPTY: &str = "EMPTY";

const DEFAULT_EVENT_TYPE: &str = "scroll";

/// Free-form parameter bag forwarded to every test and callback.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Boolean test gating whether the deferred callbacks may run.
///
/// Tests receive a shared view of the harness and are expected to be pure;
/// a panicking test propagates to the caller.
#[derive(Clone)]
pub struct TestFn(Rc<dyn Fn(&Harness, ElementId, &Params, &Settings) -> bool>);

impl TestFn {
    pub fn new(f: impl Fn(&Harness, ElementId, &Params, &Settings) -> bool + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub(crate) fn call(
        &self,
        harness: &Harness,
        element: ElementId,
        params: &Params,
        settings: &Settings,
    ) -> bool {
        (self.0)(harness, element, params, settings)
    }
}

impl fmt::Debug for TestFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TestFn")
    }
}

/// Deferred action invoked once the gating tests pass. Side-effecting by
/// design; it may mutate the harness (e.g. rewrite an element attribute).
#[derive(Clone)]
pub struct CallbackFn(Rc<dyn Fn(&mut Harness, ElementId, &Params, &Settings)>);

impl CallbackFn {
    pub fn new(f: impl Fn(&mut Harness, ElementId, &Params, &Settings) + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub(crate) fn call(
        &self,
        harness: &mut Harness,
        element: ElementId,
        params: &Params,
        settings: &Settings,
    ) {
        (self.0)(harness, element, params, settings)
    }
}

impl fmt::Debug for CallbackFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackFn")
    }
}

/// A test given either directly or as a registry key resolved at
/// `lazy_load` time.
#[derive(Debug, Clone)]
pub enum TestRef {
    Direct(TestFn),
    Named(String),
}

impl From<TestFn> for TestRef {
    fn from(test: TestFn) -> Self {
        Self::Direct(test)
    }
}

impl From<&str> for TestRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum CallbackRef {
    Direct(CallbackFn),
    Named(String),
}

impl From<CallbackFn> for CallbackRef {
    fn from(callback: CallbackFn) -> Self {
        Self::Direct(callback)
    }
}

impl From<&str> for CallbackRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// Caller-supplied configuration for one `lazy_load` invocation.
///
/// Empty sequences fall back to the documented defaults when the options are
/// resolved: tests to the registry's `"IN_VIEW"`, callbacks to `"EMPTY"`,
/// event types to `["scroll"]`.
#[derive(Debug, Clone, Default)]
pub struct LazyOptions {
    pub tests: Vec<TestRef>,
    pub callbacks: Vec<CallbackRef>,
    pub event_types: Vec<String>,
    pub force_event: bool,
    pub event_delay_ms: i64,
}

impl LazyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds options from space-separated registry-key lists, the shape a
    /// declarative binding layer hands over.
    pub fn from_name_lists(tests: &str, callbacks: &str, event_types: &str) -> Self {
        Self {
            tests: parse_name_list(tests)
                .into_iter()
                .map(TestRef::Named)
                .collect(),
            callbacks: parse_name_list(callbacks)
                .into_iter()
                .map(CallbackRef::Named)
                .collect(),
            event_types: parse_name_list(event_types),
            ..Self::default()
        }
    }

    pub fn with_test(mut self, test: TestFn) -> Self {
        self.tests.push(TestRef::Direct(test));
        self
    }

    pub fn with_named_test(mut self, name: impl Into<String>) -> Self {
        self.tests.push(TestRef::Named(name.into()));
        self
    }

    pub fn with_callback(mut self, callback: CallbackFn) -> Self {
        self.callbacks.push(CallbackRef::Direct(callback));
        self
    }

    pub fn with_named_callback(mut self, name: impl Into<String>) -> Self {
        self.callbacks.push(CallbackRef::Named(name.into()));
        self
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types.extend(event_types.into_iter().map(Into::into));
        self
    }

    pub fn with_force_event(mut self, force_event: bool) -> Self {
        self.force_event = force_event;
        self
    }

    pub fn with_event_delay_ms(mut self, event_delay_ms: i64) -> Self {
        self.event_delay_ms = event_delay_ms;
        self
    }
}

/// Splits a space-separated name list, dropping empty entries.
pub fn parse_name_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

/// Resolved, immutable configuration for one invocation. Tests and callbacks
/// see this view instead of the raw options.
#[derive(Debug, Clone)]
pub struct Settings {
    pub(crate) tests: Vec<TestFn>,
    pub(crate) callbacks: Vec<CallbackFn>,
    pub(crate) event_types: Vec<String>,
    pub(crate) force_event: bool,
    pub(crate) event_delay_ms: i64,
}

impl Settings {
    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub fn force_event(&self) -> bool {
        self.force_event
    }

    pub fn event_delay_ms(&self) -> i64 {
        self.event_delay_ms
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}

/// The call data a watch's debouncer records per dispatched event; the last
/// record before the debounce window closes is the one the re-check sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: String,
    pub dispatched_at_ms: i64,
}

#[derive(Debug)]
pub(crate) struct Watch {
    pub(crate) id: i64,
    pub(crate) element: ElementId,
    pub(crate) params: Rc<Params>,
    pub(crate) settings: Rc<Settings>,
    pub(crate) debounce: Debouncer<EventRecord>,
}

/// Snapshot of one pending invocation, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWatch {
    pub element: ElementId,
    pub event_types: Vec<String>,
    pub event_delay_ms: i64,
    pub debounce_armed: bool,
    /// The coalesced event the pending re-check will see, if one is armed.
    pub last_event: Option<EventRecord>,
}

impl Harness {
    /// Extends the test registry. Setup-phase only: fails once the first
    /// `lazy_load` call has run. Existing keys are overwritten.
    pub fn set_tests_cache<I, K>(&mut self, entries: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, TestFn)>,
        K: Into<String>,
    {
        self.ensure_setup_phase("set_tests_cache")?;
        let entries = validate_cache_entries(entries, "test")?;
        for (name, test) in entries {
            self.tests_cache.insert(name, test);
        }
        Ok(self)
    }

    /// Extends the callback registry. Setup-phase only.
    pub fn set_callbacks_cache<I, K>(&mut self, entries: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, CallbackFn)>,
        K: Into<String>,
    {
        self.ensure_setup_phase("set_callbacks_cache")?;
        let entries = validate_cache_entries(entries, "callback")?;
        for (name, callback) in entries {
            self.callbacks_cache.insert(name, callback);
        }
        Ok(self)
    }

    /// Sets the process-wide disabled flag: every later `lazy_load` schedules
    /// its callbacks immediately, running no tests and attaching no
    /// listeners. Setup-phase only; never reset by the engine.
    pub fn disable_lazy_loading(&mut self) -> Result<&mut Self> {
        self.ensure_setup_phase("disable_lazy_loading")?;
        self.disabled = true;
        Ok(self)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Defers callbacks on `element` until one of the configured tests
    /// passes.
    ///
    /// Runs the tests once up front (unless `force_event` is set); on a pass
    /// the callbacks are scheduled and no listener is ever attached. On a
    /// fail a watch is registered for every configured event type, feeding
    /// one debounced re-check; the first passing re-check schedules the
    /// callbacks exactly once and removes the watch.
    ///
    /// Named tests and callbacks are resolved here; an unknown key fails the
    /// whole call before any listener is attached or callback scheduled.
    pub fn lazy_load(
        &mut self,
        element: ElementId,
        params: Params,
        options: LazyOptions,
    ) -> Result<()> {
        self.element(element)?;
        let settings = Rc::new(self.resolve_settings(&options)?);
        self.engine_started = true;
        let params = Rc::new(params);

        if self.disabled {
            self.trace_engine_line(format!(
                "[lazy] disabled element={} callbacks={}",
                element,
                settings.callbacks.len()
            ));
            self.schedule_callbacks(element, &params, &settings);
            return Ok(());
        }

        if !settings.force_event && self.run_tests(element, &params, &settings) {
            self.trace_engine_line(format!(
                "[lazy] pass element={} tests={}",
                element,
                settings.tests.len()
            ));
            self.schedule_callbacks(element, &params, &settings);
            return Ok(());
        }

        let id = self.next_watch_id;
        self.next_watch_id = self.next_watch_id.saturating_add(1);
        for event_type in &settings.event_types {
            self.watch_listeners
                .entry(event_type.clone())
                .or_default()
                .push(id);
        }
        self.trace_engine_line(format!(
            "[lazy] watch id={} element={} events={} delay_ms={} force_event={}",
            id,
            element,
            settings.event_types.join(","),
            settings.event_delay_ms,
            settings.force_event
        ));
        self.watches.push(Watch {
            id,
            element,
            params,
            settings: Rc::clone(&settings),
            debounce: Debouncer::new(settings.event_delay_ms),
        });
        Ok(())
    }

    /// Dispatches a window-level event: every watch registered for
    /// `event_type` records the event with its debouncer and, when no
    /// evaluation is pending yet, arms a debounce timer. Dispatch never runs
    /// timers itself; advance the clock to evaluate.
    pub fn dispatch(&mut self, event_type: &str) -> Result<()> {
        if event_type.is_empty() {
            return Err(Error::Config(
                "dispatch requires a non-empty event type".into(),
            ));
        }
        let now = self.now_ms;
        let ids = self
            .watch_listeners
            .get(event_type)
            .cloned()
            .unwrap_or_default();
        self.trace_event_line(format!(
            "[event] dispatch type={event_type} watches={}",
            ids.len()
        ));
        for id in ids {
            let Some(watch) = self.watches.iter_mut().find(|watch| watch.id == id) else {
                continue;
            };
            let record = EventRecord {
                event_type: event_type.to_string(),
                dispatched_at_ms: now,
            };
            match watch.debounce.call(now, record) {
                Some(delay_ms) => {
                    let timer = self.schedule_task(delay_ms, TaskKind::DebounceFire { watch: id });
                    self.trace_event_line(format!(
                        "[event] debounce id={id} armed timer={timer} delay_ms={delay_ms}"
                    ));
                }
                None => {
                    self.trace_event_line(format!("[event] debounce id={id} coalesced"));
                }
            }
        }
        Ok(())
    }

    /// Number of pending invocations.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Number of watches registered for one event type.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.watch_listeners
            .get(event_type)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn pending_watches(&self) -> Vec<PendingWatch> {
        self.watches
            .iter()
            .map(|watch| PendingWatch {
                element: watch.element,
                event_types: watch.settings.event_types.clone(),
                event_delay_ms: watch.settings.event_delay_ms,
                debounce_armed: watch.debounce.is_armed(),
                last_event: watch.debounce.latest().cloned(),
            })
            .collect()
    }

    /// Cancels every pending invocation on `element`, removing listeners and
    /// debounce timers. The callbacks never fire. Returns the number of
    /// watches removed.
    pub fn clear_watches(&mut self, element: ElementId) -> usize {
        let ids: Vec<i64> = self
            .watches
            .iter()
            .filter(|watch| watch.element == element)
            .map(|watch| watch.id)
            .collect();
        for id in &ids {
            self.remove_watch(*id);
        }
        ids.len()
    }

    pub fn clear_all_watches(&mut self) -> usize {
        let ids: Vec<i64> = self.watches.iter().map(|watch| watch.id).collect();
        for id in &ids {
            self.remove_watch(*id);
        }
        ids.len()
    }

    pub(crate) fn run_debounce_fire(&mut self, watch_id: i64) -> Result<()> {
        let now = self.now_ms;
        let (element, params, settings, outcome) = {
            let Some(watch) = self.watches.iter_mut().find(|watch| watch.id == watch_id) else {
                // Watch removed while its timer was queued.
                return Ok(());
            };
            (
                watch.element,
                Rc::clone(&watch.params),
                Rc::clone(&watch.settings),
                watch.debounce.fire(now),
            )
        };

        match outcome {
            FireOutcome::Idle => Ok(()),
            FireOutcome::Reschedule { remaining_ms } => {
                let timer =
                    self.schedule_task(remaining_ms, TaskKind::DebounceFire { watch: watch_id });
                self.trace_engine_line(format!(
                    "[lazy] recheck id={watch_id} deferred timer={timer} remaining_ms={remaining_ms}"
                ));
                Ok(())
            }
            FireOutcome::Invoke(record) => {
                let passed = self.run_tests(element, &params, &settings);
                self.trace_engine_line(format!(
                    "[lazy] recheck id={} element={} event={} passed={}",
                    watch_id, element, record.event_type, passed
                ));
                if passed {
                    self.remove_watch(watch_id);
                    self.trace_engine_line(format!(
                        "[lazy] fire id={} element={} callbacks={}",
                        watch_id,
                        element,
                        settings.callbacks.len()
                    ));
                    self.schedule_callbacks(element, &params, &settings);
                }
                Ok(())
            }
        }
    }

    /// Short-circuiting OR over the configured tests. An empty sequence is
    /// false, never a free pass.
    fn run_tests(&self, element: ElementId, params: &Params, settings: &Settings) -> bool {
        settings
            .tests
            .iter()
            .any(|test| test.call(self, element, params, settings))
    }

    /// Schedules every callback as its own zero-delay task, in configured
    /// order. Callbacks run after the current call returns and may interleave
    /// with other queued work.
    fn schedule_callbacks(
        &mut self,
        element: ElementId,
        params: &Rc<Params>,
        settings: &Rc<Settings>,
    ) {
        let settings = Rc::clone(settings);
        for callback in settings.callbacks.iter() {
            self.schedule_task(
                0,
                TaskKind::RunCallback {
                    callback: callback.clone(),
                    element,
                    params: Rc::clone(params),
                    settings: Rc::clone(&settings),
                },
            );
        }
    }

    fn remove_watch(&mut self, watch_id: i64) -> bool {
        let Some(pos) = self.watches.iter().position(|watch| watch.id == watch_id) else {
            return false;
        };
        let watch = self.watches.remove(pos);
        for event_type in watch.settings.event_types.iter() {
            let emptied = match self.watch_listeners.get_mut(event_type) {
                Some(ids) => {
                    ids.retain(|id| *id != watch_id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.watch_listeners.remove(event_type);
            }
        }
        let cleared = self.clear_tasks_for_watch(watch_id);
        self.trace_engine_line(format!(
            "[lazy] unwatch id={} element={} cleared_timers={}",
            watch_id, watch.element, cleared
        ));
        true
    }

    fn resolve_settings(&self, options: &LazyOptions) -> Result<Settings> {
        if options.event_delay_ms < 0 {
            return Err(Error::Config(format!(
                "event delay must be non-negative, got {}",
                options.event_delay_ms
            )));
        }

        let tests = if options.tests.is_empty() {
            vec![self.resolve_test(&TestRef::Named(IN_VIEW.to_string()))?]
        } else {
            options
                .tests
                .iter()
                .map(|test| self.resolve_test(test))
                .collect::<Result<Vec<_>>>()?
        };

        let callbacks = if options.callbacks.is_empty() {
            vec![self.resolve_callback(&CallbackRef::Named(EMPTY.to_string()))?]
        } else {
            options
                .callbacks
                .iter()
                .map(|callback| self.resolve_callback(callback))
                .collect::<Result<Vec<_>>>()?
        };

        // Event names form a set: drop empties, keep first occurrences.
        let mut event_types: Vec<String> = Vec::new();
        for raw in &options.event_types {
            if raw.is_empty() || event_types.iter().any(|existing| existing == raw) {
                continue;
            }
            event_types.push(raw.clone());
        }
        if event_types.is_empty() {
            event_types.push(DEFAULT_EVENT_TYPE.to_string());
        }

        Ok(Settings {
            tests,
            callbacks,
            event_types,
            force_event: options.force_event,
            event_delay_ms: options.event_delay_ms,
        })
    }

    fn resolve_test(&self, reference: &TestRef) -> Result<TestFn> {
        match reference {
            TestRef::Direct(test) => Ok(test.clone()),
            TestRef::Named(name) => self
                .tests_cache
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownTest(name.clone())),
        }
    }

    fn resolve_callback(&self, reference: &CallbackRef) -> Result<CallbackFn> {
        match reference {
            CallbackRef::Direct(callback) => Ok(callback.clone()),
            CallbackRef::Named(name) => self
                .callbacks_cache
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownCallback(name.clone())),
        }
    }

    fn ensure_setup_phase(&self, operation: &str) -> Result<()> {
        if self.engine_started {
            return Err(Error::Config(format!(
                "{operation} must be called before the first lazy_load invocation"
            )));
        }
        Ok(())
    }
}

fn validate_cache_entries<T, I, K>(entries: I, kind: &str) -> Result<Vec<(String, T)>>
where
    I: IntoIterator<Item = (K, T)>,
    K: Into<String>,
{
    let entries: Vec<(String, T)> = entries
        .into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect();
    for (name, _) in &entries {
        if name.is_empty() {
            return Err(Error::Config(format!("{kind} cache keys must be non-empty")));
        }
    }
    Ok(entries)
}

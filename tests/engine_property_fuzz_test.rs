use std::cell::Cell;
use std::rc::Rc;

use lazy_load::{
    CallbackFn, Debouncer, FireOutcome, Harness, LazyOptions, Params, Rect, TestFn,
};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::test_runner::{FileFailurePersistence, TestCaseResult};

const ENGINE_PROPTEST_REGRESSION_FILE: &str =
    "tests/proptest-regressions/engine_property_fuzz_test.txt";
const DEFAULT_ENGINE_PROPTEST_CASES: u32 = 128;

const WATCHED_ELEMENTS: usize = 3;
const FUZZ_EVENT_DELAY_MS: i64 = 50;

fn env_proptest_cases(var_name: &str, default_cases: u32) -> u32 {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_cases)
}

fn engine_proptest_cases() -> u32 {
    std::env::var("LAZY_LOAD_ENGINE_PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or_else(|| {
            env_proptest_cases("LAZY_LOAD_PROPTEST_CASES", DEFAULT_ENGINE_PROPTEST_CASES)
        })
}

#[derive(Clone, Debug)]
enum EngineAction {
    Dispatch,
    AdvanceTime(i64),
    Flush,
    SetReady(bool),
    ClearWatches(usize),
}

fn engine_action_strategy() -> BoxedStrategy<EngineAction> {
    prop_oneof![
        5 => Just(EngineAction::Dispatch),
        4 => (0i64..=200).prop_map(EngineAction::AdvanceTime),
        2 => Just(EngineAction::Flush),
        2 => any::<bool>().prop_map(EngineAction::SetReady),
        1 => (0..WATCHED_ELEMENTS).prop_map(EngineAction::ClearWatches),
    ]
    .boxed()
}

fn engine_action_sequence_strategy() -> BoxedStrategy<Vec<EngineAction>> {
    vec(engine_action_strategy(), 1..=32).boxed()
}

fn assert_engine_sequence_is_stable(actions: &[EngineAction]) -> TestCaseResult {
    let mut harness = Harness::new();
    let ready = Rc::new(Cell::new(false));

    let mut elements = Vec::new();
    let mut fired: Vec<Rc<Cell<usize>>> = Vec::new();
    let mut cleared_while_watching = vec![false; WATCHED_ELEMENTS];

    for index in 0..WATCHED_ELEMENTS {
        let element = harness
            .create_element_with_id("img", &format!("fuzz-{index}"))
            .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
        let count = Rc::new(Cell::new(0usize));
        let test = {
            let ready = Rc::clone(&ready);
            TestFn::new(move |_, _, _, _| ready.get())
        };
        let callback = {
            let count = Rc::clone(&count);
            CallbackFn::new(move |_, _, _, _| count.set(count.get() + 1))
        };
        harness
            .lazy_load(
                element,
                Params::new(),
                LazyOptions::new()
                    .with_test(test)
                    .with_callback(callback)
                    .with_event_delay_ms(FUZZ_EVENT_DELAY_MS),
            )
            .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
        elements.push(element);
        fired.push(count);
    }
    prop_assert_eq!(harness.watch_count(), WATCHED_ELEMENTS);

    for (step, action) in actions.iter().enumerate() {
        let outcome = match action {
            EngineAction::Dispatch => harness.dispatch("scroll"),
            EngineAction::AdvanceTime(delta) => harness.advance_time(*delta),
            EngineAction::Flush => harness.flush(),
            EngineAction::SetReady(value) => {
                ready.set(*value);
                Ok(())
            }
            EngineAction::ClearWatches(index) => {
                if harness.clear_watches(elements[*index]) > 0 {
                    cleared_while_watching[*index] = true;
                }
                Ok(())
            }
        };
        prop_assert!(
            outcome.is_ok(),
            "action failed at step {step}: {action:?}, error={:?}, actions={actions:?}",
            outcome.err()
        );

        // Each invocation fires its callback at most once, and every live
        // watch keeps exactly one scroll listener.
        for (index, count) in fired.iter().enumerate() {
            prop_assert!(
                count.get() <= 1,
                "element {index} fired {} times after step {step}: {action:?}",
                count.get()
            );
        }
        prop_assert_eq!(harness.listener_count("scroll"), harness.watch_count());
        prop_assert!(harness.watch_count() <= WATCHED_ELEMENTS);
    }

    // Settle: once the test passes, every surviving watch fires on the next
    // event, and cancelled watches stay silent.
    ready.set(true);
    harness
        .dispatch("scroll")
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    harness
        .flush()
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;
    prop_assert_eq!(harness.watch_count(), 0);
    for index in 0..WATCHED_ELEMENTS {
        let fired_once = fired[index].get() == 1;
        prop_assert!(
            fired_once != cleared_while_watching[index],
            "element {index}: fired={}, cleared_while_watching={}",
            fired[index].get(),
            cleared_while_watching[index]
        );
    }
    Ok(())
}

fn assert_debounce_coalesces(wait_ms: i64, gaps: &[i64]) -> TestCaseResult {
    let mut debouncer: Debouncer<i64> = Debouncer::new(wait_ms);

    let mut call_times = Vec::with_capacity(gaps.len());
    let mut now = 0i64;
    for gap in gaps {
        now += gap;
        call_times.push(now);
    }

    // Drive the call/fire protocol the way a timer queue would: a call may
    // arm a fire, and a due fire runs before any later call.
    let mut pending_fire: Option<i64> = None;
    let mut invokes: Vec<(i64, i64)> = Vec::new();
    let mut next_call = 0usize;
    loop {
        let fire_first = match (pending_fire, call_times.get(next_call)) {
            (Some(due), Some(call)) => due <= *call,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if fire_first {
            let due = pending_fire.take().unwrap();
            match debouncer.fire(due) {
                FireOutcome::Invoke(args) => invokes.push((due, args)),
                FireOutcome::Reschedule { remaining_ms } => {
                    prop_assert!(remaining_ms > 0);
                    pending_fire = Some(due + remaining_ms);
                }
                FireOutcome::Idle => {
                    prop_assert!(false, "armed debouncer fired idle at {due}");
                }
            }
        } else {
            let at = call_times[next_call];
            next_call += 1;
            if let Some(delay) = debouncer.call(at, at) {
                prop_assert!(pending_fire.is_none(), "call armed over a pending fire");
                pending_fire = Some(at + delay);
            }
        }
    }

    prop_assert!(!invokes.is_empty(), "no invoke for {} calls", gaps.len());
    // Every invoke carries a real call time and respects the wait, and the
    // final invoke delivers the last call's arguments.
    for (fired_at, args) in &invokes {
        prop_assert!(call_times.contains(args));
        prop_assert!(
            fired_at - args >= wait_ms.max(0),
            "invoked {}ms after its last call, wait={wait_ms}",
            fired_at - args
        );
    }
    let (_, last_args) = invokes.last().unwrap();
    prop_assert_eq!(*last_args, *call_times.last().unwrap());
    prop_assert!(!debouncer.is_armed());
    prop_assert!(matches!(debouncer.fire(now + 1), FireOutcome::Idle));
    Ok(())
}

fn assert_in_view_matches_reference(rect: Rect, width: f64, height: f64) -> TestCaseResult {
    let mut harness = Harness::new();
    harness.set_viewport(width, height);
    let element = harness.create_element("div");
    harness
        .set_bounding_rect(element, rect)
        .map_err(|err| proptest::test_runner::TestCaseError::fail(format!("{err:?}")))?;

    let margin = 3.0 * width;
    let expected = (rect.y - 100.0 < height && rect.y + rect.height > 0.0)
        && (rect.x - margin < width && rect.x + rect.width + margin > 0.0);
    prop_assert_eq!(
        harness.element_in_view(element),
        expected,
        "rect={:?}, viewport={}x{}",
        rect,
        width,
        height
    );
    Ok(())
}

fn rect_strategy() -> BoxedStrategy<Rect> {
    (
        -5_000.0f64..5_000.0,
        -5_000.0f64..5_000.0,
        0.0f64..2_000.0,
        0.0f64..2_000.0,
    )
        .prop_map(|(x, y, width, height)| Rect::new(x, y, width, height))
        .boxed()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: engine_proptest_cases(),
        failure_persistence: Some(Box::new(
            FileFailurePersistence::Direct(ENGINE_PROPTEST_REGRESSION_FILE),
        )),
        .. ProptestConfig::default()
    })]

    #[test]
    fn engine_action_sequences_fire_each_watch_at_most_once(
        actions in engine_action_sequence_strategy()
    ) {
        assert_engine_sequence_is_stable(&actions)?;
    }

    #[test]
    fn debounced_call_bursts_settle_on_the_last_arguments(
        wait_ms in 0i64..=200,
        gaps in vec(0i64..=400, 1..=24),
    ) {
        assert_debounce_coalesces(wait_ms, &gaps)?;
    }

    #[test]
    fn default_visibility_test_matches_the_margin_formula(
        rect in rect_strategy(),
        width in 100.0f64..3_000.0,
        height in 100.0f64..3_000.0,
    ) {
        assert_in_view_matches_reference(rect, width, height)?;
    }
}

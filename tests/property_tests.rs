//! Property-based tests for planharness
//!
//! These tests verify:
//! - Variable marshaling is deterministic and one `-var` pair per key
//! - Backoff delays are monotonic and bounded
//! - The engine state machine never leaves a terminal state
//! - Classification depends only on the failure text

use proptest::prelude::*;

use planharness::engine::EngineState;
use planharness::retry::{BackoffStrategy, Classification, RetryClassifier, default_retryable_errors};
use planharness::runner::InvocationResult;
use planharness::variables::{ListStyle, VarValue, VariableSet};
use std::time::Duration;

// =============================================================================
// Variable marshaling
// =============================================================================

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

fn value_strategy() -> impl Strategy<Value = VarValue> {
    prop_oneof![
        "[a-zA-Z0-9 ._/-]{0,20}".prop_map(VarValue::String),
        any::<bool>().prop_map(VarValue::Bool),
        any::<i64>().prop_map(VarValue::Int),
        prop::collection::vec("[a-z0-9-]{1,8}", 0..4).prop_map(VarValue::List),
    ]
}

fn variable_set_strategy() -> impl Strategy<Value = Vec<(String, VarValue)>> {
    prop::collection::vec((key_strategy(), value_strategy()), 0..8)
}

proptest! {
    /// Same declarations in any order marshal to the same arguments
    #[test]
    fn marshaling_ignores_declaration_order(entries in variable_set_strategy()) {
        let mut seen = std::collections::HashSet::new();
        let unique: Vec<(String, VarValue)> = entries
            .into_iter()
            .filter(|(k, _)| seen.insert(k.clone()))
            .collect();

        let forward: VariableSet = unique.clone().into_iter().collect();
        let reversed: VariableSet = unique.into_iter().rev().collect();

        prop_assert_eq!(
            forward.to_cli_args(ListStyle::HclList).unwrap(),
            reversed.to_cli_args(ListStyle::HclList).unwrap()
        );
    }

    /// HCL list style emits exactly one `-var` pair per key, in key order
    #[test]
    fn one_flag_pair_per_key(entries in variable_set_strategy()) {
        let vars: VariableSet = entries.into_iter().collect();
        let args = vars.to_cli_args(ListStyle::HclList).unwrap();

        prop_assert_eq!(args.len(), vars.len() * 2);
        let keys: Vec<&str> = args
            .chunks(2)
            .map(|pair| {
                assert_eq!(pair[0], "-var");
                pair[1].split_once('=').map(|(k, _)| k).unwrap_or("")
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
    }

    /// Booleans always marshal lowercase
    #[test]
    fn bools_marshal_lowercase(key in key_strategy(), value in any::<bool>()) {
        let vars: VariableSet = [(key.clone(), value)].into_iter().collect();
        let args = vars.to_cli_args(ListStyle::HclList).unwrap();
        prop_assert_eq!(&args[1], &format!("{}={}", key, value));
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    /// Exponential delays never decrease and never pass the ceiling
    #[test]
    fn exponential_backoff_monotonic_and_capped(
        initial in 0u64..10_000,
        extra in 0u64..100_000,
        attempts in 1u32..80,
    ) {
        let max = initial + extra;
        let backoff = BackoffStrategy::Exponential { initial_delay_ms: initial, max_delay_ms: max };

        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = backoff.delay_after(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= Duration::from_millis(max));
            previous = delay;
        }
        prop_assert_eq!(backoff.delay_after(1), Duration::from_millis(initial));
    }

    /// Fixed delays do not depend on the attempt number
    #[test]
    fn fixed_backoff_is_constant(delay_ms in 0u64..1_000_000, attempt in 1u32..1000) {
        let backoff = BackoffStrategy::Fixed { delay_ms };
        prop_assert_eq!(backoff.delay_after(attempt), Duration::from_millis(delay_ms));
    }
}

// =============================================================================
// Engine state machine
// =============================================================================

fn state_strategy() -> impl Strategy<Value = EngineState> {
    prop_oneof![
        Just(EngineState::Idle),
        Just(EngineState::Invoking),
        Just(EngineState::Classifying),
        Just(EngineState::Retrying),
        Just(EngineState::Succeeded),
        Just(EngineState::FailedFatal),
        Just(EngineState::FailedExhausted),
        Just(EngineState::Cancelled),
    ]
}

proptest! {
    /// Terminal states have no outgoing edges
    #[test]
    fn terminal_states_are_absorbing(from in state_strategy(), to in state_strategy()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    /// No state transitions to itself
    #[test]
    fn no_self_loops(state in state_strategy()) {
        prop_assert!(!state.can_transition_to(state));
    }
}

// =============================================================================
// Classification
// =============================================================================

proptest! {
    /// Text with no known signature is fatal, whichever stream it is on
    #[test]
    fn unknown_failures_are_fatal(text in "[a-z ]{0,40}", exit in 1i32..255) {
        let classifier = RetryClassifier::new(&default_retryable_errors()).unwrap();
        let result = InvocationResult {
            exit_code: Some(exit),
            stdout: String::new(),
            stderr: text,
            duration: Duration::ZERO,
        };
        prop_assert_eq!(classifier.classify(&result), Some(Classification::Fatal));
    }

    /// A known signature anywhere in the output makes the failure retryable
    #[test]
    fn known_signature_is_retryable(prefix in "[a-z ]{0,20}", suffix in "[a-z ]{0,20}") {
        let classifier = RetryClassifier::new(&default_retryable_errors()).unwrap();
        let result = InvocationResult {
            exit_code: Some(1),
            stdout: format!("{}TLS handshake timeout{}", prefix, suffix),
            stderr: String::new(),
            duration: Duration::ZERO,
        };
        prop_assert!(classifier.classify(&result).is_some_and(|c| c.is_retryable()));
    }
}

//! Property-based coverage for the matcher, the filter tree, the
//! serializers, and the retention arithmetic.

use proptest::prelude::*;

use spoor::entry::{TraceEntry, Variable};
use spoor::filter::{Filter, TraceKeySet};
use spoor::matcher::{Matcher, MatchingMode};
use spoor::point::{TracePoint, TracePointKind};
use spoor::serializer::{deserialize_plaintext, deserialize_xml, Serializer};
use spoor::storage::shrink_amount;

fn leak(text: String) -> &'static str {
    Box::leak(text.into_boxed_str())
}

fn any_kind() -> impl Strategy<Value = TracePointKind> {
    prop_oneof![
        Just(TracePointKind::Error),
        Just(TracePointKind::Debug),
        Just(TracePointKind::Log),
        Just(TracePointKind::Watch),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_strict_matcher_is_equality(subject in "[ -~]{0,30}", other in "[ -~]{0,30}") {
        let matcher = Matcher::new(MatchingMode::StrictMatch, &subject).unwrap();
        prop_assert!(matcher.matches(&subject));
        prop_assert_eq!(matcher.matches(&other), subject == other);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_wildcard_star_alone_accepts_everything(subject in "[ -~]{0,50}") {
        let matcher = Matcher::new(MatchingMode::WildcardMatch, "*").unwrap();
        prop_assert!(matcher.matches(&subject));
    }

    #[test]
    fn prop_wildcard_never_panics(subject in "[ -~]{0,30}", pattern in "[ -~*?]{0,30}") {
        let matcher = Matcher::new(MatchingMode::WildcardMatch, &pattern).unwrap();
        let _ = matcher.matches(&subject);
    }

    #[test]
    fn prop_wildcard_prefix_pattern(subject in "[a-z]{0,20}", prefix in "[a-z]{0,5}") {
        let pattern = format!("{}*", prefix);
        let matcher = Matcher::new(MatchingMode::WildcardMatch, &pattern).unwrap();
        prop_assert_eq!(matcher.matches(&subject), subject.starts_with(&prefix));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_regexp_construction_never_panics(pattern in "[ -~]{0,20}") {
        if let Ok(matcher) = Matcher::new(MatchingMode::RegExpMatch, &pattern) {
            let _ = matcher.matches("src/scene.rs");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_filter_evaluation_deterministic(
        file in "[a-z/._-]{1,20}",
        function in "[a-z_]{1,20}",
        pattern in "[a-z*?]{0,10}",
    ) {
        let point = TracePoint::new(
            TracePointKind::Log,
            1,
            leak(file),
            1,
            leak(function),
        );
        let filter = Filter::MatchAny(vec![
            Filter::Function(Matcher::new(MatchingMode::WildcardMatch, &pattern).unwrap()),
            Filter::Path(Matcher::new(MatchingMode::WildcardMatch, &pattern).unwrap()),
        ]);
        let keys = TraceKeySet::new();
        let first = filter.accepts(&point, &keys);
        for _ in 0..10 {
            prop_assert_eq!(filter.accepts(&point, &keys), first);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_plaintext_round_trip(
        kind in any_kind(),
        file in "[A-Za-z0-9_/.:-]{1,30}",
        line in 0u32..1_000_000,
        function in "[ -~]{0,30}",
        message in proptest::option::of("[ -~]{0,40}"),
        variables in proptest::collection::vec(("[a-z][a-z0-9_]{0,8}", "[ -~]{0,20}"), 0..4),
        timestamp in 0u64..4_102_444_800,
    ) {
        let point = TracePoint::new(kind, 1, leak(file.clone()), line, leak(function.clone()));
        let mut entry = TraceEntry::with_timestamp(&point, message.as_deref(), timestamp);
        if !variables.is_empty() {
            entry.attach_variables(
                variables.iter().map(|(n, v)| Variable::new(n.clone(), v)).collect(),
            );
        }

        let serializer = Serializer::Plaintext { timestamps: true };
        let bytes = serializer.serialize(&entry);
        prop_assert_eq!(&bytes, &serializer.serialize(&entry));

        let text = String::from_utf8(bytes).unwrap();
        let parsed = deserialize_plaintext(&text).unwrap();
        prop_assert_eq!(parsed.timestamp, Some(timestamp));
        prop_assert_eq!(parsed.kind, kind);
        prop_assert_eq!(parsed.source_file, file);
        prop_assert_eq!(parsed.line, line);
        prop_assert_eq!(parsed.function, function);
        prop_assert_eq!(parsed.message, message);
        prop_assert_eq!(parsed.variables.len(), variables.len());
        for (parsed_var, (name, value)) in parsed.variables.iter().zip(&variables) {
            prop_assert_eq!(parsed_var.name(), name);
            prop_assert_eq!(parsed_var.value(), value);
        }
    }

    #[test]
    fn prop_xml_round_trip(
        kind in any_kind(),
        file in "[A-Za-z0-9_/.:-]{1,30}",
        line in 0u32..1_000_000,
        function in "[ -~]{0,30}",
        message in proptest::option::of("[ -~]{0,40}"),
        beautified in any::<bool>(),
        timestamp in proptest::num::u64::ANY,
    ) {
        let point = TracePoint::new(kind, 1, leak(file.clone()), line, leak(function.clone()));
        let entry = TraceEntry::with_timestamp(&point, message.as_deref(), timestamp);

        let serializer = Serializer::Xml { beautified };
        let text = String::from_utf8(serializer.serialize(&entry)).unwrap();
        let parsed = deserialize_xml(&text).unwrap();
        prop_assert_eq!(parsed.timestamp, Some(timestamp));
        prop_assert_eq!(parsed.kind, kind);
        prop_assert_eq!(parsed.source_file, file);
        prop_assert_eq!(parsed.line, line);
        prop_assert_eq!(parsed.function, function);
        prop_assert_eq!(parsed.message, message);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_shrink_amount_bounds(size in 0u64..10_000_000_000, percentage in 1u8..=100) {
        let amount = shrink_amount(size, percentage);
        prop_assert!(amount <= size);
        // At least the exact share, since the division rounds up.
        prop_assert!(amount as u128 * 100 >= size as u128 * percentage as u128);
        if size > 0 {
            prop_assert!(amount >= 1);
        }
    }
}

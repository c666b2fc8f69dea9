use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tf_formula::{FormulaEngine, FormulaError, IDate, MemoryStore, RegisterOptions, SeriesType};
use tf_frame::Series;
use tf_index::parse_stamp;
use tf_runtime::{DecisionAction, EngineConfig, IssueKind};

fn idate(d: u32) -> IDate {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
        .single()
        .expect("idate")
}

fn series(name: &str, points: &[(u32, f64)]) -> Series {
    Series::from_pairs(
        name,
        points.iter().map(|(d, value)| {
            (
                parse_stamp(&format!("2024-01-{d:02}")).expect("stamp"),
                *value,
            )
        }),
    )
    .expect("series")
}

/// `a`, `b` and `c` naive, `utc1` and `utc2` tz-aware.
fn engine() -> FormulaEngine<MemoryStore> {
    let mut engine =
        FormulaEngine::new(MemoryStore::new(), EngineConfig::default()).expect("engine");
    for (name, tzaware) in [
        ("a", false),
        ("b", false),
        ("c", false),
        ("utc1", true),
        ("utc2", true),
    ] {
        engine
            .update_series(name, &series(name, &[(1, 1.0), (2, 2.0)]), idate(1), tzaware)
            .expect("insert");
    }
    engine
}

fn texts(engine: &FormulaEngine<MemoryStore>) -> Vec<(String, Option<String>)> {
    engine
        .formula_names()
        .map(|name| (name.to_owned(), engine.formula(name, false).expect("text")))
        .collect()
}

#[test]
fn ill_typed_formulas_are_refused() {
    let mut engine = engine();
    for text in [
        "(priority)",
        "(+ 1 2)",
        r#"(series 1)"#,
        r#"(add (series "a") 3)"#,
        r#"(+ (series "a") (series "b"))"#,
    ] {
        let err = engine
            .register_formula("bad", text, RegisterOptions::default())
            .expect_err(text);
        assert!(matches!(err, FormulaError::Type(_)), "{text}: {err}");
        assert_eq!(
            engine.ledger().last().expect("record").issue.kind,
            IssueKind::TypeMismatch
        );
    }
    assert!(!engine.exists("bad"));
}

#[test]
fn every_unknown_operator_is_reported() {
    let mut engine = engine();
    let err = engine
        .register_formula(
            "f",
            r#"(foo (bar (series "a")) (add (series "b")))"#,
            RegisterOptions::default(),
        )
        .expect_err("unknown operators");
    let FormulaError::UnknownOperators(mut names) = err else {
        panic!("expected unknown operators, got {err}");
    };
    names.sort();
    assert_eq!(names, vec!["bar".to_owned(), "foo".to_owned()]);
}

#[test]
fn naive_and_aware_series_do_not_mix() {
    let mut engine = engine();
    let err = engine
        .register_formula("mixed", r#"(add (series "a") (series "utc1"))"#, RegisterOptions::default())
        .expect_err("mixed");
    let FormulaError::TimezoneMismatch { statuses, .. } = err else {
        panic!("expected a tz mismatch, got {err}");
    };
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().any(|status| status.contains("naive")));
    assert!(statuses.iter().any(|status| status.contains("tzaware")));

    engine
        .register_formula("aware", r#"(add (series "utc1") (series "utc2"))"#, RegisterOptions::default())
        .expect("two aware series");
    let meta = engine.metadata("aware").expect("meta").expect("some");
    assert_eq!(meta["tzaware"], serde_json::json!(true));

    // naive turns an aware leaf into a naive one
    engine
        .register_formula(
            "local",
            r#"(add (series "a") (naive (series "utc1") "Europe/Paris"))"#,
            RegisterOptions::default(),
        )
        .expect("naive wrapper");
}

#[test]
fn rename_rewrites_references_and_keeps_keywords() {
    let mut engine = engine();
    engine
        .register_formula(
            "f",
            r#"(add (series "a" #:fill 0) (series "b"))"#,
            RegisterOptions::default(),
        )
        .expect("f");
    engine
        .register_formula("g", r#"(* 2 (series "f"))"#, RegisterOptions::default())
        .expect("g");

    engine.rename("a", "z").expect("rename primary");
    assert_eq!(
        engine.formula("f", false).expect("text").as_deref(),
        Some(r#"(add (series "z" #:fill 0) (series "b"))"#)
    );
    assert_eq!(engine.type_of("z"), Some(SeriesType::Primary));
    assert_eq!(engine.type_of("a"), None);

    engine.rename("f", "h").expect("rename formula");
    assert_eq!(
        engine.formula("g", false).expect("text").as_deref(),
        Some(r#"(* 2 (series "h"))"#)
    );
    assert_eq!(engine.type_of("h"), Some(SeriesType::Formula));
    assert_eq!(
        engine.ledger().last().expect("record").issue.kind,
        IssueKind::Renamed
    );
}

#[test]
fn rename_onto_a_referenced_name_changes_nothing() {
    let mut engine = engine();
    engine
        .register_formula(
            "f",
            r#"(add (series "a") (series "ghost"))"#,
            RegisterOptions::default().allow_unknown(),
        )
        .expect("f");
    engine
        .register_formula("g", r#"(series "b")"#, RegisterOptions::default())
        .expect("g");
    let before = texts(&engine);

    let err = engine.rename("b", "ghost").expect_err("conflict");
    let FormulaError::RenameConflict { referenced_by, .. } = err else {
        panic!("expected a rename conflict, got {err}");
    };
    assert_eq!(referenced_by, vec!["f".to_owned()]);
    assert_eq!(texts(&engine), before);
    assert_eq!(engine.type_of("b"), Some(SeriesType::Primary));
    assert_eq!(
        engine.ledger().last().expect("record").action,
        DecisionAction::Reject
    );

    assert!(matches!(
        engine.rename("b", "c"),
        Err(FormulaError::NameTaken(_))
    ));
    assert!(matches!(
        engine.rename("nobody", "x"),
        Err(FormulaError::UnknownName(_))
    ));
    assert!(matches!(
        engine.rename("nobody", "nobody"),
        Err(FormulaError::UnknownName(_))
    ));
}

#[test]
fn deleting_a_primary_leaves_dependents_registered() {
    let mut engine = engine();
    engine
        .register_formula("f", r#"(series "c")"#, RegisterOptions::default())
        .expect("f");
    engine.delete("c").expect("delete");
    assert!(!engine.exists("c"));
    assert_eq!(engine.type_of("f"), Some(SeriesType::Formula));
    assert!(matches!(
        engine.delete("c"),
        Err(FormulaError::Store(_))
    ));
}

proptest! {
    #[test]
    fn renaming_to_itself_is_a_no_op(pick in 0usize..4) {
        let mut engine = engine();
        engine
            .register_formula("f", r#"(add (series "a") (series "b"))"#, RegisterOptions::default())
            .expect("f");
        engine
            .register_formula("g", r#"(row-mean (series "f") (series "c"))"#, RegisterOptions::default())
            .expect("g");
        let name = ["a", "b", "f", "g"][pick];
        let before = texts(&engine);
        let records = engine.ledger().records().len();

        engine.rename(name, name).expect("self rename");
        prop_assert_eq!(texts(&engine), before);
        prop_assert_eq!(engine.ledger().records().len(), records);
        prop_assert!(engine.exists(name));
    }
}

use std::sync::Arc;

use chrono::{TimeDelta, TimeZone, Utc};
use tf_formula::{
    BindingRow, Component, FormulaEngine, FormulaError, GroupType, HistoryQuery, IDate,
    MemoryStore, Query, RegisterOptions,
};
use tf_frame::{Frame, Series};
use tf_index::{Stamp, TimeIndex, Window, parse_stamp};
use tf_runtime::{EngineConfig, IssueKind};

fn day(d: u32) -> Stamp {
    parse_stamp(&format!("2024-01-{d:02}")).expect("stamp")
}

fn idate(d: u32) -> IDate {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
        .single()
        .expect("idate")
}

fn series(name: &str, points: &[(u32, f64)]) -> Series {
    Series::from_pairs(name, points.iter().map(|(d, value)| (day(*d), *value))).expect("series")
}

fn pairs(series: &Series) -> Vec<(u32, f64)> {
    series
        .iter()
        .map(|(stamp, value)| (stamp.format("%d").to_string().parse().expect("day"), value))
        .collect()
}

fn empty_engine(config: EngineConfig) -> FormulaEngine<MemoryStore> {
    FormulaEngine::new(MemoryStore::new(), config).expect("engine")
}

fn insert(engine: &mut FormulaEngine<MemoryStore>, name: &str, points: &[(u32, f64)], at: u32) {
    engine
        .update_series(name, &series(name, points), idate(at), false)
        .expect("insert");
}

fn table(columns: &[(&str, f64)]) -> Frame {
    let index = TimeIndex::new(vec![day(1), day(2)]).expect("index");
    let columns = columns
        .iter()
        .map(|(name, value)| ((*name).to_owned(), vec![*value; 2]))
        .collect();
    Frame::new(index, columns).expect("frame")
}

#[test]
fn nested_formulas_evaluate_with_leaf_options() {
    let mut engine = empty_engine(EngineConfig::default());
    insert(&mut engine, "a", &[(1, 1.0), (2, 2.0), (3, 3.0)], 1);
    insert(&mut engine, "b", &[(2, 10.0)], 1);
    engine
        .register_formula(
            "f",
            r#"(add (series "a") (series "b" #:fill 0))"#,
            RegisterOptions::default(),
        )
        .expect("f");
    engine
        .register_formula("g", r#"(* 2 (series "f"))"#, RegisterOptions::default())
        .expect("g");

    let value = engine.get("g", &Query::latest()).expect("get").expect("some");
    assert_eq!(pairs(&value), vec![(1, 2.0), (2, 24.0), (3, 6.0)]);

    let window = Window::new(Some(day(2)), None);
    let value = engine
        .get("g", &Query::latest().with_window(window))
        .expect("get")
        .expect("some");
    assert_eq!(pairs(&value), vec![(2, 24.0), (3, 6.0)]);

    assert_eq!(
        engine.formula("g", true).expect("text").as_deref(),
        Some(r#"(* 2 (add (series "a") (series "b" #:fill 0)))"#)
    );
    assert!(engine.get("nowhere", &Query::latest()).expect("get").is_none());
}

#[test]
fn history_is_keyed_by_every_dependency_insertion() {
    let mut engine = empty_engine(EngineConfig::default());
    insert(&mut engine, "X", &[(1, 1.0), (2, 1.0)], 1);
    insert(&mut engine, "Y", &[(1, 10.0), (2, 10.0)], 2);
    insert(&mut engine, "X", &[(1, 3.0), (2, 3.0)], 3);
    insert(&mut engine, "Y", &[(1, 30.0), (2, 30.0)], 3);
    engine
        .register_formula("h", r#"(add (series "X") (series "Y"))"#, RegisterOptions::default())
        .expect("h");

    let history = engine
        .history("h", &HistoryQuery::all())
        .expect("history")
        .expect("some");
    assert_eq!(
        history.keys().copied().collect::<Vec<_>>(),
        vec![idate(1), idate(2), idate(3)]
    );
    assert!(history[&idate(1)].is_empty());
    assert_eq!(pairs(&history[&idate(2)]), vec![(1, 11.0), (2, 11.0)]);
    assert_eq!(pairs(&history[&idate(3)]), vec![(1, 33.0), (2, 33.0)]);

    assert_eq!(
        engine
            .insertion_dates("h", &Window::unbounded())
            .expect("idates"),
        vec![idate(1), idate(2), idate(3)]
    );

    let bounded = engine
        .history("h", &HistoryQuery::between(Some(idate(2)), None))
        .expect("history")
        .expect("some");
    assert_eq!(
        bounded.keys().copied().collect::<Vec<_>>(),
        vec![idate(2), idate(3)]
    );
    // X has no version inside the bounds and is read as of idate 2
    assert_eq!(pairs(&bounded[&idate(2)]), vec![(1, 11.0), (2, 11.0)]);

    let at_two = engine
        .get("h", &Query::as_of(idate(2)))
        .expect("get")
        .expect("some");
    assert!(at_two.semantic_eq(&history[&idate(2)]));
}

#[test]
fn diff_history_keeps_only_changes() {
    let mut engine = empty_engine(EngineConfig::default());
    insert(&mut engine, "X", &[(1, 1.0), (2, 1.0)], 1);
    insert(&mut engine, "X", &[(2, 5.0)], 2);
    engine
        .register_formula("f", r#"(* 2 (series "X"))"#, RegisterOptions::default())
        .expect("f");

    let primary = engine
        .history("X", &HistoryQuery::all().diff())
        .expect("history")
        .expect("some");
    assert_eq!(pairs(&primary[&idate(1)]), vec![(1, 1.0), (2, 1.0)]);
    assert_eq!(pairs(&primary[&idate(2)]), vec![(2, 5.0)]);

    let formula = engine
        .history("f", &HistoryQuery::all().diff())
        .expect("history")
        .expect("some");
    assert_eq!(pairs(&formula[&idate(1)]), vec![(1, 2.0), (2, 2.0)]);
    assert_eq!(pairs(&formula[&idate(2)]), vec![(2, 10.0)]);
}

#[test]
fn constant_carries_its_own_revision() {
    let mut engine = empty_engine(EngineConfig::default());
    insert(&mut engine, "a", &[(1, 1.0), (2, 1.0), (3, 1.0)], 1);
    let constant = r#"(constant 5 (date "2024-01-01") (date "2024-01-03") "D" (date "2024-01-02"))"#;
    engine
        .register_formula("k", constant, RegisterOptions::default())
        .expect("k");
    engine
        .register_formula(
            "shifted",
            &format!(r#"(add (series "a") {constant})"#),
            RegisterOptions::default(),
        )
        .expect("shifted");

    let latest = engine.get("k", &Query::latest()).expect("get").expect("some");
    assert_eq!(pairs(&latest), vec![(1, 5.0), (2, 5.0), (3, 5.0)]);
    let early = engine
        .get("k", &Query::as_of(idate(1)))
        .expect("get")
        .expect("some");
    assert!(early.is_empty());

    let history = engine
        .history("k", &HistoryQuery::all())
        .expect("history")
        .expect("some");
    assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![idate(2)]);
    assert_eq!(
        engine
            .insertion_dates("k", &Window::unbounded())
            .expect("idates"),
        vec![idate(2)]
    );

    let history = engine
        .history("shifted", &HistoryQuery::all())
        .expect("history")
        .expect("some");
    assert_eq!(
        history.keys().copied().collect::<Vec<_>>(),
        vec![idate(1), idate(2)]
    );
    assert!(history[&idate(1)].is_empty());
    assert_eq!(
        pairs(&history[&idate(2)]),
        vec![(1, 6.0), (2, 6.0), (3, 6.0)]
    );
}

fn staircase_engine(fast: bool) -> FormulaEngine<MemoryStore> {
    let config = EngineConfig {
        fast_staircase: fast,
        ..EngineConfig::default()
    };
    let mut engine = empty_engine(config);
    insert(&mut engine, "a", &[(1, 1.0), (2, 1.0), (3, 1.0), (4, 1.0)], 1);
    insert(&mut engine, "a", &[(3, 2.0), (4, 2.0)], 2);
    insert(&mut engine, "b", &[(1, 10.0), (2, 10.0), (3, 10.0), (4, 10.0)], 1);
    insert(&mut engine, "b", &[(4, 30.0)], 3);
    engine
        .register_formula(
            "s",
            r#"(add (series "a") (* 2 (series "b")))"#,
            RegisterOptions::default(),
        )
        .expect("s");
    engine
}

#[test]
fn fast_and_slow_staircases_agree() {
    let window = Window::unbounded();
    let fast = staircase_engine(true)
        .staircase("s", TimeDelta::zero(), &window)
        .expect("fast")
        .expect("some");
    let slow = staircase_engine(false)
        .staircase("s", TimeDelta::zero(), &window)
        .expect("slow")
        .expect("some");
    assert_eq!(
        pairs(&fast),
        vec![(1, 21.0), (2, 21.0), (3, 22.0), (4, 62.0)]
    );
    assert!(fast.semantic_eq(&slow));

    let primary = staircase_engine(true)
        .staircase("b", TimeDelta::days(1), &window)
        .expect("primary")
        .expect("some");
    assert_eq!(pairs(&primary), vec![(2, 10.0), (3, 10.0), (4, 30.0)]);
}

#[test]
fn filled_leaves_take_the_whole_series_staircase() {
    let before = Utc
        .with_ymd_and_hms(2023, 12, 31, 0, 0, 0)
        .single()
        .expect("idate");
    let build = |fast: bool| {
        let config = EngineConfig {
            fast_staircase: fast,
            ..EngineConfig::default()
        };
        let mut engine = empty_engine(config);
        let x = series("X", &[(1, 1.0), (2, 1.0), (3, 1.0), (4, 1.0), (5, 1.0), (6, 1.0)]);
        engine.update_series("X", &x, before, false).expect("X");
        engine
            .update_series("Y", &series("Y", &[(1, 10.0)]), before, false)
            .expect("Y");
        insert(&mut engine, "Y", &[(1, 10.0), (2, 20.0)], 3);
        engine
            .register_formula(
                "s",
                r#"(add (series "X") (series "Y" #:fill "ffill"))"#,
                RegisterOptions::default(),
            )
            .expect("s");
        engine
    };

    let expected = vec![(1, 11.0), (2, 11.0), (3, 21.0), (4, 21.0), (5, 21.0), (6, 21.0)];
    for fast in [true, false] {
        let stair = build(fast)
            .staircase("s", TimeDelta::zero(), &Window::unbounded())
            .expect("staircase")
            .expect("some");
        assert_eq!(pairs(&stair), expected, "fast = {fast}");
    }
}

#[test]
fn windowed_history_matches_windowed_reads_through_naive() {
    let mut engine = empty_engine(EngineConfig::default());
    let utc = Series::from_pairs(
        "X",
        [
            (parse_stamp("2024-01-01 23:00").expect("stamp"), 1.0),
            (parse_stamp("2024-01-02 12:00").expect("stamp"), 2.0),
        ],
    )
    .expect("series");
    engine.update_series("X", &utc, idate(1), true).expect("X");
    engine
        .register_formula(
            "local",
            r#"(naive (series "X") "Europe/Paris")"#,
            RegisterOptions::default(),
        )
        .expect("local");

    let window = Window::new(Some(day(2)), None);
    let history = engine
        .history("local", &HistoryQuery::all().with_window(window))
        .expect("history")
        .expect("some");
    let read = engine
        .get("local", &Query::as_of(idate(1)).with_window(window))
        .expect("get")
        .expect("some");
    assert_eq!(
        read.index().stamps(),
        &[
            parse_stamp("2024-01-02 00:00").expect("stamp"),
            parse_stamp("2024-01-02 13:00").expect("stamp"),
        ]
    );
    assert!(history[&idate(1)].semantic_eq(&read));
}

fn scenario_engine() -> FormulaEngine<MemoryStore> {
    let mut engine = empty_engine(EngineConfig::default());
    engine
        .update_group("temp", &table(&[("low", 1.0), ("high", 2.0)]), idate(1))
        .expect("temp");
    engine
        .update_group("price", &table(&[("a", 10.0), ("b", 20.0), ("c", 30.0)]), idate(1))
        .expect("price");
    engine
        .register_formula(
            "f",
            r#"(add (series "t") (series "p"))"#,
            RegisterOptions::default().allow_unknown(),
        )
        .expect("f");
    engine
}

#[test]
fn bound_groups_yield_one_column_per_scenario() {
    let mut engine = scenario_engine();
    engine
        .register_formula_bindings(
            "scenarios",
            "f",
            vec![
                BindingRow::new("t", "temp", "weather"),
                BindingRow::new("p", "price", "market"),
            ],
        )
        .expect("bindings");
    assert_eq!(engine.group_type("scenarios"), Some(GroupType::Bound));

    let frame = engine
        .group_get("scenarios", &Query::latest())
        .expect("group")
        .expect("some");
    let mut names = frame.column_names().map(str::to_owned).collect::<Vec<_>>();
    names.sort();
    assert_eq!(
        names,
        ["a-high", "a-low", "b-high", "b-low", "c-high", "c-low"]
    );
    let column = frame.column("b-high").expect("b-high");
    assert_eq!(column.values(), &[22.0, 22.0]);

    assert!(matches!(
        engine.update_group("scenarios", &table(&[("x", 1.0)]), idate(2)),
        Err(FormulaError::FormulaUpdate(_))
    ));
}

#[test]
fn bindings_are_checked_against_their_groups() {
    let mut engine = scenario_engine();
    assert!(matches!(
        engine.register_formula_bindings("s", "nope", vec![BindingRow::new("t", "temp", "w")]),
        Err(FormulaError::NotAFormula(_))
    ));
    assert!(matches!(
        engine.register_formula_bindings("temp", "f", vec![BindingRow::new("t", "temp", "w")]),
        Err(FormulaError::NameTaken(_))
    ));

    engine
        .update_group("temp_bis", &table(&[("low", 3.0), ("mid", 4.0)]), idate(1))
        .expect("temp_bis");
    engine
        .register_formula_bindings(
            "uneven",
            "f",
            vec![
                BindingRow::new("t", "temp", "weather"),
                BindingRow::new("p", "temp_bis", "weather"),
            ],
        )
        .expect("bindings");
    let err = engine
        .group_get("uneven", &Query::latest())
        .expect_err("missing scenario");
    assert!(matches!(
        err,
        FormulaError::MissingScenario { ref group, ref scenario }
            if group == "temp_bis" && scenario == "high"
    ));

    engine
        .register_formula_bindings("unused", "f", vec![BindingRow::new("z", "temp", "weather")])
        .expect("bindings");
    assert!(matches!(
        engine.group_get("unused", &Query::latest()),
        Err(FormulaError::NoGroupMappings(_))
    ));
}

#[test]
fn binding_records_need_the_three_binding_columns() {
    let mut engine = scenario_engine();
    let err = engine
        .register_formula_binding_records(
            "partial",
            "f",
            &[serde_json::json!({"series": "t", "group": "temp"})],
        )
        .expect_err("missing family");
    assert!(matches!(err, FormulaError::MalformedBinding(_)), "{err}");
    assert!(engine.bindings("partial").is_none());
    assert_eq!(
        engine.ledger().last().expect("record").issue.kind,
        IssueKind::MalformedBinding
    );

    engine
        .register_formula_binding_records(
            "records",
            "f",
            &[
                serde_json::json!({"series": "t", "group": "temp", "family": "weather"}),
                serde_json::json!({"series": "p", "group": "price", "family": "market"}),
            ],
        )
        .expect("records");
    let frame = engine
        .group_get("records", &Query::latest())
        .expect("group")
        .expect("some");
    assert_eq!(frame.column("a-low").expect("a-low").values(), &[11.0, 11.0]);
}

#[test]
fn group_formulas_combine_tables() {
    let mut engine = scenario_engine();
    engine
        .register_group_formula("dearer", r#"(group-add (group "price") 1)"#, RegisterOptions::default())
        .expect("group formula");
    assert_eq!(engine.group_type("dearer"), Some(GroupType::Formula));
    let frame = engine
        .group_get("dearer", &Query::latest())
        .expect("group")
        .expect("some");
    assert_eq!(frame.column("c").expect("c").values(), &[31.0, 31.0]);

    assert!(matches!(
        engine.register_group_formula("bad", r#"(group "nowhere")"#, RegisterOptions::default()),
        Err(FormulaError::UnknownGroups { .. })
    ));
}

#[test]
fn an_engine_reads_through_another() {
    let mut remote = empty_engine(EngineConfig {
        namespace: "remote".to_owned(),
        ..EngineConfig::default()
    });
    insert(&mut remote, "r", &[(1, 1.0), (2, 2.0)], 1);
    remote
        .register_formula("rf", r#"(* 10 (series "r"))"#, RegisterOptions::default())
        .expect("rf");

    let mut local = empty_engine(EngineConfig::default());
    local.add_source(Arc::new(remote));
    insert(&mut local, "x", &[(1, 1.0), (2, 2.0)], 1);

    assert!(local.exists("rf"));
    assert_eq!(local.type_of("rf"), None);
    assert_eq!(
        local.formula("rf", false).expect("text").as_deref(),
        Some(r#"(* 10 (series "r"))"#)
    );

    local
        .register_formula("g", r#"(add (series "rf") (series "x"))"#, RegisterOptions::default())
        .expect("g");
    let value = local.get("g", &Query::latest()).expect("get").expect("some");
    assert_eq!(pairs(&value), vec![(1, 11.0), (2, 22.0)]);

    let components = local
        .formula_components("g", true)
        .expect("components")
        .expect("some");
    assert_eq!(components.parts.len(), 2);
    let Component::Formula(remote_part) = &components.parts[0] else {
        panic!("expected the remote formula to be broken down");
    };
    assert_eq!(remote_part.name, "rf");
    assert_eq!(remote_part.parts, vec![Component::Series("r".to_owned())]);
    assert_eq!(components.parts[1], Component::Series("x".to_owned()));

    let history = local
        .history("g", &HistoryQuery::all())
        .expect("history")
        .expect("some");
    assert_eq!(history.keys().copied().collect::<Vec<_>>(), vec![idate(1)]);
}

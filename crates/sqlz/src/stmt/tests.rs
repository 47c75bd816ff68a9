use super::*;
use crate::scan::RawColumn;
use crate::testing::{Event, Expectation, MockDb, MockError, MockRows};
use std::time::Duration;
use tokio_postgres::types::Type;

fn ints(n: usize) -> MockRows {
    MockRows::new(&vec![Type::INT4; n])
}

fn backend_error(err: &Error) -> Option<&MockError> {
    err.backend().downcast_ref::<MockError>()
}

// ==================== building ====================

#[test]
fn append_separates_fragments_with_one_space() {
    let s = stmt("insert").append("into").append("foo");
    assert_eq!(s.sql(), "insert into foo");
}

#[test]
fn append_does_not_double_an_existing_space() {
    let s = stmt("select ").append("a ").append("from foo");
    assert_eq!(s.sql(), "select a from foo");
}

#[test]
fn trim_drops_trailing_separator() {
    let s = stmt("select").append("a,").append("b,").append("c,").trim(",");
    assert_eq!(s.sql(), "select a, b, c");
}

#[test]
fn trim_without_matching_suffix_is_a_noop() {
    let s = stmt("select a").trim(",");
    assert_eq!(s.sql(), "select a");
}

#[test]
fn trim_twice_only_removes_once() {
    let s = stmt("select").append("a,").trim(",").trim(",");
    assert_eq!(s.sql(), "select a");
}

#[test]
fn trim_removes_a_single_occurrence() {
    let s = stmt("values (1,,").trim(",");
    assert_eq!(s.sql(), "values (1,");
}

#[test]
fn trimmed_space_does_not_glue_next_fragment() {
    let s = stmt("select a ").trim(" ").append("from foo");
    assert_eq!(s.sql(), "select a from foo");
}

#[test]
fn insert_with_looped_placeholders() {
    let mut s = stmt("insert into foo ( a, b, c ) values (");
    for v in [1, 2, 3] {
        s = s.append("?,").bind(v);
    }
    let s = s.trim(",").append(")");

    assert_eq!(s.sql(), "insert into foo ( a, b, c ) values ( ?, ?, ? )");
    assert_eq!(s.arg_count(), 3);
    let args: Vec<String> = s.params_ref().iter().map(|p| format!("{p:?}")).collect();
    assert_eq!(args, ["1", "2", "3"]);
}

#[test]
fn select_with_scan_targets() {
    let (a, b) = (Slot::<i32>::new(), Slot::<i32>::new());
    let s = stmt("select")
        .append("a,")
        .scan(&a)
        .append("b,")
        .scan(&b)
        .trim(",");

    assert_eq!(s.sql(), "select a, b");
    assert_eq!(s.target_count(), 2);
    assert_eq!(s.arg_count(), 0);
}

#[test]
fn bind_all_keeps_order() {
    let s = stmt("select * from foo where id in ($1, $2, $3)")
        .bind_all(["x", "y"])
        .bind_value(Arc::new(3_i64));
    let args: Vec<String> = s.params_ref().iter().map(|p| format!("{p:?}")).collect();
    assert_eq!(args, ["\"x\"", "\"y\"", "3"]);
}

#[test]
fn sql_is_readable_mid_construction() {
    let s = stmt("update foo set");
    assert_eq!(s.sql(), "update foo set");
    let s = s.append("a = ?,").bind(1);
    assert_eq!(s.sql(), "update foo set a = ?,");
}

#[test]
fn debug_shows_sql_and_counts() {
    let a = Slot::<i32>::new();
    let s = stmt("select a from foo where b = $1").bind(2).scan(&a).tag("foo.by_b");
    let out = format!("{s:?}");
    assert!(out.contains("select a from foo where b = $1"));
    assert!(out.contains("targets: 1"));
    assert!(out.contains("foo.by_b"));
}

#[test]
#[should_panic(expected = "sql fragment must not be empty")]
fn empty_first_fragment_panics() {
    let _ = stmt("");
}

// ==================== execute ====================

#[tokio::test]
async fn execute_sends_text_and_args() {
    let db = MockDb::new();
    db.expect(
        Expectation::exec("insert into foo ( a, b, c ) values ( ?, ?, ? )")
            .with_args(&[&1, &2, &3])
            .returns(ExecResult::new(100).with_last_insert_id(99)),
    );

    let result = stmt("insert into foo ( a, b, c ) values (")
        .append("?,")
        .bind(1)
        .append("?,")
        .bind(2)
        .append("?,")
        .bind(3)
        .trim(",")
        .append(")")
        .execute(&Context::background(), &db)
        .await
        .unwrap();

    db.expectations_were_met().unwrap();
    assert_eq!(result.last_insert_id(), Some(99));
    assert_eq!(result.rows_affected(), 100);
}

#[tokio::test]
async fn execute_failure_carries_sql() {
    let db = MockDb::new();
    db.expect(
        Expectation::exec("insert into foo ( a, b, c ) values ( 1, 2, 3 )")
            .fails(MockError::new("failed")),
    );

    let err = stmt("insert into foo ( a, b, c ) values ( 1, 2, 3 )")
        .execute(&Context::background(), &db)
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert!(matches!(err, Error::Exec { .. }));
    assert_eq!(backend_error(&err), Some(&MockError::new("failed")));
    assert_eq!(
        err.to_string(),
        "execute statement; sql=\"insert into foo ( a, b, c ) values ( 1, 2, 3 )\": failed"
    );
    assert_eq!(err.sql(), Some("insert into foo ( a, b, c ) values ( 1, 2, 3 )"));
}

#[tokio::test]
async fn execute_honours_context_deadline() {
    let db = MockDb::new();
    db.expect(Expectation::exec("select pg_sleep(1)").delay(Duration::from_secs(5)));

    let ctx = Context::with_timeout(Duration::from_millis(10));
    let err = stmt("select pg_sleep(1)")
        .execute(&ctx, &db)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Exec { .. }));
    assert!(err.is_deadline_exceeded());
}

// ==================== fetch_one ====================

#[tokio::test]
async fn fetch_one_scans_into_slots() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a, b, c from foo where a = ? and b = ?")
            .with_args(&[&1, &2])
            .returns_rows(ints(3).row(&[&1, &2, &3])),
    );

    let (a, b, c) = (Slot::<i32>::new(), Slot::<i32>::new(), Slot::<i32>::new());
    stmt("select")
        .append("a,")
        .scan(&a)
        .append("b,")
        .scan(&b)
        .append("c,")
        .scan(&c)
        .trim(",")
        .append("from foo where")
        .append("a = ?")
        .bind(1)
        .append("and")
        .append("b = ?")
        .bind(2)
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap();

    db.expectations_were_met().unwrap();
    assert_eq!((a.get(), b.get(), c.get()), (Some(1), Some(2), Some(3)));
}

#[tokio::test]
async fn fetch_one_query_failure() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a, b, c from foo limit 1").fails(MockError::new("failed")));

    let err = stmt("select a, b, c from foo limit 1")
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert_eq!(backend_error(&err), Some(&MockError::new("failed")));
    assert_eq!(
        err.to_string(),
        "execute query; sql=\"select a, b, c from foo limit 1\": failed"
    );
}

#[tokio::test]
async fn fetch_one_without_rows_is_a_scan_error() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a from foo limit 1").returns_rows(ints(1)));

    let a = Slot::<i32>::new();
    let err = stmt("select a from foo limit 1")
        .scan(&a)
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap_err();

    assert!(err.is_no_rows());
    assert_eq!(
        err.to_string(),
        "scan row; sql=\"select a from foo limit 1\": no rows in result set"
    );
    assert!(!a.is_set());
}

#[tokio::test]
async fn fetch_one_column_count_mismatch() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a, b, c from foo").returns_rows(ints(3).row(&[&1, &2, &3])));

    let (a, b) = (Slot::<i32>::new(), Slot::<i32>::new());
    let err = stmt("select a, b, c from foo")
        .scan(&a)
        .scan(&b)
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Scan { .. }));
    assert!(!err.is_no_rows());
    assert!(
        err.to_string()
            .ends_with("expected 3 destination arguments in scan, not 2")
    );
}

#[tokio::test]
async fn fetch_one_reads_nulls_into_option_slots() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a, b from foo")
            .returns_rows(MockRows::new(&[Type::TEXT, Type::INT8]).row(&[&"x", &None::<i64>])),
    );

    let a = Slot::<String>::new();
    let b = Slot::<Option<i64>>::new();
    stmt("select a, b from foo")
        .scan(&a)
        .scan(&b)
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap();

    assert_eq!(a.take().as_deref(), Some("x"));
    assert_eq!(b.get(), Some(None));
}

#[tokio::test]
async fn fetch_one_scans_driver_extension_types() {
    let id = uuid::Uuid::new_v4();
    let at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let doc = serde_json::json!({"k": [1, 2]});
    let db = MockDb::new();
    db.expect(Expectation::query("select id, at, doc from foo").returns_rows(
        MockRows::new(&[Type::UUID, Type::TIMESTAMPTZ, Type::JSONB]).row(&[&id, &at, &doc]),
    ));

    let id_slot = Slot::<uuid::Uuid>::new();
    let at_slot = Slot::<chrono::DateTime<chrono::Utc>>::new();
    let doc_slot = Slot::<serde_json::Value>::new();
    stmt("select id, at, doc from foo")
        .scan(&id_slot)
        .scan(&at_slot)
        .scan(&doc_slot)
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap();

    assert_eq!(id_slot.get(), Some(id));
    assert_eq!(at_slot.get(), Some(at));
    assert_eq!(doc_slot.get(), Some(doc));
}

/// Upper-cases a text column into its slot.
struct Shout(Slot<String>);

impl ScanTarget for Shout {
    fn scan(&self, column: &RawColumn) -> std::result::Result<(), BoxError> {
        let text: String = column.decode()?;
        self.0.replace(text.to_uppercase());
        Ok(())
    }
}

/// Records whether the column was NULL, whatever its type.
struct NullFlag(Slot<bool>);

impl ScanTarget for NullFlag {
    fn scan(&self, column: &RawColumn) -> std::result::Result<(), BoxError> {
        self.0.replace(column.is_null());
        Ok(())
    }
}

#[tokio::test]
async fn fetch_one_fills_custom_targets() {
    let db = MockDb::new();
    db.expect(Expectation::query("select name, note, age from people").returns_rows(
        MockRows::new(&[Type::TEXT, Type::TEXT, Type::INT4]).row(&[&"ada", &None::<String>, &36]),
    ));

    let (name, note_missing, age_missing) = (Slot::new(), Slot::new(), Slot::new());
    let s = stmt("select name, note, age from people")
        .scan_target(Box::new(Shout(name.clone())))
        .scan_all([
            Box::new(NullFlag(note_missing.clone())) as Box<dyn ScanTarget>,
            Box::new(NullFlag(age_missing.clone())),
        ]);
    assert_eq!(s.target_count(), 3);
    s.fetch_one(&Context::background(), &db).await.unwrap();

    db.expectations_were_met().unwrap();
    assert_eq!(name.take().as_deref(), Some("ADA"));
    assert_eq!(note_missing.get(), Some(true));
    assert_eq!(age_missing.get(), Some(false));
}

#[tokio::test]
async fn custom_target_failure_is_a_scan_error() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select age from people").returns_rows(ints(1).row(&[&36])),
    );

    let name = Slot::new();
    let err = stmt("select age from people")
        .scan_target(Box::new(Shout(name.clone())))
        .fetch_one(&Context::background(), &db)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Scan { .. }));
    assert!(err.to_string().contains("converting column 0 of type int4"));
    assert!(!name.is_set());
}

// ==================== fetch_each ====================

#[derive(Debug, Clone, PartialEq)]
struct Foo {
    a: i32,
    b: Option<i32>,
    c: i32,
}

#[tokio::test]
async fn fetch_each_collects_until_callback_stops() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a, b, c from foo").returns_rows(
            ints(3)
                .row(&[&1, &2, &3])
                .row(&[&4, &None::<i32>, &6])
                .row(&[&7, &8, &9])
                .row(&[&10, &11, &12]),
        ),
    );

    let (a, b, c) = (Slot::<i32>::new(), Slot::<Option<i32>>::new(), Slot::<i32>::new());
    let mut foos = Vec::new();
    stmt("select")
        .append("a,")
        .scan(&a)
        .append("b,")
        .scan(&b)
        .append("c,")
        .scan(&c)
        .trim(",")
        .append("from foo")
        .fetch_each(&Context::background(), &db, || {
            if foos.len() == 3 {
                return false;
            }
            foos.push(Foo {
                a: a.get().unwrap_or_default(),
                b: b.get().flatten(),
                c: c.get().unwrap_or_default(),
            });
            true
        })
        .await
        .unwrap();

    db.expectations_were_met().unwrap();
    assert_eq!(
        foos,
        [
            Foo { a: 1, b: Some(2), c: 3 },
            Foo { a: 4, b: None, c: 6 },
            Foo { a: 7, b: Some(8), c: 9 },
        ]
    );
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn fetch_each_stops_scanning_on_first_false() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a from foo")
            .returns_rows(ints(1).row(&[&1]).row(&[&2]).row(&[&3]).row(&[&4])),
    );

    let a = Slot::<i32>::new();
    let mut seen = Vec::new();
    stmt("select a from foo")
        .scan(&a)
        .fetch_each(&Context::background(), &db, || {
            seen.extend(a.get());
            seen.len() < 3
        })
        .await
        .unwrap();

    assert_eq!(seen, [1, 2, 3]);
    assert_eq!(db.rows_delivered(), 3);
    assert_eq!(db.cursor_closes(), 1);
    db.expectations_were_met().unwrap();
}

#[tokio::test]
async fn fetch_each_exhausts_rows() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a from foo").returns_rows(ints(1).row(&[&1]).row(&[&2])));

    let a = Slot::<i32>::new();
    let mut calls = 0;
    stmt("select a from foo")
        .scan(&a)
        .fetch_each(&Context::background(), &db, || {
            calls += 1;
            true
        })
        .await
        .unwrap();

    assert_eq!(calls, 2);
    assert_eq!(a.get(), Some(2));
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn fetch_each_query_failure_opens_no_cursor() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a, b, c from foo").fails(MockError::new("failed")));

    let err = stmt("select a, b, c from foo")
        .fetch_each(&Context::background(), &db, || true)
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert_eq!(backend_error(&err), Some(&MockError::new("failed")));
    assert_eq!(
        err.to_string(),
        "execute query; sql=\"select a, b, c from foo\": failed"
    );
    assert_eq!(db.cursor_closes(), 0);
}

#[tokio::test]
async fn fetch_each_scan_failure_closes_cursor() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a, b, c from foo").returns_rows(
        MockRows::new(&[Type::INT4, Type::TEXT, Type::INT4]).row(&[&1, &"hello", &2]),
    ));

    let (a, b, c) = (Slot::<i32>::new(), Slot::<i32>::new(), Slot::<i32>::new());
    let mut calls = 0;
    let err = stmt("select a, b, c from foo")
        .scan(&a)
        .scan(&b)
        .scan(&c)
        .fetch_each(&Context::background(), &db, || {
            calls += 1;
            true
        })
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert!(matches!(err, Error::Scan { .. }));
    assert!(
        err.to_string()
            .starts_with("scan row; sql=\"select a, b, c from foo\": converting column 1 of type text:")
    );
    assert_eq!(calls, 0);
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn fetch_each_close_failure_after_early_stop() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a, b, c from foo").returns_rows(
            ints(3)
                .row(&[&1, &2, &3])
                .row(&[&4, &5, &6])
                .close_error(MockError::new("failed")),
        ),
    );

    let (a, b, c) = (Slot::<i32>::new(), Slot::<i32>::new(), Slot::<i32>::new());
    let err = stmt("select a, b, c from foo")
        .scan(&a)
        .scan(&b)
        .scan(&c)
        .fetch_each(&Context::background(), &db, || false)
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert_eq!(backend_error(&err), Some(&MockError::new("failed")));
    assert_eq!(
        err.to_string(),
        "close rows; sql=\"select a, b, c from foo\": failed"
    );
}

#[tokio::test]
async fn fetch_each_row_error_surfaces_after_close() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a, b, c from foo")
            .returns_rows(ints(3).row_error(MockError::new("failed")).row(&[&1, &2, &3])),
    );

    let (a, b, c) = (Slot::<i32>::new(), Slot::<i32>::new(), Slot::<i32>::new());
    let mut calls = 0;
    let err = stmt("select a, b, c from foo")
        .scan(&a)
        .scan(&b)
        .scan(&c)
        .fetch_each(&Context::background(), &db, || {
            calls += 1;
            true
        })
        .await
        .unwrap_err();

    db.expectations_were_met().unwrap();
    assert_eq!(backend_error(&err), Some(&MockError::new("failed")));
    assert_eq!(
        err.to_string(),
        "iterate rows; sql=\"select a, b, c from foo\": failed"
    );
    assert_eq!(calls, 0);
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn scan_error_outranks_close_error() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a from foo").returns_rows(
            MockRows::new(&[Type::TEXT])
                .row(&[&"nope"])
                .close_error(MockError::new("close")),
        ),
    );

    let a = Slot::<i32>::new();
    let err = stmt("select a from foo")
        .scan(&a)
        .fetch_each(&Context::background(), &db, || true)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Scan { .. }));
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn close_error_outranks_row_error() {
    let db = MockDb::new();
    db.expect(
        Expectation::query("select a from foo").returns_rows(
            ints(1)
                .row(&[&1])
                .row_error(MockError::new("row"))
                .close_error(MockError::new("close")),
        ),
    );

    let a = Slot::<i32>::new();
    let err = stmt("select a from foo")
        .scan(&a)
        .fetch_each(&Context::background(), &db, || true)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Close { .. }));
    assert_eq!(backend_error(&err), Some(&MockError::new("close")));
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn cursor_is_closed_exactly_once_on_every_path() {
    let ctx = Context::background();
    for query_fails in [false, true] {
        for scan_fails in [false, true] {
            for stop_early in [false, true] {
                for close_fails in [false, true] {
                    let db = MockDb::new();
                    let mut rows = ints(1).row(&[&1]).row(&[&2]);
                    if close_fails {
                        rows = rows.close_error(MockError::new("close"));
                    }
                    let expectation = Expectation::query("select a from foo");
                    db.expect(if query_fails {
                        expectation.fails(MockError::new("query"))
                    } else {
                        expectation.returns_rows(rows)
                    });

                    let good = Slot::<i32>::new();
                    let bad = Slot::<String>::new();
                    let s = stmt("select a from foo");
                    let s = if scan_fails { s.scan(&bad) } else { s.scan(&good) };
                    let mut calls = 0;
                    let result = s
                        .fetch_each(&ctx, &db, || {
                            calls += 1;
                            !stop_early
                        })
                        .await;

                    let case = (query_fails, scan_fails, stop_early, close_fails);
                    assert_eq!(db.cursor_closes(), usize::from(!query_fails), "{case:?}");
                    db.expectations_were_met().unwrap();

                    let expected_calls = if query_fails || scan_fails {
                        0
                    } else if stop_early {
                        1
                    } else {
                        2
                    };
                    assert_eq!(calls, expected_calls, "{case:?}");

                    match result {
                        Err(Error::Query { .. }) => assert!(query_fails, "{case:?}"),
                        Err(Error::Scan { .. }) => assert!(!query_fails && scan_fails, "{case:?}"),
                        Err(Error::Close { .. }) => {
                            assert!(!query_fails && !scan_fails && close_fails, "{case:?}")
                        }
                        Ok(()) => assert!(!query_fails && !scan_fails && !close_fails, "{case:?}"),
                        Err(other) => panic!("{case:?}: unexpected {other}"),
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn fetch_each_closes_cursor_when_callback_panics() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a from foo").returns_rows(ints(1).row(&[&1]).row(&[&2])));

    let a = Slot::<i32>::new();
    let result = AssertUnwindSafe(stmt("select a from foo").scan(&a).fetch_each(
        &Context::background(),
        &db,
        || panic!("callback fault"),
    ))
    .catch_unwind()
    .await;

    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"callback fault"));
    assert_eq!(db.rows_delivered(), 1);
    assert_eq!(db.cursor_closes(), 1);
    db.expectations_were_met().unwrap();
}

#[tokio::test]
async fn callback_panic_wins_over_close_error() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a from foo").returns_rows(
        ints(1).row(&[&1]).close_error(MockError::new("close")),
    ));

    let a = Slot::<i32>::new();
    let result = AssertUnwindSafe(stmt("select a from foo").scan(&a).fetch_each(
        &Context::background(),
        &db,
        || panic!("callback fault"),
    ))
    .catch_unwind()
    .await;

    assert!(result.is_err());
    assert_eq!(db.cursor_closes(), 1);
}

#[tokio::test]
async fn dropped_cursor_is_released() {
    let db = MockDb::new();
    db.expect(Expectation::query("select a from foo").returns_rows(ints(1).row(&[&1])));

    let ctx = Context::background();
    let mut rows = Queryer::query(&db, &ctx, "select a from foo", &[]).await.unwrap();
    assert!(db.expectations_were_met().is_err());
    assert!(rows.next_row().await.is_some());
    drop(rows);

    db.expectations_were_met().unwrap();
    assert_eq!(db.cursor_closes(), 0);
    assert_eq!(
        db.events(),
        [
            Event::Query("select a from foo".into()),
            Event::NextRow,
            Event::DropRows,
        ]
    );
}

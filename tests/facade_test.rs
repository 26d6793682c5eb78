//! Integration tests for the execution facade: connection ownership,
//! timeouts, vendor conventions, transactions, bulk copy and readers.

mod common;

use common::{FakeDriver, OUTPUT_VALUE};
use db_helper::db::blocking;
use db_helper::error::DbError;
use db_helper::models::{Command, DataTable, DbType, ParameterDirection, Value};
use db_helper::reader::{OrdinalCache, RowCursor, RowReader};
use db_helper::{DbHelper, IsolationLevel, Vendor};
use std::time::Duration;

const CONN: &str = "Server=localhost;Database=app";

fn helper(vendor: Vendor) -> (DbHelper, FakeDriver) {
    let driver = FakeDriver::new(vendor);
    (DbHelper::with_factory(driver.factory()), driver)
}

#[tokio::test]
async fn test_sql_server_scalar_end_to_end() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut command =
        Command::text("SELECT @x AS Result").param(helper.create_parameter_with_value("x", 42i32));

    let value = helper.execute_scalar(CONN, &mut command).await.unwrap();

    assert_eq!(value, Value::Int32(42));
    assert_eq!(*driver.stats.last_parameter_names.lock().unwrap(), vec!["@x"]);
    assert_eq!(driver.stats.opened(), 1);
    assert_eq!(driver.stats.closed(), 1);
    assert!(command.parameters.is_empty());
}

#[tokio::test]
async fn test_connection_string_calls_close_what_they_open() {
    let (helper, driver) = helper(Vendor::Postgres);

    helper
        .execute_non_query(CONN, &mut Command::text("UPDATE t SET a = 1"))
        .await
        .unwrap();
    let data = helper
        .execute_dataset(CONN, &mut Command::text("SELECT 1"))
        .await
        .unwrap();

    assert_eq!(data.tables.len(), 1);
    assert_eq!(driver.stats.opened(), 2);
    assert_eq!(driver.stats.closed(), 2);
}

#[tokio::test]
async fn test_driver_error_still_closes_connection() {
    let (helper, driver) = helper(Vendor::SqlServer);

    let err = helper
        .execute_non_query(CONN, &mut Command::text("FAIL"))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Driver(_)));
    assert!(err.to_string().contains("syntax error"));
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_every_operation_closes_on_driver_error() {
    let (helper, driver) = helper(Vendor::SqlServer);

    let err = helper
        .execute_dataset(CONN, &mut Command::text("FAIL"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
    let err = helper
        .execute_scalar(CONN, &mut Command::text("FAIL"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
    let err = helper
        .execute_reader(CONN, &mut Command::text("FAIL"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DbError::Driver(_)));

    assert_eq!(driver.stats.opened(), 3);
    assert_eq!(driver.stats.closed(), 3);
}

#[tokio::test]
async fn test_closed_caller_connection_closed_after_error() {
    let (helper, driver) = helper(Vendor::Postgres);
    let mut connection = helper.create_connection(CONN).unwrap();

    helper
        .execute_non_query_on(&mut connection, &mut Command::text("FAIL"))
        .await
        .unwrap_err();
    assert!(!connection.is_open());
    helper
        .execute_dataset_on(&mut connection, &mut Command::text("FAIL"))
        .await
        .unwrap_err();
    assert!(!connection.is_open());
    assert!(helper
        .execute_reader_on(&mut connection, &mut Command::text("FAIL"))
        .await
        .is_err());
    assert!(!connection.is_open());
    helper
        .execute_scalar_on(&mut connection, &mut Command::text("FAIL"))
        .await
        .unwrap_err();
    assert!(!connection.is_open());

    assert_eq!(driver.stats.opened(), 4);
    assert_eq!(driver.stats.closed(), 4);
}

#[tokio::test]
async fn test_open_caller_connection_is_left_open() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut connection = helper.create_connection(CONN).unwrap();
    connection.open().await.unwrap();

    helper
        .execute_scalar_on(&mut connection, &mut Command::text("SELECT 1"))
        .await
        .unwrap();
    helper
        .execute_non_query_on(&mut connection, &mut Command::text("FAIL"))
        .await
        .unwrap_err();

    assert!(connection.is_open());
    assert_eq!(driver.stats.closed(), 0);
    connection.close().await.unwrap();
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_closed_caller_connection_is_opened_and_closed() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut connection = helper.create_connection(CONN).unwrap();

    helper
        .execute_scalar_on(&mut connection, &mut Command::text("SELECT 1"))
        .await
        .unwrap();

    assert!(!connection.is_open());
    assert_eq!(driver.stats.opened(), 1);
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_usage_errors_raised_before_io() {
    let (helper, driver) = helper(Vendor::SqlServer);

    let err = helper
        .execute_scalar("", &mut Command::text("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidArgument { param: "connection_string", .. }
    ));

    let err = helper
        .execute_dataset(CONN, &mut Command::text("   "))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidArgument { param: "command_text", .. }
    ));
    assert!(err.is_usage_error());
    assert_eq!(driver.stats.opened(), 0);
}

#[tokio::test]
async fn test_connect_failure_is_returned_verbatim() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let err = helper
        .execute_scalar("Server=unreachable", &mut Command::text("SELECT 1"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "connection refused");
    assert_eq!(driver.stats.closed(), 0);
}

#[tokio::test]
async fn test_command_timeout_elapses() {
    let (mut helper, driver) = helper(Vendor::Postgres);
    helper.set_default_timeout(1);

    let err = helper
        .execute_non_query(CONN, &mut Command::text("SELECT pg_sleep(5) -- SLOW"))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Timeout { elapsed_secs: 1, .. }));
    // the interrupted session is dropped, not closed gracefully
    assert_eq!(driver.stats.closed(), 0);
    assert_eq!(driver.stats.dropped(), 1);
}

#[tokio::test]
async fn test_timeout_discards_caller_connection() {
    let (mut helper, driver) = helper(Vendor::SqlServer);
    helper.set_default_timeout(1);
    let mut connection = helper.create_connection(CONN).unwrap();
    connection.open().await.unwrap();

    let err = helper
        .execute_non_query_on(&mut connection, &mut Command::text("UPDATE SLOW"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(!connection.is_open());
    assert_eq!(driver.stats.dropped(), 1);

    // the next call opens a fresh session and closes it again
    helper
        .execute_scalar_on(&mut connection, &mut Command::text("SELECT 1"))
        .await
        .unwrap();
    assert!(!connection.is_open());
    assert_eq!(driver.stats.opened(), 2);
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_timeout_inside_transaction_ends_it() {
    let (mut helper, driver) = helper(Vendor::Postgres);
    helper.set_default_timeout(1);
    let mut tx = helper.begin_transaction(CONN, None).await.unwrap();

    let err = helper
        .execute_dataset_in(&mut tx, &mut Command::text("SELECT SLOW"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(!tx.is_active());
    assert_eq!(driver.stats.dropped(), 1);

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidArgument { param: "transaction", .. }
    ));
    assert!(!driver.stats.events().contains(&"commit".to_string()));
}

#[tokio::test]
async fn test_driver_enforced_timeout_is_not_preempted() {
    let driver = FakeDriver::new(Vendor::Oracle)
        .with_delay(Duration::from_millis(1500))
        .with_driver_timeouts();
    let mut helper = DbHelper::with_factory(driver.factory());
    helper.set_default_timeout(1);

    let rows = helper
        .execute_non_query(CONN, &mut Command::text("UPDATE SLOW"))
        .await
        .unwrap();

    assert_eq!(rows, 1);
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_timeout_override_applies_to_one_command() {
    let (helper, driver) = helper(Vendor::SqlServer);

    let mut command = Command::text("SELECT 1").with_timeout(90);
    helper.execute_scalar(CONN, &mut command).await.unwrap();
    assert_eq!(
        *driver.stats.last_timeout.lock().unwrap(),
        Some(Duration::from_secs(90))
    );

    helper
        .execute_scalar(CONN, &mut Command::text("SELECT 1"))
        .await
        .unwrap();
    assert_eq!(
        *driver.stats.last_timeout.lock().unwrap(),
        Some(Duration::from_secs(30))
    );
}

#[tokio::test]
async fn test_oracle_prefix_and_bind_by_name() {
    let (helper, driver) = helper(Vendor::Oracle);
    let mut command =
        Command::text("SELECT :y FROM dual").param(helper.create_parameter_with_value("y", 5i32));

    let value = helper.execute_scalar(CONN, &mut command).await.unwrap();

    assert_eq!(value, Value::Int32(5));
    assert_eq!(*driver.stats.last_parameter_names.lock().unwrap(), vec![":y"]);
    assert_eq!(*driver.stats.last_bind_by_name.lock().unwrap(), Some(true));

    let err = helper.create_array_parameter("ids", [1i32, 2]).unwrap_err();
    assert!(matches!(err, DbError::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_output_parameters_survive_clearing() {
    let (helper, _driver) = helper(Vendor::SqlServer);
    let mut command = Command::procedure("usp_total")
        .param(helper.create_parameter_with_value("id", 3i32))
        .param(helper.create_parameter_full(
            "total",
            DbType::Int32,
            None::<i32>,
            ParameterDirection::Output,
        ));

    helper.execute_non_query(CONN, &mut command).await.unwrap();

    assert!(command.parameters.is_empty());
    assert_eq!(command.output("@total"), Some(&Value::Int32(OUTPUT_VALUE)));
}

#[tokio::test]
async fn test_unset_input_binds_as_null() {
    let (helper, _driver) = helper(Vendor::SqlServer);
    let mut command =
        Command::text("SELECT @a AS a").param(helper.create_parameter("a", DbType::String));
    let value = helper.execute_scalar(CONN, &mut command).await.unwrap();
    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn test_transaction_commit_closes_connection() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut tx = helper
        .begin_transaction(CONN, Some(IsolationLevel::Serializable))
        .await
        .unwrap();
    assert!(tx.is_active());
    assert_eq!(tx.isolation_level(), IsolationLevel::Serializable);

    helper
        .execute_non_query_in(&mut tx, &mut Command::text("INSERT INTO t VALUES (1)"))
        .await
        .unwrap();
    assert_eq!(driver.stats.closed(), 0);

    tx.commit().await.unwrap();
    assert!(!tx.is_active());
    assert_eq!(driver.stats.closed(), 1);
    assert_eq!(
        driver.stats.events(),
        vec![
            "begin SERIALIZABLE".to_string(),
            "command INSERT INTO t VALUES (1)".to_string(),
            "commit".to_string(),
        ]
    );

    let err = helper
        .execute_scalar_in(&mut tx, &mut Command::text("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidArgument { param: "transaction", .. }
    ));
}

#[tokio::test]
async fn test_transaction_rollback_and_default_isolation() {
    let (helper, driver) = helper(Vendor::Postgres);
    let mut tx = helper.begin_transaction(CONN, None).await.unwrap();
    assert_eq!(tx.isolation_level(), IsolationLevel::ReadCommitted);

    tx.rollback().await.unwrap();
    assert!(tx.rollback().await.is_err());
    assert_eq!(driver.stats.closed(), 1);
    assert_eq!(driver.stats.events().last().map(String::as_str), Some("rollback"));
}

#[tokio::test]
async fn test_failed_begin_closes_connection() {
    let (helper, driver) = helper(Vendor::SqlServer);

    let err = helper
        .begin_transaction("Server=localhost;nobegin", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot start transaction"));
    assert_eq!(driver.stats.opened(), 1);
    assert_eq!(driver.stats.closed(), 1);

    // a failing close is logged; the begin error is what the caller sees
    let err = helper
        .begin_transaction("Server=localhost;nobegin;noclose", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot start transaction"));
    assert_eq!(driver.stats.opened(), 2);
    assert_eq!(driver.stats.closed(), 1);
    assert_eq!(driver.stats.dropped(), 2);
}

#[tokio::test]
async fn test_bulk_insert_only_on_sql_server() {
    let (helper, driver) = helper(Vendor::Postgres);
    let err = helper
        .bulk_insert(CONN, "dbo.people", &DataTable::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotSupported { .. }));
    assert_eq!(driver.stats.opened(), 0);

    let (helper, driver) = self::helper(Vendor::SqlServer);
    let mut data = DataTable::with_column_names(["id", "name"]);
    for i in 0..3 {
        data.push_row(vec![Value::Int32(i), Value::from(format!("n{i}"))])
            .unwrap();
    }
    let rows = helper.bulk_insert(CONN, "dbo.people", &data).await.unwrap();

    assert_eq!(rows, 3);
    assert_eq!(
        driver.stats.events(),
        vec!["bulk dbo.people rows=3 batch=1000".to_string()]
    );
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_reader_owns_connection_it_opened() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut command =
        Command::text("SELECT @id AS id").param(helper.create_parameter_with_value("id", 9i64));

    let mut reader = helper.execute_reader(CONN, &mut command).await.unwrap();
    assert!(reader.closes_connection());
    assert_eq!(driver.stats.closed(), 0);

    assert!(reader.read());
    assert_eq!(reader.value(0).unwrap(), &Value::Int64(9));
    reader.close().await.unwrap();
    assert_eq!(driver.stats.closed(), 1);
}

#[tokio::test]
async fn test_reader_on_open_connection_leaves_it_alone() {
    let (helper, driver) = helper(Vendor::SqlServer);
    let mut connection = helper.create_connection(CONN).unwrap();
    connection.open().await.unwrap();

    let reader = helper
        .execute_reader_on(&mut connection, &mut Command::text("SELECT 1"))
        .await
        .unwrap();
    assert!(!reader.closes_connection());
    reader.close().await.unwrap();

    assert!(connection.is_open());
    assert_eq!(driver.stats.closed(), 0);
}

#[tokio::test]
async fn test_row_reader_over_facade_reader() {
    let (helper, _driver) = helper(Vendor::SqlServer);
    let cache = OrdinalCache::new();
    let mut command = Command::text("SELECT @name AS name, @age AS age")
        .param(helper.create_parameter_with_value("name", "ada"))
        .param(helper.create_parameter_with_value("age", None::<i32>));

    let reader = helper.execute_reader(CONN, &mut command).await.unwrap();
    let mut rows = RowReader::new(reader)
        .optimized(true)
        .with_cache("people.by_name", &cache);
    assert!(rows.read());
    assert_eq!(rows.get_string("name").unwrap(), "ada");
    assert_eq!(rows.get_i32_or("age", -1).unwrap(), -1);
    assert!(!rows.read());

    assert_eq!(cache.entry("people.by_name").get("age"), Some(1));
    rows.into_inner().close().await.unwrap();
}

#[test]
fn test_blocking_facade_mirrors_async() {
    let driver = FakeDriver::new(Vendor::SqlServer);
    let helper = blocking::DbHelper::with_factory(driver.factory()).unwrap();
    let mut command =
        Command::text("SELECT @x AS Result").param(helper.create_parameter_with_value("x", 42i32));

    assert_eq!(helper.execute_scalar(CONN, &mut command).unwrap(), Value::Int32(42));

    let mut tx = helper.begin_transaction(CONN, None).unwrap();
    helper
        .execute_non_query_in(&mut tx, &mut Command::text("DELETE FROM t"))
        .unwrap();
    helper.rollback(&mut tx).unwrap();

    let reader = helper
        .execute_reader(CONN, &mut Command::text("SELECT 1"))
        .unwrap();
    helper.close_reader(reader).unwrap();

    assert_eq!(driver.stats.opened(), 3);
    assert_eq!(driver.stats.closed(), 3);
}

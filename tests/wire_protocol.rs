use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotwise::engine::{Engine, EngineSettings};
use slotwise::notify::NotifyHub;
use slotwise::wire::{self, SlotwiseFactory};

const PASSWORD: &str = "slotwise";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("slotwise.wal"),
            Arc::new(NotifyHub::new()),
            EngineSettings::default(),
        )
        .unwrap(),
    );
    let factory = Arc::new(SlotwiseFactory::new(engine.clone(), PASSWORD.to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotwise")
        .user("slotwise")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, PASSWORD).await.unwrap()
}

async fn select(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

/// A date a week out, so holds never start in the past.
fn next_week() -> NaiveDate {
    Utc::now().date_naive() + ChronoDuration::days(7)
}

fn at(date: NaiveDate, hour: u32) -> i64 {
    date.and_hms_opt(hour, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

/// Tutor available 09:00-17:00 UTC on `date`'s weekday.
async fn tutor_on(client: &Client, date: NaiveDate) -> Ulid {
    let tid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO tutors (id, timezone, base_price, currency) VALUES ('{tid}', 'UTC', 4500, 'EUR')"
        ))
        .await
        .unwrap();
    let weekday = date.weekday().num_days_from_monday();
    let rule_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rules (id, tutor_id, day_of_week, start_time, end_time) VALUES ('{rule_id}', '{tid}', {weekday}, '09:00', '17:00')"
        ))
        .await
        .unwrap();
    tid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_with(addr, "not-the-password").await.is_err());
}

#[tokio::test]
async fn slots_listed_over_simple_query() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let date = next_week();
    let tid = tutor_on(&client, date).await;

    let rows = select(
        &client,
        &format!(
            "SELECT * FROM slots WHERE tutor_id = '{tid}' AND date >= '{date}' AND date <= '{date}' AND duration = 60"
        ),
    )
    .await;
    assert_eq!(rows.len(), 8);
    assert_eq!(rows[0].get("tutor_id"), Some(tid.to_string().as_str()));
    let first_start = at(date, 9).to_string();
    assert_eq!(rows[0].get("start"), Some(first_start.as_str()));
}

#[tokio::test]
async fn hold_confirm_and_cancel_over_the_wire() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let date = next_week();
    let tid = tutor_on(&client, date).await;
    let consumer = Ulid::new();

    let hold_id = Ulid::new();
    let start = at(date, 10);
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, tutor_id, consumer_id, start, duration) VALUES ('{hold_id}', '{tid}', '{consumer}', {start}, 60)"
        ))
        .await
        .unwrap();

    // Overlapping claim by someone else.
    let other = Ulid::new();
    let half_past = start + 30 * 60_000;
    let code = sqlstate(
        &client,
        &format!(
            "INSERT INTO holds (id, tutor_id, consumer_id, start, duration) VALUES ('{}', '{tid}', '{other}', {half_past}, 60)",
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(code, "23P01");

    let booking_id = Ulid::new();
    let student = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, hold_id, consumer_id, student_id) VALUES ('{booking_id}', '{hold_id}', '{consumer}', '{student}')"
        ))
        .await
        .unwrap();

    let rows = select(&client, &format!("SELECT * FROM bookings WHERE id = '{booking_id}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("booked"));
    assert_eq!(rows[0].get("price"), Some("4500"));
    assert!(select(&client, &format!("SELECT * FROM holds WHERE tutor_id = '{tid}'")).await.is_empty());

    // Only the tutor acknowledges.
    let code = sqlstate(
        &client,
        &format!("INSERT INTO acknowledgements (booking_id, actor_id) VALUES ('{booking_id}', '{consumer}')"),
    )
    .await;
    assert_eq!(code, "42501");
    client
        .batch_execute(&format!(
            "INSERT INTO acknowledgements (booking_id, actor_id) VALUES ('{booking_id}', '{tid}')"
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO cancellations (booking_id, actor_id) VALUES ('{booking_id}', '{consumer}')"
        ))
        .await
        .unwrap();
    let code = sqlstate(
        &client,
        &format!("INSERT INTO completions (booking_id, actor_id) VALUES ('{booking_id}', '{tid}')"),
    )
    .await;
    assert_eq!(code, "55000");

    let booking = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.status.as_str(), "canceled_by_consumer");
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let date = next_week();
    let tid = tutor_on(&client, date).await;

    let hold_id = Ulid::new().to_string();
    let tutor = tid.to_string();
    let consumer = Ulid::new().to_string();
    let start = at(date, 14).to_string();
    let duration = "45".to_string();
    let inserted = client
        .execute(
            "INSERT INTO holds (id, tutor_id, consumer_id, start, duration) VALUES ($1, $2, $3, $4, $5)",
            &[&hold_id, &tutor, &consumer, &start, &duration],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = client
        .query("SELECT * FROM holds WHERE tutor_id = $1", &[&tutor])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let id: String = rows[0].get("id");
    assert_eq!(id, hold_id);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    assert_eq!(sqlstate(&client, "SELEKT nonsense").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO bookings (id, hold_id, consumer_id, student_id) VALUES ('{}', '{}', '{}', '{}')",
                Ulid::new(),
                Ulid::new(),
                Ulid::new(),
                Ulid::new()
            ),
        )
        .await,
        "P0002"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO tutors (id, timezone, base_price, currency) VALUES ('{}', 'Mars/Olympus', 100, 'EUR')",
                Ulid::new()
            ),
        )
        .await,
        "22023"
    );
}

#[tokio::test]
async fn calendar_rows_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let date = next_week();
    let tid = tutor_on(&client, date).await;

    let exception_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO exceptions (id, tutor_id, date, is_available, windows) VALUES ('{exception_id}', '{tid}', '{date}', true, '13:00-14:00')"
        ))
        .await
        .unwrap();
    let rows = select(&client, &format!("SELECT * FROM exceptions WHERE tutor_id = '{tid}'")).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("windows"), Some("13:00-14:00"));

    let slots = select(
        &client,
        &format!("SELECT * FROM slots WHERE tutor_id = '{tid}' AND date = '{date}' AND duration = 30"),
    )
    .await;
    assert_eq!(slots.len(), 2);

    client
        .batch_execute(&format!("DELETE FROM exceptions WHERE id = '{exception_id}'"))
        .await
        .unwrap();
    let tutors = select(&client, "SELECT * FROM tutors").await;
    assert!(tutors.iter().any(|r| r.get("id") == Some(tid.to_string().as_str())));
}

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use visitd::auth::Credentials;
use visitd::calendar::SlotCalendar;
use visitd::engine::Engine;
use visitd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("visitd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("visitd.wal"), SlotCalendar::default()).unwrap());
    let credentials = Credentials {
        staff_password: "visitd".into(),
        public_user: "public".into(),
        public_password: "public".into(),
    };

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let credentials = credentials.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, credentials, None).await;
            });
        }
    });

    addr
}

async fn try_connect(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("visitd")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect_public(addr: SocketAddr) -> Client {
    try_connect(addr, "public", "public").await.unwrap()
}

async fn connect_staff(addr: SocketAddr, user: &str) -> Client {
    try_connect(addr, user, "visitd").await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE and message of a statement expected to fail.
async fn failure(client: &Client, sql: &str) -> (String, String) {
    let err = client.simple_query(sql).await.unwrap_err();
    let db = err.as_db_error().expect("server error");
    (db.code().code().to_string(), db.message().to_string())
}

/// A Monday at least a week out, so every slot is in the future.
fn future_monday() -> NaiveDate {
    let mut d = Utc::now().date_naive() + chrono::Days::new(7);
    while d.weekday() != Weekday::Mon {
        d = d.succ_opt().unwrap();
    }
    d
}

fn book_sql(property: &str, date: NaiveDate, slot: &str) -> String {
    format!(
        "INSERT INTO reservations (property_id, date, slot, client_name, client_email, client_phone, kind) \
         VALUES ('{property}', '{date}', '{slot}', 'Ana Ruiz', 'ana@example.com', '+34 600 000 000', 'sale')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn public_booking_takes_the_slot() {
    let addr = start_test_server().await;
    let client = connect_public(addr).await;
    let property = format!("villa-{}", Ulid::new());
    let monday = future_monday();
    let availability = format!("SELECT * FROM available_slots WHERE property_id = '{property}' AND date = '{monday}'");

    assert_eq!(rows(&client, &availability).await.len(), 8);

    let booked = rows(&client, &book_sql(&property, monday, "10:00")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("pending"));
    assert_eq!(booked[0].get("slot"), Some("10:00"));
    assert_eq!(booked[0].get("owner_id"), None);

    let free = rows(&client, &availability).await;
    assert_eq!(free.len(), 7);
    assert!(free.iter().all(|r| r.get("slot") != Some("10:00")));

    let (code, message) = failure(&client, &book_sql(&property, monday, "10:00")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("slot_taken"), "{message}");
}

#[tokio::test]
async fn weekend_and_malformed_requests_are_rejected() {
    let addr = start_test_server().await;
    let client = connect_public(addr).await;
    let saturday = future_monday() + chrono::Days::new(5);

    let (code, message) = failure(&client, &book_sql("villa-1", saturday, "10:00")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("weekend_unavailable"), "{message}");

    let (code, _) = failure(&client, "SELECT * FROM available_slots WHERE property_id = 'villa-1'").await;
    assert_eq!(code, "42601");

    let (code, _) = failure(&client, &book_sql("villa-1", future_monday(), "25:00")).await;
    assert_eq!(code, "22023");
}

#[tokio::test]
async fn public_user_cannot_administer() {
    let addr = start_test_server().await;
    let client = connect_public(addr).await;
    let id = Ulid::new();

    let (code, _) = failure(&client, &format!("INSERT INTO confirmations (reservation_id) VALUES ('{id}')")).await;
    assert_eq!(code, "42501");
    let (code, _) = failure(&client, "SELECT * FROM reservations").await;
    assert_eq!(code, "42501");
    let (code, _) = failure(&client, "INSERT INTO blackouts (date) VALUES ('2030-01-01')").await;
    assert_eq!(code, "42501");

    // Reading blackouts stays public.
    assert!(rows(&client, "SELECT * FROM blackouts").await.is_empty());
}

#[tokio::test]
async fn staff_confirms_lists_and_counts() {
    let addr = start_test_server().await;
    let staff = connect_staff(addr, "agent-1").await;
    let property = format!("flat-{}", Ulid::new());
    let monday = future_monday();

    let booked = rows(&staff, &book_sql(&property, monday, "14:00")).await;
    assert_eq!(booked[0].get("owner_id"), Some("agent-1"));
    let id = booked[0].get("id").unwrap().to_string();

    let confirmed = rows(&staff, &format!("INSERT INTO confirmations (reservation_id) VALUES ('{id}')")).await;
    assert_eq!(confirmed[0].get("status"), Some("confirmed"));

    let listed = rows(
        &staff,
        &format!("SELECT * FROM reservations WHERE property_id = '{property}' AND status = 'confirmed'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.as_str()));

    let upcoming = rows(&staff, "SELECT * FROM upcoming_reservations WHERE days = 60 AND owner_id = 'agent-1'").await;
    assert_eq!(upcoming.len(), 1);

    let stats = rows(&staff, "SELECT * FROM statistics WHERE owner_id = 'agent-1'").await;
    let count = |category: &str, name: &str| {
        stats
            .iter()
            .find(|r| r.get("category") == Some(category) && r.get("name") == Some(name))
            .and_then(|r| r.get("count"))
            .map(str::to_string)
    };
    assert_eq!(count("total", "all").as_deref(), Some("1"));
    assert_eq!(count("status", "confirmed").as_deref(), Some("1"));
    assert_eq!(count("status", "pending").as_deref(), Some("0"));

    let cancelled = rows(&staff, &format!("INSERT INTO cancellations (reservation_id) VALUES ('{id}')")).await;
    assert_eq!(cancelled[0].get("status"), Some("cancelled"));

    let (code, message) = failure(&staff, &format!("INSERT INTO confirmations (reservation_id) VALUES ('{id}')")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("already_terminal"), "{message}");
}

#[tokio::test]
async fn staff_reschedules_and_removes() {
    let addr = start_test_server().await;
    let staff = connect_staff(addr, "agent-2").await;
    let property = format!("house-{}", Ulid::new());
    let monday = future_monday();
    let tuesday = monday.succ_opt().unwrap();

    let booked = rows(&staff, &book_sql(&property, monday, "09:00")).await;
    let id = booked[0].get("id").unwrap().to_string();

    let moved = rows(
        &staff,
        &format!("INSERT INTO reschedules (reservation_id, date, slot) VALUES ('{id}', '{tuesday}', '11:00')"),
    )
    .await;
    assert_eq!(moved[0].get("date"), Some(tuesday.to_string().as_str()));
    assert_eq!(moved[0].get("slot"), Some("11:00"));

    let monday_free = rows(
        &staff,
        &format!("SELECT * FROM available_slots WHERE property_id = '{property}' AND date = '{monday}'"),
    )
    .await;
    assert_eq!(monday_free.len(), 8);

    staff
        .simple_query(&format!("DELETE FROM reservations WHERE id = '{id}'"))
        .await
        .unwrap();
    let (code, message) = failure(&staff, &format!("DELETE FROM reservations WHERE id = '{id}'")).await;
    assert_eq!(code, "P0002");
    assert!(message.starts_with("not_found"), "{message}");
}

#[tokio::test]
async fn blackout_day_blocks_public_booking() {
    let addr = start_test_server().await;
    let staff = connect_staff(addr, "manager").await;
    let public = connect_public(addr).await;
    let property = format!("villa-{}", Ulid::new());
    let monday = future_monday();

    let added = rows(
        &staff,
        &format!("INSERT INTO blackouts (date, reason) VALUES ('{monday}', 'office closed')"),
    )
    .await;
    assert_eq!(added[0].get("reason"), Some("office closed"));
    assert_eq!(added[0].get("slot"), None);

    let free = rows(
        &public,
        &format!("SELECT * FROM available_slots WHERE property_id = '{property}' AND date = '{monday}'"),
    )
    .await;
    assert!(free.is_empty());

    let (code, message) = failure(&public, &book_sql(&property, monday, "09:00")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("date_blocked"), "{message}");

    assert_eq!(rows(&public, "SELECT * FROM blackouts").await.len(), 1);

    staff
        .simple_query(&format!("DELETE FROM blackouts WHERE date = '{monday}'"))
        .await
        .unwrap();
    assert_eq!(rows(&public, &book_sql(&property, monday, "09:00")).await.len(), 1);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "agent-1", "not-the-password").await.is_err());
    assert!(try_connect(addr, "public", "visitd").await.is_err());
}

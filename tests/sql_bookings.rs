use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use servicesync::engine::{BookingStore, Engine, WalStore};
use servicesync::model::{Action, Status};
use servicesync::scheduler::{Reconciler, ReconcilerConfig};
use servicesync::wire;

const PASSWORD: &str = "servicesync";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<dyn BookingStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("servicesync_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store: Arc<dyn BookingStore> = Arc::new(WalStore::open(dir.join("bookings.wal")).unwrap());
    let engine = Arc::new(Engine::new(store.clone()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, store)
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("servicesync")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect_as(addr: SocketAddr, role: &str, id: Ulid) -> tokio_postgres::Client {
    try_connect(addr, &format!("{role}:{id}"), PASSWORD)
        .await
        .unwrap()
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| panic!("no SQLSTATE in {err}"))
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> Option<&'a str> {
    row.get(name)
}

async fn create_booking(client: &tokio_postgres::Client) -> String {
    let created = query(
        client,
        "INSERT INTO bookings (id, service_type, date, location) VALUES (NULL, 'Plumbing', '2026-11-02', '9 Mill Lane')",
    )
    .await;
    assert_eq!(created.len(), 1);
    col(&created[0], "id").unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn customer_creates_and_lists_booking() {
    let (addr, _store) = start_test_server().await;
    let customer = Ulid::new();
    let client = connect_as(addr, "customer", customer).await;

    let id = create_booking(&client).await;

    let listed = query(&client, "SELECT * FROM bookings").await;
    assert_eq!(listed.len(), 1);
    let row = &listed[0];
    assert_eq!(col(row, "id"), Some(id.as_str()));
    assert_eq!(col(row, "customer_id"), Some(customer.to_string().as_str()));
    assert_eq!(col(row, "provider_id"), None);
    assert_eq!(col(row, "service_type"), Some("Plumbing"));
    assert_eq!(col(row, "location"), Some("9 Mill Lane"));
    assert_eq!(col(row, "status"), Some("Pending"));

    let history: serde_json::Value = serde_json::from_str(col(row, "history").unwrap()).unwrap();
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["action"], "created");
    assert_eq!(entries[0]["actor"]["role"], "customer");
}

#[tokio::test]
async fn full_lifecycle_over_the_wire() {
    let (addr, _store) = start_test_server().await;
    let provider = Ulid::new();
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let pro = connect_as(addr, "provider", provider).await;

    let id = create_booking(&customer).await;

    // The open pool is visible to any provider.
    let pool = query(&pro, "SELECT * FROM bookings WHERE status = 'Pending'").await;
    assert!(pool.iter().any(|r| col(r, "id") == Some(id.as_str())));

    let accepted = query(&pro, &format!("INSERT INTO assignments VALUES ('{id}')")).await;
    assert_eq!(col(&accepted[0], "status"), Some("Assigned"));
    assert_eq!(col(&accepted[0], "provider_id"), Some(provider.to_string().as_str()));

    query(&pro, &format!("INSERT INTO transitions VALUES ('{id}', 'InProgress')")).await;
    let done = query(&pro, &format!("INSERT INTO transitions VALUES ('{id}', 'Completed')")).await;
    assert_eq!(col(&done[0], "status"), Some("Completed"));
    assert_eq!(col(&done[0], "provider_id"), Some(provider.to_string().as_str()));

    assert_eq!(
        sqlstate(&pro, &format!("INSERT INTO transitions VALUES ('{id}', 'InProgress')")).await,
        "55000"
    );
    assert_eq!(
        sqlstate(&pro, &format!("INSERT INTO assignments VALUES ('{id}')")).await,
        "55000"
    );

    let trail = query(
        &customer,
        &format!("SELECT * FROM booking_history WHERE booking_id = '{id}'"),
    )
    .await;
    let actions: Vec<&str> = trail.iter().filter_map(|r| col(r, "action")).collect();
    assert_eq!(
        actions,
        vec![
            "created",
            "assigned",
            "status-change-to-InProgress",
            "status-change-to-Completed"
        ]
    );
    assert_eq!(col(&trail[1], "role"), Some("provider"));
    assert_eq!(col(&trail[1], "seq"), Some("1"));
}

#[tokio::test]
async fn reject_clears_provider() {
    let (addr, _store) = start_test_server().await;
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let pro = connect_as(addr, "provider", Ulid::new()).await;
    let id = create_booking(&customer).await;

    query(&pro, &format!("INSERT INTO assignments VALUES ('{id}')")).await;
    let back = query(&pro, &format!("INSERT INTO transitions VALUES ('{id}', 'Pending')")).await;
    assert_eq!(col(&back[0], "status"), Some("Pending"));
    assert_eq!(col(&back[0], "provider_id"), None);

    let trail = query(
        &pro,
        &format!("SELECT * FROM booking_history WHERE booking_id = '{id}'"),
    )
    .await;
    assert_eq!(col(trail.last().unwrap(), "action"), Some("rejected-by-provider"));
}

#[tokio::test]
async fn errors_map_to_distinct_sqlstates() {
    let (addr, _store) = start_test_server().await;
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let first = connect_as(addr, "provider", Ulid::new()).await;
    let second = connect_as(addr, "provider", Ulid::new()).await;
    let admin = connect_as(addr, "admin", Ulid::new()).await;
    let id = create_booking(&customer).await;

    // Unknown booking.
    assert_eq!(
        sqlstate(&first, &format!("INSERT INTO assignments VALUES ('{}')", Ulid::new())).await,
        "P0002"
    );
    // Already claimed.
    query(&first, &format!("INSERT INTO assignments VALUES ('{id}')")).await;
    assert_eq!(
        sqlstate(&second, &format!("INSERT INTO assignments VALUES ('{id}')")).await,
        "42501"
    );
    // Stale compare-and-set.
    assert_eq!(
        sqlstate(
            &customer,
            &format!("INSERT INTO transitions VALUES ('{id}', 'Cancelled', 'Pending')")
        )
        .await,
        "40001"
    );
    // Providers cannot open bookings.
    assert_eq!(
        sqlstate(&first, "INSERT INTO bookings VALUES (NULL, 'Cleaning', '2026-11-02')").await,
        "42501"
    );
    // Deleting a live booking.
    assert_eq!(
        sqlstate(&admin, &format!("DELETE FROM bookings WHERE id = '{id}'")).await,
        "42501"
    );
    // Bad input.
    assert_eq!(
        sqlstate(&customer, "INSERT INTO bookings VALUES (NULL, '', '2026-11-02')").await,
        "22023"
    );
    assert_eq!(sqlstate(&customer, "SELEKT 1").await, "42601");
}

#[tokio::test]
async fn admin_assigns_and_deletes_finished_booking() {
    let (addr, _store) = start_test_server().await;
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let admin = connect_as(addr, "admin", Ulid::new()).await;
    let provider = Ulid::new();
    let id = create_booking(&customer).await;

    let assigned = query(
        &admin,
        &format!("INSERT INTO assignments VALUES ('{id}', '{provider}')"),
    )
    .await;
    assert_eq!(col(&assigned[0], "provider_id"), Some(provider.to_string().as_str()));

    query(&admin, &format!("INSERT INTO transitions VALUES ('{id}', 'Cancelled')")).await;
    let deleted = admin
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(deleted
        .iter()
        .any(|m| matches!(m, SimpleQueryMessage::CommandComplete(1))));

    assert!(query(&admin, "SELECT * FROM bookings").await.is_empty());
}

#[tokio::test]
async fn admin_lists_providers_with_workload() {
    let (addr, _store) = start_test_server().await;
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let admin = connect_as(addr, "admin", Ulid::new()).await;
    let provider_id = Ulid::new();
    let provider = connect_as(addr, "provider", provider_id).await;

    assert!(query(&admin, "SELECT * FROM providers").await.is_empty());

    let id = create_booking(&customer).await;
    query(&provider, &format!("INSERT INTO assignments VALUES ('{id}')")).await;

    let listed = query(&admin, "SELECT * FROM providers").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(col(&listed[0], "provider_id"), Some(provider_id.to_string().as_str()));
    assert_eq!(col(&listed[0], "active_bookings"), Some("1"));
    assert_eq!(col(&listed[0], "completed_bookings"), Some("0"));

    assert_eq!(sqlstate(&provider, "SELECT * FROM providers").await, "42501");
    assert_eq!(sqlstate(&customer, "SELECT * FROM providers").await, "42501");
}

#[tokio::test]
async fn visibility_is_enforced_per_login() {
    let (addr, _store) = start_test_server().await;
    let alice = connect_as(addr, "customer", Ulid::new()).await;
    let bob = connect_as(addr, "customer", Ulid::new()).await;
    let p = connect_as(addr, "provider", Ulid::new()).await;
    let q = connect_as(addr, "provider", Ulid::new()).await;

    let a1 = create_booking(&alice).await;
    let b1 = create_booking(&bob).await;
    query(&q, &format!("INSERT INTO assignments VALUES ('{b1}')")).await;

    let for_bob = query(&bob, "SELECT * FROM bookings").await;
    assert_eq!(for_bob.len(), 1);
    assert_eq!(col(&for_bob[0], "id"), Some(b1.as_str()));

    let for_p = query(&p, "SELECT * FROM bookings").await;
    let ids: Vec<&str> = for_p.iter().filter_map(|r| col(r, "id")).collect();
    assert_eq!(ids, vec![a1.as_str()]);

    // Someone else's booking reads as missing.
    assert_eq!(
        sqlstate(&alice, &format!("SELECT * FROM booking_history WHERE booking_id = '{b1}'")).await,
        "P0002"
    );
    assert!(query(&alice, &format!("SELECT * FROM bookings WHERE id = '{b1}'"))
        .await
        .is_empty());
}

#[tokio::test]
async fn malformed_login_is_refused() {
    let (addr, _store) = start_test_server().await;
    assert!(try_connect(addr, "bob", PASSWORD).await.is_err());
    assert!(try_connect(addr, &format!("system:{}", Ulid::new()), PASSWORD).await.is_err());
    assert!(try_connect(addr, &format!("wizard:{}", Ulid::new()), PASSWORD).await.is_err());
    assert!(try_connect(addr, &format!("customer:{}", Ulid::new()), "wrong").await.is_err());
    assert!(try_connect(addr, &format!("customer:{}", Ulid::new()), PASSWORD).await.is_ok());
}

#[tokio::test]
async fn reconciler_flag_shows_in_history() {
    let (addr, store) = start_test_server().await;
    let customer = connect_as(addr, "customer", Ulid::new()).await;
    let id = create_booking(&customer).await;

    let created_at: i64 = col(&query(&customer, "SELECT * FROM bookings").await[0], "created_at")
        .unwrap()
        .parse()
        .unwrap();
    let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());
    let report = reconciler.tick(created_at + 6 * 60_000).await.unwrap();
    assert_eq!(report.marked, 1);

    let trail = query(
        &customer,
        &format!("SELECT * FROM booking_history WHERE booking_id = '{id}'"),
    )
    .await;
    let last = trail.last().unwrap();
    assert_eq!(col(last, "action"), Some(Action::TimeoutCheck.to_string().as_str()));
    assert_eq!(col(last, "role"), Some("system"));
    assert_eq!(col(last, "actor_id"), None);

    let listed = query(&customer, "SELECT * FROM bookings").await;
    assert_eq!(col(&listed[0], "status"), Some(Status::Pending.as_str()));
}

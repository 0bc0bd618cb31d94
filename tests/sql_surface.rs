use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{NaiveDate, TimeDelta, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use staygrid::config::TenantConfig;
use staygrid::tenant::TenantManager;
use staygrid::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("staygrid_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "staygrid".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("staygrid")
        .password("staygrid");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn day(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + TimeDelta::days(30 + offset)
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

fn flag(row: &SimpleQueryRow, column: &str) -> bool {
    matches!(row.get(column), Some("t") | Some("true"))
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn create_unit(client: &Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO units (id, name, nightly_rate, active) VALUES ('{id}', 'Unit 7', 12500, true)"
        ))
        .await
        .unwrap();
    id
}

async fn place_hold(client: &Client, unit: Ulid, from: i64, to: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO holds (id, unit_id, requester, check_in, check_out, hold_minutes) \
             VALUES ('{id}', '{unit}', 'guest', '{}', '{}', 15)",
            day(from),
            day(to)
        ))
        .await
        .map(|()| id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn units_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "units").await;
    let id = create_unit(&client).await;

    let units = rows(&client, "SELECT * FROM units").await;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(units[0].get("name"), Some("Unit 7"));
    assert_eq!(units[0].get("nightly_rate"), Some("12500"));
    assert!(flag(&units[0], "active"));

    let err = client
        .batch_execute(&format!("DELETE FROM units WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert!(sqlstate(&err).is_some());
}

#[tokio::test]
async fn hold_conflict_maps_to_exclusion_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "conflicts").await;
    let unit = create_unit(&client).await;

    let occ = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO occupancies (id, unit_id, requester, check_in, check_out, state) \
             VALUES ('{occ}', '{unit}', 'guest-1', '{}', '{}', 'confirmed')",
            day(10),
            day(13)
        ))
        .await
        .unwrap();

    place_hold(&client, unit, 13, 15).await.unwrap();
    let err = place_hold(&client, unit, 12, 14).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let verdict = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE unit_id = '{unit}' AND check_in = '{}' AND check_out = '{}'",
            day(12),
            day(14)
        ),
    )
    .await;
    assert_eq!(verdict.len(), 1);
    assert!(!flag(&verdict[0], "available"));
    assert!(verdict[0].get("reason").unwrap().contains("occupied"));
}

#[tokio::test]
async fn hold_consumed_into_occupancy() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "consume").await;
    let unit = create_unit(&client).await;
    let hold = place_hold(&client, unit, 1, 4).await.unwrap();

    let occ = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO occupancies (id, hold_id) VALUES ('{occ}', '{hold}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO occupancy_transitions (occupancy_id, state) VALUES ('{occ}', 'confirmed')"
        ))
        .await
        .unwrap();

    let occupancies = rows(&client, &format!("SELECT * FROM occupancies WHERE unit_id = '{unit}'")).await;
    assert_eq!(occupancies.len(), 1);
    assert_eq!(occupancies[0].get("state"), Some("confirmed"));
    assert_eq!(occupancies[0].get("hold_id"), Some(hold.to_string().as_str()));

    let holds = rows(&client, &format!("SELECT * FROM holds WHERE unit_id = '{unit}'")).await;
    assert_eq!(holds[0].get("state"), Some("consumed"));

    // A consumed hold cannot be consumed again.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO occupancies (id, hold_id) VALUES ('{}', '{hold}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn cancel_and_release_free_the_calendar() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "cancel").await;
    let unit = create_unit(&client).await;

    let occ = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO occupancies (id, unit_id, requester, check_in, check_out) \
             VALUES ('{occ}', '{unit}', 'guest', '{}', '{}')",
            day(0),
            day(2)
        ))
        .await
        .unwrap();
    let hold = place_hold(&client, unit, 2, 3).await.unwrap();

    let calendar_sql = format!(
        "SELECT * FROM calendar WHERE unit_id = '{unit}' AND date >= '{}' AND date <= '{}'",
        day(0),
        day(3)
    );
    let grid = rows(&client, &calendar_sql).await;
    assert_eq!(grid.len(), 4);
    assert_eq!(grid[0].get("occupancy_ref"), Some(format!("occupancy:{occ}").as_str()));
    assert_eq!(grid[2].get("occupancy_ref"), Some(format!("hold:{hold}").as_str()));
    assert!(flag(&grid[2], "has_check_in") && flag(&grid[2], "has_check_out"));
    assert!(flag(&grid[3], "is_available"));

    client
        .batch_execute(&format!("DELETE FROM occupancies WHERE id = '{occ}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM holds WHERE id = '{hold}'"))
        .await
        .unwrap();

    let grid = rows(&client, &calendar_sql).await;
    assert!(grid.iter().all(|row| flag(row, "is_available")));

    let active = rows(&client, &format!("SELECT * FROM occupancies WHERE unit_id = '{unit}'")).await;
    assert!(active.is_empty());
    let all = rows(
        &client,
        &format!("SELECT * FROM occupancies WHERE unit_id = '{unit}' AND include_cancelled = true"),
    )
    .await;
    assert_eq!(all[0].get("state"), Some("cancelled"));
}

#[tokio::test]
async fn bulk_availability_and_periods() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "bulk").await;
    let free = create_unit(&client).await;
    let busy = create_unit(&client).await;
    let missing = Ulid::new();
    place_hold(&client, busy, 2, 5).await.unwrap();

    let verdicts = rows(
        &client,
        &format!(
            "SELECT * FROM availability WHERE unit_id IN ('{free}', '{busy}', '{missing}') \
             AND check_in = '{}' AND check_out = '{}'",
            day(3),
            day(4)
        ),
    )
    .await;
    assert_eq!(verdicts.len(), 3);
    assert_eq!(verdicts[0].get("unit_id"), Some(free.to_string().as_str()));
    assert!(flag(&verdicts[0], "available"));
    assert!(!flag(&verdicts[1], "available"));
    assert!(verdicts[1].get("reason").unwrap().contains("held"));
    assert!(!flag(&verdicts[2], "available"));
    assert!(verdicts[2].get("reason").unwrap().contains("not found"));

    let periods = rows(
        &client,
        &format!(
            "SELECT * FROM available_periods WHERE unit_id = '{busy}' \
             AND date >= '{}' AND date <= '{}' AND min_stay = 3",
            day(0),
            day(9)
        ),
    )
    .await;
    assert_eq!(periods.len(), 2);
    assert_eq!(periods[0].get("nights"), Some("2"));
    assert!(!flag(&periods[0], "meets_min_stay"));
    assert_eq!(periods[1].get("start"), Some(day(5).to_string().as_str()));
    assert!(flag(&periods[1], "meets_min_stay"));
}

#[tokio::test]
async fn invalid_input_error_codes() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "errors").await;
    let unit = create_unit(&client).await;

    let err = client.batch_execute("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    // Zero-length stay.
    let err = place_hold(&client, unit, 3, 3).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .simple_query(&format!(
            "SELECT * FROM availability WHERE unit_id = '{}' AND check_in = '{}' AND check_out = '{}'",
            Ulid::new(),
            day(1),
            day(2)
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("02000"));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "tenant_a").await;
    let b = connect(addr, "tenant_b").await;

    create_unit(&a).await;
    assert_eq!(rows(&a, "SELECT * FROM units").await.len(), 1);
    assert!(rows(&b, "SELECT * FROM units").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn concurrent_clients_never_double_book() {
    let (addr, _tm) = start_test_server().await;
    let setup = connect(addr, "race").await;
    let unit = create_unit(&setup).await;

    let mut handles = Vec::new();
    for i in 0..16i64 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr, "race").await;
            place_hold(&client, unit, i % 4, 5 + i % 3).await.is_ok()
        }));
    }
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
}

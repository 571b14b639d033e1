//! The Postgres adapter against a live database.
//!
//! These run only when `DATABASE_URL` points at a scratch Postgres database;
//! otherwise each test returns early.

use chrono::Duration;
use futures::StreamExt;
use nippou_core::domain::{
    DocumentFields, DocumentPath, FieldValue, ReportDraft, SignInMethod, UserId,
};
use nippou_core::ports::{AuthError, AuthService, DocumentStore, PortError, SnapshotStream};
use report_sync_lib::adapters::DbAdapter;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration as StdDuration;
use tokio::time::timeout;

const WAIT: StdDuration = StdDuration::from_secs(5);

async fn connect(max_connections: u32) -> Option<DbAdapter> {
    connect_with_pool(max_connections).await.map(|(db, _)| db)
}

async fn connect_with_pool(max_connections: u32) -> Option<(DbAdapter, PgPool)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping Postgres adapter tests");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(WAIT)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    let db = DbAdapter::new(pool.clone());
    db.run_migrations().await.expect("migrations");
    Some((db, pool))
}

async fn fresh_user(db: &DbAdapter) -> UserId {
    db.sign_in_anonymously().await.expect("anonymous user").user_id
}

async fn next_content(stream: &mut SnapshotStream) -> Option<String> {
    let item = timeout(WAIT, stream.next())
        .await
        .expect("change delivered in time")
        .expect("stream open")
        .expect("snapshot");
    item.map(|snapshot| ReportDraft::from_snapshot(&snapshot).content)
}

#[tokio::test]
async fn merge_write_is_pushed_to_subscribers() {
    let Some(db) = connect(3).await else { return };
    let path = DocumentPath::current_draft(&fresh_user(&db).await);

    let mut stream = db.subscribe(&path).await.unwrap();
    assert_eq!(next_content(&mut stream).await, None);

    db.merge_set(&path, ReportDraft::write_fields("one")).await.unwrap();
    assert_eq!(next_content(&mut stream).await.as_deref(), Some("one"));

    let mut extra = DocumentFields::new();
    extra.insert("department".to_string(), FieldValue::Text("製造部".to_string()));
    db.merge_set(&path, extra).await.unwrap();
    assert_eq!(next_content(&mut stream).await.as_deref(), Some("one"));

    let stored = db.get(&path).await.unwrap().unwrap();
    assert_eq!(
        stored.fields.get("department"),
        Some(&FieldValue::Text("製造部".to_string()))
    );
    assert!(matches!(
        stored.fields.get("lastUpdated"),
        Some(FieldValue::Timestamp(_))
    ));
}

#[tokio::test]
async fn many_subscriptions_share_one_listener_connection() {
    let Some(db) = connect(3).await else { return };
    let path = DocumentPath::current_draft(&fresh_user(&db).await);

    let mut streams = Vec::new();
    for _ in 0..8 {
        let mut stream = db.subscribe(&path).await.unwrap();
        assert_eq!(next_content(&mut stream).await, None);
        streams.push(stream);
    }

    db.merge_set(&path, ReportDraft::write_fields("seen by all"))
        .await
        .unwrap();
    for stream in &mut streams {
        assert_eq!(next_content(stream).await.as_deref(), Some("seen by all"));
    }
}

#[tokio::test]
async fn issued_token_signs_in_as_its_user() {
    let Some(db) = connect(2).await else { return };
    let user = fresh_user(&db).await;

    let token = db.issue_custom_token(&user, Duration::minutes(10)).await.unwrap();
    let session = db.sign_in_with_custom_token(&token).await.unwrap();
    assert_eq!(session.user_id, user);
    assert_eq!(session.method, SignInMethod::CustomToken);

    let expired = db.issue_custom_token(&user, Duration::minutes(-1)).await.unwrap();
    assert_eq!(
        db.sign_in_with_custom_token(&expired).await.unwrap_err(),
        AuthError::InvalidCredential
    );

    let unknown = db
        .issue_custom_token(&UserId::new("no-such-user"), Duration::minutes(10))
        .await;
    assert!(matches!(unknown, Err(PortError::NotFound(_))));
}

async fn backdate(pool: &PgPool, user: &UserId, days: i32) {
    sqlx::query("UPDATE users SET created_at = NOW() - make_interval(days => $2) WHERE user_id = $1")
        .bind(user.as_str())
        .bind(days)
        .execute(pool)
        .await
        .expect("backdate user");
}

#[tokio::test]
async fn idle_anonymous_users_are_purged() {
    let Some((db, pool)) = connect_with_pool(2).await else { return };
    let idle = fresh_user(&db).await;
    let active = fresh_user(&db).await;
    let newcomer = fresh_user(&db).await;
    backdate(&pool, &idle, 40).await;
    backdate(&pool, &active, 40).await;

    let idle_path = DocumentPath::current_draft(&idle);
    let active_path = DocumentPath::current_draft(&active);
    db.merge_set(&idle_path, ReportDraft::write_fields("forgotten"))
        .await
        .unwrap();
    sqlx::query("UPDATE documents SET updated_at = NOW() - make_interval(days => 40) WHERE path = $1")
        .bind(idle_path.as_str())
        .execute(&pool)
        .await
        .unwrap();
    db.merge_set(&active_path, ReportDraft::write_fields("still typing"))
        .await
        .unwrap();
    let idle_token = db.issue_custom_token(&idle, Duration::minutes(10)).await.unwrap();

    let purged = db.purge_idle_anonymous_users(Duration::days(30)).await.unwrap();
    assert!(purged >= 1);

    assert_eq!(
        db.sign_in_with_custom_token(&idle_token).await.unwrap_err(),
        AuthError::InvalidCredential
    );
    assert!(db.get(&idle_path).await.unwrap().is_none());
    assert!(db.get(&active_path).await.unwrap().is_some());
    for user in [&active, &newcomer] {
        let token = db.issue_custom_token(user, Duration::minutes(10)).await.unwrap();
        assert_eq!(db.sign_in_with_custom_token(&token).await.unwrap().user_id, *user);
    }
}

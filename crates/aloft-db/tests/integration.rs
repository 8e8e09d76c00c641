use aloft_db::{create_pool, run_migrations};

#[test]
fn db_initialization_works() {
    let pool = create_pool(":memory:").expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 4);

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
        .expect("failed to prepare table count query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table count query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    for expected in [
        "_aloft_migrations",
        "channels",
        "channel_participants",
        "channel_messages",
        "transmission_history",
    ] {
        assert!(
            tables.iter().any(|t| t == expected),
            "expected table {expected} to exist, found {tables:?}"
        );
    }
}

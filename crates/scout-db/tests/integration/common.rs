use std::time::Duration;

use scout_db::{Database, DatabaseConfig, SourceRepository};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Starts PostgreSQL, applies the migrations and returns a repository.
///
/// Keep the `ContainerAsync` alive for the whole test; dropping it stops
/// the database.
pub async fn setup_test_db() -> (SourceRepository, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "scout_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/scout_test");

    // The server restarts once during init; retry until it accepts us.
    let config = DatabaseConfig::new(url).with_max_connections(5);
    let mut attempt = 0;
    let db = loop {
        attempt += 1;
        match Database::connect(&config).await {
            Ok(db) => break db,
            Err(e) if attempt >= 30 => panic!("Postgres not reachable after {attempt} attempts: {e}"),
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    };
    db.migrate().await.expect("Failed to run migrations");

    (db.sources(), container)
}

#![allow(clippy::multiple_crate_versions)]

use treasury_dashboard::config::AppConfig;
use treasury_dashboard::db::seed_database;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env()?;
    let mut conn = rusqlite::Connection::open(&config.db_path)?;
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    seed_database(&mut conn)?;
    tracing::info!("Seeded {:?}", config.db_path);
    Ok(())
}

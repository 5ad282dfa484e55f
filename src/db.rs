use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("seed data missing: {0}")]
    SeedData(&'static str),
}

pub struct DbInit {
    pub path: PathBuf,
    pub seeded: bool,
    pub connection: Connection,
}

const STATUSES: &[&str] = &[
    "Executed", "Approved", "Rejected", "TimedOut", "Cancelled", "Ongoing", "Killed",
];
const TRACKS: &[&str] = &[
    "Treasurer", "BigSpender", "MediumSpender", "SmallSpender", "SmallTipper", "BigTipper",
    "WishForChange", "Root",
];
const CATEGORIES: &[(&str, &str)] = &[
    ("Development", "Infrastructure"),
    ("Development", "Tooling"),
    ("Development", "Wallets"),
    ("Outreach", "Events"),
    ("Outreach", "Content"),
    ("Outreach", "Ambassadors"),
    ("Research", "Protocol"),
    ("Research", "Economics"),
    ("Operations", "Bounty Curation"),
    ("Operations", "Legal"),
];
const TITLE_SUBJECTS: &[&str] = &[
    "Light Client", "Indexer", "Block Explorer", "Governance Portal", "Hackathon", "Meetup Series",
    "Audit", "Validator Program", "Education Course", "Podcast", "Translation Effort", "Wallet SDK",
];
const TITLE_VERBS: &[&str] = &[
    "Funding for", "Retroactive payment for", "Continued support for", "Proposal:", "Milestone 2 of",
];
const ASSETS: &[&str] = &["DOT", "USDC", "USDT"];
const FLOW_TYPES: &[&str] = &["inflow", "outflow", "burn", "transfer"];
const BOUNTY_NAMES: &[&str] = &[
    "Anti-Scam Bounty", "Events Bounty", "Meme Bounty", "Infrastructure Builders Program",
    "Marketing Bounty", "Security Bounty",
];
const DOT_USD: f64 = 6.5;

/// Open the treasury database, seeding it when the file is new or when
/// seeding is forced by configuration.
///
/// # Errors
/// Returns `DbError` if the database cannot be opened or seeded.
pub fn init_db(config: &AppConfig) -> Result<DbInit, DbError> {
    let path = config.db_path.clone();
    let should_seed = config.force_seed || !path.exists();

    let mut connection = Connection::open(&path)?;
    let _ = connection.pragma_update(None, "journal_mode", "WAL");

    let seeded = if should_seed {
        seed_database(&mut connection)?;
        true
    } else {
        create_schema(&connection)?;
        false
    };

    Ok(DbInit {
        path,
        seeded,
        connection,
    })
}

/// Create every table and view the dashboard uses. Idempotent.
///
/// # Errors
/// Returns `DbError` if any statement fails.
pub fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          category TEXT NOT NULL,
          subcategory TEXT,
          UNIQUE(category, subcategory)
        );

        CREATE TABLE IF NOT EXISTS referenda (
          id INTEGER PRIMARY KEY,
          title TEXT,
          status TEXT,
          track TEXT,
          proposal_time TEXT,
          latest_status_change TEXT,
          DOT_proposal_time REAL,
          USD_proposal_time REAL,
          DOT_latest REAL,
          USD_latest REAL,
          DOT_component REAL,
          USDC_component REAL,
          USDT_component REAL,
          "tally.ayes" REAL,
          "tally.nays" REAL,
          category_id INTEGER REFERENCES categories(id),
          notes TEXT,
          hide_in_spends INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS bounties (
          id INTEGER PRIMARY KEY,
          name TEXT,
          category_id INTEGER REFERENCES categories(id),
          remaining_dot REAL,
          url TEXT,
          description TEXT
        );

        CREATE TABLE IF NOT EXISTS child_bounties (
          identifier TEXT PRIMARY KEY,
          parentBountyId INTEGER REFERENCES bounties(id),
          status TEXT,
          description TEXT,
          DOT REAL,
          USD_proposal_time REAL,
          USD_latest REAL,
          beneficiary TEXT,
          proposal_time TEXT,
          latest_status_change TEXT,
          category_id INTEGER REFERENCES categories(id),
          notes TEXT,
          hide_in_spends INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS subtreasury (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT,
          description TEXT,
          DOT_latest REAL,
          USD_latest REAL,
          DOT_component REAL,
          USDC_component REAL,
          USDT_component REAL,
          category_id INTEGER REFERENCES categories(id),
          latest_status_change TEXT
        );

        CREATE TABLE IF NOT EXISTS treasury_netflows (
          month TEXT NOT NULL,
          asset_name TEXT NOT NULL,
          flow_type TEXT NOT NULL,
          amount_usd REAL,
          amount_dot_equivalent REAL
        );

        CREATE TABLE IF NOT EXISTS users (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          username TEXT UNIQUE NOT NULL,
          password_hash TEXT NOT NULL,
          created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS dashboards (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL,
          description TEXT,
          created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
          updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS dashboard_components (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          dashboard_id INTEGER NOT NULL REFERENCES dashboards(id) ON DELETE CASCADE,
          name TEXT NOT NULL,
          type TEXT NOT NULL,
          query_config TEXT NOT NULL,
          grid_config TEXT NOT NULL,
          chart_config TEXT
        );

        CREATE TABLE IF NOT EXISTS custom_table_metadata (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          table_name TEXT UNIQUE NOT NULL,
          display_name TEXT NOT NULL,
          schema_json TEXT NOT NULL DEFAULT '[]',
          row_count INTEGER DEFAULT 0,
          created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
          updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE VIEW IF NOT EXISTS all_spending AS
          SELECT 'referendum' AS type, CAST(id AS TEXT) AS id, title, DOT_latest AS DOT,
                 USD_latest AS USD, category_id, latest_status_change
            FROM referenda
           WHERE status = 'Executed' AND hide_in_spends = 0
          UNION ALL
          SELECT 'child_bounty', identifier, description, DOT, USD_latest, category_id,
                 latest_status_change
            FROM child_bounties
           WHERE status = 'Claimed' AND hide_in_spends = 0
          UNION ALL
          SELECT 'subtreasury', CAST(id AS TEXT), title, DOT_latest, USD_latest, category_id,
                 latest_status_change
            FROM subtreasury;
        "#,
    )?;

    Ok(())
}

/// Rebuild the database with random treasury demo data.
///
/// # Errors
/// Returns `DbError` if schema creation or inserts fail.
pub fn seed_database(conn: &mut Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        DROP VIEW IF EXISTS all_spending;
        DROP TABLE IF EXISTS child_bounties;
        DROP TABLE IF EXISTS bounties;
        DROP TABLE IF EXISTS referenda;
        DROP TABLE IF EXISTS subtreasury;
        DROP TABLE IF EXISTS treasury_netflows;
        DROP TABLE IF EXISTS categories;
        ",
    )?;
    create_schema(conn)?;

    let mut rng = rand::thread_rng();
    seed_categories(conn)?;
    seed_referenda(conn, &mut rng)?;
    seed_bounties(conn, &mut rng)?;
    seed_subtreasury(conn, &mut rng)?;
    seed_netflows(conn, &mut rng)?;

    log_summary(conn)?;

    Ok(())
}

fn seed_categories(conn: &mut Connection) -> Result<(), DbError> {
    let tx = conn.transaction()?;
    let mut stmt = tx.prepare("INSERT INTO categories (category, subcategory) VALUES (?, ?)")?;
    for (category, subcategory) in CATEGORIES {
        stmt.execute(params![category, subcategory])?;
    }
    drop(stmt);
    tx.commit()?;
    Ok(())
}

fn seed_referenda(conn: &mut Connection, rng: &mut impl Rng) -> Result<(), DbError> {
    info!("seeding 1000 referenda");

    let tx = conn.transaction()?;
    let mut stmt = tx.prepare(
        "INSERT INTO referenda (id, title, status, track, proposal_time, latest_status_change, \
         DOT_proposal_time, USD_proposal_time, DOT_latest, USD_latest, DOT_component, \
         USDC_component, USDT_component, \"tally.ayes\", \"tally.nays\", category_id, hide_in_spends) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;

    for id in 1..=1000_i64 {
        let verb = choose_str(TITLE_VERBS, rng, "title_verbs")?;
        let subject = choose_str(TITLE_SUBJECTS, rng, "title_subjects")?;
        let title = format!("{verb} {subject} #{id}");
        let status = choose_str(STATUSES, rng, "statuses")?;
        let track = choose_str(TRACKS, rng, "tracks")?;
        let proposal_time = random_date(rng);
        let latest_status_change = random_date(rng);

        let dot = random_float(rng, 100.0, 250_000.0, 2);
        let usd_then = random_float(rng, dot * 4.0, dot * 9.0, 2);
        let usdc = if rng.gen_bool(0.2) { random_float(rng, 1_000.0, 100_000.0, 2) } else { 0.0 };
        let usdt = if rng.gen_bool(0.1) { random_float(rng, 1_000.0, 50_000.0, 2) } else { 0.0 };
        let dot_latest = dot + (usdc + usdt) / DOT_USD;
        let usd_latest = dot_latest * DOT_USD;
        let ayes = random_float(rng, 0.0, 50_000_000.0, 0);
        let nays = random_float(rng, 0.0, 20_000_000.0, 0);
        // Leave some referenda uncategorised so null-aware filters have something to find.
        let category_id: Option<i64> = rng
            .gen_bool(0.85)
            .then(|| rng.gen_range(1..=i64::try_from(CATEGORIES.len()).unwrap_or(1)));
        let hide = i32::from(rng.gen_bool(0.05));

        stmt.execute(params![
            id,
            title,
            status,
            track,
            proposal_time,
            latest_status_change,
            dot,
            usd_then,
            dot_latest,
            usd_latest,
            dot,
            usdc,
            usdt,
            ayes,
            nays,
            category_id,
            hide
        ])?;
    }

    drop(stmt);
    tx.commit()?;

    Ok(())
}

fn seed_bounties(conn: &mut Connection, rng: &mut impl Rng) -> Result<(), DbError> {
    info!("seeding bounties and 300 child bounties");

    let tx = conn.transaction()?;
    let mut bounty_stmt = tx.prepare(
        "INSERT INTO bounties (id, name, category_id, remaining_dot, url, description) VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for (idx, name) in BOUNTY_NAMES.iter().enumerate() {
        let id = i64::try_from(idx).unwrap_or_default() + 10;
        let category_id = rng.gen_range(1..=i64::try_from(CATEGORIES.len()).unwrap_or(1));
        let remaining = random_float(rng, 0.0, 500_000.0, 2);
        let url = format!("https://polkadot.subsquare.io/treasury/bounties/{id}");
        bounty_stmt.execute(params![id, name, category_id, remaining, url, format!("{name} curated spending")])?;
    }
    drop(bounty_stmt);

    let mut child_stmt = tx.prepare(
        "INSERT INTO child_bounties (identifier, parentBountyId, status, description, DOT, \
         USD_proposal_time, USD_latest, beneficiary, proposal_time, latest_status_change, category_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    let bounty_count = i64::try_from(BOUNTY_NAMES.len()).unwrap_or(1);
    for idx in 0..300_i64 {
        let parent = rng.gen_range(0..bounty_count) + 10;
        let identifier = format!("{parent}_{idx}");
        let status = if rng.gen_bool(0.7) { "Claimed" } else { "Awarded" };
        let subject = choose_str(TITLE_SUBJECTS, rng, "title_subjects")?;
        let dot = random_float(rng, 10.0, 20_000.0, 2);
        let usd_then = random_float(rng, dot * 4.0, dot * 9.0, 2);
        let beneficiary = format!("1{}", random_hex(rng, 24));
        let category_id = rng.gen_range(1..=i64::try_from(CATEGORIES.len()).unwrap_or(1));

        child_stmt.execute(params![
            identifier,
            parent,
            status,
            format!("Child bounty for {subject}"),
            dot,
            usd_then,
            dot * DOT_USD,
            beneficiary,
            random_date(rng),
            random_date(rng),
            category_id
        ])?;
    }
    drop(child_stmt);
    tx.commit()?;

    Ok(())
}

fn seed_subtreasury(conn: &mut Connection, rng: &mut impl Rng) -> Result<(), DbError> {
    let tx = conn.transaction()?;
    let mut stmt = tx.prepare(
        "INSERT INTO subtreasury (title, description, DOT_latest, USD_latest, DOT_component, \
         USDC_component, USDT_component, category_id, latest_status_change) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for idx in 1..=40 {
        let subject = choose_str(TITLE_SUBJECTS, rng, "title_subjects")?;
        let dot = random_float(rng, 500.0, 50_000.0, 2);
        let usdc = random_float(rng, 0.0, 20_000.0, 2);
        let dot_latest = dot + usdc / DOT_USD;
        let category_id = rng.gen_range(1..=i64::try_from(CATEGORIES.len()).unwrap_or(1));
        stmt.execute(params![
            format!("Subtreasury spend {idx}: {subject}"),
            format!("Off-chain spend for {subject}"),
            dot_latest,
            dot_latest * DOT_USD,
            dot,
            usdc,
            0.0,
            category_id,
            random_date(rng)
        ])?;
    }
    drop(stmt);
    tx.commit()?;
    Ok(())
}

fn seed_netflows(conn: &mut Connection, rng: &mut impl Rng) -> Result<(), DbError> {
    let tx = conn.transaction()?;
    let mut stmt = tx.prepare(
        "INSERT INTO treasury_netflows (month, asset_name, flow_type, amount_usd, amount_dot_equivalent) \
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for year in 2023..=2025 {
        for month in 1..=12 {
            let label = format!("{year}-{month:02}");
            for asset in ASSETS {
                let flow_type = choose_str(FLOW_TYPES, rng, "flow_types")?;
                let usd = random_float(rng, -2_000_000.0, 2_000_000.0, 2);
                stmt.execute(params![label, asset, flow_type, usd, usd / DOT_USD])?;
            }
        }
    }
    drop(stmt);
    tx.commit()?;
    Ok(())
}

fn log_summary(conn: &Connection) -> Result<(), DbError> {
    let referenda: i64 = conn.query_row("SELECT COUNT(*) FROM referenda", [], |row| row.get(0))?;
    let child_bounties: i64 =
        conn.query_row("SELECT COUNT(*) FROM child_bounties", [], |row| row.get(0))?;
    let spending: i64 = conn.query_row("SELECT COUNT(*) FROM all_spending", [], |row| row.get(0))?;

    info!(referenda, child_bounties, spending, "database seeded");
    Ok(())
}

fn choose_str<'a>(items: &'a [&'a str], rng: &mut impl Rng, label: &'static str) -> Result<&'a str, DbError> {
    items.choose(rng).copied().ok_or(DbError::SeedData(label))
}

fn random_float(rng: &mut impl Rng, min: f64, max: f64, decimals: u32) -> f64 {
    let value = rng.gen_range(min..=max);
    let exponent = i32::try_from(decimals).unwrap_or(0);
    let factor = 10_f64.powi(exponent);
    (value * factor).round() / factor
}

fn random_date(rng: &mut impl Rng) -> String {
    let year = rng.gen_range(2023..=2025);
    let month = rng.gen_range(1..=12);
    let day = rng.gen_range(1..=28);
    format!("{year}-{month:02}-{day:02} 12:00:00")
}

fn random_hex(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_builder::registry;

    #[test]
    fn seeded_database_exposes_every_queryable_source() {
        let mut conn = Connection::open_in_memory().unwrap();
        seed_database(&mut conn).unwrap();

        for table in registry::allowed_tables(&conn).unwrap() {
            let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0)).unwrap();
            assert!(count > 0, "{table} should have seed rows");
        }
    }

    #[test]
    fn create_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        create_schema(&conn).unwrap();
    }
}

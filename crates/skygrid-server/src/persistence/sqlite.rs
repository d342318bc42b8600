//! SQLite-backed persistence.

use super::{MissionFilter, Persistence, PersistenceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skygrid_core::{Conflict, ConflictKind, ConflictSeverity, Mission, MissionState,
    TrajectorySample, Waypoint};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and run
    /// migrations.
    pub async fn init(db_path: &str, max_connections: u32) -> anyhow::Result<Self> {
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", db_path)
        };
        info!("Connecting to database: {}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let migration_sql = include_str!("../../migrations/001_init.sql");
    info!("Running database migrations...");

    for statement in migration_sql.split(';') {
        let statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            if e.to_string().contains("already exists") {
                continue;
            }
            anyhow::bail!("migration failed: {}", e);
        }
    }

    info!("Database migrations complete");
    Ok(())
}

/// Map sqlx failures onto the retry classification.
fn classify(err: sqlx::Error) -> PersistenceError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
            PersistenceError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) if db.message().contains("locked") => {
            PersistenceError::Transient(err.to_string())
        }
        _ => PersistenceError::Permanent(err.to_string()),
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Permanent(format!("bad timestamp {raw:?}: {e}")))
}

fn state_to_str(state: MissionState) -> &'static str {
    match state {
        MissionState::Scheduled => "scheduled",
        MissionState::Running => "running",
        MissionState::Completed => "completed",
        MissionState::Failed => "failed",
        MissionState::Cancelled => "cancelled",
    }
}

fn state_from_str(raw: &str) -> Result<MissionState, PersistenceError> {
    match raw {
        "scheduled" => Ok(MissionState::Scheduled),
        "running" => Ok(MissionState::Running),
        "completed" => Ok(MissionState::Completed),
        "failed" => Ok(MissionState::Failed),
        "cancelled" => Ok(MissionState::Cancelled),
        other => Err(PersistenceError::Permanent(format!(
            "unknown mission state {other:?}"
        ))),
    }
}

fn kind_to_str(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::Live => "live",
        ConflictKind::Planned => "planned",
        ConflictKind::Mixed => "mixed",
        ConflictKind::Exclusivity => "exclusivity",
        ConflictKind::Altitude => "altitude",
    }
}

fn kind_from_str(raw: &str) -> Result<ConflictKind, PersistenceError> {
    match raw {
        "live" => Ok(ConflictKind::Live),
        "planned" => Ok(ConflictKind::Planned),
        "mixed" => Ok(ConflictKind::Mixed),
        "exclusivity" => Ok(ConflictKind::Exclusivity),
        "altitude" => Ok(ConflictKind::Altitude),
        other => Err(PersistenceError::Permanent(format!(
            "unknown conflict kind {other:?}"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct MissionRow {
    mission_id: String,
    vehicle_id: String,
    waypoints: String,
    start_time: String,
    end_time: String,
    state: String,
    fail_reason: Option<String>,
    created_at: String,
}

impl TryFrom<MissionRow> for Mission {
    type Error = PersistenceError;

    fn try_from(row: MissionRow) -> Result<Self, PersistenceError> {
        let waypoints: Vec<Waypoint> = serde_json::from_str(&row.waypoints)
            .map_err(|e| PersistenceError::Permanent(format!("bad waypoints json: {e}")))?;
        Ok(Mission {
            mission_id: row.mission_id,
            vehicle_id: row.vehicle_id,
            waypoints,
            start_time: parse_time(&row.start_time)?,
            end_time: parse_time(&row.end_time)?,
            state: state_from_str(&row.state)?,
            fail_reason: row.fail_reason,
            created_at: parse_time(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TrajectoryRow {
    vehicle_id: String,
    timestamp: String,
    lat: f64,
    lon: f64,
    altitude_m: f64,
    velocity_x: f64,
    velocity_y: f64,
    velocity_z: f64,
}

impl TryFrom<TrajectoryRow> for TrajectorySample {
    type Error = PersistenceError;

    fn try_from(row: TrajectoryRow) -> Result<Self, PersistenceError> {
        Ok(TrajectorySample {
            vehicle_id: row.vehicle_id,
            timestamp: parse_time(&row.timestamp)?,
            lat: row.lat,
            lon: row.lon,
            altitude_m: row.altitude_m,
            velocity_x: row.velocity_x,
            velocity_y: row.velocity_y,
            velocity_z: row.velocity_z,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    kind: String,
    vehicle_a: String,
    vehicle_b: Option<String>,
    time_from: String,
    time_to: String,
    min_distance_m: f64,
    severity: String,
}

impl TryFrom<ConflictRow> for Conflict {
    type Error = PersistenceError;

    fn try_from(row: ConflictRow) -> Result<Self, PersistenceError> {
        let severity = match row.severity.as_str() {
            "warning" => ConflictSeverity::Warning,
            "critical" => ConflictSeverity::Critical,
            other => {
                return Err(PersistenceError::Permanent(format!(
                    "unknown severity {other:?}"
                )))
            }
        };
        Ok(Conflict {
            kind: kind_from_str(&row.kind)?,
            vehicle_a: row.vehicle_a,
            vehicle_b: row.vehicle_b,
            time_from: parse_time(&row.time_from)?,
            time_to: parse_time(&row.time_to)?,
            min_distance_m: row.min_distance_m,
            severity,
        })
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn put_mission(&self, mission: &Mission) -> Result<(), PersistenceError> {
        let waypoints_json = serde_json::to_string(&mission.waypoints)
            .map_err(|e| PersistenceError::Permanent(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO missions (
                mission_id, vehicle_id, waypoints,
                start_time, end_time, state, fail_reason, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(mission_id) DO UPDATE SET
                state = ?6, fail_reason = ?7
            "#,
        )
        .bind(&mission.mission_id)
        .bind(&mission.vehicle_id)
        .bind(&waypoints_json)
        .bind(mission.start_time.to_rfc3339())
        .bind(mission.end_time.to_rfc3339())
        .bind(state_to_str(mission.state))
        .bind(&mission.fail_reason)
        .bind(mission.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn get_mission(&self, mission_id: &str) -> Result<Option<Mission>, PersistenceError> {
        let row = sqlx::query_as::<_, MissionRow>(
            "SELECT mission_id, vehicle_id, waypoints, start_time, end_time, state, fail_reason, created_at \
             FROM missions WHERE mission_id = ?1",
        )
        .bind(mission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(Mission::try_from).transpose()
    }

    async fn list_missions(
        &self,
        filter: &MissionFilter,
    ) -> Result<Vec<Mission>, PersistenceError> {
        let mut sql = String::from(
            "SELECT mission_id, vehicle_id, waypoints, start_time, end_time, state, fail_reason, created_at \
             FROM missions WHERE 1=1",
        );
        if filter.vehicle_id.is_some() {
            sql.push_str(" AND vehicle_id = ?1");
        }
        if filter.active_only {
            sql.push_str(" AND state IN ('scheduled', 'running')");
        }
        sql.push_str(" ORDER BY start_time");

        let mut query = sqlx::query_as::<_, MissionRow>(&sql);
        if let Some(vehicle_id) = &filter.vehicle_id {
            query = query.bind(vehicle_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(classify)?;
        rows.into_iter().map(Mission::try_from).collect()
    }

    async fn append_trajectory(&self, sample: &TrajectorySample) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO trajectory_points \
             (vehicle_id, timestamp, lat, lon, altitude_m, velocity_x, velocity_y, velocity_z) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&sample.vehicle_id)
        .bind(sample.timestamp.to_rfc3339())
        .bind(sample.lat)
        .bind(sample.lon)
        .bind(sample.altitude_m)
        .bind(sample.velocity_x)
        .bind(sample.velocity_y)
        .bind(sample.velocity_z)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn range_trajectory(
        &self,
        vehicle_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TrajectorySample>, PersistenceError> {
        let rows = sqlx::query_as::<_, TrajectoryRow>(
            "SELECT vehicle_id, timestamp, lat, lon, altitude_m, velocity_x, velocity_y, velocity_z \
             FROM trajectory_points \
             WHERE vehicle_id = ?1 AND timestamp BETWEEN ?2 AND ?3 \
             ORDER BY timestamp",
        )
        .bind(vehicle_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(TrajectorySample::try_from).collect()
    }

    async fn append_conflict_event(&self, conflict: &Conflict) -> Result<(), PersistenceError> {
        let severity = match conflict.severity {
            ConflictSeverity::Warning => "warning",
            ConflictSeverity::Critical => "critical",
        };
        sqlx::query(
            "INSERT INTO conflict_events \
             (kind, vehicle_a, vehicle_b, time_from, time_to, min_distance_m, severity) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(kind_to_str(conflict.kind))
        .bind(&conflict.vehicle_a)
        .bind(&conflict.vehicle_b)
        .bind(conflict.time_from.to_rfc3339())
        .bind(conflict.time_to.to_rfc3339())
        .bind(conflict.min_distance_m)
        .bind(severity)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn range_conflicts(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Conflict>, PersistenceError> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            "SELECT kind, vehicle_a, vehicle_b, time_from, time_to, min_distance_m, severity \
             FROM conflict_events \
             WHERE time_from BETWEEN ?1 AND ?2 \
             ORDER BY time_from",
        )
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(Conflict::try_from).collect()
    }
}

use super::{RunState, RunTracker, TrackerError};
use crate::job::RunIdentity;
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    Connection, ToSql,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};
use tracing::{debug, error, info};

/// Run tracker persisted in a local SQLite database
#[derive(Debug)]
pub struct SqliteTracker {
    connection: Connection,
}

impl ToSql for RunState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for RunState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;

        RunState::try_from(raw).map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

impl SqliteTracker {
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        let tracker = Self {
            connection: Connection::open(path)?,
        };
        tracker.init()?;

        info!(path = ?path, "Opened SQLite run tracker");

        Ok(tracker)
    }

    pub fn in_memory() -> Result<Self, TrackerError> {
        let tracker = Self {
            connection: Connection::open_in_memory()?,
        };
        tracker.init()?;

        Ok(tracker)
    }

    fn init(&self) -> Result<(), TrackerError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1),
                Err(error) => {
                    error!(error = ?error, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(error.into());
                }
            }
        }

        Ok(())
    }

    /// Insert or update the state of a run
    pub fn record(
        &self,
        experiment: &str,
        run: &RunIdentity,
        state: RunState,
    ) -> Result<(), TrackerError> {
        self.connection
            .prepare_cached(
                "insert into runs (experiment, name, state) values (?, ?, ?)
                 on conflict (experiment, name) do update
                 set state = excluded.state, updated = strftime('%s', 'now')",
            )?
            .execute(params![experiment, run.as_str(), state])?;

        info!(experiment = experiment, run = %run, state = %state, "Recorded run state");

        Ok(())
    }

    pub fn runs(&self, experiment: &str) -> Result<BTreeMap<RunIdentity, RunState>, TrackerError> {
        self.connection
            .prepare_cached("select name, state from runs where experiment = ?")?
            .query_map(params![experiment], |row| {
                Ok((RunIdentity::from(row.get::<_, String>(0)?), row.get(1)?))
            })?
            .try_fold(BTreeMap::<RunIdentity, RunState>::new(), |mut init, result| {
                let (run, state) = result?;
                init.insert(run, state);

                Ok::<_, TrackerError>(init)
            })
    }
}

impl RunTracker for SqliteTracker {
    fn running_finished_runs(
        &self,
        experiment: &str,
    ) -> Result<BTreeSet<RunIdentity>, TrackerError> {
        let existing = self
            .connection
            .prepare_cached("select name from runs where experiment = ? and state in (?, ?)")?
            .query_map(
                params![experiment, RunState::Running, RunState::Finished],
                |row| row.get::<_, String>(0).map(RunIdentity::from),
            )?
            .collect::<Result<BTreeSet<_>, _>>()?;

        debug!(experiment = experiment, existing = existing.len(), "SQLite tracker lookup");

        Ok(existing)
    }
}

pub const SQL_SCHEMA: [&str; 1] = ["create table if not exists runs (
    experiment text not null,
    name text not null,
    state integer not null,
    updated integer not null default (strftime('%s', 'now')),
    primary key (experiment, name)
);"];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

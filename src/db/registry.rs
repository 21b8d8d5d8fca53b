//! Profile-keyed session cache.
//!
//! A [`SessionRegistry`] owns the connector and a set of named connection
//! profiles, and hands out at most one live [`Session`] at a time. Asking
//! for the profile that is already active returns the cached session; asking
//! for a different one closes the old session first. Sessions pinned to
//! utf8mb4 are rebuilt on every request.
//!
//! The registry is an explicit object: construct one where the application
//! wires its services and pass it down, or keep several side by side.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ConnectionParams, DEFAULT_PROFILE, Profiles};
use crate::db::driver::Connector;
use crate::db::mysql::MySqlConnector;
use crate::db::session::Session;
use crate::error::Result;
use crate::models::{ResultSet, SqlParam};
use crate::sql::Assignments;

struct ActiveSession {
    profile: String,
    database: String,
    reusable: bool,
    session: Arc<Mutex<Session>>,
}

/// Opens, caches, and closes database sessions by profile name.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    profiles: Profiles,
    active: Option<ActiveSession>,
}

impl SessionRegistry {
    /// Build a registry over an arbitrary connector.
    pub fn new(connector: Arc<dyn Connector>, profiles: Profiles) -> Self {
        Self {
            connector,
            profiles,
            active: None,
        }
    }

    /// Build a registry that opens real MySQL connections.
    pub fn mysql(profiles: Profiles) -> Self {
        Self::new(Arc::new(MySqlConnector::new()), profiles)
    }

    pub fn profiles(&self) -> &Profiles {
        &self.profiles
    }

    /// The profile whose session is currently live, if any.
    pub fn active_profile(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.profile.as_str())
    }

    /// The session for [`DEFAULT_PROFILE`].
    pub async fn default_session(&mut self) -> Result<Arc<Mutex<Session>>> {
        self.session(DEFAULT_PROFILE).await
    }

    /// The session for `profile`, opening one when needed.
    ///
    /// A cached session is reused only when the profile matches and the
    /// session allows reuse; a stale captured primary key is cleared on the
    /// way out so it cannot leak between callers. In every other case the
    /// previous session is closed and a fresh one opened.
    pub async fn session(&mut self, profile: &str) -> Result<Arc<Mutex<Session>>> {
        let params = self.profiles.get(profile)?.clone();

        if let Some(active) = &self.active {
            if active.profile == profile && active.reusable {
                let session = Arc::clone(&active.session);
                session.lock().await.clear_primary_key();
                return Ok(session);
            }
        }

        self.close_active().await;
        self.open_session(profile, params).await
    }

    /// Open a session from ad-hoc parameters, cached under `profile`.
    ///
    /// The parameters do not need to be registered; the name and the params'
    /// database together form the cache key, so passing the same name with a
    /// different database opens a fresh session rather than handing back one
    /// connected elsewhere. Malformed params are rejected up front.
    pub async fn session_with_params(
        &mut self,
        profile: &str,
        params: ConnectionParams,
    ) -> Result<Arc<Mutex<Session>>> {
        params.validate()?;

        if let Some(active) = &self.active {
            if active.profile == profile && active.database == params.database && active.reusable {
                let session = Arc::clone(&active.session);
                session.lock().await.clear_primary_key();
                return Ok(session);
            }
        }

        self.close_active().await;
        self.open_session(profile, params).await
    }

    async fn open_session(
        &mut self,
        profile: &str,
        params: ConnectionParams,
    ) -> Result<Arc<Mutex<Session>>> {
        debug!(profile = profile, database = %params.database, "Opening session");
        let database = params.database.clone();
        let session = Session::open(Arc::clone(&self.connector), params).await?;
        let reusable = session.is_reusable();
        let session = Arc::new(Mutex::new(session));
        self.active = Some(ActiveSession {
            profile: profile.to_string(),
            database,
            reusable,
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    /// Close the active session, if any. Close failures are logged, not
    /// propagated; the registry forgets the session either way.
    pub async fn close_active(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.session.lock().await.close().await {
                warn!(profile = %active.profile, error = %e, "Closing session failed");
            }
        }
    }

    // =========================================================================
    // One-shot helpers
    // =========================================================================
    //
    // Each helper resolves the profile's session, runs exactly one operation
    // under the lock, and hands the outcome back.

    /// Run one raw statement on `profile`.
    pub async fn run(&mut self, profile: &str, sql: &str) -> Result<Option<ResultSet>> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        session.execute(sql).await
    }

    /// Run one parameterized statement on `profile`.
    pub async fn run_with_params(
        &mut self,
        profile: &str,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Option<ResultSet>> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        session.execute_with_params(sql, params).await
    }

    /// Insert a row built from `fields` into `table` on `profile`.
    pub async fn create(
        &mut self,
        profile: &str,
        table: &str,
        fields: &Assignments,
    ) -> Result<bool> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        Ok(session.create(table, fields).await)
    }

    /// Update the row matched by `key` in `table` on `profile`.
    pub async fn update(
        &mut self,
        profile: &str,
        table: &str,
        fields: &Assignments,
        key: impl Into<SqlParam>,
        match_column: Option<&str>,
    ) -> Result<bool> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        Ok(session.update(table, fields, key, match_column).await)
    }

    /// Insert a bare row and update it with `fields` on `profile`.
    pub async fn insert_update(
        &mut self,
        profile: &str,
        table: &str,
        fields: &Assignments,
        match_column: Option<&str>,
    ) -> Result<bool> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        Ok(session.insert_update(table, fields, match_column).await)
    }

    /// Delete the rows matched by `keys` from `table` on `profile`.
    pub async fn delete(
        &mut self,
        profile: &str,
        table: &str,
        keys: &[SqlParam],
        match_column: Option<&str>,
    ) -> Result<bool> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        Ok(session.delete(table, keys, match_column).await)
    }

    /// Insert a bare row into `table` on `profile`, returning its key.
    pub async fn insert(
        &mut self,
        profile: &str,
        table: &str,
        explicit_key: Option<u64>,
    ) -> Result<Option<u64>> {
        let session = self.session(profile).await?;
        let mut session = session.lock().await;
        Ok(session.insert(table, explicit_key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::mock::MockConnector;
    use crate::error::Error;
    use serde_json::json;

    fn profiles() -> Profiles {
        let mut profiles = Profiles::new();
        profiles.insert(
            DEFAULT_PROFILE,
            ConnectionParams::new("localhost", "appdb", "app", "secret"),
        );
        profiles.insert(
            "reporting",
            ConnectionParams::new("localhost", "reports", "app", "secret"),
        );
        profiles
    }

    fn registry(connector: &MockConnector) -> SessionRegistry {
        SessionRegistry::new(Arc::new(connector.clone()), profiles())
    }

    #[tokio::test]
    async fn test_same_profile_reuses_the_session() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let first = registry.session(DEFAULT_PROFILE).await.unwrap();
        let second = registry.session(DEFAULT_PROFILE).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
        assert_eq!(registry.active_profile(), Some(DEFAULT_PROFILE));
    }

    #[tokio::test]
    async fn test_switching_profile_closes_the_old_session() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        registry.session(DEFAULT_PROFILE).await.unwrap();
        let session = registry.session("reporting").await.unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.closes(), 1);
        assert_eq!(session.lock().await.database(), "reports");
        assert_eq!(registry.active_profile(), Some("reporting"));
    }

    #[tokio::test]
    async fn test_utf8mb4_sessions_are_never_reused() {
        let connector = MockConnector::new();
        let mut profiles = Profiles::new();
        profiles.insert(
            "emoji",
            ConnectionParams::new("localhost", "appdb", "app", "secret").with_charset("utf8mb4"),
        );
        let mut registry = SessionRegistry::new(Arc::new(connector.clone()), profiles);

        registry.session("emoji").await.unwrap();
        registry.session("emoji").await.unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_handout_clears_a_stale_primary_key() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let session = registry.session(DEFAULT_PROFILE).await.unwrap();
        session.lock().await.set_primary_key(77);

        let session = registry.session(DEFAULT_PROFILE).await.unwrap();
        assert_eq!(session.lock().await.primary_key(), None);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_profiles_are_rejected() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let err = registry.session("nope").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("nope"));

        let err = registry.session("").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_session_with_params_caches_under_the_given_name() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let params = ConnectionParams::new("localhost", "scratch", "app", "secret");
        let first = registry
            .session_with_params("scratch", params.clone())
            .await
            .unwrap();
        let second = registry
            .session_with_params("scratch", params)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_session_with_params_reopens_when_database_changes() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let params = ConnectionParams::new("localhost", "db_a", "app", "pw");
        registry.session_with_params("scratch", params).await.unwrap();

        // Same cache name, different database: the old session must go
        let params = ConnectionParams::new("localhost", "db_b", "app", "pw");
        let session = registry.session_with_params("scratch", params).await.unwrap();

        assert_eq!(session.lock().await.database(), "db_b");
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_session_with_params_rejects_malformed_params() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        let params = ConnectionParams::new("localhost", "db_a", "app", "pw");
        registry.session_with_params("scratch", params).await.unwrap();

        // An under-specified record is rejected before any cache lookup
        let err = registry
            .session_with_params("scratch", ConnectionParams::new("", "", "", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(connector.connects(), 1);
        assert_eq!(registry.active_profile(), Some("scratch"));
    }

    #[tokio::test]
    async fn test_run_executes_exactly_once() {
        let connector = MockConnector::new();
        connector.push_rows(vec![crate::models::Row::from_pairs(vec![(
            "n".to_string(),
            json!(1),
        )])]);
        let mut registry = registry(&connector);

        let result = registry.run(DEFAULT_PROFILE, "SELECT n FROM t").await.unwrap();
        assert_eq!(result.unwrap().len(), 1);
        assert_eq!(connector.executed_sql(), vec!["SELECT n FROM t"]);
    }

    #[tokio::test]
    async fn test_insert_returns_the_generated_key() {
        let connector = MockConnector::new();
        connector.push_outcome(Ok(crate::db::driver::StatementOutcome {
            rows: Vec::new(),
            affected_rows: 1,
            last_insert_id: 9,
        }));
        let mut registry = registry(&connector);

        let key = registry.insert(DEFAULT_PROFILE, "tasks", None).await.unwrap();
        assert_eq!(key, Some(9));
    }

    #[tokio::test]
    async fn test_close_active_forgets_the_session() {
        let connector = MockConnector::new();
        let mut registry = registry(&connector);

        registry.session(DEFAULT_PROFILE).await.unwrap();
        registry.close_active().await;

        assert_eq!(connector.closes(), 1);
        assert_eq!(registry.active_profile(), None);

        registry.session(DEFAULT_PROFILE).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }
}

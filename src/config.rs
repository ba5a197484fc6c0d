use crate::dispatcher::QueueKind;

/// Configuration of a [`Database`](crate::database::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Name of the transaction worker thread.
    ///
    /// Default: `sqlite_invalidation_worker`.
    pub worker_name: String,

    /// Ordering of queued units of work.
    ///
    /// Default: [`QueueKind::Fifo`].
    pub queue_kind: QueueKind,

    /// Whether the shadow table is scanned after every unit of work.
    ///
    /// When disabled, observers are only notified when
    /// [`Database::check_for_table_updates`](crate::database::Database::check_for_table_updates)
    /// is called. Live queries depend on these scans to refresh.
    ///
    /// Default: `true`.
    pub auto_check_after_commit: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            worker_name: "sqlite_invalidation_worker".to_owned(),
            queue_kind: QueueKind::Fifo,
            auto_check_after_commit: true,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    #[must_use]
    pub fn with_queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    /// See [`auto_check_after_commit`](Self::auto_check_after_commit).
    #[must_use]
    pub fn with_auto_check_after_commit(mut self, enabled: bool) -> Self {
        self.auto_check_after_commit = enabled;
        self
    }
}

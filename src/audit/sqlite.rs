//! SQLite audit store

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use super::{
    Auditor, CleanupCounts, EventRecord, ExecutionRecord, ExecutionStatus, ResourceRecord,
    VmRecord, WorkloadRecord,
};
use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id                TEXT    NOT NULL UNIQUE,
    linked_run_ids        TEXT,
    command               TEXT    NOT NULL,
    status                TEXT    NOT NULL DEFAULT 'in_progress',
    kubeconfig_path       TEXT,
    namespace             TEXT    NOT NULL,
    container_disk_image  TEXT,
    default_cpu_cores     INTEGER,
    default_memory        TEXT,
    data_disk_size        TEXT,
    workloads_csv         TEXT,
    total_vm_count        INTEGER,
    total_workload_count  INTEGER,
    dry_run               INTEGER NOT NULL DEFAULT 0,
    ssh_auth_configured   INTEGER NOT NULL DEFAULT 0,
    cleanup_mode          TEXT,
    wait_for_ready        INTEGER NOT NULL DEFAULT 1,
    ready_timeout_seconds INTEGER,
    vms_deleted           INTEGER,
    services_deleted      INTEGER,
    secrets_deleted       INTEGER,
    namespace_deleted     INTEGER,
    started_at            TEXT    NOT NULL,
    completed_at          TEXT,
    error_summary         TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_log_started_at ON audit_log(started_at);
CREATE INDEX IF NOT EXISTS idx_audit_log_namespace  ON audit_log(namespace);
CREATE INDEX IF NOT EXISTS idx_audit_log_status     ON audit_log(status);

CREATE TABLE IF NOT EXISTS workload_details (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id         INTEGER NOT NULL REFERENCES audit_log(id),
    workload_type    TEXT    NOT NULL,
    vm_count         INTEGER NOT NULL,
    cpu_cores        INTEGER NOT NULL,
    memory           TEXT    NOT NULL,
    has_data_disk    INTEGER NOT NULL DEFAULT 0,
    data_disk_size   TEXT,
    requires_service INTEGER NOT NULL DEFAULT 0,
    status           TEXT    NOT NULL DEFAULT 'pending',
    started_at       TEXT,
    completed_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_workload_details_audit_id ON workload_details(audit_id);

CREATE TABLE IF NOT EXISTS vm_details (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id             INTEGER NOT NULL REFERENCES audit_log(id),
    workload_id          INTEGER REFERENCES workload_details(id),
    vm_name              TEXT    NOT NULL,
    namespace            TEXT    NOT NULL,
    component            TEXT    NOT NULL,
    role                 TEXT,
    cpu_cores            INTEGER NOT NULL,
    memory               TEXT    NOT NULL,
    container_disk_image TEXT    NOT NULL,
    has_data_disk        INTEGER NOT NULL DEFAULT 0,
    data_disk_size       TEXT,
    phase                TEXT,
    status               TEXT    NOT NULL DEFAULT 'planned',
    created_at           TEXT,
    ready_at             TEXT
);
CREATE INDEX IF NOT EXISTS idx_vm_details_audit_id ON vm_details(audit_id);
CREATE INDEX IF NOT EXISTS idx_vm_details_vm_name  ON vm_details(vm_name);

CREATE TABLE IF NOT EXISTS resource_details (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id      INTEGER NOT NULL REFERENCES audit_log(id),
    resource_type TEXT    NOT NULL,
    resource_name TEXT    NOT NULL,
    namespace     TEXT    NOT NULL,
    status        TEXT    NOT NULL DEFAULT 'created',
    created_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_resource_details_audit_id ON resource_details(audit_id);

CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_id     INTEGER NOT NULL REFERENCES audit_log(id),
    vm_id        INTEGER REFERENCES vm_details(id),
    workload_id  INTEGER REFERENCES workload_details(id),
    event_type   TEXT    NOT NULL,
    message      TEXT,
    error_detail TEXT,
    occurred_at  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_audit_id   ON events(audit_id);
CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);
";

fn map_err(what: &str, err: impl std::fmt::Display) -> Error {
    Error::audit(format!("{what}: {err}"))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// [`Auditor`] backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteAuditor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditor {
    /// Open (or create) the database at `path`; `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory().map_err(|e| map_err("open in-memory db", e))?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_err("create audit db directory", e))?;
            }
            Connection::open(path).map_err(|e| map_err("open audit db", e))?
        };

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| map_err("enable foreign keys", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_err("ensure schema", e))?;

        debug!(path = %path.display(), "Opened audit database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::audit("audit connection mutex poisoned"))
    }

    #[cfg(test)]
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn()?;
        f(&conn).map_err(|e| map_err("query", e))
    }
}

impl Auditor for SqliteAuditor {
    fn start_execution(&self, r: &ExecutionRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (
                run_id, command, status, kubeconfig_path, namespace,
                container_disk_image, default_cpu_cores, default_memory, data_disk_size,
                workloads_csv, total_vm_count, total_workload_count, dry_run,
                ssh_auth_configured, cleanup_mode, wait_for_ready, ready_timeout_seconds,
                started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                r.run_id,
                r.command,
                ExecutionStatus::InProgress.as_str(),
                r.kubeconfig_path,
                r.namespace,
                r.container_disk_image,
                r.cpu_cores,
                r.memory,
                r.data_disk_size,
                r.workloads,
                r.total_vm_count.map(|n| n as i64),
                r.total_workload_count.map(|n| n as i64),
                r.dry_run,
                r.ssh_auth_configured,
                r.cleanup_mode,
                r.wait_for_ready,
                r.ready_timeout_seconds.map(|n| n as i64),
                now(),
            ],
        )
        .map_err(|e| map_err("insert execution", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        error_summary: Option<&str>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE audit_log SET status = ?1, completed_at = ?2, error_summary = ?3 WHERE id = ?4",
                params![status.as_str(), now(), error_summary, id],
            )
            .map_err(|e| map_err("complete execution", e))?;
        Ok(())
    }

    fn link_cleanup_to_runs(&self, id: i64, run_ids: &[String]) -> Result<()> {
        let json = serde_json::to_string(run_ids).map_err(|e| map_err("encode run ids", e))?;
        self.conn()?
            .execute(
                "UPDATE audit_log SET linked_run_ids = ?1 WHERE id = ?2",
                params![json, id],
            )
            .map_err(|e| map_err("link runs", e))?;
        Ok(())
    }

    fn record_cleanup_counts(&self, id: i64, c: &CleanupCounts) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE audit_log SET vms_deleted = ?1, services_deleted = ?2,
                    secrets_deleted = ?3, namespace_deleted = ?4 WHERE id = ?5",
                params![
                    c.vms_deleted as i64,
                    c.services_deleted as i64,
                    c.secrets_deleted as i64,
                    c.namespace_deleted,
                    id
                ],
            )
            .map_err(|e| map_err("record cleanup counts", e))?;
        Ok(())
    }

    fn record_workload(&self, execution_id: i64, w: &WorkloadRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workload_details (
                audit_id, workload_type, vm_count, cpu_cores, memory,
                has_data_disk, data_disk_size, requires_service, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                execution_id,
                w.workload_type,
                w.vm_count as i64,
                w.cpu_cores,
                w.memory,
                w.data_disk_size.is_some(),
                w.data_disk_size,
                w.requires_service,
                now(),
            ],
        )
        .map_err(|e| map_err("insert workload", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn update_workload_status(&self, id: i64, status: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE workload_details SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status, now(), id],
            )
            .map_err(|e| map_err("update workload", e))?;
        Ok(())
    }

    fn record_vm(&self, execution_id: i64, workload_id: Option<i64>, v: &VmRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO vm_details (
                audit_id, workload_id, vm_name, namespace, component, role, cpu_cores,
                memory, container_disk_image, has_data_disk, data_disk_size
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                execution_id,
                workload_id,
                v.vm_name,
                v.namespace,
                v.component,
                v.role,
                v.cpu_cores,
                v.memory,
                v.container_disk_image,
                v.data_disk_size.is_some(),
                v.data_disk_size,
            ],
        )
        .map_err(|e| map_err("insert VM", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn update_vm_status(&self, id: i64, phase: &str, status: &str) -> Result<()> {
        let conn = self.conn()?;
        let result = match status {
            "created" => conn.execute(
                "UPDATE vm_details SET phase = ?1, status = ?2, created_at = ?3 WHERE id = ?4",
                params![phase, status, now(), id],
            ),
            "ready" => conn.execute(
                "UPDATE vm_details SET phase = ?1, status = ?2, ready_at = ?3 WHERE id = ?4",
                params![phase, status, now(), id],
            ),
            _ => conn.execute(
                "UPDATE vm_details SET phase = ?1, status = ?2 WHERE id = ?3",
                params![phase, status, id],
            ),
        };
        result.map_err(|e| map_err("update VM", e))?;
        Ok(())
    }

    fn record_resource(&self, execution_id: i64, r: &ResourceRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resource_details (audit_id, resource_type, resource_name, namespace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![execution_id, r.resource_type, r.resource_name, r.namespace, now()],
        )
        .map_err(|e| map_err("insert resource", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn record_event(&self, execution_id: i64, e: &EventRecord) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO events (audit_id, vm_id, workload_id, event_type, message, error_detail, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    execution_id,
                    e.vm_id,
                    e.workload_id,
                    e.event_type.as_str(),
                    e.message,
                    e.error_detail,
                    now(),
                ],
            )
            .map_err(|err| map_err("insert event", err))?;
        Ok(())
    }
}

//! SQLite storage backend for the candidate tray

use super::traits::{
    AuditAction, AuditEntry, BacklogStats, CandidateFilter, CandidateStore, OpenStore, SortOrder,
    StorageError, StorageResult,
};
use crate::candidate::{
    normalize_code, CandidateCode, CandidateId, CandidateState, CanonicalCode, Fragment,
    NewCandidate,
};
use crate::reconcile::{MergePlan, PlanDecision, PlanDecisionKind, PlanPair};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

const CANDIDATE_COLUMNS: &str = "id, project, codigo, estado, fuente_origen, score_confianza, cita, \
     fragmento_id, archivo, fusionado_a, promovido_en, memo, created_at, resolved_at";

/// SQLite-backed candidate store
///
/// One database file holds candidates, evidence fragments, the canonical
/// codebook, the audit trail and the merge plan log. Thread-safe via an
/// internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Raw candidate columns before label and date parsing
struct CandidateRow {
    id: String,
    project: String,
    code: String,
    state: String,
    origin: String,
    confidence: Option<f64>,
    quote: String,
    fragment_id: Option<String>,
    document: String,
    merged_into: Option<String>,
    promoted_at: Option<String>,
    memo: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl CandidateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project: row.get(1)?,
            code: row.get(2)?,
            state: row.get(3)?,
            origin: row.get(4)?,
            confidence: row.get(5)?,
            quote: row.get(6)?,
            fragment_id: row.get(7)?,
            document: row.get(8)?,
            merged_into: row.get(9)?,
            promoted_at: row.get(10)?,
            memo: row.get(11)?,
            created_at: row.get(12)?,
            resolved_at: row.get(13)?,
        })
    }

    fn into_candidate(self) -> StorageResult<CandidateCode> {
        Ok(CandidateCode {
            id: CandidateId::from_string(self.id),
            project: self.project,
            code: self.code,
            state: self.state.parse()?,
            origin: self.origin.parse()?,
            confidence: self.confidence.map(|c| c as f32),
            quote: self.quote,
            fragment_id: self.fragment_id,
            document: self.document,
            merged_into: self.merged_into,
            promoted_at: parse_opt_ts(self.promoted_at)?,
            memo: self.memo,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
        })
    }
}

/// Fixed-width UTC timestamps so lexical order matches time order
fn fmt_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(e.to_string()))
}

fn parse_opt_ts(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn state_list(states: &[CandidateState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Candidate tray
            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                codigo TEXT NOT NULL,
                codigo_norm TEXT NOT NULL,
                estado TEXT NOT NULL,
                fuente_origen TEXT NOT NULL,
                score_confianza REAL,
                cita TEXT NOT NULL DEFAULT '',
                fragmento_id TEXT,
                archivo TEXT NOT NULL DEFAULT '',
                fusionado_a TEXT,
                promovido_en TEXT,
                memo TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_state
                ON candidates(project, estado);
            CREATE INDEX IF NOT EXISTS idx_candidates_code
                ON candidates(project, codigo_norm);

            -- Evidence units
            CREATE TABLE IF NOT EXISTS fragments (
                project TEXT NOT NULL,
                id TEXT NOT NULL,
                archivo TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (project, id)
            );

            -- Canonical codebook
            CREATE TABLE IF NOT EXISTS codebook (
                project TEXT NOT NULL,
                codigo_norm TEXT NOT NULL,
                codigo TEXT NOT NULL,
                promoted_from_json TEXT NOT NULL,
                first_promoted_at TEXT NOT NULL,
                PRIMARY KEY (project, codigo_norm)
            );

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                action TEXT NOT NULL,
                memo TEXT,
                details_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_project
                ON audit_log(project, seq);

            -- AI merge plans and their decisions
            CREATE TABLE IF NOT EXISTS merge_plans (
                run_id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                threshold REAL NOT NULL,
                created_at TEXT NOT NULL,
                pairs_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS merge_plan_decisions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                decision TEXT NOT NULL,
                memo TEXT,
                merged INTEGER NOT NULL DEFAULT 0,
                decided_at TEXT NOT NULL,
                FOREIGN KEY (run_id) REFERENCES merge_plans(run_id)
            );

            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn load_candidate(conn: &Connection, project: &str, id: &CandidateId) -> StorageResult<Option<CandidateCode>> {
        let sql = format!(
            "SELECT {} FROM candidates WHERE project = ?1 AND id = ?2",
            CANDIDATE_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![project, id.as_str()], CandidateRow::from_row)
            .optional()?;
        row.map(CandidateRow::into_candidate).transpose()
    }

    fn fragment_exists_in(conn: &Connection, project: &str, fragment_id: &str) -> StorageResult<bool> {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM fragments WHERE project = ?1 AND id = ?2",
            params![project, fragment_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CandidateStore for SqliteStore {
    // === Candidate Operations ===

    fn insert_candidate(&self, project: &str, candidate: &NewCandidate) -> StorageResult<CandidateCode> {
        let conn = self.conn.lock().unwrap();
        let id = CandidateId::new();
        let created_at = candidate.created_at.unwrap_or_else(Utc::now);

        conn.execute(
            r#"
            INSERT INTO candidates (id, project, codigo, codigo_norm, estado, fuente_origen,
                                    score_confianza, cita, fragmento_id, archivo, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                id.as_str(),
                project,
                candidate.code.trim(),
                normalize_code(&candidate.code),
                CandidateState::Pending.as_str(),
                candidate.origin.as_str(),
                candidate.confidence.map(|c| c as f64),
                candidate.quote,
                candidate.fragment_id,
                candidate.document,
                fmt_ts(&created_at),
            ],
        )?;

        Self::load_candidate(&conn, project, &id)?
            .ok_or_else(|| StorageError::CandidateNotFound(id.to_string()))
    }

    fn get_candidate(&self, project: &str, id: &CandidateId) -> StorageResult<Option<CandidateCode>> {
        let conn = self.conn.lock().unwrap();
        Self::load_candidate(&conn, project, id)
    }

    fn list_candidates(&self, project: &str, filter: &CandidateFilter) -> StorageResult<Vec<CandidateCode>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = format!("SELECT {} FROM candidates WHERE project = ?", CANDIDATE_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(project.to_string())];

        if !filter.states.is_empty() {
            sql.push_str(&format!(" AND estado IN ({})", state_list(&filter.states)));
        }

        if let Some(origin) = filter.origin {
            sql.push_str(" AND fuente_origen = ?");
            params_vec.push(Box::new(origin.as_str().to_string()));
        }

        match filter.promoted {
            Some(true) => sql.push_str(" AND promovido_en IS NOT NULL"),
            Some(false) => sql.push_str(" AND promovido_en IS NULL"),
            None => {}
        }

        if let Some(ref code) = filter.code {
            sql.push_str(" AND codigo_norm = ?");
            params_vec.push(Box::new(normalize_code(code)));
        }

        sql.push_str(match filter.sort_order {
            SortOrder::Newest => " ORDER BY created_at DESC, id",
            SortOrder::Oldest => " ORDER BY created_at ASC, id",
            SortOrder::Code => " ORDER BY codigo_norm ASC, created_at ASC",
            SortOrder::Confidence => " ORDER BY score_confianza IS NULL, score_confianza DESC, created_at ASC",
        });

        match filter.limit {
            Some(limit) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, filter.offset)),
            None if filter.offset > 0 => sql.push_str(&format!(" LIMIT -1 OFFSET {}", filter.offset)),
            None => {}
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), CandidateRow::from_row)?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?.into_candidate()?);
        }
        Ok(candidates)
    }

    fn set_state(
        &self,
        project: &str,
        id: &CandidateId,
        from: CandidateState,
        to: CandidateState,
        memo: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = fmt_ts(&Utc::now());
        let back_to_backlog = CandidateState::BACKLOG.contains(&to);

        // Compare-and-set: a merge that landed after the caller read the row wins.
        let rows = conn.execute(
            r#"
            UPDATE candidates SET
                estado = ?1,
                fusionado_a = NULL,
                memo = COALESCE(?2, memo),
                resolved_at = CASE WHEN ?3 THEN NULL ELSE COALESCE(resolved_at, ?4) END
            WHERE project = ?5 AND id = ?6 AND estado = ?7
            "#,
            params![to.as_str(), memo, back_to_backlog, now, project, id.as_str(), from.as_str()],
        )?;

        if rows == 0 {
            return match Self::load_candidate(&conn, project, id)? {
                Some(row) => Err(StorageError::StateConflict {
                    id: id.to_string(),
                    expected: from,
                    found: row.state,
                }),
                None => Err(StorageError::CandidateNotFound(id.to_string())),
            };
        }
        Ok(())
    }

    fn merge_candidates(
        &self,
        project: &str,
        ids: &[CandidateId],
        target: &str,
        memo: &str,
    ) -> StorageResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = fmt_ts(&Utc::now());
        let sql = format!(
            r#"
            UPDATE candidates SET
                estado = ?1,
                fusionado_a = ?2,
                memo = ?3,
                resolved_at = COALESCE(resolved_at, ?4)
            WHERE project = ?5 AND id = ?6
              AND estado IN ({})
              AND promovido_en IS NULL
            "#,
            state_list(&CandidateState::MERGEABLE)
        );

        let target = target.trim();
        let mut merged = 0;
        let mut sources: Vec<String> = Vec::new();
        for id in ids {
            let changed = tx.execute(
                &sql,
                params![
                    CandidateState::Merged.as_str(),
                    target,
                    memo,
                    now,
                    project,
                    id.as_str()
                ],
            )?;
            if changed > 0 {
                merged += changed;
                let norm: String = tx.query_row(
                    "SELECT codigo_norm FROM candidates WHERE project = ?1 AND id = ?2",
                    params![project, id.as_str()],
                    |row| row.get(0),
                )?;
                if !sources.contains(&norm) {
                    sources.push(norm);
                }
            }
        }

        // Rows merged into a code that no longer has live rows follow it to
        // the new target, so `fusionado_a` never names a merged-away code.
        let target_norm = normalize_code(target);
        let live_sql = format!(
            "SELECT COUNT(*) FROM candidates WHERE project = ?1 AND codigo_norm = ?2 AND estado IN ({})",
            state_list(&CandidateState::MERGEABLE)
        );
        for source in sources.iter().filter(|s| **s != target_norm) {
            let live: i64 = tx.query_row(&live_sql, params![project, source], |row| row.get(0))?;
            if live > 0 {
                continue;
            }
            let followers: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, fusionado_a FROM candidates
                     WHERE project = ?1 AND estado = ?2 AND fusionado_a IS NOT NULL",
                )?;
                let rows = stmt.query_map(params![project, CandidateState::Merged.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };
            for (id, merged_into) in followers {
                if normalize_code(&merged_into) == *source {
                    tx.execute(
                        "UPDATE candidates SET fusionado_a = ?1 WHERE project = ?2 AND id = ?3",
                        params![target, project, id],
                    )?;
                }
            }
        }
        tx.commit()?;

        Ok(merged)
    }

    fn revert_validated(&self, project: &str, memo: &str) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"
            UPDATE candidates SET
                estado = ?1,
                promovido_en = NULL,
                resolved_at = NULL,
                memo = ?2
            WHERE project = ?3 AND estado = ?4
            "#,
            params![
                CandidateState::Pending.as_str(),
                memo,
                project,
                CandidateState::Validated.as_str()
            ],
        )?;
        Ok(rows)
    }

    // === Evidence Operations ===

    fn insert_fragment(&self, fragment: &Fragment) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO fragments (project, id, archivo, text)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(project, id) DO UPDATE SET
                archivo = excluded.archivo,
                text = excluded.text
            "#,
            params![fragment.project, fragment.id, fragment.document, fragment.text],
        )?;
        Ok(())
    }

    fn fragment_exists(&self, project: &str, fragment_id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        Self::fragment_exists_in(&conn, project, fragment_id)
    }

    // === Codebook Operations ===

    fn promote_candidate(&self, project: &str, id: &CandidateId, at: DateTime<Utc>) -> StorageResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(candidate) = Self::load_candidate(&tx, project, id)? else {
            return Err(StorageError::CandidateNotFound(id.to_string()));
        };
        if candidate.state != CandidateState::Validated || candidate.is_promoted() {
            return Ok(false);
        }

        let norm = candidate.normalized();
        let existing: Option<String> = tx
            .query_row(
                "SELECT promoted_from_json FROM codebook WHERE project = ?1 AND codigo_norm = ?2",
                params![project, norm],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(json) => {
                let mut from: Vec<CandidateId> = serde_json::from_str(&json)?;
                if !from.contains(id) {
                    from.push(id.clone());
                }
                tx.execute(
                    "UPDATE codebook SET promoted_from_json = ?1 WHERE project = ?2 AND codigo_norm = ?3",
                    params![serde_json::to_string(&from)?, project, norm],
                )?;
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO codebook (project, codigo_norm, codigo, promoted_from_json, first_promoted_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        project,
                        norm,
                        candidate.code,
                        serde_json::to_string(&vec![id.clone()])?,
                        fmt_ts(&at)
                    ],
                )?;
            }
        }

        let stamped = tx.execute(
            "UPDATE candidates SET promovido_en = ?1 WHERE project = ?2 AND id = ?3 AND promovido_en IS NULL",
            params![fmt_ts(&at), project, id.as_str()],
        )?;
        tx.commit()?;

        Ok(stamped > 0)
    }

    fn list_codebook(&self, project: &str) -> StorageResult<Vec<CanonicalCode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT codigo, promoted_from_json, first_promoted_at FROM codebook
             WHERE project = ?1 ORDER BY codigo_norm",
        )?;
        let rows = stmt.query_map(params![project], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut codes = Vec::new();
        for row in rows {
            let (code, from_json, first) = row?;
            codes.push(CanonicalCode {
                project: project.to_string(),
                code,
                promoted_from: serde_json::from_str(&from_json)?,
                first_promoted_at: parse_ts(&first)?,
            });
        }
        Ok(codes)
    }

    // === Audit Operations ===

    fn append_audit(&self, entry: &AuditEntry) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (project, action, memo, details_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.project,
                entry.action.as_str(),
                entry.memo,
                serde_json::to_string(&entry.details)?,
                fmt_ts(&entry.created_at)
            ],
        )?;
        Ok(())
    }

    fn list_audit(&self, project: &str, limit: Option<usize>) -> StorageResult<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT project, action, memo, details_json, created_at FROM audit_log
             WHERE project = ?1 ORDER BY seq DESC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (project, action, memo, details, created_at) = row?;
            entries.push(AuditEntry {
                project,
                action: action.parse::<AuditAction>()?,
                memo,
                details: serde_json::from_str(&details)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(entries)
    }

    // === Health ===

    fn backlog_stats(&self, project: &str) -> StorageResult<BacklogStats> {
        let conn = self.conn.lock().unwrap();

        let (pending_count, oldest): (i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MIN(created_at) FROM candidates WHERE project = ?1 AND estado = ?2",
            params![project, CandidateState::Pending.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT created_at, resolved_at FROM candidates WHERE project = ?1 AND resolved_at IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![project], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut total_hours = 0.0;
        let mut resolved = 0usize;
        for row in rows {
            let (created, resolved_at) = row?;
            let elapsed = parse_ts(&resolved_at)? - parse_ts(&created)?;
            total_hours += elapsed.num_seconds().max(0) as f64 / 3600.0;
            resolved += 1;
        }

        let without_evidence: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM candidates c
            WHERE c.project = ?1 AND c.estado = ?2 AND c.promovido_en IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM fragments f WHERE f.project = c.project AND f.id = c.fragmento_id
              )
            "#,
            params![project, CandidateState::Validated.as_str()],
            |row| row.get(0),
        )?;

        let mut alerts = Vec::new();
        if without_evidence > 0 {
            alerts.push(format!(
                "{} validated candidate(s) lack a resolvable fragment and cannot be promoted",
                without_evidence
            ));
        }

        Ok(BacklogStats {
            pending_count: pending_count as usize,
            oldest_pending_at: parse_opt_ts(oldest)?,
            avg_resolution_hours: (resolved > 0).then(|| total_hours / resolved as f64),
            alerts,
        })
    }

    // === Merge Plan Log ===

    fn save_plan(&self, plan: &MergePlan) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO merge_plans (run_id, project, threshold, created_at, pairs_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                plan.run_id,
                plan.project,
                plan.threshold as f64,
                fmt_ts(&plan.created_at),
                serde_json::to_string(&plan.pairs)?
            ],
        )?;
        Ok(())
    }

    fn load_plan(&self, run_id: &str) -> StorageResult<Option<MergePlan>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, f64, String, String)> = conn
            .query_row(
                "SELECT project, threshold, created_at, pairs_json FROM merge_plans WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((project, threshold, created_at, pairs_json)) = row else {
            return Ok(None);
        };

        let pairs: Vec<PlanPair> = serde_json::from_str(&pairs_json)?;
        Ok(Some(MergePlan {
            run_id: run_id.to_string(),
            project,
            threshold: threshold as f32,
            created_at: parse_ts(&created_at)?,
            pairs,
        }))
    }

    fn record_plan_decision(&self, decision: &PlanDecision) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO merge_plan_decisions (run_id, source, target, decision, memo, merged, decided_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                decision.run_id,
                decision.source,
                decision.target,
                decision.kind.as_str(),
                decision.memo,
                decision.merged as i64,
                fmt_ts(&decision.decided_at)
            ],
        )?;
        Ok(())
    }

    fn plan_decisions(&self, run_id: &str) -> StorageResult<Vec<PlanDecision>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source, target, decision, memo, merged, decided_at FROM merge_plan_decisions
             WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut decisions = Vec::new();
        for row in rows {
            let (source, target, kind, memo, merged, decided_at) = row?;
            let kind: PlanDecisionKind = kind.parse()?;
            decisions.push(PlanDecision {
                run_id: run_id.to_string(),
                source,
                target,
                kind,
                memo,
                merged: merged.max(0) as usize,
                decided_at: parse_ts(&decided_at)?,
            });
        }
        Ok(decisions)
    }
}

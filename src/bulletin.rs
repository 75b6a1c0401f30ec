use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::calc::{self, CalcError, Scope};
use crate::store;

/// Outcome of one generation batch. `created_count` only counts bulletins
/// newly inserted by this run; pre-existing ones are skipped silently.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOutcome {
    pub created_count: i64,
    pub skipped_count: i64,
    pub class_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Only refill aggregate columns that are currently null.
    NullOnly,
    /// Recompute every aggregate column in scope.
    Full,
}

impl RepairMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "nullOnly" => Some(RepairMode::NullOnly),
            "full" => Some(RepairMode::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub updated_count: i64,
    pub scanned_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinLineView {
    pub subject_id: String,
    pub subject_name: String,
    pub subject_average: Option<f64>,
    pub subject_rank: Option<i64>,
    pub weighted_average: Option<f64>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinView {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub period_label: String,
    pub overall_average: Option<f64>,
    pub class_rank: Option<i64>,
    pub class_size: i64,
    pub validated: bool,
    pub generated_at: String,
    pub generated_by: String,
    pub lines: Vec<BulletinLineView>,
}

fn batch_failure(code: &str, e: impl ToString, would_have_created: i64) -> CalcError {
    CalcError::new(code, e.to_string())
        .with_details(json!({ "wouldHaveCreated": would_have_created }))
}

/// Best-effort reporting for a failed repair batch: the whole transaction
/// rolls back, but the caller learns how many bulletins had already been
/// brought up to date before the failure point.
fn repair_failure(e: CalcError, would_have_updated: i64) -> CalcError {
    e.with_details(json!({ "wouldHaveUpdated": would_have_updated }))
}

/// Keeps only roster/holder students in an averages pool, as unrounded means.
fn pool_for<'a, I>(averages: &HashMap<String, calc::ScopeAverage>, members: I) -> HashMap<String, f64>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pool = HashMap::new();
    for id in members {
        if let Some(avg) = averages.get(id) {
            pool.insert(id.to_string(), avg.mean);
        }
    }
    pool
}

/// Generates one bulletin per rostered student for (class, period), inside a
/// single transaction. Already-existing bulletins are skipped without error;
/// the skip rides on the (student_id, class_id, period_id) unique constraint
/// so two concurrent runs cannot double-insert. Any failure rolls back the
/// whole batch.
pub fn generate(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    period_label: &str,
    actor_id: &str,
) -> Result<GenerateOutcome, CalcError> {
    let class = store::find_class_in_school(conn, school_id, class_id)?
        .filter(|c| c.active)
        .ok_or_else(|| CalcError::new("not_found", "class not found or inactive"))?;

    let period_id = store::resolve_period(conn, &class.school_year, period_label)?
        .ok_or_else(|| CalcError::new("not_found", "period not found for school year"))?;

    let roster = store::list_active_roster(conn, class_id)?;
    if roster.is_empty() {
        return Err(CalcError::new("empty_roster", "class has no active students"));
    }
    let class_size = roster.len() as i64;

    let subjects = store::list_assigned_subjects(conn, class_id)?;
    let period_ids = store::period_scope_ids(conn, &period_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    // All averages come from the same transaction snapshot the inserts use,
    // so ranks and averages agree even if grades change concurrently.
    let roster_ids: Vec<&str> = roster.iter().map(|s| s.student_id.as_str()).collect();
    let overall_scope = Scope {
        class_id,
        subject_id: None,
        period_ids: &period_ids,
    };
    let overall_pool = pool_for(
        &calc::scope_averages(&tx, &overall_scope)?,
        roster_ids.iter().copied(),
    );

    let mut subject_pools: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for subject in &subjects {
        let scope = Scope {
            class_id,
            subject_id: Some(&subject.subject_id),
            period_ids: &period_ids,
        };
        subject_pools.insert(
            subject.subject_id.clone(),
            pool_for(&calc::scope_averages(&tx, &scope)?, roster_ids.iter().copied()),
        );
    }

    let generated_at = chrono::Utc::now().to_rfc3339();
    let mut created: i64 = 0;
    let mut skipped: i64 = 0;

    for student in &roster {
        let overall = overall_pool.get(student.student_id.as_str()).copied();
        let class_rank = calc::rank_in_pool(&student.student_id, &overall_pool);

        let bulletin_id = Uuid::new_v4().to_string();
        let changed = tx
            .execute(
                "INSERT INTO bulletins(
                    id, student_id, class_id, period_id,
                    overall_average, class_rank, class_size,
                    validated, generated_at, generated_by
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                 ON CONFLICT(student_id, class_id, period_id) DO NOTHING",
                (
                    &bulletin_id,
                    &student.student_id,
                    class_id,
                    &period_id,
                    overall.map(calc::round_off_2_decimals),
                    class_rank,
                    class_size,
                    &generated_at,
                    actor_id,
                ),
            )
            .map_err(|e| batch_failure("db_insert_failed", e, created))?;
        if changed == 0 {
            // Already generated, possibly by a concurrent run racing this one.
            skipped += 1;
            continue;
        }

        for subject in &subjects {
            let pool = &subject_pools[&subject.subject_id];
            let average = pool.get(student.student_id.as_str()).copied();
            let rank = calc::rank_in_pool(&student.student_id, pool);
            let weighted = calc::weighted_average(average, subject.coefficient);

            tx.execute(
                "INSERT INTO bulletin_lines(
                    id, bulletin_id, subject_id,
                    subject_average, subject_rank, weighted_average
                 ) VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &bulletin_id,
                    &subject.subject_id,
                    average.map(calc::round_off_2_decimals),
                    rank,
                    weighted,
                ),
            )
            .map_err(|e| batch_failure("db_insert_failed", e, created))?;
        }

        created += 1;
    }

    tx.commit()
        .map_err(|e| batch_failure("db_tx_failed", e, created))?;

    Ok(GenerateOutcome {
        created_count: created,
        skipped_count: skipped,
        class_size,
    })
}

#[derive(Debug)]
struct BulletinRow {
    id: String,
    student_id: String,
    class_id: String,
    period_id: String,
    overall_average: Option<f64>,
    class_rank: Option<i64>,
}

#[derive(Debug)]
struct LineRow {
    id: String,
    subject_id: String,
    subject_average: Option<f64>,
    subject_rank: Option<i64>,
    weighted_average: Option<f64>,
}

fn opt_f64_changed(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(a), Some(b)) => (a - b).abs() > 1e-9,
        _ => true,
    }
}

/// Recomputes aggregate columns on already-persisted bulletins and lines.
/// Upstream corrections (late validation, re-tagged evaluations, roster
/// changes) leave persisted aggregates stale; this refreshes them in place.
/// It never creates or deletes rows and never touches remarks or the
/// administrative `validated` flag. The rank pool for a group is the set of
/// students holding a bulletin in that group, so a late-generated student
/// re-ranks everyone on the next repair.
pub fn repair(
    conn: &Connection,
    class_id: Option<&str>,
    period_label: Option<&str>,
    mode: RepairMode,
) -> Result<RepairOutcome, CalcError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let mut updated: i64 = 0;

    let mut sql = String::from(
        "SELECT b.id, b.student_id, b.class_id, b.period_id, b.overall_average, b.class_rank
         FROM bulletins b
         JOIN periods p ON p.id = b.period_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(class_id) = class_id {
        sql.push_str(" AND b.class_id = ?");
        binds.push(class_id.to_string());
    }
    if let Some(label) = period_label {
        sql.push_str(" AND p.label = ?");
        binds.push(label.to_string());
    }
    sql.push_str(" ORDER BY b.class_id, b.period_id, b.id");

    let mut stmt = tx
        .prepare(&sql)
        .map_err(|e| repair_failure(CalcError::query(e), updated))?;
    let bulletins: Vec<BulletinRow> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(BulletinRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                class_id: r.get(2)?,
                period_id: r.get(3)?,
                overall_average: r.get(4)?,
                class_rank: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| repair_failure(CalcError::query(e), updated))?;
    drop(stmt);

    // Group by (class, period); each group gets one consistent set of pools.
    let mut groups: Vec<((String, String), Vec<&BulletinRow>)> = Vec::new();
    for row in &bulletins {
        let key = (row.class_id.clone(), row.period_id.clone());
        match groups.last_mut() {
            Some((k, rows)) if *k == key => rows.push(row),
            _ => groups.push((key, vec![row])),
        }
    }

    let scanned = bulletins.len() as i64;

    for ((group_class_id, group_period_id), rows) in groups {
        let period_ids = store::period_scope_ids(&tx, &group_period_id)
            .map_err(|e| repair_failure(e, updated))?;
        let coefficients: HashMap<String, f64> =
            store::list_assigned_subjects(&tx, &group_class_id)
                .map_err(|e| repair_failure(e, updated))?
                .into_iter()
                .map(|s| (s.subject_id, s.coefficient))
                .collect();

        let holder_ids: Vec<&str> = rows.iter().map(|r| r.student_id.as_str()).collect();
        let overall_scope = Scope {
            class_id: &group_class_id,
            subject_id: None,
            period_ids: &period_ids,
        };
        let overall_pool = pool_for(
            &calc::scope_averages(&tx, &overall_scope).map_err(|e| repair_failure(e, updated))?,
            holder_ids.iter().copied(),
        );

        let mut subject_pools: HashMap<String, HashMap<String, f64>> = HashMap::new();

        for row in rows {
            let mut row_changed = false;

            let recompute_header = match mode {
                RepairMode::Full => true,
                RepairMode::NullOnly => {
                    row.overall_average.is_none() || row.class_rank.is_none()
                }
            };
            if recompute_header {
                let mean = overall_pool.get(row.student_id.as_str()).copied();
                let new_overall = mean.map(calc::round_off_2_decimals);
                let new_rank = calc::rank_in_pool(&row.student_id, &overall_pool);
                if opt_f64_changed(row.overall_average, new_overall)
                    || row.class_rank != new_rank
                {
                    tx.execute(
                        "UPDATE bulletins SET overall_average = ?, class_rank = ? WHERE id = ?",
                        (new_overall, new_rank, &row.id),
                    )
                    .map_err(|e| {
                        repair_failure(CalcError::new("db_update_failed", e.to_string()), updated)
                    })?;
                    row_changed = true;
                }
            }

            let mut line_stmt = tx
                .prepare(
                    "SELECT id, subject_id, subject_average, subject_rank, weighted_average
                     FROM bulletin_lines
                     WHERE bulletin_id = ?",
                )
                .map_err(|e| repair_failure(CalcError::query(e), updated))?;
            let lines: Vec<LineRow> = line_stmt
                .query_map([&row.id], |r| {
                    Ok(LineRow {
                        id: r.get(0)?,
                        subject_id: r.get(1)?,
                        subject_average: r.get(2)?,
                        subject_rank: r.get(3)?,
                        weighted_average: r.get(4)?,
                    })
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| repair_failure(CalcError::query(e), updated))?;
            drop(line_stmt);

            for line in lines {
                let recompute_line = match mode {
                    RepairMode::Full => true,
                    RepairMode::NullOnly => {
                        line.subject_average.is_none()
                            || line.subject_rank.is_none()
                            || line.weighted_average.is_none()
                    }
                };
                if !recompute_line {
                    continue;
                }

                if !subject_pools.contains_key(&line.subject_id) {
                    let scope = Scope {
                        class_id: &group_class_id,
                        subject_id: Some(&line.subject_id),
                        period_ids: &period_ids,
                    };
                    let pool = pool_for(
                        &calc::scope_averages(&tx, &scope)
                            .map_err(|e| repair_failure(e, updated))?,
                        holder_ids.iter().copied(),
                    );
                    subject_pools.insert(line.subject_id.clone(), pool);
                }
                let pool = &subject_pools[&line.subject_id];

                let mean = pool.get(row.student_id.as_str()).copied();
                let new_average = mean.map(calc::round_off_2_decimals);
                let new_rank = calc::rank_in_pool(&row.student_id, pool);
                // A subject unassigned since generation keeps its line; its
                // weight falls back to 1.
                let coefficient = coefficients.get(&line.subject_id).copied().unwrap_or(1.0);
                let new_weighted = calc::weighted_average(mean, coefficient);

                if opt_f64_changed(line.subject_average, new_average)
                    || line.subject_rank != new_rank
                    || opt_f64_changed(line.weighted_average, new_weighted)
                {
                    tx.execute(
                        "UPDATE bulletin_lines
                         SET subject_average = ?, subject_rank = ?, weighted_average = ?
                         WHERE id = ?",
                        (new_average, new_rank, new_weighted, &line.id),
                    )
                    .map_err(|e| {
                        repair_failure(CalcError::new("db_update_failed", e.to_string()), updated)
                    })?;
                    row_changed = true;
                }
            }

            if row_changed {
                updated += 1;
            }
        }
    }

    tx.commit()
        .map_err(|e| repair_failure(CalcError::new("db_tx_failed", e.to_string()), updated))?;

    Ok(RepairOutcome {
        updated_count: updated,
        scanned_count: scanned,
    })
}

/// Read accessor for display/export; formatting is the caller's problem.
pub fn get_bulletin(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    period_label: &str,
) -> Result<Option<BulletinView>, CalcError> {
    let Some(class) = store::find_class(conn, class_id)? else {
        return Ok(None);
    };
    let Some(period_id) = store::resolve_period(conn, &class.school_year, period_label)? else {
        return Ok(None);
    };

    let header = conn
        .query_row(
            "SELECT id, overall_average, class_rank, class_size, validated,
                    generated_at, generated_by
             FROM bulletins
             WHERE student_id = ? AND class_id = ? AND period_id = ?",
            (student_id, class_id, &period_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<f64>>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)? != 0,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            },
        )
        .optional()
        .map_err(CalcError::query)?;
    let Some((id, overall_average, class_rank, class_size, validated, generated_at, generated_by)) =
        header
    else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT bl.subject_id, su.name, bl.subject_average, bl.subject_rank,
                    bl.weighted_average, bl.remark
             FROM bulletin_lines bl
             JOIN subjects su ON su.id = bl.subject_id
             WHERE bl.bulletin_id = ?
             ORDER BY su.name, bl.subject_id",
        )
        .map_err(CalcError::query)?;
    let lines: Vec<BulletinLineView> = stmt
        .query_map([&id], |r| {
            Ok(BulletinLineView {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                subject_average: r.get(2)?,
                subject_rank: r.get(3)?,
                weighted_average: r.get(4)?,
                remark: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::query)?;

    Ok(Some(BulletinView {
        id,
        student_id: student_id.to_string(),
        class_id: class_id.to_string(),
        period_label: period_label.to_string(),
        overall_average,
        class_rank,
        class_size,
        validated,
        generated_at,
        generated_by,
        lines,
    }))
}

/// Flips the administrative validation flag. Generation and repair never
/// reset it; this is the one terminal transition the approval step owns.
pub fn validate_bulletin(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    period_label: &str,
) -> Result<bool, CalcError> {
    let Some(class) = store::find_class(conn, class_id)? else {
        return Ok(false);
    };
    let Some(period_id) = store::resolve_period(conn, &class.school_year, period_label)? else {
        return Ok(false);
    };
    let changed = conn
        .execute(
            "UPDATE bulletins SET validated = 1
             WHERE student_id = ? AND class_id = ? AND period_id = ?",
            (student_id, class_id, &period_id),
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    Ok(changed > 0)
}

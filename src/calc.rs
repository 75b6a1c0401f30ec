use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::collections::HashMap;

/// Half-up 2-decimal rounding applied at the point of persistence only.
/// Intermediate averages stay unrounded so subject rounding error never
/// compounds into the overall average.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn query(e: impl ToString) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Scope an average or a rank pool is computed over. `period_ids` already
/// includes any sub-periods of the requested period.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    pub class_id: &'a str,
    pub subject_id: Option<&'a str>,
    pub period_ids: &'a [String],
}

/// One student's mean in a scope plus how many grades contributed. A student
/// with zero contributing grades has no `ScopeAverage` at all; callers must
/// keep that distinct from a (valid, failing) mean of 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeAverage {
    pub mean: f64,
    pub count: i64,
}

/// Computes each student's average over `scope` in one pass.
///
/// A grade contributes iff `absent = 0`, `validated = 1` and it carries a
/// value; an absent grade with a null value is excluded, never treated as
/// zero. Values are normalized to a /20 scale by the evaluation's max score
/// and weighted by the evaluation's weight. Students with no contributing
/// grades are simply missing from the returned map.
pub fn scope_averages(
    conn: &Connection,
    scope: &Scope<'_>,
) -> Result<HashMap<String, ScopeAverage>, CalcError> {
    if scope.period_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let period_placeholders = std::iter::repeat("?")
        .take(scope.period_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let mut sql = format!(
        "SELECT g.student_id, g.value, e.max_score, e.weight
         FROM grades g
         JOIN evaluations e ON e.id = g.evaluation_id
         WHERE e.class_id = ?
           AND e.period_id IN ({})
           AND g.absent = 0
           AND g.validated = 1
           AND g.value IS NOT NULL",
        period_placeholders
    );
    if scope.subject_id.is_some() {
        sql.push_str(" AND e.subject_id = ?");
    }

    let mut bind_values: Vec<Value> = Vec::with_capacity(scope.period_ids.len() + 2);
    bind_values.push(Value::Text(scope.class_id.to_string()));
    for pid in scope.period_ids {
        bind_values.push(Value::Text(pid.clone()));
    }
    if let Some(subject_id) = scope.subject_id {
        bind_values.push(Value::Text(subject_id.to_string()));
    }

    let mut stmt = conn.prepare(&sql).map_err(CalcError::query)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let student_id: String = r.get(0)?;
            let value: f64 = r.get(1)?;
            let max_score: f64 = r.get(2)?;
            let weight: f64 = r.get(3)?;
            Ok((student_id, value, max_score, weight))
        })
        .map_err(CalcError::query)?;

    // sum of weighted /20 values, sum of weights, contributing count
    let mut folds: HashMap<String, (f64, f64, i64)> = HashMap::new();
    for row in rows {
        let (student_id, value, max_score, weight) = row.map_err(CalcError::query)?;
        if max_score <= 0.0 {
            continue;
        }
        let weight = if weight > 0.0 { weight } else { 1.0 };
        let on_twenty = 20.0 * value / max_score;
        let entry = folds.entry(student_id).or_insert((0.0, 0.0, 0));
        entry.0 += on_twenty * weight;
        entry.1 += weight;
        entry.2 += 1;
    }

    let mut averages = HashMap::with_capacity(folds.len());
    for (student_id, (sum, denom, count)) in folds {
        if denom > 0.0 {
            averages.insert(
                student_id,
                ScopeAverage {
                    mean: sum / denom,
                    count,
                },
            );
        }
    }
    Ok(averages)
}

/// Rank = 1 + the number of OTHER students whose average is strictly greater.
/// Ties share a rank (two students at the top are both rank 1, the next
/// distinct average is rank 3). A student absent from the pool has no rank,
/// not last place. Returns `None` for a student outside the pool.
pub fn rank_in_pool(student_id: &str, pool: &HashMap<String, f64>) -> Option<i64> {
    let own = *pool.get(student_id)?;
    let greater = pool
        .iter()
        .filter(|(id, avg)| id.as_str() != student_id && **avg > own)
        .count();
    Some(1 + greater as i64)
}

/// `weighted = round2(average * coefficient)`, propagating "no average".
pub fn weighted_average(average: Option<f64>, coefficient: f64) -> Option<f64> {
    average.map(|a| round_off_2_decimals(a * coefficient))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_minimal(conn: &Connection) -> (String, String, String) {
        conn.execute("INSERT INTO schools(id, name) VALUES('sch', 'Test School')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO classes(id, school_id, name, school_year, active)
             VALUES('c1', 'sch', '6A', '2025-2026', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO periods(id, school_year, label, sort_order)
             VALUES('t1', '2025-2026', 'T1', 0)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO subjects(id, name) VALUES('math', 'Maths')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO class_subjects(class_id, subject_id, coefficient)
             VALUES('c1', 'math', 2)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO evaluations(id, class_id, subject_id, period_id, title, max_score, weight)
             VALUES('ev1', 'c1', 'math', 't1', 'DS1', 20, 1)",
            [],
        )
        .unwrap();
        ("c1".to_string(), "math".to_string(), "t1".to_string())
    }

    fn add_student(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO students(id, last_name, first_name) VALUES(?, ?, 'X')",
            (id, id),
        )
        .unwrap();
    }

    fn add_grade(
        conn: &Connection,
        id: &str,
        evaluation_id: &str,
        student_id: &str,
        value: Option<f64>,
        absent: bool,
        validated: bool,
    ) {
        conn.execute(
            "INSERT INTO grades(id, evaluation_id, student_id, value, absent, validated)
             VALUES(?, ?, ?, ?, ?, ?)",
            (id, evaluation_id, student_id, value, absent as i64, validated as i64),
        )
        .unwrap();
    }

    #[test]
    fn round_off_is_half_up_at_2_decimals() {
        assert_eq!(round_off_2_decimals(0.0), 0.0);
        assert_eq!(round_off_2_decimals(14.004), 14.0);
        assert_eq!(round_off_2_decimals(14.005), 14.01);
        assert_eq!(round_off_2_decimals(13.333333), 13.33);
    }

    #[test]
    fn absent_and_unvalidated_grades_do_not_contribute() {
        let conn = memory_db();
        let (class_id, subject_id, period_id) = seed_minimal(&conn);
        add_student(&conn, "a");
        add_student(&conn, "b");
        add_student(&conn, "c");

        conn.execute(
            "INSERT INTO evaluations(id, class_id, subject_id, period_id, title, max_score, weight)
             VALUES('ev2', 'c1', 'math', 't1', 'DS2', 20, 1)",
            [],
        )
        .unwrap();

        add_grade(&conn, "g1", "ev1", "a", Some(15.0), false, true);
        add_grade(&conn, "g2", "ev2", "a", Some(13.0), false, true);
        add_grade(&conn, "g3", "ev1", "b", Some(10.0), false, true);
        // Absent with a null value: excluded, not zero.
        add_grade(&conn, "g4", "ev1", "c", None, true, true);
        // Not yet validated: excluded even with a value.
        add_grade(&conn, "g5", "ev2", "c", Some(19.0), false, false);

        let period_ids = vec![period_id];
        let scope = Scope {
            class_id: &class_id,
            subject_id: Some(&subject_id),
            period_ids: &period_ids,
        };
        let averages = scope_averages(&conn, &scope).expect("averages");

        let a = averages.get("a").expect("a has an average");
        assert!((a.mean - 14.0).abs() < 1e-9);
        assert_eq!(a.count, 2);
        let b = averages.get("b").expect("b has an average");
        assert!((b.mean - 10.0).abs() < 1e-9);
        // c has no contributing grades at all: no entry, not a zero mean.
        assert!(!averages.contains_key("c"));
    }

    #[test]
    fn averages_normalize_by_max_score_and_weight() {
        let conn = memory_db();
        let (class_id, subject_id, period_id) = seed_minimal(&conn);
        add_student(&conn, "a");

        // Out of 10, weight 3: 8/10 => 16/20.
        conn.execute(
            "INSERT INTO evaluations(id, class_id, subject_id, period_id, title, max_score, weight)
             VALUES('ev2', 'c1', 'math', 't1', 'Quiz', 10, 3)",
            [],
        )
        .unwrap();
        add_grade(&conn, "g1", "ev1", "a", Some(12.0), false, true);
        add_grade(&conn, "g2", "ev2", "a", Some(8.0), false, true);

        let period_ids = vec![period_id];
        let scope = Scope {
            class_id: &class_id,
            subject_id: Some(&subject_id),
            period_ids: &period_ids,
        };
        let averages = scope_averages(&conn, &scope).expect("averages");
        let a = averages.get("a").expect("average");
        // (12*1 + 16*3) / 4 = 15
        assert!((a.mean - 15.0).abs() < 1e-9);
        assert_eq!(a.count, 2);
    }

    #[test]
    fn rank_counts_strictly_greater_others() {
        let mut pool = HashMap::new();
        pool.insert("a".to_string(), 14.0);
        pool.insert("b".to_string(), 10.0);

        assert_eq!(rank_in_pool("a", &pool), Some(1));
        assert_eq!(rank_in_pool("b", &pool), Some(2));
        // Not in the pool: no rank, not last place.
        assert_eq!(rank_in_pool("c", &pool), None);
    }

    #[test]
    fn tied_averages_share_a_rank_with_a_gap_below() {
        let mut pool = HashMap::new();
        pool.insert("a".to_string(), 16.0);
        pool.insert("b".to_string(), 16.0);
        pool.insert("c".to_string(), 12.0);

        assert_eq!(rank_in_pool("a", &pool), Some(1));
        assert_eq!(rank_in_pool("b", &pool), Some(1));
        assert_eq!(rank_in_pool("c", &pool), Some(3));
    }

    #[test]
    fn zero_average_ranks_last_but_is_still_ranked() {
        let mut pool = HashMap::new();
        pool.insert("a".to_string(), 0.0);
        pool.insert("b".to_string(), 9.5);

        assert_eq!(rank_in_pool("a", &pool), Some(2));
        assert_eq!(rank_in_pool("b", &pool), Some(1));
    }

    #[test]
    fn weighted_average_propagates_missing() {
        assert_eq!(weighted_average(Some(14.0), 2.0), Some(28.0));
        assert_eq!(weighted_average(Some(13.333333), 3.0), Some(40.0));
        assert_eq!(weighted_average(None, 2.0), None);
    }
}

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bool_flag, db_conn, optional_f64, optional_str, required_f64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let coefficient = optional_f64(req, "coefficient").unwrap_or(1.0);
    if coefficient <= 0.0 {
        return err(&req.id, "bad_params", "coefficient must be positive", None);
    }
    let teacher_name = optional_str(req, "teacherName");

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    // Subjects are shared across classes; reuse one with the same name.
    let subject_id: String = match conn
        .query_row("SELECT id FROM subjects WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(Some(id)) => id,
        Ok(None) => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO subjects(id, name) VALUES(?, ?)",
                (&id, &name),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "subjects" })),
                );
            }
            id
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO class_subjects(class_id, subject_id, coefficient, teacher_name)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET
           coefficient = excluded.coefficient,
           teacher_name = excluded.teacher_name",
        (&class_id, &subject_id, coefficient, &teacher_name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "classId": class_id, "coefficient": coefficient }),
    )
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let subjects = match store::list_assigned_subjects(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return crate::ipc::helpers::calc_err(req, e),
    };
    let subjects: Vec<serde_json::Value> = subjects
        .iter()
        .map(|s| {
            json!({
                "subjectId": s.subject_id,
                "name": s.name,
                "coefficient": s.coefficient
            })
        })
        .collect();
    ok(&req.id, json!({ "subjects": subjects }))
}

fn handle_periods_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = match required_str(req, "label") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if label.is_empty() {
        return err(&req.id, "bad_params", "label must not be empty", None);
    }
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    // Sub-periods hang off a parent in the same school year.
    let parent_id: Option<String> = match optional_str(req, "parentLabel") {
        None => None,
        Some(parent_label) => {
            match store::resolve_period(conn, &school_year, &parent_label) {
                Ok(Some(id)) => Some(id),
                Ok(None) => return err(&req.id, "not_found", "parent period not found", None),
                Err(e) => return crate::ipc::helpers::calc_err(req, e),
            }
        }
    };

    let period_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO periods(id, school_year, label, parent_id, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&period_id, &school_year, &label, &parent_id, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "periods" })),
        );
    }

    ok(
        &req.id,
        json!({ "periodId": period_id, "label": label, "schoolYear": school_year }),
    )
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_year = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.label, p.sort_order, parent.label
         FROM periods p
         LEFT JOIN periods parent ON parent.id = p.parent_id
         WHERE p.school_year = ?
         ORDER BY p.sort_order, p.label",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&school_year], |r| {
            let id: String = r.get(0)?;
            let label: String = r.get(1)?;
            let sort_order: i64 = r.get(2)?;
            let parent_label: Option<String> = r.get(3)?;
            Ok(json!({
                "id": id,
                "label": label,
                "sortOrder": sort_order,
                "parentLabel": parent_label
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(periods) => ok(&req.id, json!({ "periods": periods })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_label = match required_str(req, "periodLabel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_score = match required_f64(req, "maxScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if max_score <= 0.0 {
        return err(&req.id, "bad_params", "maxScore must be positive", None);
    }
    let weight = optional_f64(req, "weight").unwrap_or(1.0);
    if weight <= 0.0 {
        return err(&req.id, "bad_params", "weight must be positive", None);
    }

    let class = match store::find_class(conn, &class_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return crate::ipc::helpers::calc_err(req, e),
    };

    let assigned: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM class_subjects WHERE class_id = ? AND subject_id = ?",
            (&class_id, &subject_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assigned.is_none() {
        return err(&req.id, "not_found", "subject not assigned to class", None);
    }

    // The period must live in the class's school year; a grade tagged into
    // another year's period would silently vanish from every average.
    let period_id = match store::resolve_period(conn, &class.school_year, &period_label) {
        Ok(Some(id)) => id,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "period not found for the class's school year",
                Some(json!({ "schoolYear": class.school_year })),
            )
        }
        Err(e) => return crate::ipc::helpers::calc_err(req, e),
    };

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(id, class_id, subject_id, period_id, title, max_score, weight)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &evaluation_id,
            &class_id,
            &subject_id,
            &period_id,
            &title,
            max_score,
            weight,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    ok(&req.id, json!({ "evaluationId": evaluation_id }))
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let absent = bool_flag(req, "absent", false);
    let excused = bool_flag(req, "excused", false);
    let retake = bool_flag(req, "retake", false);
    let validated = bool_flag(req, "validated", false);
    let value = optional_f64(req, "value");

    let max_score: Option<f64> = match conn
        .query_row(
            "SELECT max_score FROM evaluations WHERE id = ?",
            [&evaluation_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(max_score) = max_score else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };

    match value {
        Some(v) if v < 0.0 || v > max_score => {
            return err(
                &req.id,
                "bad_params",
                "value must be between 0 and maxScore",
                Some(json!({ "maxScore": max_score })),
            );
        }
        None if !absent => {
            return err(
                &req.id,
                "bad_params",
                "value is required unless the student was absent",
                None,
            );
        }
        _ => {}
    }

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, evaluation_id, student_id, value, absent, excused, retake, validated)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, student_id) DO UPDATE SET
           value = excluded.value,
           absent = excluded.absent,
           excused = excluded.excused,
           retake = excluded.retake,
           validated = excluded.validated",
        (
            &grade_id,
            &evaluation_id,
            &student_id,
            value,
            absent as i64,
            excused as i64,
            retake as i64,
            validated as i64,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    ok(
        &req.id,
        json!({ "evaluationId": evaluation_id, "studentId": student_id }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.assign" => Some(handle_subjects_assign(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "periods.create" => Some(handle_periods_create(state, req)),
        "periods.list" => Some(handle_periods_list(state, req)),
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "grades.record" => Some(handle_grades_record(state, req)),
        _ => None,
    }
}

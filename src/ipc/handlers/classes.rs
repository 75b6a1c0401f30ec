use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
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

    let school_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        (&school_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "schools" })),
        );
    }
    ok(&req.id, json!({ "schoolId": school_id, "name": name }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let school_year = match required_str(req, "schoolYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let school_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if school_exists.is_none() {
        return err(&req.id, "not_found", "school not found", None);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, school_id, name, school_year, active) VALUES(?, ?, ?, ?, 1)",
        (&class_id, &school_id, &name, &school_year),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "schoolYear": school_year }),
    )
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Include basic counts so the UI can show a useful dashboard.
    // Use correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.school_year,
           c.active,
           (SELECT COUNT(*) FROM enrollments en WHERE en.class_id = c.id AND en.active = 1) AS roster_count,
           (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
         FROM classes c
         WHERE c.school_id = ?
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let school_year: String = row.get(2)?;
            let active: i64 = row.get(3)?;
            let roster_count: i64 = row.get(4)?;
            let subject_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "schoolYear": school_year,
                "active": active != 0,
                "rosterCount": roster_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_roster_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

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

    // Either re-enroll an existing student by id, or register a new one.
    let student_id = match optional_str(req, "studentId") {
        Some(id) => {
            let exists: Option<i64> = match conn
                .query_row("SELECT 1 FROM students WHERE id = ?", [&id], |r| r.get(0))
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if exists.is_none() {
                return err(&req.id, "not_found", "student not found", None);
            }
            id
        }
        None => {
            let last_name = match required_str(req, "lastName") {
                Ok(v) => v.trim().to_string(),
                Err(e) => return e,
            };
            let first_name = match required_str(req, "firstName") {
                Ok(v) => v.trim().to_string(),
                Err(e) => return e,
            };
            if last_name.is_empty() || first_name.is_empty() {
                return err(&req.id, "bad_params", "student name must not be empty", None);
            }
            let id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO students(id, last_name, first_name) VALUES(?, ?, ?)",
                (&id, &last_name, &first_name),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                );
            }
            id
        }
    };

    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(class_id, student_id, active) VALUES(?, ?, 1)
         ON CONFLICT(class_id, student_id) DO UPDATE SET active = 1",
        (&class_id, &student_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "classId": class_id }))
}

fn handle_roster_withdraw(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let changed = match conn.execute(
        "UPDATE enrollments SET active = 0 WHERE class_id = ? AND student_id = ?",
        (&class_id, &student_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "enrollment not found", None);
    }
    ok(&req.id, json!({ "studentId": student_id, "classId": class_id }))
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let students = match crate::store::list_active_roster(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return crate::ipc::helpers::calc_err(req, e),
    };
    let students: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            json!({
                "id": s.student_id,
                "lastName": s.last_name,
                "firstName": s.first_name,
                "displayName": s.display_name()
            })
        })
        .collect();
    ok(&req.id, json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.create" => Some(handle_schools_create(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "roster.enroll" => Some(handle_roster_enroll(state, req)),
        "roster.withdraw" => Some(handle_roster_withdraw(state, req)),
        "roster.list" => Some(handle_roster_list(state, req)),
        _ => None,
    }
}

use crate::bulletin::{self, RepairMode};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_label = match required_str(req, "periodLabel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match bulletin::generate(conn, &school_id, &class_id, &period_label, &actor_id) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => calc_err(req, e),
    }
}

fn handle_repair(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_str(req, "classId");
    let period_label = optional_str(req, "periodLabel");
    let mode = match optional_str(req, "mode") {
        None => RepairMode::NullOnly,
        Some(raw) => match RepairMode::parse(&raw) {
            Some(m) => m,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "mode must be one of: nullOnly, full",
                    Some(json!({ "mode": raw })),
                )
            }
        },
    };

    match bulletin::repair(conn, class_id.as_deref(), period_label.as_deref(), mode) {
        Ok(outcome) => ok(&req.id, json!(outcome)),
        Err(e) => calc_err(req, e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_label = match required_str(req, "periodLabel") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match bulletin::get_bulletin(conn, &student_id, &class_id, &period_label) {
        Ok(Some(view)) => ok(&req.id, json!({ "bulletin": view })),
        Ok(None) => err(&req.id, "not_found", "bulletin not found", None),
        Err(e) => calc_err(req, e),
    }
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_label = match required_str(req, "periodLabel") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match bulletin::validate_bulletin(conn, &student_id, &class_id, &period_label) {
        Ok(true) => ok(&req.id, json!({ "validated": true })),
        Ok(false) => err(&req.id, "not_found", "bulletin not found", None),
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulletins.generate" => Some(handle_generate(state, req)),
        "bulletins.repair" => Some(handle_repair(state, req)),
        "bulletins.get" => Some(handle_get(state, req)),
        "bulletins.validate" => Some(handle_validate(state, req)),
        _ => None,
    }
}

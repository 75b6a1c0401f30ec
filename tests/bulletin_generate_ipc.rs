use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Workspace {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    school_id: String,
    class_id: String,
    subject_id: String,
}

impl Workspace {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn call_raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }
}

/// Seeds the worked example: class of three, Maths with coefficient 2,
/// grades A {15, 13}, B {10}, C absent.
fn seed_example(prefix: &str) -> (Child, Workspace, Vec<String>) {
    let workspace_dir = temp_dir(prefix);
    let (child, stdin, reader) = spawn_sidecar();
    let mut ws = Workspace {
        stdin,
        reader,
        next_id: 0,
        school_id: String::new(),
        class_id: String::new(),
        subject_id: String::new(),
    };

    ws.call(
        "workspace.select",
        json!({ "path": workspace_dir.to_string_lossy() }),
    );
    let school = ws.call("schools.create", json!({ "name": "College Sud" }));
    ws.school_id = school
        .get("schoolId")
        .and_then(|v| v.as_str())
        .expect("schoolId")
        .to_string();

    let class = ws.call(
        "classes.create",
        json!({ "schoolId": ws.school_id, "name": "6A", "schoolYear": "2025-2026" }),
    );
    ws.class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    ws.call(
        "periods.create",
        json!({ "schoolYear": "2025-2026", "label": "T1", "sortOrder": 0 }),
    );

    let subject = ws.call(
        "subjects.assign",
        json!({ "classId": ws.class_id, "name": "Maths", "coefficient": 2 }),
    );
    ws.subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let mut student_ids = Vec::new();
    for (last, first) in [("Arnaud", "Alice"), ("Besson", "Bruno"), ("Colin", "Chloe")] {
        let class_id = ws.class_id.clone();
        let enrolled = ws.call(
            "roster.enroll",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        student_ids.push(
            enrolled
                .get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }

    let mut evaluation_ids = Vec::new();
    for title in ["DS1", "DS2"] {
        let class_id = ws.class_id.clone();
        let subject_id = ws.subject_id.clone();
        let evaluation = ws.call(
            "evaluations.create",
            json!({
                "classId": class_id,
                "subjectId": subject_id,
                "periodLabel": "T1",
                "title": title,
                "maxScore": 20
            }),
        );
        evaluation_ids.push(
            evaluation
                .get("evaluationId")
                .and_then(|v| v.as_str())
                .expect("evaluationId")
                .to_string(),
        );
    }

    let grades = [
        (0, 0, json!({ "value": 15.0, "validated": true })),
        (1, 0, json!({ "value": 13.0, "validated": true })),
        (0, 1, json!({ "value": 10.0, "validated": true })),
        (0, 2, json!({ "absent": true, "validated": true })),
    ];
    for (eval_idx, student_idx, extra) in grades {
        let mut params = json!({
            "evaluationId": evaluation_ids[eval_idx],
            "studentId": student_ids[student_idx],
        });
        for (k, v) in extra.as_object().expect("grade params") {
            params[k] = v.clone();
        }
        ws.call("grades.record", params);
    }

    (child, ws, student_ids)
}

#[test]
fn generate_produces_the_expected_report_cards() {
    let (_child, mut ws, students) = seed_example("bulletind-generate");

    let generated = ws.call(
        "bulletins.generate",
        json!({
            "schoolId": ws.school_id,
            "classId": ws.class_id,
            "periodLabel": "T1",
            "actorId": "admin-1"
        }),
    );
    assert_eq!(generated.get("createdCount").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(generated.get("classSize").and_then(|v| v.as_i64()), Some(3));

    let expectations = [
        (0, Some(14.0), Some(1), Some(28.0)),
        (1, Some(10.0), Some(2), Some(20.0)),
        (2, None, None, None),
    ];
    for (idx, avg, rank, weighted) in expectations {
        let class_id = ws.class_id.clone();
        let got = ws.call(
            "bulletins.get",
            json!({
                "studentId": students[idx],
                "classId": class_id,
                "periodLabel": "T1"
            }),
        );
        let bulletin = got.get("bulletin").expect("bulletin payload");
        assert_eq!(
            bulletin.get("overallAverage").and_then(|v| v.as_f64()),
            avg,
            "overall average for student {}",
            idx
        );
        assert_eq!(
            bulletin.get("classRank").and_then(|v| v.as_i64()),
            rank,
            "class rank for student {}",
            idx
        );
        assert_eq!(bulletin.get("classSize").and_then(|v| v.as_i64()), Some(3));
        assert_eq!(bulletin.get("validated").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(
            bulletin.get("generatedBy").and_then(|v| v.as_str()),
            Some("admin-1")
        );

        let lines = bulletin
            .get("lines")
            .and_then(|v| v.as_array())
            .expect("lines");
        assert_eq!(lines.len(), 1, "one line per assigned subject");
        assert_eq!(
            lines[0].get("subjectName").and_then(|v| v.as_str()),
            Some("Maths")
        );
        assert_eq!(lines[0].get("subjectAverage").and_then(|v| v.as_f64()), avg);
        assert_eq!(lines[0].get("subjectRank").and_then(|v| v.as_i64()), rank);
        assert_eq!(
            lines[0].get("weightedAverage").and_then(|v| v.as_f64()),
            weighted
        );
    }
}

#[test]
fn second_generate_is_a_no_op() {
    let (_child, mut ws, students) = seed_example("bulletind-idempotent");

    let first = ws.call(
        "bulletins.generate",
        json!({
            "schoolId": ws.school_id,
            "classId": ws.class_id,
            "periodLabel": "T1",
            "actorId": "admin-1"
        }),
    );
    assert_eq!(first.get("createdCount").and_then(|v| v.as_i64()), Some(3));

    let class_id = ws.class_id.clone();
    let before = ws.call(
        "bulletins.get",
        json!({ "studentId": students[0], "classId": class_id, "periodLabel": "T1" }),
    );

    let second = ws.call(
        "bulletins.generate",
        json!({
            "schoolId": ws.school_id,
            "classId": ws.class_id,
            "periodLabel": "T1",
            "actorId": "admin-2"
        }),
    );
    assert_eq!(second.get("createdCount").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(second.get("skippedCount").and_then(|v| v.as_i64()), Some(3));

    let class_id = ws.class_id.clone();
    let after = ws.call(
        "bulletins.get",
        json!({ "studentId": students[0], "classId": class_id, "periodLabel": "T1" }),
    );
    assert_eq!(before, after, "rerun must not rewrite existing bulletins");
}

#[test]
fn generate_errors_are_reported_with_codes() {
    let (_child, mut ws, _students) = seed_example("bulletind-generate-errors");

    let wrong_school = ws.call_raw(
        "bulletins.generate",
        json!({
            "schoolId": "nope",
            "classId": ws.class_id,
            "periodLabel": "T1",
            "actorId": "admin-1"
        }),
    );
    assert_eq!(
        wrong_school
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let wrong_period = ws.call_raw(
        "bulletins.generate",
        json!({
            "schoolId": ws.school_id,
            "classId": ws.class_id,
            "periodLabel": "T9",
            "actorId": "admin-1"
        }),
    );
    assert_eq!(
        wrong_period
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    let missing = ws.call_raw(
        "bulletins.get",
        json!({ "studentId": "ghost", "classId": ws.class_id, "periodLabel": "T1" }),
    );
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );
}

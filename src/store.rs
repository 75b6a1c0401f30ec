use rusqlite::{Connection, OptionalExtension};

use crate::calc::CalcError;

/// Read-side queries over the grade store. The aggregation engine only ever
/// reads these tables; bulletins and bulletin lines are the only tables it
/// writes.

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub school_year: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub student_id: String,
    pub last_name: String,
    pub first_name: String,
}

impl RosterStudent {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone)]
pub struct AssignedSubject {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
}

/// Fetches a class scoped to one school. A class from another school is
/// indistinguishable from a missing one on purpose.
pub fn find_class_in_school(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
) -> Result<Option<ClassRow>, CalcError> {
    conn.query_row(
        "SELECT school_year, active
         FROM classes
         WHERE id = ? AND school_id = ?",
        (class_id, school_id),
        |r| {
            Ok(ClassRow {
                school_year: r.get(0)?,
                active: r.get::<_, i64>(1)? != 0,
            })
        },
    )
    .optional()
    .map_err(CalcError::query)
}

pub fn find_class(conn: &Connection, class_id: &str) -> Result<Option<ClassRow>, CalcError> {
    conn.query_row(
        "SELECT school_year, active FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassRow {
                school_year: r.get(0)?,
                active: r.get::<_, i64>(1)? != 0,
            })
        },
    )
    .optional()
    .map_err(CalcError::query)
}

/// Active roster for a class in a stable (last name, first name, id) order.
/// Generation iterates this order so repeated runs are reproducible.
pub fn list_active_roster(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name
             FROM enrollments en
             JOIN students s ON s.id = en.student_id
             WHERE en.class_id = ? AND en.active = 1
             ORDER BY s.last_name, s.first_name, s.id",
        )
        .map_err(CalcError::query)?;
    stmt.query_map([class_id], |r| {
        Ok(RosterStudent {
            student_id: r.get(0)?,
            last_name: r.get(1)?,
            first_name: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

/// Subjects assigned to a class, with their report-card coefficients.
pub fn list_assigned_subjects(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<AssignedSubject>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT cs.subject_id, su.name, cs.coefficient
             FROM class_subjects cs
             JOIN subjects su ON su.id = cs.subject_id
             WHERE cs.class_id = ?
             ORDER BY su.name, cs.subject_id",
        )
        .map_err(CalcError::query)?;
    stmt.query_map([class_id], |r| {
        Ok(AssignedSubject {
            subject_id: r.get(0)?,
            name: r.get(1)?,
            coefficient: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

/// Resolves a period label within one school year. Labels repeat across
/// years, so the year always comes from the class being processed.
pub fn resolve_period(
    conn: &Connection,
    school_year: &str,
    label: &str,
) -> Result<Option<String>, CalcError> {
    conn.query_row(
        "SELECT id FROM periods WHERE school_year = ? AND label = ?",
        (school_year, label),
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(CalcError::query)
}

/// A period plus all its descendants. A trimester's averages include grades
/// recorded against its sub-periods.
pub fn period_scope_ids(conn: &Connection, period_id: &str) -> Result<Vec<String>, CalcError> {
    let mut scope: Vec<String> = vec![period_id.to_string()];
    let mut frontier: Vec<String> = vec![period_id.to_string()];

    let mut stmt = conn
        .prepare("SELECT id FROM periods WHERE parent_id = ? ORDER BY sort_order, id")
        .map_err(CalcError::query)?;

    while let Some(parent) = frontier.pop() {
        let children = stmt
            .query_map([&parent], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CalcError::query)?;
        for child in children {
            frontier.push(child.clone());
            scope.push(child);
        }
    }
    Ok(scope)
}

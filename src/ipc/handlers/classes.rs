use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    optional_bool, optional_i64, optional_str, parse_choice, require_row, required_date,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const CLASS_LEVELS: &[&str] = &["PRIMARY", "SECONDARY", "HIGH_SCHOOL", "UNIVERSITY"];
const SUBJECT_CATEGORIES: &[&str] = &["CORE", "ELECTIVE", "EXTRA"];

fn academic_years_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, is_current
             FROM academic_years
             ORDER BY start_date DESC",
        )
        .map_err(HandlerErr::query)?;
    let years = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "academicYears": years }))
}

fn academic_years_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if end < start {
        return Err(HandlerErr::bad_params("endDate must not be before startDate"));
    }
    let is_current = optional_bool(params, "isCurrent")?.unwrap_or(false);

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Only one year may be current.
    if is_current {
        tx.execute("UPDATE academic_years SET is_current = 0 WHERE is_current = 1", [])
            .map_err(|e| HandlerErr::update("academic_years", e))?;
    }
    tx.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, is_current, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            start.to_string(),
            end.to_string(),
            is_current as i64,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert("academic_years", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "academicYearId": id, "name": name, "isCurrent": is_current }))
}

fn class_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let capacity: i64 = r.get(4)?;
    let active_students: i64 = r.get(8)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "level": r.get::<_, String>(2)?,
        "stream": r.get::<_, String>(3)?,
        "capacity": capacity,
        "roomNumber": r.get::<_, String>(5)?,
        "academicYearId": r.get::<_, String>(6)?,
        "isActive": r.get::<_, i64>(7)? != 0,
        "studentCount": active_students,
        "availableSeats": capacity - active_students,
        "subjectCount": r.get::<_, i64>(9)?,
    }))
}

const CLASS_SELECT: &str = "SELECT
       c.id, c.name, c.level, c.stream, c.capacity, c.room_number, c.academic_year_id, c.is_active,
       (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.is_active = 1),
       (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id AND cs.is_active = 1)
     FROM classes c";

fn classes_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = optional_str(params, "academicYearId")?;
    let sql = match year {
        Some(_) => format!(
            "{} WHERE c.academic_year_id = ? ORDER BY c.level, c.name, c.stream",
            CLASS_SELECT
        ),
        None => format!("{} ORDER BY c.level, c.name, c.stream", CLASS_SELECT),
    };
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = match &year {
        Some(y) => stmt.query_map([y], class_row_json),
        None => stmt.query_map([], class_row_json),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)?;
    Ok(json!({ "classes": rows }))
}

fn classes_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let class = conn
        .query_row(
            &format!("{} WHERE c.id = ?", CLASS_SELECT),
            [&class_id],
            class_row_json,
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("class not found"))?;
    let subjects = class_subjects(conn, &class_id)?;
    Ok(json!({ "class": class, "subjects": subjects }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let level = parse_choice(&required_str(params, "level")?, "level", CLASS_LEVELS)?;
    let academic_year_id = required_str(params, "academicYearId")?;
    let stream = optional_str(params, "stream")?.unwrap_or_default();
    let room_number = optional_str(params, "roomNumber")?.unwrap_or_default();
    let capacity = optional_i64(params, "capacity")?.unwrap_or(40);
    if capacity < 1 {
        return Err(HandlerErr::bad_params("capacity must be at least 1"));
    }
    require_row(conn, "academic_years", &academic_year_id, "academic year")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, level, stream, capacity, room_number, academic_year_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            level,
            &stream,
            capacity,
            &room_number,
            &academic_year_id,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert("classes", e))?;

    tracing::info!(class_id = %class_id, name = %name, level, "class created");
    Ok(json!({ "classId": class_id, "name": name, "level": level, "stream": stream }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, code, category, pass_mark, total_marks, is_active
             FROM subjects
             ORDER BY name",
        )
        .map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "category": r.get::<_, String>(3)?,
                "passMark": r.get::<_, i64>(4)?,
                "totalMarks": r.get::<_, i64>(5)?,
                "isActive": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let code = required_str(params, "code")?.to_ascii_uppercase();
    let category = match optional_str(params, "category")? {
        Some(c) if !c.is_empty() => parse_choice(&c, "category", SUBJECT_CATEGORIES)?,
        _ => "CORE",
    };
    let pass_mark = optional_i64(params, "passMark")?.unwrap_or(40);
    if !(0..=100).contains(&pass_mark) {
        return Err(HandlerErr::bad_params("passMark must be between 0 and 100"));
    }
    let total_marks = optional_i64(params, "totalMarks")?.unwrap_or(100);
    if total_marks < 1 {
        return Err(HandlerErr::bad_params("totalMarks must be at least 1"));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, category, pass_mark, total_marks)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&subject_id, &name, &code, category, pass_mark, total_marks),
    )
    .map_err(|e| HandlerErr::insert("subjects", e))?;
    Ok(json!({ "subjectId": subject_id, "name": name, "code": code }))
}

fn class_subjects(conn: &Connection, class_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.code, s.pass_mark, s.total_marks
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.class_id = ? AND cs.is_active = 1
             ORDER BY s.name",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([class_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "code": r.get::<_, String>(2)?,
            "passMark": r.get::<_, i64>(3)?,
            "totalMarks": r.get::<_, i64>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn class_subjects_assign(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    // Re-assigning a dropped subject reactivates the existing link.
    conn.execute(
        "INSERT INTO class_subjects(id, class_id, subject_id, is_active) VALUES(?, ?, ?, 1)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET is_active = 1",
        (Uuid::new_v4().to_string(), &class_id, &subject_id),
    )
    .map_err(|e| HandlerErr::insert("class_subjects", e))?;
    Ok(json!({ "ok": true }))
}

fn class_subjects_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class")?;
    Ok(json!({ "subjects": class_subjects(conn, &class_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        respond(&req.id, state.conn().and_then(|c| f(c, &req.params)))
    };
    match req.method.as_str() {
        "academicYears.list" => Some(run(|c, _| academic_years_list(c))),
        "academicYears.create" => Some(run(academic_years_create)),
        "classes.list" => Some(run(classes_list)),
        "classes.get" => Some(run(classes_get)),
        "classes.create" => Some(run(classes_create)),
        "subjects.list" => Some(run(|c, _| subjects_list(c))),
        "subjects.create" => Some(run(subjects_create)),
        "classSubjects.assign" => Some(run(class_subjects_assign)),
        "classSubjects.list" => Some(run(class_subjects_list)),
        _ => None,
    }
}

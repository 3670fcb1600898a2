use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{optional_bool, optional_str, require_row, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ADMISSION_ATTEMPTS: usize = 8;

/// `ADM<year><6 digits>`, digits drawn from a v4 uuid.
fn generate_admission_number() -> String {
    let year = chrono::Utc::now().year();
    let digits = Uuid::new_v4().as_u128() % 1_000_000;
    format!("ADM{}{:06}", year, digits)
}

fn admission_number_taken(conn: &Connection, number: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE admission_number = ?",
        [number],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn resolve_academic_year(
    conn: &Connection,
    explicit: Option<String>,
    class_id: Option<&str>,
) -> Result<String, HandlerErr> {
    if let Some(id) = explicit.filter(|s| !s.is_empty()) {
        require_row(conn, "academic_years", &id, "academic year")?;
        return Ok(id);
    }
    if let Some(cid) = class_id {
        let year: Option<String> = conn
            .query_row(
                "SELECT academic_year_id FROM classes WHERE id = ?",
                [cid],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if let Some(y) = year {
            return Ok(y);
        }
    }
    conn.query_row(
        "SELECT id FROM academic_years WHERE is_current = 1",
        [],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::bad_params("missing academicYearId and no current academic year"))
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "admissionNumber": r.get::<_, String>(1)?,
        "firstName": first,
        "lastName": last,
        "displayName": format!("{}, {}", last, first),
        "rollNumber": r.get::<_, String>(4)?,
        "classId": r.get::<_, Option<String>>(5)?,
        "academicYearId": r.get::<_, String>(6)?,
        "isActive": r.get::<_, i64>(7)? != 0,
    }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = optional_str(params, "classId")?;
    let include_inactive = optional_bool(params, "includeInactive")?.unwrap_or(true);
    let active_clause = if include_inactive { "" } else { " AND is_active = 1" };

    let base = "SELECT id, admission_number, first_name, last_name, roll_number, class_id,
                       academic_year_id, is_active
                FROM students";
    let rows = match &class_id {
        Some(cid) => {
            require_row(conn, "classes", cid, "class")?;
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE class_id = ?{} ORDER BY admission_number",
                    base, active_clause
                ))
                .map_err(HandlerErr::query)?;
            let v = stmt
                .query_map([cid], student_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            v
        }
        None => {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE 1 = 1{} ORDER BY admission_number",
                    base, active_clause
                ))
                .map_err(HandlerErr::query)?;
            let v = stmt
                .query_map([], student_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            v
        }
    }
    .map_err(HandlerErr::query)?;
    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let first_name = required_str(params, "firstName")?;
    let last_name = required_str(params, "lastName")?;
    let roll_number = optional_str(params, "rollNumber")?.unwrap_or_default();
    let class_id = optional_str(params, "classId")?.filter(|s| !s.is_empty());
    if let Some(cid) = &class_id {
        require_row(conn, "classes", cid, "class")?;
    }
    let academic_year_id =
        resolve_academic_year(conn, optional_str(params, "academicYearId")?, class_id.as_deref())?;

    let admission_number = match optional_str(params, "admissionNumber")?.filter(|s| !s.is_empty()) {
        Some(n) => n,
        None => {
            let mut picked = None;
            for _ in 0..ADMISSION_ATTEMPTS {
                let candidate = generate_admission_number();
                if !admission_number_taken(conn, &candidate)? {
                    picked = Some(candidate);
                    break;
                }
            }
            picked.ok_or_else(|| {
                HandlerErr::new("conflict", "could not generate a free admission number")
            })?
        }
    };

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, admission_number, first_name, last_name, roll_number, class_id,
                              academic_year_id, is_active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &student_id,
            &admission_number,
            &first_name,
            &last_name,
            &roll_number,
            &class_id,
            &academic_year_id,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert("students", e))?;

    Ok(json!({
        "studentId": student_id,
        "admissionNumber": admission_number,
        "classId": class_id,
        "academicYearId": academic_year_id,
    }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = optional_str(patch, "firstName")? {
        if v.is_empty() {
            return Err(HandlerErr::bad_params("firstName must not be empty"));
        }
        sets.push("first_name = ?");
        values.push(v.into());
    }
    if let Some(v) = optional_str(patch, "lastName")? {
        if v.is_empty() {
            return Err(HandlerErr::bad_params("lastName must not be empty"));
        }
        sets.push("last_name = ?");
        values.push(v.into());
    }
    if let Some(v) = optional_str(patch, "rollNumber")? {
        sets.push("roll_number = ?");
        values.push(v.into());
    }
    if patch.get("classId").is_some() {
        match optional_str(patch, "classId")?.filter(|s| !s.is_empty()) {
            Some(cid) => {
                require_row(conn, "classes", &cid, "class")?;
                sets.push("class_id = ?");
                values.push(cid.into());
            }
            None => {
                sets.push("class_id = ?");
                values.push(rusqlite::types::Value::Null);
            }
        }
    }
    if let Some(v) = optional_bool(patch, "isActive")? {
        sets.push("is_active = ?");
        values.push((v as i64).into());
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true, "changed": false }));
    }
    sets.push("updated_at = ?");
    values.push(db::now_timestamp().into());
    values.push(student_id.into());

    conn.execute(
        &format!("UPDATE students SET {} WHERE id = ?", sets.join(", ")),
        rusqlite::params_from_iter(values),
    )
    .map_err(|e| HandlerErr::update("students", e))?;
    Ok(json!({ "ok": true, "changed": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "students.list" => students_list,
            "students.create" => students_create,
            "students.update" => students_update,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

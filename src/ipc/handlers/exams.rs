use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    optional_i64, optional_str, parse_choice, require_row, required_date, required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const EXAM_TYPES: &[&str] = &["MID_TERM", "FINAL", "QUIZ", "ASSIGNMENT", "PRACTICAL", "OTHER"];
const EXAM_STATUSES: &[&str] = &["SCHEDULED", "ONGOING", "COMPLETED", "POSTPONED"];
const SCHEDULE_STATUSES: &[&str] = &["SCHEDULED", "COMPLETED", "POSTPONED", "CANCELLED"];

fn parse_time(params: &serde_json::Value, key: &str) -> Result<NaiveTime, HandlerErr> {
    let raw = required_str(params, key)?;
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

fn exam_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "examType": r.get::<_, String>(2)?,
        "academicYearId": r.get::<_, String>(3)?,
        "term": r.get::<_, String>(4)?,
        "startDate": r.get::<_, String>(5)?,
        "endDate": r.get::<_, String>(6)?,
        "status": r.get::<_, String>(7)?,
        "isPublished": r.get::<_, i64>(8)? != 0,
        "description": r.get::<_, String>(9)?,
    }))
}

const EXAM_SELECT: &str = "SELECT id, name, exam_type, academic_year_id, term, start_date, end_date,
            status, is_published, description
     FROM exams";

fn exams_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = optional_str(params, "academicYearId")?.filter(|s| !s.is_empty());
    let mut stmt = match year {
        Some(_) => conn.prepare(&format!(
            "{} WHERE academic_year_id = ? ORDER BY start_date DESC",
            EXAM_SELECT
        )),
        None => conn.prepare(&format!("{} ORDER BY start_date DESC", EXAM_SELECT)),
    }
    .map_err(HandlerErr::query)?;
    let exams = match &year {
        Some(y) => stmt.query_map([y], exam_row_json),
        None => stmt.query_map([], exam_row_json),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)?;
    Ok(json!({ "exams": exams }))
}

fn exams_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let exam_type = parse_choice(&required_str(params, "examType")?, "examType", EXAM_TYPES)?;
    let academic_year_id = required_str(params, "academicYearId")?;
    let term = required_str(params, "term")?;
    let start = required_date(params, "startDate")?;
    let end = required_date(params, "endDate")?;
    if end < start {
        return Err(HandlerErr::bad_params("endDate must not be before startDate"));
    }
    let description = optional_str(params, "description")?.unwrap_or_default();
    require_row(conn, "academic_years", &academic_year_id, "academic year")?;

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, name, exam_type, academic_year_id, term, start_date, end_date,
                           description, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &name,
            exam_type,
            &academic_year_id,
            &term,
            start.to_string(),
            end.to_string(),
            &description,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert("exams", e))?;
    Ok(json!({ "examId": exam_id, "name": name, "status": "SCHEDULED" }))
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE id = ?", EXAM_SELECT),
        [exam_id],
        exam_row_json,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("exam not found"))
}

fn exams_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;
    let schedules = list_schedules(conn, Some(&exam_id), None)?;
    Ok(json!({ "exam": exam, "schedules": schedules }))
}

fn exams_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let status = parse_choice(&required_str(params, "status")?, "status", EXAM_STATUSES)?;
    require_row(conn, "exams", &exam_id, "exam")?;
    conn.execute("UPDATE exams SET status = ? WHERE id = ?", (status, &exam_id))
        .map_err(|e| HandlerErr::update("exams", e))?;
    Ok(json!({ "examId": exam_id, "status": status }))
}

fn exams_publish(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    require_row(conn, "exams", &exam_id, "exam")?;
    conn.execute("UPDATE exams SET is_published = 1 WHERE id = ?", [&exam_id])
        .map_err(|e| HandlerErr::update("exams", e))?;
    tracing::info!(exam_id = %exam_id, "exam results published");
    Ok(json!({ "examId": exam_id, "isPublished": true }))
}

pub fn list_schedules(
    conn: &Connection,
    exam_id: Option<&str>,
    class_id: Option<&str>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT es.id, es.exam_id, es.class_id, es.subject_id, s.name, s.code, es.exam_date,
                    es.start_time, es.end_time, es.room_number, es.max_marks, es.pass_marks,
                    es.status
             FROM exam_schedules es
             JOIN subjects s ON s.id = es.subject_id
             WHERE (?1 IS NULL OR es.exam_id = ?1) AND (?2 IS NULL OR es.class_id = ?2)
             ORDER BY es.exam_date, es.start_time",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map((exam_id, class_id), |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "examId": r.get::<_, String>(1)?,
            "classId": r.get::<_, String>(2)?,
            "subjectId": r.get::<_, String>(3)?,
            "subjectName": r.get::<_, String>(4)?,
            "subjectCode": r.get::<_, String>(5)?,
            "examDate": r.get::<_, String>(6)?,
            "startTime": r.get::<_, String>(7)?,
            "endTime": r.get::<_, String>(8)?,
            "roomNumber": r.get::<_, String>(9)?,
            "maxMarks": r.get::<_, i64>(10)?,
            "passMarks": r.get::<_, i64>(11)?,
            "status": r.get::<_, String>(12)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn schedules_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = optional_str(params, "examId")?.filter(|s| !s.is_empty());
    let class_id = optional_str(params, "classId")?.filter(|s| !s.is_empty());
    let schedules = list_schedules(conn, exam_id.as_deref(), class_id.as_deref())?;
    Ok(json!({ "schedules": schedules }))
}

fn schedules_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let exam_date = required_date(params, "examDate")?;
    let start_time = parse_time(params, "startTime")?;
    let end_time = parse_time(params, "endTime")?;
    if end_time <= start_time {
        return Err(HandlerErr::bad_params("endTime must be after startTime"));
    }
    let room_number = optional_str(params, "roomNumber")?.unwrap_or_default();
    let max_marks = optional_i64(params, "maxMarks")?.unwrap_or(100);
    let pass_marks = optional_i64(params, "passMarks")?.unwrap_or(40);
    if max_marks < 1 {
        return Err(HandlerErr::bad_params("maxMarks must be at least 1"));
    }
    if pass_marks < 0 || pass_marks > max_marks {
        return Err(HandlerErr::bad_params("passMarks must be between 0 and maxMarks"));
    }
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    let schedule_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_schedules(id, exam_id, class_id, subject_id, exam_date, start_time,
                                    end_time, room_number, max_marks, pass_marks)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &schedule_id,
            &exam_id,
            &class_id,
            &subject_id,
            exam_date.to_string(),
            start_time.format("%H:%M").to_string(),
            end_time.format("%H:%M").to_string(),
            &room_number,
            max_marks,
            pass_marks,
        ),
    )
    .map_err(|e| HandlerErr::insert("exam_schedules", e))?;
    Ok(json!({ "scheduleId": schedule_id }))
}

fn schedules_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = required_str(params, "scheduleId")?;
    let status = parse_choice(&required_str(params, "status")?, "status", SCHEDULE_STATUSES)?;
    require_row(conn, "exam_schedules", &schedule_id, "exam schedule")?;
    conn.execute(
        "UPDATE exam_schedules SET status = ? WHERE id = ?",
        (status, &schedule_id),
    )
    .map_err(|e| HandlerErr::update("exam_schedules", e))?;
    Ok(json!({ "scheduleId": schedule_id, "status": status }))
}

fn schedules_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = required_str(params, "scheduleId")?;
    let n = conn
        .execute("DELETE FROM exam_schedules WHERE id = ?", [&schedule_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::not_found("exam schedule not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "exams.list" => exams_list,
            "exams.create" => exams_create,
            "exams.get" => exams_get,
            "exams.updateStatus" => exams_update_status,
            "exams.publish" => exams_publish,
            "examSchedules.list" => schedules_list,
            "examSchedules.create" => schedules_create,
            "examSchedules.updateStatus" => schedules_update_status,
            "examSchedules.delete" => schedules_delete,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

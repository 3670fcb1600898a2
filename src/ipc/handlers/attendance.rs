use crate::calc;
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    optional_date, optional_str, parse_choice, parse_date, require_row, required_date, required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::setup;

pub const ATTENDANCE_STATUSES: &[&str] = &["Present", "Absent", "Late", "Excused"];

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn late_counts(conn: &Connection) -> Result<bool, HandlerErr> {
    setup::attendance_config(conn)
        .map(|c| c.count_late_as_present)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// Insert or overwrite the single record for (student, date).
fn upsert_attendance(
    conn: &Connection,
    student_id: &str,
    class_id: Option<&str>,
    date: NaiveDate,
    status: &str,
    remarks: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance(id, student_id, class_id, date, status, remarks, marked_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           class_id = excluded.class_id,
           status = excluded.status,
           remarks = excluded.remarks,
           marked_at = excluded.marked_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            class_id,
            date.to_string(),
            status,
            remarks,
            db::now_timestamp(),
        ),
    )?;
    Ok(())
}

struct EntryErr {
    code: &'static str,
    message: String,
}

impl EntryErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn mark_entry(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
    entry: &serde_json::Value,
) -> Result<String, EntryErr> {
    let student_id = entry
        .get("studentId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EntryErr::new("bad_params", "missing studentId"))?
        .trim()
        .to_string();
    let status_raw = entry
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EntryErr::new("bad_params", "missing status"))?;
    let status = parse_choice(status_raw, "status", ATTENDANCE_STATUSES)
        .map_err(|e| EntryErr::new(e.code, e.message))?;
    let remarks = entry
        .get("remarks")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let member: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| EntryErr::new("db_query_failed", e.to_string()))?;
    match member {
        None => return Err(EntryErr::new("not_found", "student not found")),
        Some(c) if c.as_deref() != Some(class_id) => {
            return Err(EntryErr::new("bad_params", "student is not in this class"))
        }
        Some(_) => {}
    }

    upsert_attendance(conn, &student_id, Some(class_id), date, status, &remarks)
        .map_err(|e| EntryErr::new("db_insert_failed", e.to_string()))?;
    Ok(student_id)
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let date = required_date(params, "date")?;
    require_row(conn, "classes", &class_id, "class")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("entries must be an array"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut marked = 0usize;
    let mut errors = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        match mark_entry(&tx, &class_id, date, entry) {
            Ok(_) => marked += 1,
            Err(e) => errors.push(json!({
                "index": index,
                "studentId": entry.get("studentId"),
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(class_id = %class_id, date = %date, marked, skipped = errors.len(), "attendance marked");
    Ok(json!({
        "date": date.to_string(),
        "marked": marked,
        "skipped": errors.len(),
        "errors": errors,
    }))
}

fn attendance_mark_one(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let status = parse_choice(&required_str(params, "status")?, "status", ATTENDANCE_STATUSES)?;
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let remarks = optional_str(params, "remarks")?.unwrap_or_default();

    let class_id = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| {
            HandlerErr::not_found("student not found").with_details(json!({ "id": student_id }))
        })?;

    upsert_attendance(conn, &student_id, class_id.as_deref(), date, status, &remarks)
        .map_err(|e| HandlerErr::insert("attendance", e))?;
    Ok(json!({
        "ok": true,
        "studentId": student_id,
        "date": date.to_string(),
        "status": status,
    }))
}

fn attendance_for_date(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let date = required_date(params, "date")?;
    require_row(conn, "classes", &class_id, "class")?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.admission_number, s.first_name, s.last_name, s.roll_number,
                    a.status, a.remarks
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.date = ?
             WHERE s.class_id = ? AND s.is_active = 1
             ORDER BY s.roll_number, s.admission_number",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((date.to_string(), &class_id), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "admissionNumber": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "rollNumber": r.get::<_, String>(4)?,
                "status": r.get::<_, Option<String>>(5)?,
                "remarks": r.get::<_, Option<String>>(6)?.unwrap_or_default(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let marked = rows.iter().filter(|r| !r["status"].is_null()).count();
    Ok(json!({
        "classId": class_id,
        "date": date.to_string(),
        "marked": marked,
        "students": rows,
    }))
}

fn attendance_home(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.stream,
                    (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.is_active = 1),
                    (SELECT COUNT(*) FROM attendance a WHERE a.class_id = c.id AND a.date = ?1)
             FROM classes c
             WHERE c.is_active = 1
             ORDER BY c.name, c.stream",
        )
        .map_err(HandlerErr::query)?;
    let classes = stmt
        .query_map([date.to_string()], |r| {
            let marked: i64 = r.get(4)?;
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "stream": r.get::<_, String>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
                "markedCount": marked,
                "isMarked": marked > 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let total_students: i64 = conn
        .query_row("SELECT COUNT(*) FROM students WHERE is_active = 1", [], |r| r.get(0))
        .map_err(HandlerErr::query)?;
    Ok(json!({
        "date": date.to_string(),
        "totalStudents": total_students,
        "classes": classes,
    }))
}

#[derive(Debug, Default, Clone, Copy)]
struct StatusCounts {
    total: i64,
    present: i64,
    absent: i64,
    late: i64,
    excused: i64,
}

impl StatusCounts {
    fn add(&mut self, status: &str) {
        self.total += 1;
        match status {
            "Present" => self.present += 1,
            "Absent" => self.absent += 1,
            "Late" => self.late += 1,
            "Excused" => self.excused += 1,
            _ => {}
        }
    }

    fn percentage(&self, late_counts: bool) -> f64 {
        let attended = if late_counts {
            self.present + self.late
        } else {
            self.present
        };
        calc::round_2(calc::percent_of(attended as f64, self.total as f64))
    }

    fn to_json(self, late_counts: bool) -> serde_json::Value {
        json!({
            "totalDays": self.total,
            "presentCount": self.present,
            "absentCount": self.absent,
            "lateCount": self.late,
            "excusedCount": self.excused,
            "attendancePercentage": self.percentage(late_counts),
        })
    }
}

fn attendance_report(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    let class_id = optional_str(params, "classId")?.filter(|s| !s.is_empty());
    if let Some(sid) = &student_id {
        require_row(conn, "students", sid, "student")?;
    }
    if let Some(cid) = &class_id {
        require_row(conn, "classes", cid, "class")?;
    }
    let cfg = setup::attendance_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let end = optional_date(params, "endDate")?.unwrap_or_else(today);
    let start = optional_date(params, "startDate")?
        .unwrap_or_else(|| end - Duration::days(cfg.default_range_days));
    if end < start {
        return Err(HandlerErr::bad_params("endDate must not be before startDate"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, s.admission_number, s.first_name, s.last_name, a.class_id,
                    a.date, a.status, a.remarks
             FROM attendance a
             JOIN students s ON s.id = a.student_id
             WHERE a.date >= ?1 AND a.date <= ?2
               AND (?3 IS NULL OR a.student_id = ?3)
               AND (?4 IS NULL OR s.class_id = ?4)
             ORDER BY a.date DESC, s.admission_number",
        )
        .map_err(HandlerErr::query)?;
    let mut counts = StatusCounts::default();
    let records = stmt
        .query_map(
            (start.to_string(), end.to_string(), &student_id, &class_id),
            |r| {
                let first: String = r.get(2)?;
                let last: String = r.get(3)?;
                let status: String = r.get(6)?;
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "admissionNumber": r.get::<_, String>(1)?,
                    "displayName": format!("{}, {}", last, first),
                    "classId": r.get::<_, Option<String>>(4)?,
                    "date": r.get::<_, String>(5)?,
                    "status": status,
                    "remarks": r.get::<_, String>(7)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    for rec in &records {
        counts.add(rec["status"].as_str().unwrap_or(""));
    }

    let mut out = counts.to_json(cfg.count_late_as_present);
    out["startDate"] = json!(start.to_string());
    out["endDate"] = json!(end.to_string());
    out["records"] = json!(records);
    Ok(out)
}

fn month_bounds(month: &str) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let first = parse_date(&format!("{}-01", month.trim()), "month")
        .map_err(|_| HandlerErr::bad_params("month must be YYYY-MM"))?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .ok_or_else(|| HandlerErr::bad_params("month out of range"))?;
    Ok((first, next - Duration::days(1)))
}

fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let month = required_str(params, "month")?;
    require_row(conn, "students", &student_id, "student")?;
    let (first, last) = month_bounds(&month)?;
    let late_counts = late_counts(conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance
             WHERE student_id = ? AND date >= ? AND date <= ?",
        )
        .map_err(HandlerErr::query)?;
    let statuses = stmt
        .query_map((&student_id, first.to_string(), last.to_string()), |r| {
            r.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut counts = StatusCounts::default();
    for s in &statuses {
        counts.add(s);
    }

    let mut out = counts.to_json(late_counts);
    out["studentId"] = json!(student_id);
    out["month"] = json!(first.format("%Y-%m").to_string());
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "attendance.mark" => attendance_mark,
            "attendance.markOne" => attendance_mark_one,
            "attendance.forDate" => attendance_for_date,
            "attendance.home" => attendance_home,
            "attendance.report" => attendance_report,
            "attendance.summary" => attendance_summary,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_bounds_cover_whole_month() {
        let (a, b) = month_bounds("2024-02").expect("feb");
        assert_eq!(a.to_string(), "2024-02-01");
        assert_eq!(b.to_string(), "2024-02-29");
        let (a, b) = month_bounds("2023-12").expect("dec");
        assert_eq!(a.to_string(), "2023-12-01");
        assert_eq!(b.to_string(), "2023-12-31");
        assert!(month_bounds("2023-13").is_err());
        assert!(month_bounds("march").is_err());
    }

    #[test]
    fn empty_counts_give_zero_percentage() {
        assert_eq!(StatusCounts::default().percentage(true), 0.0);
    }

    #[test]
    fn late_only_counts_when_enabled() {
        let mut c = StatusCounts::default();
        for s in ["Present", "Late", "Absent", "Excused"] {
            c.add(s);
        }
        assert_eq!(c.percentage(false), 25.0);
        assert_eq!(c.percentage(true), 50.0);
    }
}

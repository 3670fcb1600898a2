use crate::calc::{self, Grade};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{require_row, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SheetSubject {
    pub id: String,
    pub name: String,
    pub max_marks: i64,
}

/// Subjects examined for a class: the exam's schedule when there is one,
/// otherwise the class's assigned subjects at their default totals.
pub fn sheet_subjects(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
) -> Result<Vec<SheetSubject>, HandlerErr> {
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(SheetSubject {
            id: r.get(0)?,
            name: r.get(1)?,
            max_marks: r.get(2)?,
        })
    };
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, es.max_marks
             FROM exam_schedules es
             JOIN subjects s ON s.id = es.subject_id
             WHERE es.exam_id = ? AND es.class_id = ? AND es.status <> 'CANCELLED'
             ORDER BY s.name",
        )
        .map_err(HandlerErr::query)?;
    let scheduled = stmt
        .query_map((exam_id, class_id), map_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    if !scheduled.is_empty() {
        return Ok(scheduled);
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.total_marks
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.class_id = ? AND cs.is_active = 1
             ORDER BY s.name",
        )
        .map_err(HandlerErr::query)?;
    let assigned = stmt
        .query_map([class_id], map_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(assigned)
}

fn max_marks_for(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
    subject_id: &str,
) -> Result<i64, HandlerErr> {
    let scheduled: Option<i64> = conn
        .query_row(
            "SELECT max_marks FROM exam_schedules
             WHERE exam_id = ? AND class_id = ? AND subject_id = ?",
            (exam_id, class_id, subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if let Some(m) = scheduled {
        return Ok(m);
    }
    conn.query_row(
        "SELECT total_marks FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn result_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let marks: f64 = r.get(4)?;
    let max: i64 = r.get(5)?;
    let is_absent = r.get::<_, i64>(8)? != 0;
    let pass_mark: i64 = r.get(9)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "examId": r.get::<_, String>(1)?,
        "subjectId": r.get::<_, String>(2)?,
        "subjectName": r.get::<_, String>(3)?,
        "marksObtained": marks,
        "maxMarks": max,
        "percentage": calc::round_2(calc::percent_of(marks, max as f64)),
        "grade": r.get::<_, String>(6)?,
        "remarks": r.get::<_, String>(7)?,
        "isAbsent": is_absent,
        "isPass": !is_absent && marks >= pass_mark as f64,
    }))
}

const RESULT_SELECT: &str = "SELECT r.id, r.exam_id, r.subject_id, s.name, r.marks_obtained,
            r.max_marks, r.grade, r.remarks, r.is_absent, s.pass_mark
     FROM results r
     JOIN subjects s ON s.id = r.subject_id";

/// A student's results for one exam, by subject name.
pub fn results_for(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE r.student_id = ? AND r.exam_id = ? ORDER BY s.name",
            RESULT_SELECT
        ))
        .map_err(HandlerErr::query)?;
    stmt.query_map((student_id, exam_id), result_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn results_sheet(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "classes", &class_id, "class")?;

    let subjects = sheet_subjects(conn, &exam_id, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, admission_number, first_name, last_name
             FROM students
             WHERE class_id = ? AND is_active = 1
             ORDER BY admission_number",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                format!("{}, {}", r.get::<_, String>(3)?, r.get::<_, String>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut stmt = conn
        .prepare(
            "SELECT r.student_id, r.subject_id, r.marks_obtained, r.grade, r.remarks, r.is_absent
             FROM results r
             JOIN students st ON st.id = r.student_id
             WHERE r.exam_id = ? AND st.class_id = ? AND st.is_active = 1",
        )
        .map_err(HandlerErr::query)?;
    let mut entered: HashMap<(String, String), serde_json::Value> = HashMap::new();
    let rows = stmt
        .query_map((&exam_id, &class_id), |r| {
            let is_absent = r.get::<_, i64>(5)? != 0;
            let marks: Option<f64> = if is_absent { None } else { Some(r.get(2)?) };
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                json!({
                    "marks": marks,
                    "grade": r.get::<_, String>(3)?,
                    "remarks": r.get::<_, String>(4)?,
                    "isAbsent": is_absent,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    entered.extend(rows);

    let subject_ids: Vec<&str> = subjects.iter().map(|s| s.id.as_str()).collect();
    let total_expected = students.len() * subjects.len();
    let mut total_entered = 0usize;
    let student_rows: Vec<serde_json::Value> = students
        .iter()
        .map(|(sid, adm, name)| {
            let mut cells = serde_json::Map::new();
            for subj in &subject_ids {
                if let Some(v) = entered.get(&(sid.clone(), subj.to_string())) {
                    total_entered += 1;
                    cells.insert(subj.to_string(), v.clone());
                }
            }
            json!({
                "studentId": sid,
                "admissionNumber": adm,
                "displayName": name,
                "results": cells,
            })
        })
        .collect();

    let completion = if total_expected > 0 {
        total_entered as f64 / total_expected as f64 * 100.0
    } else {
        0.0
    };

    Ok(json!({
        "examId": exam_id,
        "classId": class_id,
        "subjects": subjects
            .iter()
            .map(|s| json!({ "id": s.id, "name": s.name, "maxMarks": s.max_marks }))
            .collect::<Vec<_>>(),
        "students": student_rows,
        "totalExpected": total_expected,
        "totalEntered": total_entered,
        "completionPercentage": calc::round_2(completion),
    }))
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

/// Marks arrive as JSON numbers or numeric strings from text inputs.
fn parse_marks(v: Option<&serde_json::Value>) -> Result<f64, EntryErr> {
    let marks = match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        None | Some(serde_json::Value::Null) => {
            return Err(EntryErr::new("bad_params", "marks are required unless absent"))
        }
        _ => None,
    };
    match marks {
        Some(m) if m.is_finite() => Ok(m),
        _ => Err(EntryErr::new("bad_params", "marks must be numeric")),
    }
}

struct SaveContext<'a> {
    exam_id: &'a str,
    class_id: &'a str,
    subject_id: &'a str,
    max_marks: i64,
}

fn save_one(conn: &Connection, ctx: &SaveContext<'_>, entry: &serde_json::Value) -> Result<String, EntryErr> {
    let student_id = entry
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EntryErr::new("bad_params", "missing studentId"))?;

    let student_class: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| EntryErr::new("db_query_failed", e.to_string()))?;
    match student_class {
        None => return Err(EntryErr::new("not_found", "student not found")),
        Some(cid) if cid.as_deref() != Some(ctx.class_id) => {
            return Err(EntryErr::new("bad_params", "student is not in this class"))
        }
        Some(_) => {}
    }

    let is_absent = entry
        .get("isAbsent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let remarks = entry
        .get("remarks")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let (marks, grade) = if is_absent {
        (0.0, String::new())
    } else {
        let marks = parse_marks(entry.get("marks"))?;
        if marks < 0.0 {
            return Err(EntryErr::new("bad_params", "marks must not be negative"));
        }
        if marks > ctx.max_marks as f64 {
            return Err(EntryErr::new(
                "bad_params",
                format!("marks must not exceed {}", ctx.max_marks),
            ));
        }
        let manual = entry
            .get("grade")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let grade = match manual {
            Some(g) => Grade::parse(g)
                .ok_or_else(|| EntryErr::new("bad_params", "grade must be one of A-F"))?,
            None => calc::calculate_grade(calc::percent_of(marks, ctx.max_marks as f64)),
        };
        (marks, grade.as_str().to_string())
    };

    conn.execute(
        "INSERT INTO results(id, student_id, exam_id, subject_id, marks_obtained, max_marks, grade,
                             remarks, is_absent, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id, subject_id) DO UPDATE SET
           marks_obtained = excluded.marks_obtained,
           max_marks = excluded.max_marks,
           grade = excluded.grade,
           remarks = excluded.remarks,
           is_absent = excluded.is_absent,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            ctx.exam_id,
            ctx.subject_id,
            marks,
            ctx.max_marks,
            &grade,
            &remarks,
            is_absent as i64,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| EntryErr::new("db_update_failed", e.to_string()))?;
    Ok(student_id)
}

fn results_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let Some(entries) = params.get("results").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("results must be an array"));
    };
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    let ctx = SaveContext {
        exam_id: &exam_id,
        class_id: &class_id,
        subject_id: &subject_id,
        max_marks: max_marks_for(conn, &exam_id, &class_id, &subject_id)?,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut saved = 0usize;
    let mut errors = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        match save_one(&tx, &ctx, entry) {
            Ok(_) => saved += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": entry.get("studentId").cloned().unwrap_or(serde_json::Value::Null),
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    if !errors.is_empty() {
        tracing::warn!(
            exam_id = %exam_id,
            subject_id = %subject_id,
            skipped = errors.len(),
            "some result entries were skipped"
        );
    }
    Ok(json!({
        "saved": saved,
        "skipped": errors.len(),
        "errors": errors,
        "maxMarks": ctx.max_marks,
    }))
}

fn results_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "students", &student_id, "student")?;

    let mut stmt = conn
        .prepare(&format!(
            "{} JOIN exams e ON e.id = r.exam_id
             WHERE r.student_id = ?
             ORDER BY e.start_date DESC, s.name",
            RESULT_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let results = stmt
        .query_map([&student_id], result_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut stmt = conn
        .prepare(
            "SELECT rc.exam_id, e.name, rc.percentage, rc.overall_grade, rc.gpa, rc.rank,
                    rc.class_position
             FROM report_cards rc
             JOIN exams e ON e.id = rc.exam_id
             WHERE rc.student_id = ?
             ORDER BY e.start_date DESC",
        )
        .map_err(HandlerErr::query)?;
    let report_cards = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "examId": r.get::<_, String>(0)?,
                "examName": r.get::<_, String>(1)?,
                "percentage": r.get::<_, f64>(2)?,
                "overallGrade": r.get::<_, String>(3)?,
                "gpa": r.get::<_, Option<f64>>(4)?,
                "rank": r.get::<_, Option<i64>>(5)?,
                "classPosition": r.get::<_, Option<i64>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "results": results, "reportCards": report_cards }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "results.sheet" => results_sheet,
            "results.save" => results_save,
            "results.forStudent" => results_for_student,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

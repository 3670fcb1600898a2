use crate::calc::{self, GenerationOptions, Grade};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{optional_bool, optional_str, require_row, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::{results, setup};

const COMMENT_MAX_CHARS: usize = 2000;

fn generation_options(conn: &Connection) -> Result<GenerationOptions, HandlerErr> {
    let results_cfg =
        setup::results_config(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let attendance_cfg = setup::attendance_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(GenerationOptions {
        credits_per_subject: results_cfg.credits_per_subject,
        late_counts_as_present: attendance_cfg.count_late_as_present,
    })
}

fn student_class(conn: &Connection, student_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| {
        HandlerErr::not_found("student not found").with_details(json!({ "id": student_id }))
    })
}

fn reports_generate_one(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let student_id = required_str(params, "studentId")?;
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "students", &student_id, "student")?;
    let opts = generation_options(conn)?;
    let card = calc::generate_report_card(conn, &student_id, &exam_id, &opts)?;
    Ok(json!({ "reportCard": card }))
}

fn reports_generate_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "classes", &class_id, "class")?;

    let opts = generation_options(conn)?;
    let generation = calc::generate_class_report_cards(conn, &exam_id, &class_id, &opts)?;
    tracing::info!(
        exam_id = %exam_id,
        class_id = %class_id,
        generated = generation.generated,
        failed = generation.failed.len(),
        "class report cards generated"
    );

    let auto_rank = setup::results_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .auto_rank_after_generate;
    let ranks = if auto_rank {
        Some(calc::calculate_ranks(conn, &exam_id, &class_id)?)
    } else {
        None
    };

    Ok(json!({
        "generated": generation.generated,
        "failedCount": generation.failed.len(),
        "failed": generation.failed,
        "ranks": ranks,
    }))
}

fn reports_calculate_ranks(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    require_row(conn, "exams", &exam_id, "exam")?;
    require_row(conn, "classes", &class_id, "class")?;
    let pass = calc::calculate_ranks(conn, &exam_id, &class_id)?;
    Ok(json!(pass))
}

fn count_active_students(conn: &Connection, class_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ? AND is_active = 1",
        [class_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn student_header(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT s.id, s.admission_number, s.first_name, s.last_name, s.roll_number,
                c.id, c.name, c.level, c.stream
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "admissionNumber": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "rollNumber": r.get::<_, String>(4)?,
                "classId": r.get::<_, Option<String>>(5)?,
                "className": r.get::<_, Option<String>>(6)?,
                "classLevel": r.get::<_, Option<String>>(7)?,
                "stream": r.get::<_, Option<String>>(8)?,
            }))
        },
    )
    .map_err(HandlerErr::query)
}

fn exam_header(conn: &Connection, exam_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT e.id, e.name, e.exam_type, e.term, e.start_date, e.end_date, e.is_published,
                ay.name
         FROM exams e
         JOIN academic_years ay ON ay.id = e.academic_year_id
         WHERE e.id = ?",
        [exam_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "examType": r.get::<_, String>(2)?,
                "term": r.get::<_, String>(3)?,
                "startDate": r.get::<_, String>(4)?,
                "endDate": r.get::<_, String>(5)?,
                "isPublished": r.get::<_, i64>(6)? != 0,
                "academicYear": r.get::<_, String>(7)?,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("exam not found").with_details(json!({ "id": exam_id })))
}

/// Creates the card on first view. An existing card is returned as stored
/// unless `regenerate` asks for fresh totals.
fn reports_report_card(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let exam_id = required_str(params, "examId")?;
    let regenerate = optional_bool(params, "regenerate")?.unwrap_or(false);
    let exam = exam_header(conn, &exam_id)?;
    let class_id = student_class(conn, &student_id)?;

    let existing = calc::load_report_card(conn, &student_id, &exam_id)?;
    let created = existing.is_none();
    let card = match existing {
        Some(card) if !regenerate => card,
        _ => {
            let opts = generation_options(conn)?;
            calc::generate_report_card(conn, &student_id, &exam_id, &opts)?
        }
    };

    let grade_label = Grade::parse(&card.overall_grade).map(Grade::label);
    let total_students = match &class_id {
        Some(cid) => count_active_students(conn, cid)?,
        None => 0,
    };

    Ok(json!({
        "student": student_header(conn, &student_id)?,
        "exam": exam,
        "reportCard": card,
        "created": created,
        "gradeLabel": grade_label,
        "results": results::results_for(conn, &student_id, &exam_id)?,
        "totalStudents": total_students,
    }))
}

fn reports_class_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let class_id = required_str(params, "classId")?;
    let exam = exam_header(conn, &exam_id)?;
    require_row(conn, "classes", &class_id, "class")?;

    let cards = calc::list_report_cards_for_class(conn, &exam_id, &class_id)?;
    let mut rows = Vec::with_capacity(cards.len());
    for card in &cards {
        rows.push(json!({
            "student": student_header(conn, &card.student_id)?,
            "reportCard": card,
        }));
    }
    Ok(json!({
        "exam": exam,
        "classId": class_id,
        "totalStudents": count_active_students(conn, &class_id)?,
        "reportCards": rows,
    }))
}

/// Entry progress per scheduled class: how many of the expected
/// (student, subject) results exist and how many cards were generated.
fn reports_processing(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = required_str(params, "examId")?;
    let exam = exam_header(conn, &exam_id)?;

    let classes: Vec<(String, String, String)> = {
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT c.id, c.name, c.stream
                 FROM exam_schedules es
                 JOIN classes c ON c.id = es.class_id
                 WHERE es.exam_id = ? AND es.status <> 'CANCELLED'
                 ORDER BY c.name, c.stream",
            )
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([&exam_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        rows
    };

    let mut out = Vec::with_capacity(classes.len());
    for (class_id, name, stream) in classes {
        let students = count_active_students(conn, &class_id)?;
        let subjects = results::sheet_subjects(conn, &exam_id, &class_id)?.len() as i64;
        let expected = students * subjects;
        let entered: i64 = conn
            .query_row(
                "SELECT COUNT(*)
                 FROM results r
                 JOIN students s ON s.id = r.student_id
                 WHERE r.exam_id = ? AND s.class_id = ? AND s.is_active = 1",
                (&exam_id, &class_id),
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?;
        let generated: i64 = conn
            .query_row(
                "SELECT COUNT(*)
                 FROM report_cards rc
                 JOIN students s ON s.id = rc.student_id
                 WHERE rc.exam_id = ? AND s.class_id = ? AND s.is_active = 1",
                (&exam_id, &class_id),
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?;
        out.push(json!({
            "classId": class_id,
            "className": name,
            "stream": stream,
            "studentCount": students,
            "subjectCount": subjects,
            "resultsExpected": expected,
            "resultsEntered": entered,
            "resultsPending": (expected - entered).max(0),
            "completionPercentage": calc::round_2(calc::percent_of(entered as f64, expected as f64)),
            "reportsGenerated": generated,
        }));
    }

    Ok(json!({ "exam": exam, "classes": out }))
}

fn comment_field(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let v = optional_str(params, key)?;
    if let Some(s) = &v {
        if s.chars().count() > COMMENT_MAX_CHARS {
            return Err(HandlerErr::bad_params(format!(
                "{} must be at most {} characters",
                key, COMMENT_MAX_CHARS
            )));
        }
    }
    Ok(v)
}

fn reports_update_comments(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let exam_id = required_str(params, "examId")?;
    let remarks = comment_field(params, "remarks")?;
    let teacher = comment_field(params, "teacherComment")?;
    let principal = comment_field(params, "principalComment")?;

    let Some(card) = calc::load_report_card(conn, &student_id, &exam_id)? else {
        return Err(HandlerErr::not_found("report card not found")
            .with_details(json!({ "studentId": student_id, "examId": exam_id })));
    };
    conn.execute(
        "UPDATE report_cards
         SET remarks = COALESCE(?, remarks),
             teacher_comment = COALESCE(?, teacher_comment),
             principal_comment = COALESCE(?, principal_comment)
         WHERE id = ?",
        (&remarks, &teacher, &principal, &card.id),
    )
    .map_err(|e| HandlerErr::update("report_cards", e))?;

    let updated = calc::load_report_card(conn, &student_id, &exam_id)?;
    Ok(json!({ "reportCard": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "reports.generateOne" => reports_generate_one,
            "reports.generateClass" => reports_generate_class,
            "reports.calculateRanks" => reports_calculate_ranks,
            "reports.reportCard" => reports_report_card,
            "reports.classList" => reports_class_list,
            "reports.processing" => reports_processing,
            "reports.updateComments" => reports_update_comments,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use uuid::Uuid;

/// Credit hours every subject carries when computing a GPA.
pub const DEFAULT_CREDITS_PER_SUBJECT: f64 = 3.0;

/// Class level that gets a GPA on its report cards.
pub const GPA_LEVEL: &str = "UNIVERSITY";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub credits_per_subject: f64,
    /// Count `Late` days towards attendance_days alongside `Present`.
    pub late_counts_as_present: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            credits_per_subject: DEFAULT_CREDITS_PER_SUBJECT,
            late_counts_as_present: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    pub const ALL: [Grade; 6] = [Grade::A, Grade::B, Grade::C, Grade::D, Grade::E, Grade::F];

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Grade> {
        let t = s.trim();
        Grade::ALL
            .iter()
            .copied()
            .find(|g| g.as_str().eq_ignore_ascii_case(t))
    }

    pub fn label(self) -> &'static str {
        match self {
            Grade::A => "Excellent",
            Grade::B => "Very Good",
            Grade::C => "Good",
            Grade::D => "Satisfactory",
            Grade::E => "Pass",
            Grade::F => "Fail",
        }
    }
}

/// Letter grade for a percentage. Bands are closed at the bottom:
/// 80 is an A, 79.99 is a B.
pub fn calculate_grade(percentage: f64) -> Grade {
    if percentage >= 80.0 {
        Grade::A
    } else if percentage >= 70.0 {
        Grade::B
    } else if percentage >= 60.0 {
        Grade::C
    } else if percentage >= 50.0 {
        Grade::D
    } else if percentage >= 40.0 {
        Grade::E
    } else {
        Grade::F
    }
}

/// 4.0-scale grade point, same bands as [`calculate_grade`].
pub fn grade_point(percentage: f64) -> f64 {
    match calculate_grade(percentage) {
        Grade::A => 4.0,
        Grade::B => 3.5,
        Grade::C => 3.0,
        Grade::D => 2.5,
        Grade::E => 2.0,
        Grade::F => 0.0,
    }
}

pub fn percent_of(obtained: f64, max: f64) -> f64 {
    if max == 0.0 {
        return 0.0;
    }
    obtained / max * 100.0
}

pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectResult {
    pub marks_obtained: f64,
    pub max_marks: f64,
    pub is_absent: bool,
}

impl SubjectResult {
    pub fn percentage(&self) -> f64 {
        percent_of(self.marks_obtained, self.max_marks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Totals {
    pub total_marks: f64,
    pub marks_obtained: f64,
    /// Unrounded; callers round when persisting.
    pub percentage: f64,
    pub counted: usize,
}

/// Sums every non-absent result. No results means zero totals, not an error.
pub fn calculate_totals<'a, I>(results: I) -> Totals
where
    I: IntoIterator<Item = &'a SubjectResult>,
{
    let mut t = Totals::default();
    for r in results.into_iter().filter(|r| !r.is_absent) {
        t.total_marks += r.max_marks;
        t.marks_obtained += r.marks_obtained;
        t.counted += 1;
    }
    t.percentage = percent_of(t.marks_obtained, t.total_marks);
    t
}

/// Credit-weighted grade point average over non-absent results, rounded to
/// two decimals. Every subject carries the same `credits`.
pub fn calculate_gpa<'a, I>(results: I, credits: f64) -> f64
where
    I: IntoIterator<Item = &'a SubjectResult>,
{
    let mut total_points = 0.0;
    let mut total_credits = 0.0;
    for r in results.into_iter().filter(|r| !r.is_absent) {
        total_points += grade_point(r.percentage()) * credits;
        total_credits += credits;
    }
    if total_credits <= 0.0 {
        return 0.0;
    }
    round_2(total_points / total_credits)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub report_card_id: String,
    pub percentage: f64,
    /// Orders equal percentages. Any stable key will do; callers pass the
    /// admission number.
    pub tie_key: String,
}

/// Orders by percentage descending and numbers 1..=N with no gaps and no
/// shared positions.
pub fn assign_positions(mut standings: Vec<Standing>) -> Vec<(String, i64)> {
    standings.sort_by(|a, b| {
        b.percentage
            .partial_cmp(&a.percentage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.tie_key.cmp(&b.tie_key))
    });
    standings
        .into_iter()
        .enumerate()
        .map(|(i, s)| (s.report_card_id, i as i64 + 1))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardModel {
    pub id: String,
    pub student_id: String,
    pub exam_id: String,
    pub total_marks: f64,
    pub marks_obtained: f64,
    pub percentage: f64,
    pub overall_grade: String,
    pub gpa: Option<f64>,
    pub rank: Option<i64>,
    pub class_position: Option<i64>,
    pub remarks: String,
    pub teacher_comment: String,
    pub principal_comment: String,
    pub attendance_days: Option<i64>,
    pub total_school_days: Option<i64>,
    pub generated_at: Option<String>,
}

const REPORT_CARD_COLUMNS: &str = "id, student_id, exam_id, total_marks, marks_obtained, percentage,
     overall_grade, gpa, rank, class_position, remarks, teacher_comment, principal_comment,
     attendance_days, total_school_days, generated_at";

fn report_card_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ReportCardModel> {
    Ok(ReportCardModel {
        id: r.get(0)?,
        student_id: r.get(1)?,
        exam_id: r.get(2)?,
        total_marks: r.get(3)?,
        marks_obtained: r.get(4)?,
        percentage: r.get(5)?,
        overall_grade: r.get(6)?,
        gpa: r.get(7)?,
        rank: r.get(8)?,
        class_position: r.get(9)?,
        remarks: r.get(10)?,
        teacher_comment: r.get(11)?,
        principal_comment: r.get(12)?,
        attendance_days: r.get(13)?,
        total_school_days: r.get(14)?,
        generated_at: r.get(15)?,
    })
}

pub fn load_report_card(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
) -> Result<Option<ReportCardModel>, CalcError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM report_cards WHERE student_id = ? AND exam_id = ?",
            REPORT_CARD_COLUMNS
        ),
        (student_id, exam_id),
        report_card_from_row,
    )
    .optional()
    .map_err(CalcError::db)
}

pub fn list_report_cards_for_class(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
) -> Result<Vec<ReportCardModel>, CalcError> {
    let cols = REPORT_CARD_COLUMNS
        .split(',')
        .map(|c| format!("rc.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}
             FROM report_cards rc
             JOIN students s ON s.id = rc.student_id
             WHERE rc.exam_id = ? AND s.class_id = ?
             ORDER BY rc.class_position IS NULL, rc.class_position, s.admission_number",
            cols
        ))
        .map_err(CalcError::db)?;
    stmt.query_map((exam_id, class_id), report_card_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)
}

/// Returns the card id and whether it was created by this call.
pub fn ensure_report_card(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
) -> Result<(String, bool), CalcError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM report_cards WHERE student_id = ? AND exam_id = ?",
            (student_id, exam_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    if let Some(id) = existing {
        return Ok((id, false));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO report_cards(id, student_id, exam_id) VALUES(?, ?, ?)",
        (&id, student_id, exam_id),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    Ok((id, true))
}

fn load_subject_results(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
) -> Result<Vec<SubjectResult>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT marks_obtained, max_marks, is_absent
             FROM results
             WHERE student_id = ? AND exam_id = ?",
        )
        .map_err(CalcError::db)?;
    stmt.query_map((student_id, exam_id), |r| {
        Ok(SubjectResult {
            marks_obtained: r.get(0)?,
            max_marks: r.get::<_, i64>(1)? as f64,
            is_absent: r.get::<_, i64>(2)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

fn student_class_level(conn: &Connection, student_id: &str) -> Result<Option<String>, CalcError> {
    conn.query_row(
        "SELECT c.level
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(CalcError::db)
}

/// (attended, recorded) days for the student from the start of the exam's
/// academic year through the exam's last day.
fn attendance_window(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
    late_counts_as_present: bool,
) -> Result<(i64, i64), CalcError> {
    let window: Option<(String, String)> = conn
        .query_row(
            "SELECT ay.start_date, e.end_date
             FROM exams e
             JOIN academic_years ay ON ay.id = e.academic_year_id
             WHERE e.id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some((from, to)) = window else {
        return Ok((0, 0));
    };
    conn.query_row(
        "SELECT
           COALESCE(SUM(CASE
             WHEN status = 'Present' THEN 1
             WHEN status = 'Late' AND ?4 THEN 1
             ELSE 0 END), 0),
           COUNT(*)
         FROM attendance
         WHERE student_id = ?1 AND date >= ?2 AND date <= ?3",
        (student_id, &from, &to, late_counts_as_present),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .map_err(CalcError::db)
}

/// Get-or-create the card for (student, exam) and rewrite its totals,
/// grade, GPA and attendance from the current results. Rank and position
/// are left alone; they belong to [`calculate_ranks`].
pub fn generate_report_card(
    conn: &Connection,
    student_id: &str,
    exam_id: &str,
    opts: &GenerationOptions,
) -> Result<ReportCardModel, CalcError> {
    let (card_id, created) = ensure_report_card(conn, student_id, exam_id)?;

    let results = load_subject_results(conn, student_id, exam_id)?;
    let totals = calculate_totals(&results);
    let percentage = round_2(totals.percentage);
    let overall_grade = calculate_grade(percentage);

    let level = student_class_level(conn, student_id)?;
    let gpa = match level.as_deref() {
        Some(l) if l.eq_ignore_ascii_case(GPA_LEVEL) => {
            Some(calculate_gpa(&results, opts.credits_per_subject))
        }
        _ => None,
    };
    let (attended, recorded) =
        attendance_window(conn, student_id, exam_id, opts.late_counts_as_present)?;

    conn.execute(
        "UPDATE report_cards
         SET total_marks = ?, marks_obtained = ?, percentage = ?, overall_grade = ?, gpa = ?,
             attendance_days = ?, total_school_days = ?, generated_at = ?
         WHERE id = ?",
        rusqlite::params![
            totals.total_marks,
            totals.marks_obtained,
            percentage,
            overall_grade.as_str(),
            gpa,
            attended,
            recorded,
            crate::db::now_timestamp(),
            &card_id,
        ],
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;

    tracing::debug!(
        student_id,
        exam_id,
        created,
        counted = totals.counted,
        percentage,
        "report card generated"
    );

    load_report_card(conn, student_id, exam_id)?
        .ok_or_else(|| CalcError::new("not_found", "report card vanished after update"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailure {
    pub student_id: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGeneration {
    pub generated: usize,
    pub failed: Vec<GenerationFailure>,
}

/// Generates a card for every active student currently in the class. A
/// failing student is recorded and skipped; the rest still commit.
pub fn generate_class_report_cards(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
    opts: &GenerationOptions,
) -> Result<ClassGeneration, CalcError> {
    let student_ids: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM students
                 WHERE class_id = ? AND is_active = 1
                 ORDER BY admission_number",
            )
            .map_err(CalcError::db)?;
        let ids = stmt
            .query_map([class_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CalcError::db)?;
        ids
    };

    let mut tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    let mut out = ClassGeneration {
        generated: 0,
        failed: Vec::new(),
    };
    for sid in &student_ids {
        // Dropping an uncommitted savepoint undoes a half-written card.
        let sp = tx
            .savepoint()
            .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
        match generate_report_card(&sp, sid, exam_id, opts) {
            Ok(_) => {
                sp.commit()
                    .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;
                out.generated += 1;
            }
            Err(e) => {
                tracing::warn!(student_id = %sid, code = e.code, message = %e.message, "report card skipped");
                out.failed.push(GenerationFailure {
                    student_id: sid.clone(),
                    code: e.code,
                    message: e.message,
                });
            }
        }
    }
    tx.commit()
        .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankPass {
    pub class_positions_assigned: usize,
    pub exam_ranks_assigned: usize,
}

fn load_standings(
    conn: &Connection,
    exam_id: &str,
    class_id: Option<&str>,
) -> Result<Vec<Standing>, CalcError> {
    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(Standing {
            report_card_id: r.get(0)?,
            percentage: r.get(1)?,
            tie_key: r.get(2)?,
        })
    };
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn
                .prepare(
                    "SELECT rc.id, rc.percentage, s.admission_number
                     FROM report_cards rc
                     JOIN students s ON s.id = rc.student_id
                     WHERE rc.exam_id = ? AND s.class_id = ?",
                )
                .map_err(CalcError::db)?;
            let v = stmt
                .query_map((exam_id, cid), map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            v
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT rc.id, rc.percentage, s.admission_number
                     FROM report_cards rc
                     JOIN students s ON s.id = rc.student_id
                     WHERE rc.exam_id = ?",
                )
                .map_err(CalcError::db)?;
            let v = stmt
                .query_map([exam_id], map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            v
        }
    };
    rows.map_err(CalcError::db)
}

/// Rewrites `class_position` for the class's cards and `rank` across every
/// card of the exam. Both passes commit together or not at all.
pub fn calculate_ranks(
    conn: &Connection,
    exam_id: &str,
    class_id: &str,
) -> Result<RankPass, CalcError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    let class_positions = assign_positions(load_standings(&tx, exam_id, Some(class_id))?);
    for (card_id, pos) in &class_positions {
        tx.execute(
            "UPDATE report_cards SET class_position = ? WHERE id = ?",
            (pos, card_id),
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    }

    let exam_ranks = assign_positions(load_standings(&tx, exam_id, None)?);
    for (card_id, rank) in &exam_ranks {
        tx.execute(
            "UPDATE report_cards SET rank = ? WHERE id = ?",
            (rank, card_id),
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        exam_id,
        class_id,
        class_positions = class_positions.len(),
        exam_ranks = exam_ranks.len(),
        "ranks recalculated"
    );
    Ok(RankPass {
        class_positions_assigned: class_positions.len(),
        exam_ranks_assigned: exam_ranks.len(),
    })
}

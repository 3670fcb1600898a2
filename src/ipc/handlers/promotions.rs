use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{optional_str, parse_choice, require_row, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const PROMOTION_STATUSES: &[&str] = &["PROMOTED", "DETAINED", "GRADUATED"];

fn promotions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = optional_str(params, "classId")?.filter(|s| !s.is_empty());
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.student_id, s.admission_number, s.first_name, s.last_name,
                    p.from_class_id, fc.name, p.to_class_id, tc.name,
                    p.from_academic_year_id, p.to_academic_year_id, p.status, p.remarks,
                    p.promoted_on
             FROM promotions p
             JOIN students s ON s.id = p.student_id
             JOIN classes fc ON fc.id = p.from_class_id
             LEFT JOIN classes tc ON tc.id = p.to_class_id
             WHERE (?1 IS NULL OR p.from_class_id = ?1 OR p.to_class_id = ?1)
             ORDER BY p.promoted_on DESC, s.admission_number",
        )
        .map_err(HandlerErr::query)?;
    let promotions = stmt
        .query_map([&class_id], |r| {
            let first: String = r.get(3)?;
            let last: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "admissionNumber": r.get::<_, String>(2)?,
                "displayName": format!("{}, {}", last, first),
                "fromClassId": r.get::<_, String>(5)?,
                "fromClassName": r.get::<_, String>(6)?,
                "toClassId": r.get::<_, Option<String>>(7)?,
                "toClassName": r.get::<_, Option<String>>(8)?,
                "fromAcademicYearId": r.get::<_, String>(9)?,
                "toAcademicYearId": r.get::<_, String>(10)?,
                "status": r.get::<_, String>(11)?,
                "remarks": r.get::<_, String>(12)?,
                "promotedOn": r.get::<_, String>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "promotions": promotions }))
}

struct PromotionPlan<'a> {
    from_class_id: &'a str,
    to_class_id: Option<&'a str>,
    to_academic_year_id: &'a str,
    status: &'static str,
    remarks: &'a str,
    promoted_on: String,
}

/// Records one promotion. Only `PROMOTED` moves the student; detained and
/// graduated students keep their class and year.
fn promote_one(conn: &Connection, plan: &PromotionPlan<'_>, student_id: &str) -> Result<String, HandlerErr> {
    let row: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT class_id, academic_year_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((current_class, from_year)) = row else {
        return Err(HandlerErr::not_found("student not found"));
    };
    if current_class.as_deref() != Some(plan.from_class_id) {
        return Err(HandlerErr::bad_params("student is not in fromClassId"));
    }

    let promotion_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO promotions(id, student_id, from_class_id, to_class_id,
                                from_academic_year_id, to_academic_year_id, status, remarks,
                                promoted_on)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &promotion_id,
            student_id,
            plan.from_class_id,
            plan.to_class_id,
            &from_year,
            plan.to_academic_year_id,
            plan.status,
            plan.remarks,
            &plan.promoted_on,
        ),
    )
    .map_err(|e| HandlerErr::insert("promotions", e))?;

    if plan.status == "PROMOTED" {
        conn.execute(
            "UPDATE students SET class_id = ?, academic_year_id = ?, updated_at = ? WHERE id = ?",
            (
                plan.to_class_id,
                plan.to_academic_year_id,
                db::now_timestamp(),
                student_id,
            ),
        )
        .map_err(|e| HandlerErr::update("students", e))?;
    }
    Ok(promotion_id)
}

fn active_students(conn: &Connection, class_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM students
             WHERE class_id = ? AND is_active = 1
             ORDER BY admission_number",
        )
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([class_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<String>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(ids)
}

fn promotions_bulk(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let from_class_id = required_str(params, "fromClassId")?;
    let to_academic_year_id = required_str(params, "toAcademicYearId")?;
    let status = parse_choice(&required_str(params, "status")?, "status", PROMOTION_STATUSES)?;
    let remarks = optional_str(params, "remarks")?.unwrap_or_default();
    let to_class_id = match status {
        // Graduates leave the school; a destination class is dropped.
        "GRADUATED" => None,
        _ => optional_str(params, "toClassId")?.filter(|s| !s.is_empty()),
    };
    if status == "PROMOTED" && to_class_id.is_none() {
        return Err(HandlerErr::bad_params("promoted students must have a toClassId"));
    }
    require_row(conn, "classes", &from_class_id, "class")?;
    require_row(conn, "academic_years", &to_academic_year_id, "academic year")?;
    if let Some(cid) = &to_class_id {
        require_row(conn, "classes", cid, "class")?;
    }

    let student_ids: Vec<String> = match params.get("studentIds") {
        None | Some(serde_json::Value::Null) => active_students(conn, &from_class_id)?,
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| HandlerErr::bad_params("studentIds must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(HandlerErr::bad_params("studentIds must be an array")),
    };

    let plan = PromotionPlan {
        from_class_id: &from_class_id,
        to_class_id: to_class_id.as_deref(),
        to_academic_year_id: &to_academic_year_id,
        status,
        remarks: &remarks,
        promoted_on: chrono::Local::now().date_naive().to_string(),
    };

    let mut tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut processed = 0usize;
    let mut errors = Vec::new();
    for (index, sid) in student_ids.iter().enumerate() {
        // A failed record rolls back to its savepoint when `sp` drops.
        let sp = tx
            .savepoint()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        match promote_one(&sp, &plan, sid) {
            Ok(_) => {
                sp.commit()
                    .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
                processed += 1;
            }
            Err(e) => errors.push(json!({
                "index": index,
                "studentId": sid,
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        from_class_id = %from_class_id,
        status,
        processed,
        skipped = errors.len(),
        "promotions recorded"
    );
    Ok(json!({
        "status": status,
        "processed": processed,
        "skipped": errors.len(),
        "errors": errors,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "promotions.list" => promotions_list,
            "promotions.bulk" => promotions_bulk,
            _ => return None,
        };
    Some(respond(&req.id, state.conn().and_then(|c| f(c, &req.params))))
}

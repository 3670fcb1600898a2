mod common;

use common::{add_student, seed_school, Sidecar};
use serde_json::json;

fn next_year_with_class(sc: &mut Sidecar) -> (String, String) {
    let year = sc.ok(
        "academicYears.create",
        json!({ "name": "2025", "startDate": "2025-01-06", "endDate": "2025-11-28" }),
    )["academicYearId"]
        .as_str()
        .expect("academicYearId")
        .to_string();
    let class = sc.ok(
        "classes.create",
        json!({ "name": "Form 3", "stream": "East", "level": "SECONDARY", "academicYearId": year }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    (year, class)
}

#[test]
fn promoting_a_class_moves_every_active_student() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-promotions-all");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    add_student(&mut sc, &school, "ADM002", "Brian");
    let gone = add_student(&mut sc, &school, "ADM003", "Chebet");
    sc.ok(
        "students.update",
        json!({ "studentId": gone, "patch": { "isActive": false } }),
    );
    let (year, form3) = next_year_with_class(&mut sc);

    let out = sc.ok(
        "promotions.bulk",
        json!({
            "fromClassId": school.class_id,
            "toClassId": form3,
            "toAcademicYearId": year,
            "status": "promoted"
        }),
    );
    assert_eq!(out["processed"], 2);
    assert_eq!(out["skipped"], 0);

    let moved = sc.ok("students.list", json!({ "classId": form3 }));
    let moved = moved["students"].as_array().expect("students");
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|s| s["academicYearId"] == json!(year)));
    let left = sc.ok("students.list", json!({ "classId": school.class_id }));
    assert_eq!(left["students"].as_array().map(|v| v.len()), Some(1));

    let history = sc.ok("promotions.list", json!({ "classId": form3 }));
    let history = history["promotions"].as_array().expect("promotions");
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|p| p["studentId"] == json!(a)));
    assert_eq!(history[0]["fromAcademicYearId"], json!(school.year_id));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn detained_and_graduated_students_stay_put() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-promotions-stay");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");
    let (year, form3) = next_year_with_class(&mut sc);

    let out = sc.ok(
        "promotions.bulk",
        json!({
            "fromClassId": school.class_id,
            "toClassId": form3,
            "toAcademicYearId": year,
            "status": "DETAINED",
            "studentIds": [a],
            "remarks": "repeat the year"
        }),
    );
    assert_eq!(out["processed"], 1);
    let out = sc.ok(
        "promotions.bulk",
        json!({
            "fromClassId": school.class_id,
            "toClassId": form3,
            "toAcademicYearId": year,
            "status": "GRADUATED",
            "studentIds": [b]
        }),
    );
    assert_eq!(out["processed"], 1);

    let still = sc.ok("students.list", json!({ "classId": school.class_id }));
    assert_eq!(still["students"].as_array().map(|v| v.len()), Some(2));

    let history = sc.ok("promotions.list", json!({ "classId": school.class_id }));
    let graduated = history["promotions"]
        .as_array()
        .expect("promotions")
        .iter()
        .find(|p| p["status"] == "GRADUATED")
        .expect("graduation record")
        .clone();
    assert!(graduated["toClassId"].is_null());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn promotion_requires_destination_and_skips_strangers() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-promotions-errors");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let (year, form3) = next_year_with_class(&mut sc);

    assert_eq!(
        sc.err_code(
            "promotions.bulk",
            json!({
                "fromClassId": school.class_id,
                "toAcademicYearId": year,
                "status": "PROMOTED"
            }),
        ),
        "bad_params"
    );

    let out = sc.ok(
        "promotions.bulk",
        json!({
            "fromClassId": school.class_id,
            "toClassId": form3,
            "toAcademicYearId": year,
            "status": "PROMOTED",
            "studentIds": ["ghost", a]
        }),
    );
    assert_eq!(out["processed"], 1);
    assert_eq!(out["skipped"], 1);
    assert_eq!(out["errors"][0]["studentId"], "ghost");
    assert_eq!(out["errors"][0]["code"], "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn a_record_that_fails_midway_is_not_kept() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-promotions-rollback");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");
    let (year, form3) = next_year_with_class(&mut sc);

    // The history insert for Brian succeeds but moving him is refused.
    let db = rusqlite::Connection::open(workspace.join("school.sqlite3")).expect("open db");
    db.execute_batch(&format!(
        "CREATE TRIGGER pin_student BEFORE UPDATE OF class_id ON students
         WHEN NEW.id = '{}'
         BEGIN SELECT RAISE(ABORT, 'student pinned'); END;",
        b
    ))
    .expect("create trigger");
    drop(db);

    let out = sc.ok(
        "promotions.bulk",
        json!({
            "fromClassId": school.class_id,
            "toClassId": form3,
            "toAcademicYearId": year,
            "status": "PROMOTED"
        }),
    );
    assert_eq!(out["processed"], 1);
    assert_eq!(out["skipped"], 1);
    assert_eq!(out["errors"][0]["studentId"], json!(b));

    let history = sc.ok("promotions.list", json!({ "classId": school.class_id }));
    let history = history["promotions"].as_array().expect("promotions");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["studentId"], json!(a));

    let still = sc.ok("students.list", json!({ "classId": school.class_id }));
    assert_eq!(still["students"][0]["id"], json!(b));

    let _ = std::fs::remove_dir_all(workspace);
}

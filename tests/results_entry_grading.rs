mod common;

use common::{add_student, save_marks, seed_school, Sidecar};
use serde_json::json;

#[test]
fn saved_marks_get_grades_from_percentage_bands() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-results-grades");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");
    let c = add_student(&mut sc, &school, "ADM003", "Chebet");

    let out = save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([
            { "studentId": a, "marks": 80 },
            { "studentId": b, "marks": "79.5" },
            { "studentId": c, "marks": 39 }
        ]),
    );
    assert_eq!(out["saved"], 3);
    assert_eq!(out["skipped"], 0);
    assert_eq!(out["maxMarks"], 100);

    let res = sc.ok("results.forStudent", json!({ "studentId": a }));
    assert_eq!(res["results"][0]["grade"], "A");
    assert_eq!(res["results"][0]["isPass"], true);
    let res = sc.ok("results.forStudent", json!({ "studentId": b }));
    assert_eq!(res["results"][0]["grade"], "B");
    let res = sc.ok("results.forStudent", json!({ "studentId": c }));
    assert_eq!(res["results"][0]["grade"], "F");
    assert_eq!(res["results"][0]["isPass"], false);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_entries_are_skipped_and_counted() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-results-skip");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");

    let out = save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([
            { "studentId": a, "marks": 55 },
            { "studentId": b, "marks": "abc" },
            { "studentId": "no-such-student", "marks": 10 },
            { "studentId": b, "marks": 101 },
            { "studentId": b, "marks": -1 },
            { "marks": 10 }
        ]),
    );
    assert_eq!(out["saved"], 1);
    assert_eq!(out["skipped"], 5);
    let errors = out["errors"].as_array().expect("errors");
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[0]["code"], "bad_params");
    assert_eq!(errors[1]["code"], "not_found");

    let sheet = sc.ok(
        "results.sheet",
        json!({ "examId": school.exam_id, "classId": school.class_id }),
    );
    assert_eq!(sheet["totalExpected"], 4);
    assert_eq!(sheet["totalEntered"], 1);
    assert_eq!(sheet["completionPercentage"], 25.0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn absent_results_have_no_grade_and_manual_grades_survive() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-results-absent");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");

    save_marks(
        &mut sc,
        &school,
        &school.english_id,
        json!([
            { "studentId": a, "isAbsent": true, "marks": 90 },
            { "studentId": b, "marks": 45, "grade": "c", "remarks": "moderated" }
        ]),
    );

    let res = sc.ok("results.forStudent", json!({ "studentId": a }));
    let row = &res["results"][0];
    assert_eq!(row["isAbsent"], true);
    assert_eq!(row["grade"], "");
    assert_eq!(row["marksObtained"], 0.0);

    let res = sc.ok("results.forStudent", json!({ "studentId": b }));
    assert_eq!(res["results"][0]["grade"], "C");
    assert_eq!(res["results"][0]["remarks"], "moderated");

    // Re-saving overwrites the same row instead of adding another.
    save_marks(
        &mut sc,
        &school,
        &school.english_id,
        json!([{ "studentId": b, "marks": 72 }]),
    );
    let res = sc.ok("results.forStudent", json!({ "studentId": b }));
    assert_eq!(res["results"].as_array().map(|v| v.len()), Some(1));
    assert_eq!(res["results"][0]["grade"], "B");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_outside_the_class_are_rejected() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-results-class");
    let school = seed_school(&mut sc, "SECONDARY");
    let other_class = sc.ok(
        "classes.create",
        json!({ "name": "Form 3", "level": "SECONDARY", "academicYearId": school.year_id }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let outsider = sc.ok(
        "students.create",
        json!({ "firstName": "Daudi", "lastName": "Kamau", "classId": other_class }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let out = save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([{ "studentId": outsider, "marks": 50 }]),
    );
    assert_eq!(out["saved"], 0);
    assert_eq!(out["errors"][0]["message"], "student is not in this class");

    let _ = std::fs::remove_dir_all(workspace);
}

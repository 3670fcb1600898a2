mod common;

use common::{add_student, save_marks, seed_school, Sidecar};
use serde_json::json;
use std::collections::HashMap;

fn positions(sc: &mut Sidecar, exam_id: &str, class_id: &str) -> HashMap<String, (i64, i64)> {
    let list = sc.ok(
        "reports.classList",
        json!({ "examId": exam_id, "classId": class_id }),
    );
    list["reportCards"]
        .as_array()
        .expect("reportCards")
        .iter()
        .map(|row| {
            (
                row["student"]["admissionNumber"]
                    .as_str()
                    .expect("admissionNumber")
                    .to_string(),
                (
                    row["reportCard"]["classPosition"].as_i64().expect("classPosition"),
                    row["reportCard"]["rank"].as_i64().expect("rank"),
                ),
            )
        })
        .collect()
}

#[test]
fn ranks_are_dense_descending_and_tie_broken_by_admission_number() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-ranks");
    let school = seed_school(&mut sc, "SECONDARY");
    let s3 = add_student(&mut sc, &school, "ADM003", "Chebet");
    let s1 = add_student(&mut sc, &school, "ADM001", "Amina");
    let s2 = add_student(&mut sc, &school, "ADM002", "Brian");
    let s4 = add_student(&mut sc, &school, "ADM004", "Daudi");
    save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([
            { "studentId": s1, "marks": 60 },
            { "studentId": s2, "marks": 92 },
            { "studentId": s3, "marks": 60 },
            { "studentId": s4, "marks": 15 }
        ]),
    );
    sc.ok(
        "reports.generateClass",
        json!({ "examId": school.exam_id, "classId": school.class_id }),
    );
    let pass = sc.ok(
        "reports.calculateRanks",
        json!({ "examId": school.exam_id, "classId": school.class_id }),
    );
    assert_eq!(pass["classPositionsAssigned"], 4);
    assert_eq!(pass["examRanksAssigned"], 4);

    let p = positions(&mut sc, &school.exam_id, &school.class_id);
    assert_eq!(p["ADM002"], (1, 1));
    assert_eq!(p["ADM001"], (2, 2));
    assert_eq!(p["ADM003"], (3, 3));
    assert_eq!(p["ADM004"], (4, 4));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exam_rank_spans_classes_while_position_stays_in_class() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-ranks-cross");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");
    save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([{ "studentId": a, "marks": 70 }, { "studentId": b, "marks": 40 }]),
    );

    let west = sc.ok(
        "classes.create",
        json!({
            "name": "Form 2",
            "stream": "West",
            "level": "SECONDARY",
            "academicYearId": school.year_id
        }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    sc.ok(
        "classSubjects.assign",
        json!({ "classId": west, "subjectId": school.math_id }),
    );
    let c = sc.ok(
        "students.create",
        json!({ "firstName": "Chebet", "lastName": "Wanjiru", "admissionNumber": "ADM010", "classId": west }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    sc.ok(
        "results.save",
        json!({
            "examId": school.exam_id,
            "classId": west,
            "subjectId": school.math_id,
            "results": [{ "studentId": c, "marks": 55 }]
        }),
    );

    for class_id in [&school.class_id, &west] {
        sc.ok(
            "reports.generateClass",
            json!({ "examId": school.exam_id, "classId": class_id }),
        );
    }
    sc.ok(
        "reports.calculateRanks",
        json!({ "examId": school.exam_id, "classId": school.class_id }),
    );
    sc.ok(
        "reports.calculateRanks",
        json!({ "examId": school.exam_id, "classId": west }),
    );

    let east = positions(&mut sc, &school.exam_id, &school.class_id);
    assert_eq!(east["ADM001"], (1, 1));
    assert_eq!(east["ADM002"], (2, 3));
    let west_p = positions(&mut sc, &school.exam_id, &west);
    assert_eq!(west_p["ADM010"], (1, 2));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn auto_rank_setting_ranks_after_class_generation() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-ranks-auto");
    let school = seed_school(&mut sc, "SECONDARY");
    let a = add_student(&mut sc, &school, "ADM001", "Amina");
    let b = add_student(&mut sc, &school, "ADM002", "Brian");
    save_marks(
        &mut sc,
        &school,
        &school.math_id,
        json!([{ "studentId": a, "marks": 30 }, { "studentId": b, "marks": 88 }]),
    );
    sc.ok(
        "setup.update",
        json!({ "section": "results", "patch": { "autoRankAfterGenerate": true } }),
    );

    let out = sc.ok(
        "reports.generateClass",
        json!({ "examId": school.exam_id, "classId": school.class_id }),
    );
    assert_eq!(out["ranks"]["classPositionsAssigned"], 2);
    let p = positions(&mut sc, &school.exam_id, &school.class_id);
    assert_eq!(p["ADM002"], (1, 1));
    assert_eq!(p["ADM001"], (2, 2));

    let _ = std::fs::remove_dir_all(workspace);
}

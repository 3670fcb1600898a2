mod common;

use common::Sidecar;
use serde_json::json;

#[test]
fn defaults_are_returned_for_a_fresh_workspace() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-setup-defaults");
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["school"]["country"], "Kenya");
    assert_eq!(setup["results"]["creditsPerSubject"], 3.0);
    assert_eq!(setup["results"]["autoRankAfterGenerate"], false);
    assert_eq!(setup["attendance"]["defaultRangeDays"], 30);
    assert_eq!(setup["attendance"]["countLateAsPresent"], false);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn patches_are_validated_and_persist_across_restarts() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-setup-patch");

    let out = sc.ok(
        "setup.update",
        json!({
            "section": "school",
            "patch": { "name": "Mlimani Secondary", "principalName": "J. Mwangi" }
        }),
    );
    assert_eq!(out["values"]["name"], "Mlimani Secondary");
    assert_eq!(out["values"]["country"], "Kenya");

    let rejects = [
        json!({ "section": "results", "patch": { "creditsPerSubject": 0 } }),
        json!({ "section": "results", "patch": { "autoRankAfterGenerate": "yes" } }),
        json!({ "section": "attendance", "patch": { "defaultRangeDays": 400 } }),
        json!({ "section": "attendance", "patch": { "colour": "blue" } }),
        json!({ "section": "fees", "patch": {} }),
        json!({ "section": "school" }),
    ];
    for params in rejects {
        assert_eq!(sc.err_code("setup.update", params), "bad_params");
    }

    sc.ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "defaultRangeDays": 14 } }),
    );
    drop(sc);

    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["school"]["principalName"], "J. Mwangi");
    assert_eq!(setup["attendance"]["defaultRangeDays"], 14);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn a_bad_saved_field_does_not_hide_the_good_ones() {
    let (mut sc, workspace) = Sidecar::with_workspace("schoold-setup-saved");
    sc.ok("setup.get", json!({}));

    let db = rusqlite::Connection::open(workspace.join("school.sqlite3")).expect("open db");
    db.execute(
        "INSERT INTO settings(key, value_json) VALUES('setup.attendance', ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        [json!({
            "colour": "blue",
            "countLateAsPresent": true,
            "defaultRangeDays": "lots"
        })
        .to_string()],
    )
    .expect("write saved settings");
    drop(db);

    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["attendance"]["countLateAsPresent"], true);
    assert_eq!(setup["attendance"]["defaultRangeDays"], 30);
    assert!(setup["attendance"].get("colour").is_none());

    let _ = std::fs::remove_dir_all(workspace);
}

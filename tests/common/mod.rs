use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawns the daemon and opens a fresh workspace in it.
    #[allow(dead_code)]
    pub fn with_workspace(prefix: &str) -> (Self, PathBuf) {
        let workspace = temp_dir(prefix);
        let mut sc = Self::spawn();
        sc.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        (sc, workspace)
    }

    pub fn send_line(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_line(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Sends a request that must succeed and returns its `result`.
    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params.clone());
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} {} failed: {}",
            method,
            params,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Sends a request that must fail and returns its error code.
    #[allow(dead_code)]
    pub fn err_code(&mut self, method: &str, params: Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Ids of a small school: one current year, one class, Math and English.
#[allow(dead_code)]
pub struct School {
    pub year_id: String,
    pub class_id: String,
    pub math_id: String,
    pub english_id: String,
    pub exam_id: String,
}

#[allow(dead_code)]
pub fn seed_school(sc: &mut Sidecar, level: &str) -> School {
    let year_id = sc.ok(
        "academicYears.create",
        json!({
            "name": "2024",
            "startDate": "2024-01-08",
            "endDate": "2024-11-29",
            "isCurrent": true
        }),
    )["academicYearId"]
        .as_str()
        .expect("academicYearId")
        .to_string();
    let class_id = sc.ok(
        "classes.create",
        json!({
            "name": "Form 2",
            "level": level,
            "stream": "East",
            "academicYearId": year_id
        }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let math_id = sc.ok(
        "subjects.create",
        json!({ "name": "Mathematics", "code": "mat" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    let english_id = sc.ok(
        "subjects.create",
        json!({ "name": "English", "code": "eng" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    for sid in [&math_id, &english_id] {
        sc.ok(
            "classSubjects.assign",
            json!({ "classId": class_id, "subjectId": sid }),
        );
    }
    let exam_id = sc.ok(
        "exams.create",
        json!({
            "name": "Term 1 Final",
            "examType": "FINAL",
            "academicYearId": year_id,
            "term": "Term 1",
            "startDate": "2024-03-18",
            "endDate": "2024-03-22"
        }),
    )["examId"]
        .as_str()
        .expect("examId")
        .to_string();
    School {
        year_id,
        class_id,
        math_id,
        english_id,
        exam_id,
    }
}

#[allow(dead_code)]
pub fn add_student(sc: &mut Sidecar, school: &School, admission: &str, first: &str) -> String {
    sc.ok(
        "students.create",
        json!({
            "firstName": first,
            "lastName": "Otieno",
            "admissionNumber": admission,
            "classId": school.class_id
        }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string()
}

#[allow(dead_code)]
pub fn save_marks(sc: &mut Sidecar, school: &School, subject_id: &str, entries: Value) -> Value {
    sc.ok(
        "results.save",
        json!({
            "examId": school.exam_id,
            "classId": school.class_id,
            "subjectId": subject_id,
            "results": entries
        }),
    )
}

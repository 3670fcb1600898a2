use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Results,
    Attendance,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::School, Self::Results, Self::Attendance];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "results" => Some(Self::Results),
            "attendance" => Some(Self::Attendance),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Results => "results",
            Self::Attendance => "attendance",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Results => "setup.results",
            Self::Attendance => "setup.attendance",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "principalName": "",
            "country": "Kenya"
        }),
        SetupSection::Results => json!({
            "creditsPerSubject": calc::DEFAULT_CREDITS_PER_SUBJECT,
            "autoRankAfterGenerate": false
        }),
        SetupSection::Attendance => json!({
            "defaultRangeDays": 30,
            "countLateAsPresent": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be a boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max: usize) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be a string", key))?
        .trim()
        .to_string();
    if s.chars().count() > max {
        return Err(format!("{} must be at most {} characters", key, max));
    }
    Ok(s)
}

fn parse_int_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be an integer", key))?;
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

fn parse_number_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" | "principalName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "country" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 60)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Results => match k.as_str() {
                "creditsPerSubject" => {
                    obj.insert(k.clone(), json!(parse_number_range(v, k, 0.5, 10.0)?));
                }
                "autoRankAfterGenerate" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown results field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "defaultRangeDays" => {
                    obj.insert(k.clone(), json!(parse_int_range(v, k, 1, 366)?));
                }
                "countLateAsPresent" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Each saved field is merged on its own so one bad value keeps its default only.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &one) {
                    tracing::warn!(section = section.name(), error = %e, "ignoring bad saved setting");
                }
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct ResultsConfig {
    pub credits_per_subject: f64,
    pub auto_rank_after_generate: bool,
}

pub fn results_config(conn: &rusqlite::Connection) -> anyhow::Result<ResultsConfig> {
    let v = load_section(conn, SetupSection::Results)?;
    Ok(ResultsConfig {
        credits_per_subject: v
            .get("creditsPerSubject")
            .and_then(|x| x.as_f64())
            .unwrap_or(calc::DEFAULT_CREDITS_PER_SUBJECT),
        auto_rank_after_generate: v
            .get("autoRankAfterGenerate")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceConfig {
    pub default_range_days: i64,
    pub count_late_as_present: bool,
}

pub fn attendance_config(conn: &rusqlite::Connection) -> anyhow::Result<AttendanceConfig> {
    let v = load_section(conn, SetupSection::Attendance)?;
    Ok(AttendanceConfig {
        default_range_days: v
            .get("defaultRangeDays")
            .and_then(|x| x.as_i64())
            .unwrap_or(30),
        count_late_as_present: v
            .get("countLateAsPresent")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section.name(), "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

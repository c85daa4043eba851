#![allow(dead_code)]

use std::path::{Path, PathBuf};

use serde_json::json;

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const MONTHS: [(&str, i64); 4] = [("Jan", 1200), ("Jun", 800), ("Jul", 950), ("Aug", 5000)];

pub fn cases_descriptor(name: &str) -> serde_json::Value {
    let rows: Vec<_> = MONTHS.iter().map(|(m, d)| json!([m, d])).collect();
    json!({
        "name": name,
        "table": {
            "schema": [
                {"name": "Month", "type": "STRING"},
                {"name": "Disease", "type": "NUMBER"}
            ],
            "type": "RowTable",
            "rows": rows
        }
    })
}

pub fn write_descriptor(dir: &Path, file: &str, doc: &serde_json::Value) -> TestResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file);
    std::fs::write(&path, serde_json::to_vec_pretty(doc)?)?;
    Ok(path)
}

pub fn tables_dir(tmp: &tempfile::TempDir) -> TestResult<PathBuf> {
    let dir = tmp.path().join("tables");
    write_descriptor(&dir, "cases.json", &cases_descriptor("cases"))?;
    Ok(dir)
}

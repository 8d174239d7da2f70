#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use zip::write::FileOptions;
use zip::ZipWriter;

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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_aulad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn aulad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

/// Sends one request and returns the full response envelope.
pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Like `request` but asserts success and unwraps `result`.
pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "request {} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result payload")
}

/// One worksheet cell for synthesized xlsx fixtures.
pub enum XCell {
    S(&'static str),
    N(f64),
    Blank,
}

/// Builds a minimal xlsx container (a zip with one worksheet, inline
/// strings) the way institutional platforms export them.
pub fn xlsx_bytes(rows: &[Vec<XCell>]) -> Vec<u8> {
    let mut sheet = String::from("<worksheet><sheetData>");
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!("<row r=\"{}\">", r + 1));
        for (c, cell) in row.iter().enumerate() {
            let cell_ref = format!("{}{}", column_name(c), r + 1);
            match cell {
                XCell::S(text) => sheet.push_str(&format!(
                    "<c r=\"{}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
                    cell_ref,
                    xml_escape(text)
                )),
                XCell::N(n) => {
                    sheet.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", cell_ref, n))
                }
                XCell::Blank => sheet.push_str(&format!("<c r=\"{}\"/>", cell_ref)),
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();
    zip.start_file("xl/workbook.xml", options).expect("start workbook");
    zip.write_all(
        b"<workbook><sheets><sheet name=\"Hoja1\" sheetId=\"1\"/></sheets></workbook>",
    )
    .expect("write workbook");
    zip.start_file("xl/worksheets/sheet1.xml", options)
        .expect("start sheet");
    zip.write_all(sheet.as_bytes()).expect("write sheet");
    zip.finish().expect("finish zip").into_inner()
}

pub fn write_xlsx(path: &Path, rows: &[Vec<XCell>]) {
    std::fs::write(path, xlsx_bytes(rows)).expect("write xlsx fixture");
}

fn column_name(mut index: usize) -> String {
    let mut name = String::new();
    loop {
        name.insert(0, (b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    name
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Seeds a small roster over IPC and returns nothing; documents are
/// 1001..=100N in cohort order.
pub fn seed_roster(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
    csv: &str,
) {
    let path = workspace.join("roster-seed.csv");
    std::fs::write(&path, csv).expect("write roster seed");
    let _ = request_ok(
        stdin,
        reader,
        "seed-roster",
        "roster.importCsv",
        json!({ "inPath": path.to_string_lossy() }),
    );
}

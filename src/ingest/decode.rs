use std::io::{Cursor, Read, Seek};

use anyhow::{anyhow, Context};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::ZipArchive;

/// A decoded spreadsheet cell. Numbers are kept typed so date serials and
/// scores survive the trip out of xlsx without a formatting round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(t) => t.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }

    /// Text view used by the matchers. Whole numbers render without a
    /// trailing `.0` so document cells compare cleanly.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(t) => t.clone(),
            CellValue::Number(n) => format_number(*n),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Decodes raw file bytes into a rectangular-ish grid of cells. The format is
/// sniffed from the content: a zip signature means xlsx, anything else is
/// treated as delimited text.
pub fn decode_table(bytes: &[u8]) -> anyhow::Result<Vec<Vec<CellValue>>> {
    if bytes.starts_with(b"PK\x03\x04") {
        return decode_xlsx(bytes);
    }
    let text = decode_text(bytes);
    Ok(parse_delimited(&text, sniff_delimiter(&text)))
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        // Institutional exports still ship Latin-1; its bytes map 1:1 onto
        // the first 256 code points.
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn sniff_delimiter(text: &str) -> char {
    let header = text.lines().next().unwrap_or("");
    let mut semicolons = 0usize;
    let mut commas = 0usize;
    let mut tabs = 0usize;
    let mut in_quotes = false;
    for ch in header.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => semicolons += 1,
            ',' if !in_quotes => commas += 1,
            '\t' if !in_quotes => tabs += 1,
            _ => {}
        }
    }
    // Ties keep the earlier candidate; semicolon is the dominant regional
    // export format.
    if commas > semicolons && commas >= tabs {
        ','
    } else if tabs > semicolons && tabs > commas {
        '\t'
    } else {
        ';'
    }
}

fn parse_delimited(text: &str, delimiter: char) -> Vec<Vec<CellValue>> {
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    let mut row: Vec<CellValue> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let chars: Vec<char> = text.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && chars.get(i + 1) == Some(&'"') {
                field.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == delimiter && !in_quotes {
            row.push(cell_from_text(&field));
            field.clear();
            i += 1;
            continue;
        }
        if (ch == '\n' || ch == '\r') && !in_quotes {
            if ch == '\r' && chars.get(i + 1) == Some(&'\n') {
                i += 1;
            }
            row.push(cell_from_text(&field));
            field.clear();
            rows.push(std::mem::take(&mut row));
            i += 1;
            continue;
        }
        field.push(ch);
        i += 1;
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(cell_from_text(&field));
        rows.push(row);
    }
    rows
}

fn cell_from_text(s: &str) -> CellValue {
    if s.trim().is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(s.to_string())
    }
}

fn decode_xlsx(bytes: &[u8]) -> anyhow::Result<Vec<Vec<CellValue>>> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).context("xlsx container is not readable")?;
    let shared = match read_zip_text_entry(&mut archive, "xl/sharedStrings.xml") {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet = first_sheet_entry(&mut archive)
        .ok_or_else(|| anyhow!("xlsx has no worksheet part"))?;
    let xml = read_zip_text_entry(&mut archive, &sheet)
        .ok_or_else(|| anyhow!("xlsx worksheet {} is not readable", sheet))?;
    parse_worksheet(&xml, &shared)
}

fn read_zip_text_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut text = String::new();
    entry.read_to_string(&mut text).ok()?;
    Some(text)
}

fn first_sheet_entry<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Option<String> {
    let mut sheets: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        let Ok(entry) = archive.by_index(i) else {
            continue;
        };
        let name = entry.name().to_string();
        if name.starts_with("xl/worksheets/") && name.ends_with(".xml") {
            sheets.push(name);
        }
    }
    if let Some(pos) = sheets.iter().position(|n| n == "xl/worksheets/sheet1.xml") {
        return Some(sheets.swap_remove(pos));
    }
    sheets.sort();
    sheets.into_iter().next()
}

fn parse_shared_strings(xml: &str) -> anyhow::Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_t => {
                let text = t
                    .unescape()
                    .map_err(|e| anyhow!("sharedStrings text: {}", e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    out.push(std::mem::take(&mut current));
                }
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("sharedStrings parse error: {}", e)),
            _ => {}
        }
    }
    Ok(out)
}

fn parse_worksheet(xml: &str, shared: &[String]) -> anyhow::Result<Vec<Vec<CellValue>>> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    let mut row: Vec<CellValue> = Vec::new();
    let mut col = 0usize;
    let mut cell_type = String::from("n");
    let mut pending = String::new();
    let mut capture = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    let (r, t) = cell_attrs(&e)?;
                    col = r.unwrap_or(row.len());
                    cell_type = t;
                    pending.clear();
                }
                // <v> holds plain values, <t> holds inline-string runs.
                b"v" | b"t" => capture = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"c" => {
                    let (r, _) = cell_attrs(&e)?;
                    let at = r.unwrap_or(row.len());
                    set_cell(&mut row, at, CellValue::Empty);
                }
                b"row" => rows.push(Vec::new()),
                _ => {}
            },
            Ok(Event::Text(t)) if capture => {
                let text = t.unescape().map_err(|e| anyhow!("worksheet text: {}", e))?;
                pending.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    let value = finish_cell(&cell_type, &pending, shared);
                    set_cell(&mut row, col, value);
                    pending.clear();
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("worksheet parse error: {}", e)),
            _ => {}
        }
    }
    Ok(rows)
}

fn cell_attrs(e: &BytesStart<'_>) -> anyhow::Result<(Option<usize>, String)> {
    let mut col = None;
    let mut cell_type = String::from("n");
    for attr in e.attributes() {
        let attr = attr.map_err(|e| anyhow!("bad cell attribute: {}", e))?;
        match attr.key.as_ref() {
            b"r" => {
                let value = attr
                    .unescape_value()
                    .map_err(|e| anyhow!("bad cell reference: {}", e))?;
                col = column_index(&value);
            }
            b"t" => {
                let value = attr
                    .unescape_value()
                    .map_err(|e| anyhow!("bad cell type: {}", e))?;
                cell_type = value.into_owned();
            }
            _ => {}
        }
    }
    Ok((col, cell_type))
}

/// Zero-based column index from a cell reference like `B7` or `AA12`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let mut n = 0usize;
    let mut seen = false;
    for ch in cell_ref.chars() {
        if ch.is_ascii_alphabetic() {
            seen = true;
            n = n * 26 + (ch.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        } else {
            break;
        }
    }
    if seen {
        Some(n - 1)
    } else {
        None
    }
}

fn set_cell(row: &mut Vec<CellValue>, col: usize, value: CellValue) {
    while row.len() < col {
        row.push(CellValue::Empty);
    }
    if row.len() == col {
        row.push(value);
    } else {
        row[col] = value;
    }
}

fn finish_cell(cell_type: &str, raw: &str, shared: &[String]) -> CellValue {
    match cell_type {
        "s" => {
            let resolved = raw
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| shared.get(i));
            match resolved {
                Some(text) => cell_from_text(text),
                None => CellValue::Empty,
            }
        }
        "str" | "inlineStr" => cell_from_text(raw),
        "b" => CellValue::Number(if raw.trim() == "1" { 1.0 } else { 0.0 }),
        "e" => CellValue::Empty,
        _ => match raw.trim().parse::<f64>() {
            Ok(n) => CellValue::Number(n),
            Err(_) => cell_from_text(raw),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn texts(rows: &[Vec<CellValue>]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.as_text()).collect())
            .collect()
    }

    #[test]
    fn sniffs_semicolon_and_parses_quotes() {
        let rows = decode_table("a;b;c\n\"x;y\";\"he said \"\"hi\"\"\";2\n".as_bytes())
            .expect("decode");
        assert_eq!(
            texts(&rows),
            vec![
                vec!["a".to_string(), "b".into(), "c".into()],
                vec!["x;y".to_string(), "he said \"hi\"".into(), "2".into()],
            ]
        );
    }

    #[test]
    fn sniffs_comma_and_tab() {
        let rows = decode_table("a,b\n1,2\n".as_bytes()).expect("decode");
        assert_eq!(rows[1].len(), 2);
        let rows = decode_table("a\tb\n1\t2\n".as_bytes()).expect("decode");
        assert_eq!(rows[0].len(), 2);
    }

    #[test]
    fn quoted_field_keeps_embedded_newline() {
        let rows = decode_table("name;note\nAna;\"line one\nline two\"\n".as_bytes())
            .expect("decode");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1].as_text(), "line one\nline two");
    }

    #[test]
    fn strips_utf8_bom() {
        let mut bytes = vec![0xef, 0xbb, 0xbf];
        bytes.extend_from_slice("documento;nombre\n1;Ana\n".as_bytes());
        let rows = decode_table(&bytes).expect("decode");
        assert_eq!(rows[0][0].as_text(), "documento");
    }

    #[test]
    fn falls_back_to_latin1() {
        // "Pérez" with é as a single 0xE9 byte.
        let bytes = b"apellidos;nota\nP\xe9rez;4\n";
        let rows = decode_table(bytes).expect("decode");
        assert_eq!(rows[1][0].as_text(), "Pérez");
    }

    #[test]
    fn empty_cells_stay_distinct_from_zero() {
        let rows = decode_table("a;b;c\n1;;3\n".as_bytes()).expect("decode");
        assert_eq!(rows[1][1], CellValue::Empty);
        assert!(rows[1][1].is_empty());
    }

    fn minimal_xlsx(sheet_xml: &str, shared_xml: Option<&str>) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default();
        zip.start_file("xl/workbook.xml", options).expect("start");
        zip.write_all(b"<workbook><sheets><sheet name=\"Hoja1\" sheetId=\"1\"/></sheets></workbook>")
            .expect("write");
        if let Some(shared) = shared_xml {
            zip.start_file("xl/sharedStrings.xml", options).expect("start");
            zip.write_all(shared.as_bytes()).expect("write");
        }
        zip.start_file("xl/worksheets/sheet1.xml", options).expect("start");
        zip.write_all(sheet_xml.as_bytes()).expect("write");
        zip.finish().expect("finish").into_inner()
    }

    #[test]
    fn xlsx_shared_strings_and_numbers() {
        let shared = "<sst><si><t>documento</t></si><si><t>nota</t></si></sst>";
        let sheet = "<worksheet><sheetData>\
            <row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"s\"><v>1</v></c></row>\
            <row r=\"2\"><c r=\"A2\"><v>1023456789</v></c><c r=\"B2\"><v>4.5</v></c></row>\
            </sheetData></worksheet>";
        let rows = decode_table(&minimal_xlsx(sheet, Some(shared))).expect("decode");
        assert_eq!(rows[0][0].as_text(), "documento");
        assert_eq!(rows[1][0], CellValue::Number(1023456789.0));
        assert_eq!(rows[1][0].as_text(), "1023456789");
        assert_eq!(rows[1][1], CellValue::Number(4.5));
    }

    #[test]
    fn xlsx_sparse_row_fills_gaps_with_empty() {
        let sheet = "<worksheet><sheetData>\
            <row r=\"1\"><c r=\"A1\" t=\"inlineStr\"><is><t>a</t></is></c>\
            <c r=\"D1\"><v>7</v></c></row>\
            </sheetData></worksheet>";
        let rows = decode_table(&minimal_xlsx(sheet, None)).expect("decode");
        assert_eq!(rows[0].len(), 4);
        assert_eq!(rows[0][1], CellValue::Empty);
        assert_eq!(rows[0][2], CellValue::Empty);
        assert_eq!(rows[0][3], CellValue::Number(7.0));
    }

    #[test]
    fn xlsx_date_serial_survives_as_number() {
        let sheet = "<worksheet><sheetData>\
            <row r=\"1\"><c r=\"A1\"><v>45678.5</v></c></row>\
            </sheetData></worksheet>";
        let rows = decode_table(&minimal_xlsx(sheet, None)).expect("decode");
        assert_eq!(rows[0][0], CellValue::Number(45678.5));
    }
}

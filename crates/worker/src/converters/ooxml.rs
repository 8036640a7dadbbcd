//! Text extraction from Office Open XML packages (DOCX, PPTX/PPSX, XLSX).
//!
//! Packages are zip archives of XML parts. Only text content is kept; layout,
//! images and formulas are dropped.

use std::io::{Cursor, Read};

use docconv_core::converter::{ConversionContext, ConversionError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

type Package<'a> = ZipArchive<Cursor<&'a [u8]>>;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

pub(crate) fn docx_to_markdown(
    bytes: &[u8],
    ctx: &ConversionContext<'_>,
) -> Result<String, ConversionError> {
    let mut package = open(bytes)?;
    let xml = read_part(&mut package, "word/document.xml")?
        .ok_or_else(|| ConversionError::Failed("word/document.xml is missing".into()))?;
    ctx.checkpoint()?;
    ctx.report(50);

    let blocks: Vec<String> = paragraphs(&xml)?
        .into_iter()
        .map(|p| match p.heading {
            Some(level) => format!("{} {}", "#".repeat(level), p.text),
            None => p.text,
        })
        .collect();
    Ok(join_blocks(&blocks))
}

// ---------------------------------------------------------------------------
// Presentations
// ---------------------------------------------------------------------------

/// One `## Slide N` section per slide, in slide-number order.
pub(crate) fn slides_to_markdown(
    bytes: &[u8],
    ctx: &ConversionContext<'_>,
) -> Result<String, ConversionError> {
    let mut package = open(bytes)?;
    let slides = numbered_parts(&package, "ppt/slides/slide");
    if slides.is_empty() {
        return Err(ConversionError::Failed("Presentation has no slides".into()));
    }

    let total = slides.len();
    let mut sections = Vec::with_capacity(total);
    for (index, (number, name)) in slides.iter().enumerate() {
        ctx.checkpoint()?;
        let xml = read_part(&mut package, name)?.unwrap_or_default();
        let lines: Vec<String> = paragraphs(&xml)?.into_iter().map(|p| p.text).collect();

        let mut section = format!("## Slide {number}");
        if !lines.is_empty() {
            section.push_str("\n\n");
            section.push_str(&lines.join("\n\n"));
        }
        sections.push(section);
        ctx.report_fraction(index + 1, total);
    }
    Ok(join_blocks(&sections))
}

// ---------------------------------------------------------------------------
// Spreadsheets
// ---------------------------------------------------------------------------

/// One `## Sheet N` section per worksheet, rendered as a Markdown table whose
/// first row is the header.
pub(crate) fn sheets_to_markdown(
    bytes: &[u8],
    ctx: &ConversionContext<'_>,
) -> Result<String, ConversionError> {
    let mut package = open(bytes)?;
    let shared = match read_part(&mut package, "xl/sharedStrings.xml")? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };

    let sheets = numbered_parts(&package, "xl/worksheets/sheet");
    if sheets.is_empty() {
        return Err(ConversionError::Failed("Workbook has no worksheets".into()));
    }

    let total = sheets.len();
    let mut sections = Vec::with_capacity(total);
    for (index, (number, name)) in sheets.iter().enumerate() {
        ctx.checkpoint()?;
        let xml = read_part(&mut package, name)?.unwrap_or_default();
        let rows = sheet_rows(&xml, &shared)?;

        let mut section = format!("## Sheet {number}");
        if let Some(table) = markdown_table(&rows) {
            section.push_str("\n\n");
            section.push_str(&table);
        }
        sections.push(section);
        ctx.report_fraction(index + 1, total);
    }
    Ok(join_blocks(&sections))
}

// ---------------------------------------------------------------------------
// Package access
// ---------------------------------------------------------------------------

fn open(bytes: &[u8]) -> Result<Package<'_>, ConversionError> {
    ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ConversionError::Failed(format!("Failed to open package: {e}")))
}

fn read_part(package: &mut Package<'_>, name: &str) -> Result<Option<String>, ConversionError> {
    let mut part = match package.by_name(name) {
        Ok(part) => part,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => {
            return Err(ConversionError::Failed(format!("Failed to open {name}: {e}")));
        }
    };
    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|e| ConversionError::Failed(format!("Failed to read {name}: {e}")))?;
    Ok(Some(xml))
}

/// Parts named `{prefix}{N}.xml`, sorted by `N`.
fn numbered_parts(package: &Package<'_>, prefix: &str) -> Vec<(u32, String)> {
    let mut parts: Vec<(u32, String)> = package
        .file_names()
        .filter_map(|name| {
            let number = name.strip_prefix(prefix)?.strip_suffix(".xml")?;
            Some((number.parse().ok()?, name.to_string()))
        })
        .collect();
    parts.sort();
    parts
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

struct Paragraph {
    text: String,
    heading: Option<usize>,
}

/// Paragraphs (`p`) with the text of their runs (`t`). Works for both
/// WordprocessingML (`w:`) and DrawingML (`a:`) since only local names are
/// compared. Empty paragraphs are dropped.
fn paragraphs(xml: &str) -> Result<Vec<Paragraph>, ConversionError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut current: Option<Paragraph> = None;
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"p" => {
                    current = Some(Paragraph {
                        text: String::new(),
                        heading: None,
                    })
                }
                b"t" => in_text = true,
                b"pStyle" => set_heading(&mut current, e),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"pStyle" => set_heading(&mut current, e),
                b"tab" => push_text(&mut current, "\t"),
                b"br" => push_text(&mut current, "\n"),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(paragraph) = current.take() {
                        let text = paragraph.text.trim().to_string();
                        if !text.is_empty() {
                            out.push(Paragraph {
                                text,
                                heading: paragraph.heading,
                            });
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let decoded = e.decode().unwrap_or_default();
                push_text(&mut current, &decoded);
            }
            Ok(Event::GeneralRef(e)) if in_text => {
                push_text(&mut current, &resolve_entity(&e));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(&reader, e)),
            _ => {}
        }
    }

    Ok(out)
}

/// Entries of `xl/sharedStrings.xml`, each the concatenation of its runs.
fn shared_strings(xml: &str) -> Result<Vec<String>, ConversionError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => out.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Ok(Event::Text(e)) if in_text => current.push_str(&e.decode().unwrap_or_default()),
            Ok(Event::GeneralRef(e)) if in_text => current.push_str(&resolve_entity(&e)),
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(&reader, e)),
            _ => {}
        }
    }

    Ok(out)
}

/// Cell values of each `row`, in document order. Shared-string cells
/// (`t="s"`) are resolved; every other cell keeps its literal value.
fn sheet_rows(xml: &str, shared: &[String]) -> Result<Vec<Vec<String>>, ConversionError> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut shared_cell = false;
    let mut in_value = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell.clear();
                    shared_cell = attribute_is(e, b"t", b"s");
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"c" => row.push(String::new()),
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let value = if shared_cell {
                        cell.trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        std::mem::take(&mut cell)
                    };
                    row.push(value);
                }
                b"row" => {
                    if row.iter().any(|v| !v.trim().is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) if in_value => cell.push_str(&e.decode().unwrap_or_default()),
            Ok(Event::GeneralRef(e)) if in_value => cell.push_str(&resolve_entity(&e)),
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(&reader, e)),
            _ => {}
        }
    }

    Ok(rows)
}

fn set_heading(current: &mut Option<Paragraph>, style: &BytesStart<'_>) {
    let Some(paragraph) = current.as_mut() else {
        return;
    };
    for attr in style.attributes().flatten() {
        if attr.key.local_name().as_ref() != b"val" {
            continue;
        }
        let value = String::from_utf8_lossy(&attr.value);
        paragraph.heading = heading_level(&value);
    }
}

/// `Title` and `Heading1`..`Heading6` map to Markdown heading levels.
fn heading_level(style: &str) -> Option<usize> {
    if style.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let level: usize = style
        .strip_prefix("Heading")
        .or_else(|| style.strip_prefix("heading"))?
        .parse()
        .ok()?;
    (1..=6).contains(&level).then_some(level)
}

fn push_text(current: &mut Option<Paragraph>, text: &str) {
    if let Some(paragraph) = current.as_mut() {
        paragraph.text.push_str(text);
    }
}

fn attribute_is(element: &BytesStart<'_>, name: &[u8], expected: &[u8]) -> bool {
    element
        .attributes()
        .flatten()
        .any(|attr| attr.key.local_name().as_ref() == name && attr.value.as_ref() == expected)
}

/// Predefined and numeric character references. Unknown entities are kept
/// verbatim.
fn resolve_entity(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    let reference = format!("&{name};");
    quick_xml::escape::unescape(&reference)
        .map(|s| s.into_owned())
        .unwrap_or(reference)
}

fn xml_error(reader: &Reader<&[u8]>, err: quick_xml::Error) -> ConversionError {
    ConversionError::Failed(format!(
        "XML parsing error at position {}: {err}",
        reader.error_position()
    ))
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn join_blocks(blocks: &[String]) -> String {
    let mut out = blocks.join("\n\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn markdown_table(rows: &[Vec<String>]) -> Option<String> {
    let columns = rows.iter().map(Vec::len).max().filter(|&n| n > 0)?;
    let render = |row: &[String]| {
        let cells: Vec<String> = (0..columns)
            .map(|i| escape_cell(row.get(i).map(String::as_str).unwrap_or("")))
            .collect();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(render(&rows[0]));
    lines.push(format!("|{}", " --- |".repeat(columns)));
    lines.extend(rows[1..].iter().map(|row| render(row)));
    Some(lines.join("\n"))
}

fn escape_cell(value: &str) -> String {
    value.trim().replace('|', "\\|").replace('\n', " ")
}

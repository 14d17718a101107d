//! Decoder for the extractor's stdout: a byte stream mixing human-readable
//! diagnostic lines with embedded single-line JSON objects.
//!
//! The parser is line-buffered: each chunk is appended to a carry-over
//! buffer and split on newlines, with the trailing (possibly incomplete)
//! segment kept for the next chunk. This makes frame output independent of
//! how the OS pipe happens to split the stream, which is a tested property.

use serde_json::Value;
use tracing::debug;

/// Sentinel the extractor emits when a template field has no value yet.
const SENTINEL: &str = "NA";

/// Field aliases under which a resolved artifact path may appear.
const PATH_ALIASES: &[&str] = &["filepath", "_filename", "filename"];

/// One classified unit of structured data decoded from an output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Periodic progress report; carries only transfer-state fields.
    Progress(ProgressFrame),
    /// Resolved artifact metadata (path, title, thumbnail, size).
    Metadata(InfoFrame),
    /// Anything else carrying title/thumbnail/path/size; lowest priority.
    Info(InfoFrame),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressFrame {
    pub percent: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<f64>,
    pub speed_text: Option<String>,
    pub eta_text: Option<String>,
    /// Opportunistic path hint; absent when the extractor reported the
    /// sentinel.
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoFrame {
    pub path: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub size: Option<u64>,
}

/// Stateful line-buffering decoder. One instance per spawned process.
#[derive(Debug, Default)]
pub struct OutputParser {
    carry: String,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.carry.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            if let Some(frame) = parse_line(line.trim_end_matches(['\n', '\r'])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush the trailing unterminated segment at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        let rest = std::mem::take(&mut self.carry);
        parse_line(rest.trim_end_matches('\r')).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<Frame> {
    // Lines may carry a non-JSON prefix ("[download] {...}").
    let start = line.find('{')?;
    let object: Value = match serde_json::from_str(&line[start..]) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => return None,
        Err(err) => {
            // Diagnostic text with a stray brace; never fatal.
            debug!(error = %err, "Skipping unparsable output line");
            return None;
        }
    };
    classify(&object)
}

fn classify(object: &Value) -> Option<Frame> {
    let has_status = str_field(object, "status").is_some();
    let has_byte_or_percent = object.get("downloaded_bytes").is_some()
        || object.get("percent").is_some()
        || object.get("_percent_str").is_some();

    if has_status && has_byte_or_percent {
        return Some(Frame::Progress(progress_frame(object)));
    }

    let info = info_frame(object);
    if info.path.is_some() {
        return Some(Frame::Metadata(info));
    }
    if info.title.is_some() || info.thumbnail.is_some() || info.size.is_some() {
        return Some(Frame::Info(info));
    }
    None
}

fn progress_frame(object: &Value) -> ProgressFrame {
    let downloaded = u64_field(object, "downloaded_bytes");
    let total =
        u64_field(object, "total_bytes").or_else(|| u64_field(object, "total_bytes_estimate"));

    // Prefer computing the percentage over trusting the display string.
    let percent = match (downloaded, total) {
        (Some(d), Some(t)) if t > 0 => Some((d as f64 / t as f64) * 100.0),
        _ => f64_field(object, "percent").or_else(|| {
            str_field(object, "_percent_str")
                .and_then(|s| s.trim().trim_end_matches('%').parse::<f64>().ok())
        }),
    };

    ProgressFrame {
        percent,
        downloaded_bytes: downloaded,
        total_bytes: total,
        speed_bps: f64_field(object, "speed"),
        speed_text: str_field(object, "_speed_str").map(|s| s.trim().to_string()),
        eta_text: str_field(object, "_eta_str").map(|s| s.trim().to_string()),
        output_path: first_path(object),
    }
}

fn info_frame(object: &Value) -> InfoFrame {
    InfoFrame {
        path: first_path(object),
        title: str_field(object, "title").map(str::to_string),
        thumbnail: str_field(object, "thumbnail").map(str::to_string),
        size: u64_field(object, "filesize").or_else(|| u64_field(object, "filesize_approx")),
    }
}

fn first_path(object: &Value) -> Option<String> {
    PATH_ALIASES
        .iter()
        .find_map(|alias| str_field(object, alias))
        .map(str::to_string)
}

/// String accessor that filters out the "value unavailable" sentinel.
fn str_field<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    match object.get(key)?.as_str() {
        Some(s) if !s.trim().is_empty() && s.trim() != SENTINEL => Some(s),
        _ => None,
    }
}

fn u64_field(object: &Value, key: &str) -> Option<u64> {
    let value = object.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn f64_field(object: &Value, key: &str) -> Option<f64> {
    let value = object.get(key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

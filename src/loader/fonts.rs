//! Web font conversion.
//!
//! [`Woff`] wraps a TrueType font into WOFF 1.0 without leaving the process,
//! and forwards the original font so [`Woff2`] can hand it to an external
//! WOFF2 encoder. Every `.ttf` therefore ends up as `.woff` and `.woff2`.

use std::fs;
use std::io::ErrorKind;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Hash32;
use crate::error::StageError;
use crate::pipeline::{ErrorPolicy, FileRecord, Stage};

const WOFF_SIGNATURE: u32 = 0x774F_4646;
const WOFF_HEADER: usize = 44;
const WOFF_ENTRY: usize = 20;
const SFNT_HEADER: usize = 12;
const SFNT_ENTRY: usize = 16;

/// Errors that can occur when converting fonts.
#[derive(Debug, Error)]
pub enum FontError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a TrueType or OpenType font")]
    Flavor,

    #[error("Font is truncated at offset {0}")]
    Truncated(usize),

    #[error("WOFF2 encoder '{0}' was not found")]
    MissingEncoder(String),

    #[error("WOFF2 encoder failed: {0}")]
    Encoder(String),
}

impl From<FontError> for StageError {
    fn from(err: FontError) -> Self {
        match err {
            FontError::Io(err) => StageError::Io(err),
            other => StageError::content(other.to_string()),
        }
    }
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, FontError> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(FontError::Truncated(at))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, FontError> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FontError::Truncated(at))
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Wraps an SFNT font into WOFF 1.0 with tables stored uncompressed.
pub fn encode_woff(font: &[u8]) -> Result<Vec<u8>, FontError> {
    let flavor = read_u32(font, 0)?;
    if !matches!(flavor, 0x0001_0000 | 0x4F54_544F | 0x7472_7565) {
        return Err(FontError::Flavor);
    }

    let count = read_u16(font, 4)? as usize;

    let mut tables = Vec::with_capacity(count);
    for i in 0..count {
        let entry = SFNT_HEADER + SFNT_ENTRY * i;
        let tag = read_u32(font, entry)?;
        let checksum = read_u32(font, entry + 4)?;
        let offset = read_u32(font, entry + 8)? as usize;
        let length = read_u32(font, entry + 12)? as usize;

        let data = font
            .get(offset..offset + length)
            .ok_or(FontError::Truncated(offset))?;

        tables.push((tag, checksum, data));
    }

    // directory entries must be sorted by tag
    tables.sort_by_key(|(tag, ..)| *tag);

    let sfnt_size = SFNT_HEADER
        + SFNT_ENTRY * count
        + tables.iter().map(|(_, _, data)| pad4(data.len())).sum::<usize>();

    let mut directory = Vec::with_capacity(WOFF_ENTRY * count);
    let mut body = Vec::new();
    let mut offset = WOFF_HEADER + WOFF_ENTRY * count;

    for (tag, checksum, data) in &tables {
        for field in [*tag, offset as u32, data.len() as u32, data.len() as u32, *checksum] {
            directory.extend_from_slice(&field.to_be_bytes());
        }

        body.extend_from_slice(data);
        body.resize(pad4(body.len()), 0);
        offset += pad4(data.len());
    }

    let mut out = Vec::with_capacity(offset);
    out.extend_from_slice(&WOFF_SIGNATURE.to_be_bytes());
    out.extend_from_slice(&flavor.to_be_bytes());
    out.extend_from_slice(&(offset as u32).to_be_bytes());
    out.extend_from_slice(&(count as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(sfnt_size as u32).to_be_bytes());
    // version 1.0, then no metadata and no private block
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&[0; 20]);
    out.extend_from_slice(&directory);
    out.extend_from_slice(&body);

    Ok(out)
}

/// Emits `<font>.woff` and passes the original font along.
#[derive(Debug, Default)]
pub struct Woff;

impl Stage for Woff {
    fn name(&self) -> &str {
        "woff"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::DiagnoseAndContinue
    }

    fn plan(&self, dest: Utf8PathBuf) -> Vec<Utf8PathBuf> {
        vec![dest.with_extension("woff"), dest]
    }

    fn transform(&self, record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        let mut woff = record.clone();
        woff.contents = encode_woff(&record.contents)?;
        woff.set_extension("woff");

        Ok(vec![woff, record])
    }
}

/// Turns `.ttf` records into `.woff2` with an external encoder.
///
/// The encoder is called as `<command> <file.ttf>` and must write
/// `<file>.woff2` next to its input. Other records pass through.
#[derive(Debug, Clone)]
pub struct Woff2 {
    command: String,
}

impl Woff2 {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn encode(&self, record: &FileRecord) -> Result<Vec<u8>, FontError> {
        let key = Hash32::hash([record.dest.as_str().as_bytes(), &record.contents[..]].concat());
        let scratch = std::env::temp_dir().join(format!("tsumugi-{}.ttf", key.to_hex()));
        let target = scratch.with_extension("woff2");

        fs::write(&scratch, &record.contents)?;

        let output = Command::new(&self.command)
            .arg(&scratch)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let result = match output {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(FontError::MissingEncoder(self.command.clone()))
            }
            Err(err) => Err(FontError::Io(err)),
            Ok(output) if !output.status.success() => Err(FontError::Encoder(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            )),
            Ok(_) => fs::read(&target).map_err(FontError::from),
        };

        fs::remove_file(&scratch).ok();
        fs::remove_file(&target).ok();

        result
    }
}

impl Stage for Woff2 {
    fn name(&self) -> &str {
        "woff2"
    }

    fn policy(&self) -> ErrorPolicy {
        ErrorPolicy::DiagnoseAndContinue
    }

    fn plan(&self, dest: Utf8PathBuf) -> Vec<Utf8PathBuf> {
        if dest.extension() == Some("ttf") {
            vec![dest.with_extension("woff2")]
        } else {
            vec![dest]
        }
    }

    fn transform(&self, mut record: FileRecord) -> Result<Vec<FileRecord>, StageError> {
        if record.dest.extension() != Some("ttf") {
            return Ok(vec![record]);
        }

        record.contents = self.encode(&record)?;
        record.set_extension("woff2");
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An SFNT with `head` (6 bytes) and `cmap` (4 bytes), listed out of order.
    fn font() -> Vec<u8> {
        let mut font = Vec::new();
        font.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        font.extend_from_slice(&2u16.to_be_bytes());
        font.extend_from_slice(&[0; 6]);

        let data_start = (SFNT_HEADER + 2 * SFNT_ENTRY) as u32;
        for (tag, checksum, offset, length) in [
            (b"head", 0x1111_1111u32, data_start, 6u32),
            (b"cmap", 0x2222_2222u32, data_start + 8, 4u32),
        ] {
            font.extend_from_slice(tag);
            font.extend_from_slice(&checksum.to_be_bytes());
            font.extend_from_slice(&offset.to_be_bytes());
            font.extend_from_slice(&length.to_be_bytes());
        }

        font.extend_from_slice(&[1, 2, 3, 4, 5, 6, 0, 0]);
        font.extend_from_slice(&[7, 8, 9, 10]);
        font
    }

    #[test]
    fn test_woff_layout() {
        let woff = encode_woff(&font()).unwrap();

        assert_eq!(&woff[0..4], b"wOFF");
        assert_eq!(read_u32(&woff, 4).unwrap(), 0x0001_0000);
        assert_eq!(read_u32(&woff, 8).unwrap() as usize, woff.len());
        assert_eq!(read_u16(&woff, 12).unwrap(), 2);
        assert_eq!(read_u32(&woff, 16).unwrap(), 12 + 32 + 4 + 8);

        // sorted directory: cmap first
        assert_eq!(&woff[44..48], b"cmap");
        assert_eq!(read_u32(&woff, 48).unwrap(), 84);
        assert_eq!(read_u32(&woff, 52).unwrap(), 4);
        assert_eq!(read_u32(&woff, 60).unwrap(), 0x2222_2222);
        assert_eq!(&woff[64..68], b"head");
        assert_eq!(read_u32(&woff, 68).unwrap(), 88);

        assert_eq!(&woff[84..88], &[7, 8, 9, 10]);
        assert_eq!(&woff[88..96], &[1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(woff.len(), 96);
    }

    #[test]
    fn test_not_a_font() {
        assert!(matches!(encode_woff(b"GIF89a.."), Err(FontError::Flavor)));
        assert!(matches!(encode_woff(&[0, 1, 0, 0, 0]), Err(FontError::Truncated(4))));
    }

    #[test]
    fn test_woff_keeps_original() {
        let record = FileRecord::new("src/fonts/a.ttf", "a.ttf", font(), "fonts/a.ttf");
        let out = Woff.transform(record).unwrap();

        let dests: Vec<_> = out.iter().map(|r| r.dest.as_str()).collect();
        assert_eq!(dests, vec!["fonts/a.woff", "fonts/a.ttf"]);
        assert_eq!(
            Woff.plan("fonts/a.ttf".into()),
            vec![Utf8PathBuf::from("fonts/a.woff"), "fonts/a.ttf".into()]
        );
    }

    #[test]
    fn test_missing_encoder_is_content_error() {
        let stage = Woff2::new("tsumugi-no-such-encoder");
        let record = FileRecord::new("src/fonts/a.ttf", "a.ttf", font(), "fonts/a.ttf");

        match stage.transform(record) {
            Err(StageError::Content(msg)) => assert!(msg.contains("tsumugi-no-such-encoder")),
            other => panic!("expected a content error, got {other:?}"),
        }
    }

    #[test]
    fn test_woff2_ignores_other_records() {
        let stage = Woff2::new("tsumugi-no-such-encoder");
        let record = FileRecord::new("src/fonts/a.ttf", "a.ttf", vec![1], "fonts/a.woff");
        let out = stage.transform(record).unwrap();
        assert_eq!(out[0].dest, "fonts/a.woff");
    }
}

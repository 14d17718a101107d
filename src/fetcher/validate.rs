//! Magic-byte validation of fetched payloads.
//!
//! Mirrors sometimes serve an HTML error page with a 200 status; checking
//! the leading bytes against the expected format catches that and most
//! truncation corruption before anything is installed.

/// What kind of payload a fetch expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A directly runnable binary: ELF, Windows PE ("MZ"), or a script with
    /// a shebang line.
    Executable,
    /// A compressed bundle: xz stream or ZIP.
    Archive,
}

/// Archive container detected from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarXz,
    Zip,
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const PE_MAGIC: &[u8] = b"MZ";
const SHEBANG: &[u8] = b"#!";
const XZ_MAGIC: &[u8] = b"\xfd7zXZ\x00";
const ZIP_MAGIC: &[u8] = b"PK";

/// Check the first bytes of a downloaded payload against the expected kind.
/// Returns a human-readable reason on rejection.
pub fn validate_leading_bytes(kind: PayloadKind, leading: &[u8]) -> Result<(), String> {
    if leading.first() == Some(&b'<') {
        return Err("payload looks like an HTML page served with a success status".into());
    }
    let ok = match kind {
        PayloadKind::Executable => {
            leading.starts_with(ELF_MAGIC)
                || leading.starts_with(PE_MAGIC)
                || leading.starts_with(SHEBANG)
        }
        PayloadKind::Archive => detect_archive(leading).is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "leading bytes {:02x?} do not match any expected {:?} signature",
            &leading[..leading.len().min(6)],
            kind
        ))
    }
}

pub fn detect_archive(leading: &[u8]) -> Option<ArchiveFormat> {
    if leading.starts_with(XZ_MAGIC) {
        Some(ArchiveFormat::TarXz)
    } else if leading.starts_with(ZIP_MAGIC) {
        Some(ArchiveFormat::Zip)
    } else {
        None
    }
}

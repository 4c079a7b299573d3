//! QR codes a receiver scans to find a sender.
//!
//! The code carries the JSON payload understood by
//! [`ConnectionInfo::from_payload`]:
//!
//! ```text
//! {"candidates":[{"host":"192.168.1.20","port":7017},{"host":"127.0.0.1","port":7017}]}
//! ```

use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};
use serde::Serialize;

use crate::connection::{Candidate, ConnectionInfo};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct PayloadRef<'a> {
    candidates: &'a [Candidate],
}

/// Encode the scanned payload for a sender.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn payload_for(info: &ConnectionInfo) -> Result<String> {
    Ok(serde_json::to_string(&PayloadRef {
        candidates: info.candidates(),
    })?)
}

fn encode(payload: &str) -> Result<QrCode> {
    QrCode::with_error_correction_level(payload, EcLevel::M)
        .map_err(|e| Error::Internal(format!("Failed to generate QR code: {e}")))
}

/// Render a payload for terminal display.
///
/// # Errors
///
/// Returns an error if the payload does not fit in a QR code.
pub fn generate_ascii(payload: &str) -> Result<String> {
    let rendered = encode(payload)?
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build();

    Ok(rendered)
}

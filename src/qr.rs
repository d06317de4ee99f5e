//! QR pairing payload construction and terminal/SVG rendering. Adapted from the teacher's
//! `wa::qr`, with the direct `Event::QrCode` + `mpsc` coupling removed — emission now goes
//! through [`crate::events::EventBus`] (see [`crate::pairing::run_qr_pairing`]) instead of a
//! hardcoded channel type.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qrcode::render::{svg, unicode};
use qrcode::QrCode;

/// Builds a WA QR payload string: `ref,noise_pub_b64,identity_pub_b64,adv_secret_b64`.
pub fn generate_qr_string(reference: &str, noise_pub: &[u8], identity_pub: &[u8], adv_secret: &[u8]) -> String {
    format!(
        "{reference},{},{},{}",
        STANDARD.encode(noise_pub),
        STANDARD.encode(identity_pub),
        STANDARD.encode(adv_secret),
    )
}

/// Renders a QR payload into a terminal-friendly Unicode matrix.
pub fn render_qr_for_terminal(qr_payload: &str) -> Result<String, String> {
    let code = QrCode::new(qr_payload.as_bytes()).map_err(|error| error.to_string())?;
    Ok(code.render::<unicode::Dense1x2>().build())
}

/// Encodes a QR payload as an SVG data URL.
pub fn render_qr_svg_data_url(qr_payload: &str) -> Result<String, String> {
    let code = QrCode::new(qr_payload.as_bytes()).map_err(|error| error.to_string())?;
    let svg_qr = code.render::<svg::Color<'_>>().min_dimensions(240, 240).build();
    let encoded = STANDARD.encode(svg_qr.as_bytes());
    Ok(format!("data:image/svg+xml;base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_string_has_four_comma_separated_fields() {
        let qr = generate_qr_string("ref-1", &[1u8; 32], &[2u8; 32], &[3u8; 32]);
        assert_eq!(qr.split(',').count(), 4);
        assert!(qr.starts_with("ref-1,"));
    }

    #[test]
    fn renders_terminal_and_svg_without_error() {
        let qr = generate_qr_string("ref-1", &[1u8; 32], &[2u8; 32], &[3u8; 32]);
        assert!(render_qr_for_terminal(&qr).is_ok());
        let svg = render_qr_svg_data_url(&qr).unwrap();
        assert!(svg.starts_with("data:image/svg+xml;base64,"));
    }
}

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    qrcode::{QrCode, render::svg, types::QrError},
};

/// Render a pairing payload as an SVG `data:` URL an `<img>` can display.
pub fn render_data_url(payload: &str) -> Result<String, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(264, 264)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_svg_data_url() {
        let url = render_data_url("2@abc,def,ghi").unwrap();
        let encoded = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn distinct_payloads_render_differently() {
        assert_ne!(
            render_data_url("first").unwrap(),
            render_data_url("second").unwrap()
        );
    }
}

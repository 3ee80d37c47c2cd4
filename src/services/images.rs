use base64::Engine;
use image::ImageFormat;
use std::io::Cursor;

/// Upload extensions accepted by the intake API.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff"];

/// True when the file name carries an accepted extension.
pub fn extension_allowed(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode an upload and re-encode it as an RGB PNG.
pub fn to_png(bytes: &[u8]) -> Result<Vec<u8>, ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(decoded.to_rgb8()).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// `data:image/png;base64,...` form sent to the vision model.
pub fn png_data_uri(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

/// Full intake conversion for one uploaded file.
pub fn upload_to_data_uri(filename: &str, bytes: &[u8]) -> Result<String, ImageError> {
    if !extension_allowed(filename) {
        return Err(ImageError::UnsupportedExtension(filename.to_string()));
    }
    Ok(png_data_uri(&to_png(bytes)?))
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Unsupported file type: {0}")]
    UnsupportedExtension(String),

    #[error("Could not decode image: {0}")]
    Decode(#[from] image::ImageError),
}

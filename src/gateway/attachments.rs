//! Attachment fitting for the gateway frame budget.
//!
//! The upstream caps WebSocket frames at 512 KiB. Requests that carry image
//! attachments are measured by a JSON roundtrip and, when over budget, the
//! images are downscaled and re-encoded as JPEG until the whole envelope fits
//! under the target (frame cap minus headroom). Non-image payloads that are
//! too large cannot be saved and fail with a pointer to the out-of-band
//! media workflow.

use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use serde_json::{json, Map, Value};

/// Upstream WebSocket frame cap.
const FRAME_LIMIT_BYTES: usize = 512 * 1024;
/// Headroom reserved for envelope fields and non-attachment params.
const FRAME_HEADROOM_BYTES: usize = 32 * 1024;
/// Target size for the serialized request envelope.
pub(crate) const TARGET_FRAME_BYTES: usize = FRAME_LIMIT_BYTES - FRAME_HEADROOM_BYTES;
/// Floor for the per-attachment base64 budget.
const MIN_ATTACHMENT_BASE64_LEN: usize = 12 * 1024;

/// Re-encode qualities, tried high to low.
const JPEG_QUALITIES: [u8; 7] = [82, 72, 62, 52, 44, 36, 30];
/// Max dimensions, tried high to low.
const MAX_DIMENSIONS: [u32; 9] = [1920, 1600, 1280, 1024, 800, 640, 512, 384, 256];

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("gateway payload too large before attachments ({bytes} bytes)")]
    BaseTooLarge { bytes: usize },
    #[error(
        "{name} is too large and cannot be auto-compressed (mime={mime:?}); use a media URL for large files"
    )]
    NotCompressible { name: String, mime: String },
    #[error("{name} has invalid base64 content")]
    InvalidBase64 { name: String },
    #[error("{name} cannot be decoded as an image: {source}")]
    ImageDecode {
        name: String,
        source: image::ImageError,
    },
    #[error(
        "attachment payload still too large for gateway after compression ({bytes} bytes > {target} bytes); use a media URL for large files"
    )]
    StillTooLarge { bytes: usize, target: usize },
}

/// Outcome of a fit pass. `attachments` replaces the input list on success.
#[derive(Debug)]
pub struct FitResult {
    pub attachments: Vec<Map<String, Value>>,
    pub changed: bool,
    pub before_bytes: usize,
    pub after_bytes: usize,
}

/// Fit the attachments of a request under the envelope target. The input is
/// never mutated; failures leave no partial result behind.
pub fn fit_attachments(
    method: &str,
    req_id: &str,
    base_params: &Map<String, Value>,
    attachments: &[Map<String, Value>],
) -> Result<FitResult, FitError> {
    if attachments.is_empty() {
        return Ok(FitResult {
            attachments: Vec::new(),
            changed: false,
            before_bytes: 0,
            after_bytes: 0,
        });
    }

    let mut fitted: Vec<Map<String, Value>> = attachments.to_vec();
    let before = estimate_request_bytes(method, req_id, &with_attachments(base_params, &fitted));
    if before <= TARGET_FRAME_BYTES {
        return Ok(FitResult {
            attachments: fitted,
            changed: false,
            before_bytes: before,
            after_bytes: before,
        });
    }

    let mut base_only = base_params.clone();
    base_only.remove("attachments");
    let base_only_bytes = estimate_request_bytes(method, req_id, &base_only);
    if base_only_bytes >= TARGET_FRAME_BYTES {
        return Err(FitError::BaseTooLarge {
            bytes: base_only_bytes,
        });
    }

    let per_attachment_target =
        ((TARGET_FRAME_BYTES - base_only_bytes) / fitted.len()).max(MIN_ATTACHMENT_BASE64_LEN);

    let mut changed = false;
    for attachment in fitted.iter_mut() {
        if let Some(compressed) = try_compress_attachment(attachment, per_attachment_target)? {
            *attachment = compressed;
            changed = true;
        }
    }

    let mut after = estimate_request_bytes(method, req_id, &with_attachments(base_params, &fitted));
    let mut step = 0;
    while after > TARGET_FRAME_BYTES && step < 8 {
        step += 1;
        let Some(idx) = largest_attachment_index(&fitted) else {
            break;
        };
        let current_len = attachment_content_len(&fitted[idx]);
        if current_len <= MIN_ATTACHMENT_BASE64_LEN {
            break;
        }
        let next_target =
            (((current_len as f64) * 0.75) as usize).max(MIN_ATTACHMENT_BASE64_LEN);
        let Some(next) = try_compress_attachment(&fitted[idx], next_target)? else {
            break;
        };
        if attachment_content_len(&next) >= current_len {
            break;
        }
        fitted[idx] = next;
        changed = true;
        after = estimate_request_bytes(method, req_id, &with_attachments(base_params, &fitted));
    }

    if after > TARGET_FRAME_BYTES {
        return Err(FitError::StillTooLarge {
            bytes: after,
            target: TARGET_FRAME_BYTES,
        });
    }

    Ok(FitResult {
        attachments: fitted,
        changed,
        before_bytes: before,
        after_bytes: after,
    })
}

/// Attempt to bring one attachment's base64 content under the target length.
/// Returns `None` when the attachment is already small enough (or carries no
/// content), the re-encoded replacement otherwise.
fn try_compress_attachment(
    attachment: &Map<String, Value>,
    target_base64_len: usize,
) -> Result<Option<Map<String, Value>>, FitError> {
    let Some(Value::String(content)) = attachment.get("content") else {
        return Ok(None);
    };
    let content = content.trim();
    if content.is_empty() || content.len() <= target_base64_len {
        return Ok(None);
    }

    let mime = attachment
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !is_image_mime(mime) {
        return Err(FitError::NotCompressible {
            name: attachment_name(attachment),
            mime: mime.trim().to_string(),
        });
    }

    let decoded = decode_attachment_base64(content).map_err(|_| FitError::InvalidBase64 {
        name: attachment_name(attachment),
    })?;
    let img = image::load_from_memory(&decoded).map_err(|source| FitError::ImageDecode {
        name: attachment_name(attachment),
        source,
    })?;

    let mut best: Option<String> = None;
    for max_dim in MAX_DIMENSIONS {
        let resized = resize_down_if_needed(&img, max_dim);
        let flattened = flatten_alpha(&resized);
        for quality in JPEG_QUALITIES {
            let Ok(bytes) = encode_jpeg(&flattened, quality) else {
                continue;
            };
            let candidate = base64::engine::general_purpose::STANDARD.encode(&bytes);
            if candidate.len() <= target_base64_len {
                return Ok(Some(rewrite_attachment(attachment, candidate)));
            }
            match &best {
                Some(existing) if existing.len() <= candidate.len() => {}
                _ => best = Some(candidate),
            }
        }
    }

    // Nothing met the target; keep the smallest rendition we produced.
    Ok(best.map(|candidate| rewrite_attachment(attachment, candidate)))
}

/// Replace the content and rewrite mime/type/extension for the JPEG output.
fn rewrite_attachment(attachment: &Map<String, Value>, content: String) -> Map<String, Value> {
    let mut out = attachment.clone();
    out.insert("content".to_string(), Value::String(content));
    out.insert("mimeType".to_string(), Value::String("image/jpeg".to_string()));
    out.insert("type".to_string(), Value::String("image".to_string()));
    if let Some(Value::String(name)) = attachment.get("fileName") {
        if !name.trim().is_empty() {
            out.insert(
                "fileName".to_string(),
                Value::String(replace_extension(name, ".jpg")),
            );
        }
    }
    out
}

/// Serialized size of the full request envelope with the given params.
fn estimate_request_bytes(method: &str, req_id: &str, params: &Map<String, Value>) -> usize {
    let msg = json!({
        "type": "req",
        "id": req_id,
        "method": method,
        "params": params,
    });
    serde_json::to_vec(&msg).map(|b| b.len()).unwrap_or(0)
}

fn with_attachments(
    base: &Map<String, Value>,
    attachments: &[Map<String, Value>],
) -> Map<String, Value> {
    let mut out = base.clone();
    if !attachments.is_empty() {
        out.insert(
            "attachments".to_string(),
            Value::Array(attachments.iter().cloned().map(Value::Object).collect()),
        );
    }
    out
}

fn largest_attachment_index(attachments: &[Map<String, Value>]) -> Option<usize> {
    let mut max_len = 0;
    let mut idx = None;
    for (i, attachment) in attachments.iter().enumerate() {
        let len = attachment_content_len(attachment);
        if len > max_len {
            max_len = len;
            idx = Some(i);
        }
    }
    idx
}

fn attachment_content_len(attachment: &Map<String, Value>) -> usize {
    attachment
        .get("content")
        .and_then(Value::as_str)
        .map(|s| s.trim().len())
        .unwrap_or(0)
}

fn attachment_name(attachment: &Map<String, Value>) -> String {
    match attachment.get("fileName").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => format!("attachment {:?}", name.trim()),
        _ => "attachment".to_string(),
    }
}

fn is_image_mime(mime: &str) -> bool {
    let mime = mime.trim().to_lowercase();
    mime.starts_with("image/") || mime.is_empty()
}

/// Decode base64 content, tolerating a `data:...;base64,` prefix and
/// embedded whitespace.
fn decode_attachment_base64(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut s = content.trim();
    if let Some(comma) = s.find(',') {
        if s[..comma].to_lowercase().contains("base64") {
            s = &s[comma + 1..];
        }
    }
    let cleaned: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(cleaned.as_bytes())
}

fn replace_extension(name: &str, new_ext: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}{}", &name[..idx], new_ext),
        _ => format!("{}{}", name, new_ext),
    }
}

/// Scale down so neither dimension exceeds `max_dim`, preserving aspect
/// ratio. Images already inside the bound pass through untouched.
fn resize_down_if_needed(src: &DynamicImage, max_dim: u32) -> DynamicImage {
    let (w, h) = src.dimensions();
    if max_dim == 0 || (w <= max_dim && h <= max_dim) {
        return src.clone();
    }
    src.resize(max_dim, max_dim, FilterType::Nearest)
}

/// Composite over opaque white; JPEG has no alpha channel.
fn flatten_alpha(src: &DynamicImage) -> RgbImage {
    let rgba = src.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let px = if a == 255 {
            [r, g, b]
        } else {
            let alpha = a as f32 / 255.0;
            let blend = |c: u8| ((c as f32) * alpha + 255.0 * (1.0 - alpha)) as u8;
            [blend(r), blend(g), blend(b)]
        };
        out.put_pixel(x, y, image::Rgb(px));
    }
    out
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(img)?;
    Ok(buf)
}

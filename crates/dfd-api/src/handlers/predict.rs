//! Video upload and classification.

use std::path::Path;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::Json;
use dfd_models::{Prediction, PredictionMetadata, PredictionRecord};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Suffix used when the upload's own extension is unusable.
const DEFAULT_SUFFIX: &str = ".mp4";

/// An upload written to disk. Dropping it removes the file.
struct UploadedVideo {
    file: NamedTempFile,
    filename: String,
    size: u64,
}

#[derive(Default)]
struct PredictForm {
    video: Option<UploadedVideo>,
    duration: Option<f64>,
    user_email: Option<String>,
    user_name: Option<String>,
    user_profile: Option<String>,
}

/// Classify an uploaded video.
///
/// Form fields: `file` (required, `video/*`), `duration` (seconds),
/// `user_email`, `user_name`, `user_profile`.
pub async fn predict(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<Prediction>> {
    let form = read_form(&state, &mut multipart).await?;

    let max = state.config.max_upload_duration_secs;
    if let Some(duration) = form.duration {
        if duration > max {
            metrics::record_upload_rejected("duration");
            return Err(ApiError::bad_request(format!(
                "Video duration {}s exceeds the {}s limit",
                duration, max
            )));
        }
    }

    let Some(video) = form.video else {
        metrics::record_upload_rejected("missing_file");
        return Err(ApiError::bad_request("No video file uploaded"));
    };
    metrics::record_upload_size(video.size);

    let result = state.classifier.classify(video.file.path()).await;
    remove_upload(video.file);
    let prediction = result?;

    info!(
        filename = %video.filename,
        label = %prediction.label,
        confidence = prediction.confidence,
        "Prediction complete"
    );

    if let Some(store) = &state.store {
        let record = PredictionRecord::new(
            prediction,
            PredictionMetadata {
                filename: video.filename,
                duration: form.duration,
                user_email: form.user_email,
                user_name: form.user_name,
                user_profile: form.user_profile,
            },
        );
        if let Err(e) = store.record(&record).await {
            warn!(backend = %store.backend(), error = %e, "Failed to store prediction");
            metrics::record_store_failure(store.backend().as_str());
        }
    }

    Ok(Json(prediction))
}

async fn read_form(state: &AppState, multipart: &mut Multipart) -> ApiResult<PredictForm> {
    let mut form = PredictForm::default();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                if !is_video_content_type(&content_type) {
                    metrics::record_upload_rejected("content_type");
                    return Err(ApiError::bad_request(format!(
                        "Unsupported content type '{}', expected a video",
                        content_type
                    )));
                }
                if form.video.is_some() {
                    return Err(ApiError::bad_request("Only one video may be uploaded"));
                }
                form.video = Some(save_upload(&state.config.upload_dir, &mut field).await?);
            }
            "duration" => form.duration = parse_duration(&field.text().await?)?,
            "user_email" => form.user_email = non_empty(field.text().await?),
            "user_name" => form.user_name = non_empty(field.text().await?),
            "user_profile" => form.user_profile = non_empty(field.text().await?),
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(form)
}

/// Stream a file field into a fresh temp file under `dir`.
async fn save_upload(dir: &Path, field: &mut Field<'_>) -> ApiResult<UploadedVideo> {
    let filename = field
        .file_name()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload".to_string());

    tokio::fs::create_dir_all(dir).await?;
    let file = tempfile::Builder::new()
        .prefix("upload_")
        .suffix(&upload_suffix(&filename))
        .tempfile_in(dir)?;

    let mut out = tokio::fs::OpenOptions::new().write(true).open(file.path()).await?;
    let mut size = 0u64;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len() as u64;
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    if size == 0 {
        metrics::record_upload_rejected("empty");
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }

    debug!(path = %file.path().display(), bytes = size, "Upload saved");
    Ok(UploadedVideo { file, filename, size })
}

fn remove_upload(file: NamedTempFile) {
    let path = file.path().to_path_buf();
    if let Err(e) = file.close() {
        warn!(path = %path.display(), error = %e, "Failed to remove upload");
    }
}

fn is_video_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().to_ascii_lowercase().starts_with("video/"))
        .unwrap_or(false)
}

/// Keep a short alphanumeric extension so FFmpeg can guess the container.
fn upload_suffix(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

/// Blank means "not given".
fn parse_duration(raw: &str) -> ApiResult<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(d) if d.is_finite() && d >= 0.0 => Ok(Some(d)),
        _ => {
            metrics::record_upload_rejected("duration");
            Err(ApiError::bad_request(format!("Invalid duration: {}", raw)))
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_content_types() {
        assert!(is_video_content_type("video/mp4"));
        assert!(is_video_content_type("Video/QuickTime; codecs=avc1"));
        assert!(!is_video_content_type("image/png"));
        assert!(!is_video_content_type("application/octet-stream"));
        assert!(!is_video_content_type(""));
    }

    #[test]
    fn test_upload_suffix() {
        assert_eq!(upload_suffix("clip.MOV"), ".mov");
        assert_eq!(upload_suffix("clip"), ".mp4");
        assert_eq!(upload_suffix("../../etc/passwd.sh;rm"), ".mp4");
        assert_eq!(upload_suffix("movie.webm"), ".webm");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.5").unwrap(), Some(12.5));
        assert_eq!(parse_duration("  ").unwrap(), None);
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("NaN").is_err());
    }
}

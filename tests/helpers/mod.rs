//! Test helper utilities for E2E testing

use reqwest::multipart;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tokio::time::sleep;

/// Response from POST /queue_analysis
#[derive(Debug, Deserialize)]
pub struct QueueResponse {
    pub analysis_id: i64,
    pub status: String,
}

/// Response from GET /get_analysis
#[derive(Debug, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub patient_name: String,
    pub specialty: String,
    pub status: String,
    pub mode: String,
    pub analysis: Option<String>,
    pub images_json: Vec<String>,
    pub detected_conditions: Vec<String>,
    pub error_message: Option<String>,
    pub upgrade_to_id: Option<i64>,
}

impl AnalysisRecord {
    pub fn is_settled(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "completed_fast" | "failed")
    }
}

pub type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Small PNG generated in memory for multipart uploads.
pub fn sample_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([30, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("PNG encoding failed");
    out.into_inner()
}

/// Queue a note as JSON.
pub async fn queue_note(
    client: &reqwest::Client,
    base_url: &str,
    note: &str,
    specialty: &str,
    mode: &str,
) -> TestResult<QueueResponse> {
    let response = client
        .post(format!("{}/queue_analysis", base_url))
        .json(&serde_json::json!({ "note": note, "specialty": specialty, "mode": mode }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Queueing failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<QueueResponse>().await?)
}

/// Queue a note with image uploads as multipart form data.
pub async fn queue_note_with_images(
    client: &reqwest::Client,
    base_url: &str,
    note: &str,
    mode: &str,
    images: Vec<(&str, Vec<u8>)>,
) -> TestResult<QueueResponse> {
    let mut form = multipart::Form::new()
        .text("note", note.to_string())
        .text("mode", mode.to_string());

    for (filename, bytes) in images {
        form = form.part(
            "images",
            multipart::Part::bytes(bytes)
                .file_name(filename.to_string())
                .mime_str("application/octet-stream")?,
        );
    }

    let response = client
        .post(format!("{}/queue_analysis", base_url))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<QueueResponse>().await?)
}

pub async fn get_analysis(
    client: &reqwest::Client,
    base_url: &str,
    id: i64,
) -> TestResult<AnalysisRecord> {
    let response = client
        .get(format!("{}/get_analysis", base_url))
        .query(&[("id", id.to_string())])
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("Status check failed: {}", error_text).into());
    }

    Ok(response.json::<AnalysisRecord>().await?)
}

/// Poll until the row leaves `pending`/`processing` (with timeout)
pub async fn poll_until_settled(
    client: &reqwest::Client,
    base_url: &str,
    id: i64,
    timeout_secs: u64,
) -> TestResult<AnalysisRecord> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let record = get_analysis(client, base_url, id).await?;
        if record.is_settled() {
            return Ok(record);
        }
        if attempt % 10 == 0 && attempt > 0 {
            println!("  ... still waiting on {} (attempt {}/{})", id, attempt, max_attempts);
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Analysis {} did not settle within {} seconds", id, timeout_secs).into())
}

//! Upload content negotiation
//!
//! Turns one `POST /upload` body into named buffers for the ingest pipeline.
//! Image validation happens downstream; this layer only unpacks transports.

use std::io::{Cursor, Read};

use base64::Engine;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ingest::UploadItem;

/// Multipart field carrying files
const FILE_FIELD: &str = "file";

/// How an upload body is encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadKind {
    /// `multipart/form-data` with the given boundary
    Multipart { boundary: String },
    /// A single raw image
    Raw { name: String },
    /// `{fileData, fileName, fileType, format}` envelope
    Json,
    /// Zip archive, one image per file entry
    Archive,
}

/// Classify a request by its headers
pub fn negotiate(headers: &HeaderMap) -> Result<UploadKind> {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase)
    };
    let mentions_zip = |value: Option<String>| {
        value.is_some_and(|v| v.contains("zip") || v.contains("gzip"))
    };

    let content_type = match header(CONTENT_TYPE) {
        Some(ct) => ct,
        None if mentions_zip(header(CONTENT_ENCODING)) => "application/zip".to_string(),
        None if mentions_zip(header(ACCEPT_ENCODING)) => "application/zip".to_string(),
        None if headers.contains_key(CONTENT_LENGTH) => "application/octet-stream".to_string(),
        None => {
            return Err(Error::InvalidUpload(
                "Content-Type header is missing".to_string(),
            ))
        }
    };

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    match essence.as_str() {
        "multipart/form-data" => {
            let boundary = multer::parse_boundary(&content_type)
                .map_err(|e| Error::InvalidUpload(format!("bad multipart boundary: {}", e)))?;
            Ok(UploadKind::Multipart { boundary })
        }
        "application/octet-stream" => Ok(UploadKind::Raw {
            name: "upload".to_string(),
        }),
        "application/json" => Ok(UploadKind::Json),
        "application/zip" | "application/x-zip-compressed" | "application/gzip" => {
            Ok(UploadKind::Archive)
        }
        other => match other.strip_prefix("image/") {
            Some(subtype) if !subtype.is_empty() => Ok(UploadKind::Raw {
                name: format!("upload.{}", subtype),
            }),
            _ => Err(Error::UnsupportedContentType(content_type)),
        },
    }
}

/// Unpack a body into upload items
pub async fn extract_items(kind: UploadKind, body: Bytes, max_size: usize) -> Result<Vec<UploadItem>> {
    let items = match kind {
        UploadKind::Multipart { boundary } => read_multipart(body, boundary).await?,
        UploadKind::Raw { name } => vec![UploadItem::new(name, body)],
        UploadKind::Json => vec![read_json_envelope(&body)?],
        UploadKind::Archive => {
            tokio::task::spawn_blocking(move || read_archive(body, max_size)).await??
        }
    };

    if items.is_empty() {
        return Err(Error::InvalidUpload("No files uploaded".to_string()));
    }
    Ok(items)
}

async fn read_multipart(body: Bytes, boundary: String) -> Result<Vec<UploadItem>> {
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    let invalid = |e: multer::Error| Error::InvalidUpload(format!("malformed multipart body: {}", e));

    let mut items = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let data = field.bytes().await.map_err(invalid)?;
        items.push(UploadItem::new(name, data));
    }
    Ok(items)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EnvelopeFormat {
    Base64,
    Binary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonEnvelope {
    file_data: Value,
    file_name: String,
    #[allow(dead_code)]
    file_type: String,
    format: EnvelopeFormat,
}

fn read_json_envelope(body: &[u8]) -> Result<UploadItem> {
    let invalid = || Error::InvalidUpload("Invalid JSON payload".to_string());
    let envelope: JsonEnvelope = serde_json::from_slice(body).map_err(|_| invalid())?;
    if envelope.file_name.is_empty() {
        return Err(invalid());
    }

    let data = match (envelope.format, envelope.file_data) {
        (EnvelopeFormat::Base64, Value::String(encoded)) => {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| invalid())?
        }
        (EnvelopeFormat::Binary, Value::String(array)) => {
            serde_json::from_str::<Vec<u8>>(&array).map_err(|_| invalid())?
        }
        (EnvelopeFormat::Binary, array @ Value::Array(_)) => {
            serde_json::from_value::<Vec<u8>>(array).map_err(|_| invalid())?
        }
        _ => return Err(invalid()),
    };

    Ok(UploadItem::new(envelope.file_name, data))
}

/// Read every file entry, refusing archives that inflate past `max_size`
fn read_archive(body: Bytes, max_size: usize) -> Result<Vec<UploadItem>> {
    let invalid = |e: zip::result::ZipError| Error::InvalidUpload(format!("bad archive: {}", e));
    let mut archive = zip::ZipArchive::new(Cursor::new(body)).map_err(invalid)?;

    let mut items = Vec::new();
    let mut total = 0usize;
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(invalid)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();

        let budget = max_size.saturating_sub(total);
        let mut data = Vec::new();
        entry
            .take(budget as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::InvalidUpload(format!("bad archive entry {}: {}", name, e)))?;
        if data.len() > budget {
            return Err(Error::InvalidUpload(format!(
                "archive inflates beyond {} bytes",
                max_size
            )));
        }
        total += data.len();
        items.push(UploadItem::new(name, data));
    }
    Ok(items)
}

// =============================================================================
// Tests
// =============================================================================

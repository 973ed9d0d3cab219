//! One-shot HTTP upload of a script to the device.
//!
//! The device accepts `POST /upload/<file name>` with a multipart form
//! holding a single `file` field. The upload is stateless: no retry, no
//! resume; the caller decides what to do with a failure.

use std::time::Duration;

use reqwest::Url;
use reqwest::multipart::{Form, Part};

use crate::config::device_host;
use crate::error::UploadError;

/// HTTP client bound to one device.
#[derive(Debug, Clone)]
pub struct Uploader {
    http: reqwest::Client,
    base: Url,
}

impl Uploader {
    /// Creates an uploader for the device at `device_url`.
    ///
    /// Requests go to `http://<host>[:port]/`; an explicit port in
    /// `device_url` is kept, any path is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidAddress`] if `device_url` has no host,
    /// and [`UploadError::Http`] if the HTTP client cannot be built.
    pub fn new(device_url: &str, timeout: Duration) -> Result<Self, UploadError> {
        let host =
            device_host(device_url).ok_or_else(|| UploadError::InvalidAddress(device_url.into()))?;
        let port = explicit_port(device_url);
        let authority = match port {
            Some(port) => format!("http://{host}:{port}/"),
            None => format!("http://{host}/"),
        };
        let base = Url::parse(&authority)
            .map_err(|err| UploadError::InvalidAddress(format!("{device_url}: {err}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    /// URL the script named `file_name` is posted to.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidAddress`] if the base URL cannot carry
    /// a path.
    pub fn upload_url(&self, file_name: &str) -> Result<Url, UploadError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| UploadError::InvalidAddress(self.base.to_string()))?
            .clear()
            .extend(["upload", file_name]);
        Ok(url)
    }

    /// Uploads `contents` as `file_name`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Http`] on transport failures and
    /// [`UploadError::Status`] when the device rejects the upload.
    pub async fn upload(&self, file_name: &str, contents: String) -> Result<(), UploadError> {
        let url = self.upload_url(file_name)?;
        let size = contents.len();
        let form = Form::new().part("file", Part::text(contents).file_name(file_name.to_string()));

        tracing::info!(%url, size, "uploading script");
        let response = self.http.post(url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status));
        }
        tracing::debug!(%status, "upload accepted");
        Ok(())
    }
}

fn explicit_port(device_url: &str) -> Option<u16> {
    if !device_url.contains("://") {
        return Url::parse(&format!("http://{}", device_url.trim()))
            .ok()?
            .port();
    }
    Url::parse(device_url.trim()).ok()?.port()
}

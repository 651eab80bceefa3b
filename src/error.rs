// src/error.rs
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the camera and the model.
///
/// All variants are recoverable: the controller turns them into an inline
/// alert and the user retakes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Camera missing, denied, failed mid-stream, or no alternate device to flip to.
    #[error("Camera error: {0}")]
    Device(String),

    /// Captured payload is not a base64 JPEG/PNG/WEBP data URL.
    #[error("Invalid image format received from camera.")]
    Format,

    /// The model answered but without an image part.
    #[error("Model did not return an image. Response: {0}")]
    ModelOutput(String),

    /// Transport, auth or decoding failure talking to the model endpoint.
    #[error("Image could not be processed. {0}")]
    Conversion(String),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                let message = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
                    .unwrap_or(body);
                Error::Conversion(format!("HTTP {}: {}", code, message.trim()))
            }
            ureq::Error::Transport(transport) => Error::Conversion(transport.to_string()),
        }
    }
}

impl From<nokhwa::NokhwaError> for Error {
    fn from(err: nokhwa::NokhwaError) -> Self {
        Error::Device(err.to_string())
    }
}

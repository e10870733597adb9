use crate::error::StreamError;
use reqwest::Response;

/// Pass successful responses through, turn anything else into a status error
/// carrying the response body.
pub async fn check_response_status(response: Response) -> Result<Response, StreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .map_err(|e| StreamError::Network(e.to_string()))?;

    Err(StreamError::Status {
        status: status.as_u16(),
        body,
    })
}

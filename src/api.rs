use std::fmt;

use actix_web::{http::StatusCode, HttpRequest, HttpResponse, ResponseError};

use crate::error::{Error, ErrorResponse};

pub mod health;
pub mod messages;

/// [`Error`] tagged with the request path it occurred on.
#[derive(Debug)]
pub struct ApiError {
    path: String,
    error: Error,
}

impl ApiError {
    pub fn new(req: &HttpRequest, error: impl Into<Error>) -> Self {
        Self {
            path: req.path().to_owned(),
            error: error.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.error.status_code()
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorResponse {
            status: status.as_u16(),
            message: self.error.to_string(),
            path: Some(self.path.clone()),
        })
    }
}

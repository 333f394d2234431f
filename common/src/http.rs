use actix_web::{HttpResponse, Responder, http::StatusCode};
use serde::Serialize;

use super::error::Res;

/// Shorthand constructors for JSON success responses returned by route handlers.
pub struct Success;

impl Success {
    pub fn ok<T: Serialize>(body: T) -> Res<impl Responder> {
        Ok(HttpResponse::Ok().json(body))
    }

    pub fn created<T: Serialize>(body: T) -> Res<impl Responder> {
        Ok(HttpResponse::Created().json(body))
    }

    /// Responds with an explicit status code. Used where a handled outcome
    /// (such as an entitlement denial) still carries a structured body.
    pub fn with_status<T: Serialize>(status: StatusCode, body: T) -> Res<impl Responder> {
        Ok(HttpResponse::build(status).json(body))
    }
}

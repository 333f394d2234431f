use actix_web::{HttpResponse, http::StatusCode};
use thiserror::Error;

pub type Res<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    // === CONVERSION ERRORS ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    JWT(#[from] jsonwebtoken::errors::Error),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    // === BILLING ERRORS ===
    #[error("Trial not available: {0}")]
    TrialNotEligible(String),

    #[error("Quota exceeded for {feature}: limit {limit} reached")]
    QuotaExceeded { feature: String, limit: i64 },

    #[error("Cannot {action} while subscription is {status}")]
    InvalidTransition { action: String, status: String },

    #[error("Payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    // === APPLICATION ERRORS ===
    #[error("Authorization error: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    #[error("Too Many Requests: {0}")]
    TooManyRequests(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_transition(action: &str, status: impl ToString) -> Self {
        AppError::InvalidTransition {
            action: action.to_string(),
            status: status.to_string(),
        }
    }

    /// Stable machine-readable code sent next to the message so clients can
    /// branch (e.g. fall back to checkout on `trial_not_eligible`).
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_)
            | AppError::JWT(_)
            | AppError::Reqwest(_)
            | AppError::Internal(_) => "internal",
            AppError::Stripe(_) | AppError::ProcessorUnavailable(_) => "processor_unavailable",
            AppError::TrialNotEligible(_) => "trial_not_eligible",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unprocessable(_) => "unprocessable",
            AppError::TooManyRequests(_) => "too_many_requests",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_)
            | AppError::JWT(_)
            | AppError::Reqwest(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Stripe(_) => StatusCode::BAD_GATEWAY,
            AppError::ProcessorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TrialNotEligible(_)
            | AppError::QuotaExceeded { .. }
            | AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn to_http_response(&self) -> HttpResponse {
        let is_dev = cfg!(debug_assertions);

        let to_internal_json = |err_msg: &str| {
            if is_dev {
                serde_json::json!({ "error": err_msg, "code": self.code() })
            } else {
                serde_json::json!({ "error": "Internal server error", "code": self.code() })
            }
        };

        match self {
            // === CONVERSION ERRORS ===
            AppError::Database(error) => {
                log::error!("Database error: {}", error);
                HttpResponse::build(self.status()).json(to_internal_json(&error.to_string()))
            }
            AppError::JWT(error) => {
                log::error!("JWT error: {}", error);
                HttpResponse::build(self.status()).json(to_internal_json(&error.to_string()))
            }
            AppError::Reqwest(error) => {
                log::error!("Reqwest error: {}", error);
                HttpResponse::build(self.status()).json(to_internal_json(&error.to_string()))
            }
            AppError::Stripe(error) => {
                log::error!("Stripe error: {}", error);
                HttpResponse::build(self.status()).json(to_internal_json(&error.to_string()))
            }
            AppError::ProcessorUnavailable(error) => {
                log::error!("Payment processor unavailable: {}", error);
                HttpResponse::build(self.status()).json(serde_json::json!({
                    "error": "Payment processor unavailable, please retry later",
                    "code": self.code(),
                }))
            }
            AppError::Internal(error) => {
                log::error!("Internal error: {}", error);
                HttpResponse::build(self.status()).json(to_internal_json(error))
            }

            // === EXPECTED FAILURES ===
            // denials and rejected transitions are logged where the context lives
            _ => HttpResponse::build(self.status()).json(serde_json::json!({
                "error": self.to_string(),
                "code": self.code(),
            })),
        }
    }
}

impl actix_web::ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        self.to_http_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_documented_statuses() {
        assert_eq!(
            AppError::TrialNotEligible("device".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::QuotaExceeded {
                feature: "budgets".into(),
                limit: 2
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::invalid_transition("cancel", "FREE").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Unprocessable("plan".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert!(
            AppError::ProcessorUnavailable("timeout".into())
                .status()
                .is_server_error()
        );
    }

    #[test]
    fn invalid_transition_message_names_action_and_status() {
        let err = AppError::invalid_transition("reactivate", "ACTIVE");
        assert_eq!(err.to_string(), "Cannot reactivate while subscription is ACTIVE");
        assert_eq!(err.code(), "invalid_transition");
    }
}

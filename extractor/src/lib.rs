use middleware::{extractor::ExtractionMiddleware, guard::RequireClaims};

pub mod middleware {
    pub mod extractor;
    pub mod guard;
}

/// Parses the bearer token, if any, into request extensions.
pub fn middleware() -> ExtractionMiddleware {
    ExtractionMiddleware::new()
}

/// Rejects requests without valid claims with 401.
pub fn require_claims() -> RequireClaims {
    RequireClaims::new()
}

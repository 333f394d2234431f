use middleware::{global::GlobalLimiter, user::UserRateLimiter};

pub mod middleware {
    pub mod global;
    pub mod user;
}

/// Global limiter that lets processor webhooks through regardless of load.
pub fn global_middleware(permits_per_second: u32) -> GlobalLimiter {
    GlobalLimiter::new(permits_per_second).exempt("/api/webhooks")
}

pub fn user_middleware(permits_per_second: u32) -> UserRateLimiter {
    UserRateLimiter::new(permits_per_second)
}

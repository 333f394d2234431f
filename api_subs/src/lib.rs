use actix_web::web::{self};

pub use services::stripe::StripeProcessor;

pub mod routes {
    pub mod pay;
    pub mod sub;
}

mod services {
    pub(crate) mod stripe;
}

mod dtos {
    pub(crate) mod pay;
    pub(crate) mod sub;
}

/// Subscription routes. Every handler reads the caller from the JWT claims,
/// so the scope must sit behind the extractor guard.
pub fn mount_subs() -> actix_web::Scope {
    web::scope("/subscriptions")
        .service(routes::sub::get_plans)
        .service(routes::sub::get_current)
        .service(routes::sub::get_trial_eligibility)
        .service(routes::sub::post_start_trial)
        .service(routes::sub::post_cancel)
        .service(routes::sub::post_reactivate)
        .service(routes::sub::post_change_plan)
        .service(routes::sub::post_entitlement)
        .service(routes::sub::get_entitlement)
        .service(routes::sub::post_release_usage)
        .service(routes::pay::post_checkout)
        .service(routes::pay::get_checkout)
        .service(routes::pay::get_payments)
}

pub fn mount_webhook() -> actix_web::Scope {
    web::scope("/webhooks").service(routes::pay::post_webhook)
}

use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use common::error::AppError;
use governor::{
    Quota, RateLimiter,
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
};
use std::{future::Future, num::NonZeroU32, pin::Pin, rc::Rc, sync::Arc};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Process-wide budget shared by every request. Paths under an exempt prefix
/// (processor webhooks) bypass it: a dropped delivery delays billing state.
pub struct GlobalLimiter {
    limiter: Arc<DirectLimiter>,
    exempt: Rc<Vec<String>>,
}

impl GlobalLimiter {
    pub fn new(permits_per_sec: u32) -> Self {
        let quota = Quota::per_second(permits(permits_per_sec));
        let limiter = Arc::new(RateLimiter::direct(quota));
        Self {
            limiter,
            exempt: Rc::new(Vec::new()),
        }
    }

    pub fn exempt(mut self, prefix: &str) -> Self {
        Rc::make_mut(&mut self.exempt).push(prefix.to_string());
        self
    }
}

/// A zero rate would block everything, so it is raised to one.
pub(crate) fn permits(per_second: u32) -> NonZeroU32 {
    NonZeroU32::new(per_second).unwrap_or_else(|| {
        log::warn!("Rate limit of 0 requests per second raised to 1");
        NonZeroU32::MIN
    })
}

impl<S, B> Transform<S, ServiceRequest> for GlobalLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Transform = GlobalLimiterService<S>;
    type InitError = ();
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(GlobalLimiterService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            exempt: self.exempt.clone(),
        }))
    }
}

pub struct GlobalLimiterService<S> {
    service: Rc<S>,
    limiter: Arc<DirectLimiter>,
    exempt: Rc<Vec<String>>,
}

impl<S, B> Service<ServiceRequest> for GlobalLimiterService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let srv = Rc::clone(&self.service);
        let limiter = self.limiter.clone();
        let exempt = self
            .exempt
            .iter()
            .any(|prefix| req.path().starts_with(prefix.as_str()));
        Box::pin(async move {
            if exempt || limiter.check().is_ok() {
                return srv.call(req).await.map(|res| res.map_into_boxed_body());
            }
            log::warn!(
                "Global rate limit hit, rejecting {} {}",
                req.method(),
                req.path()
            );
            Ok(req.error_response(AppError::TooManyRequests(
                "Server overloaded. Please try again later.".to_string(),
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    use super::*;

    #[actix_web::test]
    async fn webhooks_bypass_an_exhausted_budget() {
        let app = test::init_service(
            App::new()
                .wrap(GlobalLimiter::new(1).exempt("/api/webhooks"))
                .route(
                    "/api/subscriptions/current",
                    web::get().to(|| async { HttpResponse::Ok().finish() }),
                )
                .route(
                    "/api/webhooks/stripe",
                    web::post().to(|| async { HttpResponse::Ok().finish() }),
                ),
        )
        .await;

        let current = || {
            test::TestRequest::get()
                .uri("/api/subscriptions/current")
                .to_request()
        };
        assert_eq!(test::call_service(&app, current()).await.status(), StatusCode::OK);
        assert_eq!(
            test::call_service(&app, current()).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        for _ in 0..3 {
            let webhook = test::TestRequest::post()
                .uri("/api/webhooks/stripe")
                .to_request();
            assert_eq!(test::call_service(&app, webhook).await.status(), StatusCode::OK);
        }
    }
}

use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use common::{error::AppError, jwt::JwtClaims};
use governor::{
    Quota, RateLimiter,
    clock::QuantaClock,
    state::keyed::DashMapStateStore,
};
use std::{future::Future, pin::Pin, rc::Rc, sync::Arc};
use uuid::Uuid;

use super::global::permits;

type UserLimiter = RateLimiter<Uuid, DashMapStateStore<Uuid>, QuantaClock>;

/// Per-user request rate, keyed on the authenticated user id. Must run
/// behind the claims guard; requests without claims pass through untouched.
pub struct UserRateLimiter {
    limiter: Arc<UserLimiter>,
}

impl UserRateLimiter {
    pub fn new(permits_per_sec: u32) -> Self {
        let quota = Quota::per_second(permits(permits_per_sec));
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for UserRateLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Transform = UserRateLimiterService<S>;
    type InitError = ();
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(UserRateLimiterService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct UserRateLimiterService<S> {
    service: Rc<S>,
    limiter: Arc<UserLimiter>,
}

impl<S, B> Service<ServiceRequest> for UserRateLimiterService<S>
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
        let user_id = req.extensions().get::<JwtClaims>().map(|claims| claims.user_id);

        if let Some(user_id) = user_id {
            if self.limiter.check_key(&user_id).is_err() {
                log::debug!("User {} is over the request rate", user_id);
                let response = req.error_response(AppError::TooManyRequests(
                    "Too many requests, slow down".to_string(),
                ));
                return Box::pin(async move { Ok(response) });
            }
        }

        Box::pin(async move { srv.call(req).await.map(|res| res.map_into_boxed_body()) })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    use super::*;

    #[actix_web::test]
    async fn each_user_has_their_own_budget() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let app = test::init_service(
            App::new()
                .wrap(UserRateLimiter::new(1))
                .wrap_fn(|req, srv| {
                    let user_id = req
                        .headers()
                        .get("x-user")
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| Uuid::parse_str(value).ok());
                    if let Some(user_id) = user_id {
                        req.extensions_mut().insert(JwtClaims {
                            user_id,
                            stripe_customer_id: None,
                            exp: usize::MAX,
                        });
                    }
                    srv.call(req)
                })
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let call = |user_id: Uuid| {
            test::TestRequest::get()
                .uri("/")
                .insert_header(("x-user", user_id.to_string()))
                .to_request()
        };
        assert_eq!(test::call_service(&app, call(first)).await.status(), StatusCode::OK);
        assert_eq!(
            test::call_service(&app, call(first)).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(test::call_service(&app, call(second)).await.status(), StatusCode::OK);
    }
}

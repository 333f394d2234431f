use std::{future::Future, pin::Pin, sync::Arc};

use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures::future::{Ready, ok};

use common::jwt::get_jwt_claims_or_error;

/// Lets a request through only when the extractor left valid claims on it,
/// and exposes them to handlers as `web::ReqData<JwtClaims>`.
pub struct RequireClaims {}

impl RequireClaims {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for RequireClaims {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireClaims
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Transform = RequireClaimsService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequireClaimsService {
            service: Arc::new(service),
        })
    }
}

pub struct RequireClaimsService<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for RequireClaimsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<actix_web::body::BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let claims = match get_jwt_claims_or_error(&req) {
            Ok(claims) => claims,
            Err(response) => {
                log::debug!("Rejected unauthenticated request to {}", req.path());
                return Box::pin(async move { Ok(req.into_response(response)) });
            }
        };
        req.extensions_mut().insert(claims);

        let srv = Arc::clone(&self.service);
        Box::pin(async move { srv.call(req).await.map(|res| res.map_into_boxed_body()) })
    }
}

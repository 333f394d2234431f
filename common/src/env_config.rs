use std::{env, sync::Arc, time::Duration};

use crate::misc::{BillingPeriod, PlanId};

#[derive(Clone, Debug)]
/// Configuration struct for the server.
///
/// Holds everything needed to run the billing service: database connection,
/// JWT validation, server binding, CORS, logging, the Stripe account with its
/// price ids, the user directory and the engine's timing knobs.
pub struct Config {
    // environment
    pub environment: String, // development or production
    /// The URL of the database to connect to.
    pub database_url: String,
    /// Configuration for JWT (JSON Web Token) authentication.
    pub jwt_config: JwtConfig,
    /// The hostname or IP address the server will bind to.
    pub server_host: String,
    /// The port number the server will listen on.
    pub server_port: u16,
    /// The number of worker threads to spawn for handling requests.
    pub num_workers: usize,
    /// The allowed origin for CORS (Cross-Origin Resource Sharing).
    pub cors_allowed_origin: String,
    /// A boolean indicating whether console logging is enabled.
    pub console_logging_enabled: bool,
    /// Maximum number of requests per second accepted by the whole server.
    pub global_rate_limit: u32,
    /// Maximum number of requests per second accepted from one user.
    pub user_rate_limit: u32,
    /// Stripe secret key
    pub stripe_secret_key: String,
    /// Stripe webhook secret
    pub stripe_webhook_secret: String,
    /// Stripe price ids for every paid plan and billing period.
    pub stripe_prices: StripePrices,
    /// Where Stripe Checkout sends the user after paying.
    pub checkout_success_url: String,
    /// Where Stripe Checkout sends the user after backing out.
    pub checkout_cancel_url: String,
    /// Upper bound for any single call to the payment processor.
    pub processor_timeout: Duration,
    /// Length of a free trial in days.
    pub trial_days: i64,
    /// Base URL of the user directory service.
    pub user_directory_url: String,
    /// API key sent to the user directory service.
    pub user_directory_api_key: String,
    /// Interval of the background sweep that expires lapsed subscriptions.
    pub expiry_sweep_interval: Duration,
}

#[derive(Clone, Debug, Default)]
/// Stripe price ids per paid plan and billing period.
pub struct StripePrices {
    pub plus_monthly: String,
    pub plus_yearly: String,
    pub pro_monthly: String,
    pub pro_yearly: String,
}

impl StripePrices {
    /// Returns the configured price id, or `None` for FREE and unset prices.
    pub fn price_for(&self, plan: PlanId, period: BillingPeriod) -> Option<&str> {
        let price = match (plan, period) {
            (PlanId::Free, _) => return None,
            (PlanId::Plus, BillingPeriod::Monthly) => &self.plus_monthly,
            (PlanId::Plus, BillingPeriod::Yearly) => &self.plus_yearly,
            (PlanId::Pro, BillingPeriod::Monthly) => &self.pro_monthly,
            (PlanId::Pro, BillingPeriod::Yearly) => &self.pro_yearly,
        };
        if price.is_empty() { None } else { Some(price) }
    }

    /// Reverse lookup used when the processor reports a price id back.
    pub fn plan_for_price(&self, price_id: &str) -> Option<(PlanId, BillingPeriod)> {
        [
            (PlanId::Plus, BillingPeriod::Monthly),
            (PlanId::Plus, BillingPeriod::Yearly),
            (PlanId::Pro, BillingPeriod::Monthly),
            (PlanId::Pro, BillingPeriod::Yearly),
        ]
        .into_iter()
        .find(|(plan, period)| self.price_for(*plan, *period) == Some(price_id))
    }
}

#[derive(Clone, Debug)]
/// Configuration for JSON Web Token (JWT) authentication.
///
/// This struct contains the secret key used to verify JWTs issued by the
/// auth service and the expiration time in hours for locally issued tokens.
pub struct JwtConfig {
    /// The secret key used to sign and verify JWTs.
    pub secret: String,
    /// The expiration time for JWTs in hours.
    pub expiration_hours: i64,
}

impl JwtConfig {
    /// Creates a new `JwtConfig` instance from environment variables.
    ///
    /// - `JWT_SECRET`: Required. The secret key for JWT signing.
    /// - `JWT_EXPIRATION_HOURS`: Optional. Defaults to 24 hours if not provided.
    ///
    /// # Panics
    ///
    /// Panics if `JWT_SECRET` is not set or `JWT_EXPIRATION_HOURS` is not a number.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        JwtConfig {
            secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            expiration_hours: env::var("JWT_EXPIRATION_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .expect("JWT_EXPIRATION_HOURS must be a valid number"),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new `Config` instance from environment variables.
    ///
    /// # Environment Variables
    ///
    /// Required:
    /// - `ENVIRONMENT`: `development` or `production`
    /// - `DATABASE_URL`: Connection string for the database
    /// - `JWT_SECRET`: Secret key for JWT validation (via `JwtConfig::from_env()`)
    ///
    /// Optional (with defaults):
    /// - `IP`: Server host (default: "127.0.0.1")
    /// - `PORT`: Server port (default: 8080)
    /// - `WORKERS`: Number of worker threads (default: 4)
    /// - `CORS_ALLOWED_ORIGIN`: Allowed CORS origin (default: "http://localhost:3000")
    /// - `ENABLE_CONSOLE_LOGGING`: Whether to enable console logging (default: true)
    /// - `GLOBAL_RATE_LIMIT`: Requests per second (default: 50)
    /// - `USER_RATE_LIMIT`: Requests per second per user (default: 10)
    /// - `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`
    /// - `STRIPE_PRICE_PLUS_MONTHLY`, `STRIPE_PRICE_PLUS_YEARLY`,
    ///   `STRIPE_PRICE_PRO_MONTHLY`, `STRIPE_PRICE_PRO_YEARLY`
    /// - `CHECKOUT_SUCCESS_URL`, `CHECKOUT_CANCEL_URL`
    /// - `PROCESSOR_TIMEOUT_SECS` (default: 10)
    /// - `TRIAL_DAYS` (default: 7)
    /// - `USER_DIRECTORY_URL`, `USER_DIRECTORY_API_KEY`
    /// - `EXPIRY_SWEEP_SECS` (default: 300)
    ///
    /// # Panics
    ///
    /// Panics if a required environment variable is missing.
    pub fn from_env() -> Arc<Self> {
        dotenvy::dotenv().ok();

        Arc::new(Config {
            environment: env::var("ENVIRONMENT").expect("ENVIRONMENT must be set"),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            jwt_config: JwtConfig::from_env(),
            server_host: env::var("IP").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env_or("PORT", 8080),
            num_workers: env_or("WORKERS", 4),
            cors_allowed_origin: env::var("CORS_ALLOWED_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            console_logging_enabled: env::var("ENABLE_CONSOLE_LOGGING")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                == "true",
            global_rate_limit: env_or("GLOBAL_RATE_LIMIT", 50),
            user_rate_limit: env_or("USER_RATE_LIMIT", 10),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_prices: StripePrices {
                plus_monthly: env::var("STRIPE_PRICE_PLUS_MONTHLY").unwrap_or_default(),
                plus_yearly: env::var("STRIPE_PRICE_PLUS_YEARLY").unwrap_or_default(),
                pro_monthly: env::var("STRIPE_PRICE_PRO_MONTHLY").unwrap_or_default(),
                pro_yearly: env::var("STRIPE_PRICE_PRO_YEARLY").unwrap_or_default(),
            },
            checkout_success_url: env::var("CHECKOUT_SUCCESS_URL").unwrap_or_else(|_| {
                "http://localhost:3000/subscription/success?session_id={CHECKOUT_SESSION_ID}"
                    .to_string()
            }),
            checkout_cancel_url: env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/subscription/canceled".to_string()),
            processor_timeout: Duration::from_secs(env_or("PROCESSOR_TIMEOUT_SECS", 10)),
            trial_days: env_or("TRIAL_DAYS", 7),
            user_directory_url: env::var("USER_DIRECTORY_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            user_directory_api_key: env::var("USER_DIRECTORY_API_KEY").unwrap_or_default(),
            expiry_sweep_interval: Duration::from_secs(env_or("EXPIRY_SWEEP_SECS", 300)),
        })
    }
}

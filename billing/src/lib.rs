//! Entitlement and billing lifecycle engine.
//!
//! Everything that decides which plan a user is on and what that plan lets
//! them do lives here: the versioned plan catalog, monthly quota counters,
//! the trial guard, the subscription state machine, the checkout bridge to
//! the payment processor and the entitlement resolver. Storage, the payment
//! processor, the user directory and outbound notifications are traits so
//! the engine runs the same against Postgres and against the in-memory
//! doubles in [`testing`].

use std::{sync::Arc, time::Duration};

use common::error::Res;

use crate::{
    checkout::CheckoutBridge,
    clock::Clock,
    directory::UserDirectory,
    machine::SubscriptionMachine,
    notifier::Notifier,
    processor::PaymentProcessor,
    quota::QuotaTracker,
    resolver::EntitlementResolver,
    store::BillingStore,
    trial::TrialGuard,
};

pub mod catalog;
pub mod checkout;
pub mod clock;
pub mod directory;
pub mod machine;
pub mod model;
pub mod notifier;
pub mod processor;
pub mod quota;
pub mod resolver;
pub mod store;
pub mod testing;
pub mod trial;

/// Tunables read from the service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub trial_days: i64,
    pub processor_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            trial_days: 7,
            processor_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators the engine is built from.
pub struct Deps {
    pub store: Arc<dyn BillingStore>,
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub settings: Settings,
}

/// The wired engine, shared with route handlers as app data.
#[derive(Clone)]
pub struct Billing {
    pub machine: Arc<SubscriptionMachine>,
    pub quota: Arc<QuotaTracker>,
    pub trials: Arc<TrialGuard>,
    pub checkout: Arc<CheckoutBridge>,
    pub resolver: Arc<EntitlementResolver>,
}

impl Billing {
    pub fn new(deps: Deps) -> Self {
        let quota = Arc::new(QuotaTracker::new(deps.store.clone(), deps.clock.clone()));
        let trials = Arc::new(TrialGuard::new(deps.store.clone()));
        let machine = Arc::new(SubscriptionMachine::new(
            deps.store.clone(),
            deps.clock.clone(),
            deps.directory,
            deps.notifier,
            deps.processor.clone(),
            trials.clone(),
            deps.settings.trial_days,
            deps.settings.processor_timeout,
        ));
        let checkout = Arc::new(CheckoutBridge::new(
            machine.clone(),
            deps.store,
            deps.processor,
            deps.clock,
            deps.settings.processor_timeout,
        ));
        let resolver = Arc::new(EntitlementResolver::new(machine.clone(), quota.clone()));

        Billing {
            machine,
            quota,
            trials,
            checkout,
            resolver,
        }
    }

    /// Expires every subscription whose trial or paid period has lapsed.
    pub async fn sweep(&self) -> Res<usize> {
        self.machine.sweep().await
    }
}

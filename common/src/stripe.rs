use stripe::Client;

/// Builds the Stripe API client shared by checkout and webhook handling.
pub fn create_client(secret_key: &str) -> Client {
    Client::new(secret_key)
}

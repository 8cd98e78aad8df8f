//! Payment gateway trait and in-memory implementation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    /// The card token was rejected; retrying with the same token is futile.
    #[error("Invalid card token")]
    InvalidCardToken,

    #[error("Gateway object not found: {0}")]
    NotFound(String),

    #[error("Rate limited by payment gateway")]
    RateLimited,

    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

impl PaymentError {
    /// Returns true if retrying the same call cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            PaymentError::InvalidCardToken | PaymentError::NotFound(_) => true,
            PaymentError::RateLimited | PaymentError::Unavailable(_) => false,
        }
    }
}

/// Operations the subscription saga needs from the payment gateway.
///
/// Calls that create gateway objects take an idempotency key: repeating a
/// call with the same key returns the object created by the first call.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a customer and returns the gateway customer id.
    async fn create_customer(
        &self,
        email: &str,
        card_token: &str,
        idempotency_key: &str,
    ) -> Result<String, PaymentError>;

    /// Creates a subscription and returns the gateway subscription id.
    async fn create_subscription(
        &self,
        customer_id: &str,
        seats_count: i32,
        idempotency_key: &str,
    ) -> Result<String, PaymentError>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        seats_count: i32,
        card_token: &str,
    ) -> Result<(), PaymentError>;

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), PaymentError>;
}

/// A subscription as held by [`InMemoryPaymentGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySubscription {
    pub customer_id: String,
    pub seats_count: i32,
    pub card_token: Option<String>,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    customers: HashMap<String, String>,
    subscriptions: HashMap<String, GatewaySubscription>,
    idempotent_results: HashMap<String, String>,
    rejected_cards: HashSet<String>,
    scripted_failures: VecDeque<PaymentError>,
    next_id: u32,
    charge_calls: usize,
}

impl InMemoryPaymentState {
    fn next_failure(&mut self) -> Result<(), PaymentError> {
        match self.scripted_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:04}", self.next_id)
    }
}

/// In-memory payment gateway for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call presenting `card_token` fail with
    /// [`PaymentError::InvalidCardToken`].
    pub async fn reject_card(&self, card_token: &str) {
        self.state
            .write()
            .await
            .rejected_cards
            .insert(card_token.to_string());
    }

    /// Makes the next gateway call fail with `err`. Calls queue up.
    pub async fn fail_next_call(&self, err: PaymentError) {
        self.state.write().await.scripted_failures.push_back(err);
    }

    pub async fn customer_count(&self) -> usize {
        self.state.read().await.customers.len()
    }

    pub async fn subscription(&self, subscription_id: &str) -> Option<GatewaySubscription> {
        self.state
            .read()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    /// Returns how many customers and subscriptions were actually created,
    /// idempotent replays excluded.
    pub async fn charge_calls(&self) -> usize {
        self.state.read().await.charge_calls
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_customer(
        &self,
        email: &str,
        card_token: &str,
        idempotency_key: &str,
    ) -> Result<String, PaymentError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        if let Some(existing) = state.idempotent_results.get(idempotency_key) {
            return Ok(existing.clone());
        }
        if state.rejected_cards.contains(card_token) {
            return Err(PaymentError::InvalidCardToken);
        }

        let customer_id = state.next_id("cus");
        state.charge_calls += 1;
        state
            .customers
            .insert(customer_id.clone(), email.to_string());
        state
            .idempotent_results
            .insert(idempotency_key.to_string(), customer_id.clone());
        Ok(customer_id)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        seats_count: i32,
        idempotency_key: &str,
    ) -> Result<String, PaymentError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        if let Some(existing) = state.idempotent_results.get(idempotency_key) {
            return Ok(existing.clone());
        }
        if !state.customers.contains_key(customer_id) {
            return Err(PaymentError::NotFound(customer_id.to_string()));
        }

        let subscription_id = state.next_id("sub");
        state.charge_calls += 1;
        state.subscriptions.insert(
            subscription_id.clone(),
            GatewaySubscription {
                customer_id: customer_id.to_string(),
                seats_count,
                card_token: None,
            },
        );
        state
            .idempotent_results
            .insert(idempotency_key.to_string(), subscription_id.clone());
        Ok(subscription_id)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        seats_count: i32,
        card_token: &str,
    ) -> Result<(), PaymentError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        if state.rejected_cards.contains(card_token) {
            return Err(PaymentError::InvalidCardToken);
        }
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| PaymentError::NotFound(subscription_id.to_string()))?;
        subscription.seats_count = seats_count;
        subscription.card_token = Some(card_token.to_string());
        Ok(())
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), PaymentError> {
        let mut state = self.state.write().await;
        state.next_failure()?;
        state
            .subscriptions
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| PaymentError::NotFound(subscription_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_customer_is_idempotent_per_key() {
        let gateway = InMemoryPaymentGateway::new();
        let first = gateway
            .create_customer("a@example.com", "tok_visa", "subs/create/1/customer")
            .await
            .unwrap();
        let again = gateway
            .create_customer("a@example.com", "tok_visa", "subs/create/1/customer")
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(gateway.customer_count().await, 1);
        assert_eq!(gateway.charge_calls().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_card_is_permanent() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.reject_card("tok_bad").await;

        let err = gateway
            .create_customer("a@example.com", "tok_bad", "k")
            .await
            .unwrap_err();
        assert_eq!(err, PaymentError::InvalidCardToken);
        assert!(err.is_permanent());
        assert_eq!(gateway.customer_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let gateway = InMemoryPaymentGateway::new();
        let customer = gateway
            .create_customer("a@example.com", "tok_visa", "c")
            .await
            .unwrap();
        let sub = gateway.create_subscription(&customer, 3, "s").await.unwrap();

        gateway
            .update_subscription(&sub, 5, "tok_mastercard")
            .await
            .unwrap();
        let stored = gateway.subscription(&sub).await.unwrap();
        assert_eq!(stored.seats_count, 5);
        assert_eq!(stored.card_token.as_deref(), Some("tok_mastercard"));

        gateway.delete_subscription(&sub).await.unwrap();
        assert_eq!(gateway.subscription_count().await, 0);
        assert!(matches!(
            gateway.delete_subscription(&sub).await,
            Err(PaymentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_transient() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.fail_next_call(PaymentError::RateLimited).await;
        let err = gateway
            .create_customer("a@example.com", "tok_visa", "k")
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
    }
}

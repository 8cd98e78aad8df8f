//! External service traits and in-memory implementations for saga steps.

pub mod payment;
pub mod vcs;

pub use payment::{GatewaySubscription, InMemoryPaymentGateway, PaymentError, PaymentGateway};
pub use vcs::{InMemoryVcsProvider, ProviderError, ProviderHook, ProviderRepo, VcsProvider};

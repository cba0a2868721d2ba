// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod atomic;
/// Fulfillment-state store: per-need satisfaction tracking.
pub mod fulfillment;
/// Provider-state store: per-capability request/response tracking.
pub mod provider;

pub use fulfillment::{FulfillmentStateError, FulfillmentStateStore};
pub use provider::{ApplyOutcome, ProviderStateError, ProviderStateStore};

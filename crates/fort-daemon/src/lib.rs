// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fort capability broker daemon: request admission, capability
//! dispatch, need callbacks, and the trigger/GC sweep modes, wired
//! together over a shared [`AppState`].

#![deny(unsafe_code)]

pub mod admission;
pub mod capability;
pub mod fcgi;
pub mod needs;
pub mod response;
pub mod router;
pub mod sweep;

use fort_config::{BrokerConfig, DomainConfig};
use fort_error::{fort_err, ErrorCode, FortError};
use fort_handles::HandleStore;
use fort_rbac::RbacEngine;
use fort_state::{FulfillmentStateStore, ProviderStateStore};

use admission::RawRequest;
use response::RawResponse;
use router::Route;

/// Everything a request or sweep needs: loaded config, RBAC, the two
/// state stores, the handle store, and the outbound signing/callback
/// machinery. Held behind a shared reference — every store is its own
/// single-writer actor, so `AppState` itself needs no outer lock.
pub struct AppState {
    /// Broker runtime settings (paths, GC interval, debug flag).
    pub broker: BrokerConfig,
    /// The four loaded domain documents.
    pub domain: DomainConfig,
    /// RBAC engine built over `domain.rbac`.
    pub rbac: RbacEngine,
    /// Per-capability request/response state.
    pub provider_state: ProviderStateStore,
    /// Per-need satisfaction state.
    pub fulfillment_state: FulfillmentStateStore,
    /// Content-addressed response blobs.
    pub handles: HandleStore,
    /// Adapter around the local signing-client executable.
    pub signing_client: fort_callback::SigningClient,
    /// Outbound fulfillment-callback dispatcher.
    pub callbacks: fort_callback::CallbackDispatcher,
}

impl AppState {
    /// Load every domain document and state store rooted at `broker`,
    /// and spawn the callback dispatcher.
    ///
    /// # Errors
    ///
    /// Returns a [`FortError`] if any domain document fails to load or
    /// either state store fails to read.
    pub async fn load(broker: BrokerConfig) -> Result<Self, FortError> {
        let domain = fort_config::load_domain_config(&broker.config_dir)
            .map_err(|e| fort_err!(ErrorCode::ConfigInvalid, "{e}"))?;
        let rbac = RbacEngine::new(domain.rbac.clone());

        let provider_state = ProviderStateStore::load(broker.provider_state_path())
            .await
            .map_err(|e| fort_err!(ErrorCode::StateReadFailed, "{e}"))?;
        let fulfillment_state = FulfillmentStateStore::load(broker.fulfillment_state_path())
            .await
            .map_err(|e| fort_err!(ErrorCode::StateReadFailed, "{e}"))?;

        let handles = HandleStore::new(broker.handles_dir());
        let signing_client = fort_callback::resolve_signing_client(&broker.signing_client_path);
        let callbacks = fort_callback::CallbackDispatcher::spawn(signing_client.clone());

        Ok(Self {
            broker,
            domain,
            rbac,
            provider_state,
            fulfillment_state,
            handles,
            signing_client,
            callbacks,
        })
    }
}

/// The single transport-independent entry point: classify the path,
/// admit the request, and dispatch it to the matching handler. Used by
/// both the FastCGI transport and integration tests, so the two paths
/// never diverge in behavior.
pub async fn handle_request(state: &AppState, req: RawRequest, now: i64) -> RawResponse {
    match router::classify(&req.path) {
        Some(Route::Capability { capability }) => {
            match admission::admit_capability(state, &req, &capability, now).await {
                Ok(admitted) => capability::execute(state, admitted, now).await,
                Err(err) => RawResponse::from_error(&err),
            }
        }
        Some(Route::NeedCallback { capability, name }) => {
            match admission::admit_callback(state, &req, &capability, &name, now).await {
                Ok(admitted) => needs::execute(state, admitted).await,
                Err(err) => RawResponse::from_error(&err),
            }
        }
        None => RawResponse::from_error(&fort_err!(
            ErrorCode::AdmissionUnknownRoute,
            "no route matches '{}'",
            req.path
        )),
    }
}

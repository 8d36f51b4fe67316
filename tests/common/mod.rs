//! Common test utilities for re-encryption integration tests
//!
//! In-memory implementations of the cluster, resealer and key source
//! collaborators, plus fixtures for SealedSecrets and their decrypted Secrets.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use sealed_secret_reencryptor::cluster::{
    ClusterError, ClusterReader, ClusterWriter, SealedSecretRef,
};
use sealed_secret_reencryptor::config::ReencryptConfig;
use sealed_secret_reencryptor::controller::fingerprint::sha256_hex;
use sealed_secret_reencryptor::controller::reseal::{ResealError, ResealRequest, Resealer};
use sealed_secret_reencryptor::crd::{SealedSecret, SealedSecretSpec};
use sealed_secret_reencryptor::keys::{KeyFetchError, KeySource};
use sealed_secret_reencryptor::runtime::{Collaborators, RunSettings};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    sealed: BTreeMap<Key, SealedSecret>,
    secrets: BTreeMap<Key, Secret>,
    next_version: u64,
    fetches: BTreeMap<Key, usize>,
    /// Bump the resourceVersion once, right after the Nth fetch of the object
    modify_after_fetch: BTreeMap<Key, usize>,
    reject_dry_run: BTreeSet<Key>,
    reject_update: BTreeMap<Key, u16>,
}

impl ClusterState {
    fn bump(&mut self, k: &Key) {
        self.next_version += 1;
        let version = self.next_version.to_string();
        if let Some(object) = self.sealed.get_mut(k) {
            object.metadata.resource_version = Some(version);
        }
    }
}

/// In-memory API server for SealedSecrets and Secrets
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    unreachable: AtomicBool,
    secrets_unreachable: AtomicBool,
    writes: AtomicUsize,
    dry_runs: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store `object`, assigning it a fresh resourceVersion
    pub fn insert_sealed(&self, object: SealedSecret) {
        let mut state = self.state();
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let k = key(&namespace, &name);
        state.sealed.insert(k.clone(), object);
        state.bump(&k);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state().secrets.insert(key(&namespace, &name), secret);
    }

    /// A SealedSecret plus its decrypted Secret
    pub fn insert_pair(&self, namespace: &str, name: &str) {
        self.insert_sealed(sealed_secret(namespace, name, &format!("AgOLD-{name}")));
        self.insert_secret(decrypted_secret(namespace, name));
    }

    pub fn sealed(&self, namespace: &str, name: &str) -> Option<SealedSecret> {
        self.state().sealed.get(&key(namespace, name)).cloned()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make Secret reads fail as if the API server went away mid-run
    pub fn set_secrets_unreachable(&self, unreachable: bool) {
        self.secrets_unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Simulate another writer touching the object after its `fetches`-th read
    pub fn modify_after_fetch(&self, namespace: &str, name: &str, fetches: usize) {
        self.state()
            .modify_after_fetch
            .insert(key(namespace, name), fetches);
    }

    pub fn reject_dry_run(&self, namespace: &str, name: &str) {
        self.state().reject_dry_run.insert(key(namespace, name));
    }

    pub fn reject_update(&self, namespace: &str, name: &str, code: u16) {
        self.state()
            .reject_update
            .insert(key(namespace, name), code);
    }

    /// Persisted updates
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn dry_runs(&self) -> usize {
        self.dry_runs.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), ClusterError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ClusterError::Unreachable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    fn list_sealed_secrets<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxStream<'a, Result<SealedSecretRef, ClusterError>> {
        if let Err(e) = self.check_reachable() {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let refs: Vec<_> = self
            .state()
            .sealed
            .values()
            .filter(|o| namespace.is_none() || o.metadata.namespace.as_deref() == namespace)
            .filter_map(SealedSecret::reference)
            .map(Ok)
            .collect();
        stream::iter(refs).boxed()
    }

    async fn fetch_sealed_secret(
        &self,
        reference: &SealedSecretRef,
    ) -> Result<SealedSecret, ClusterError> {
        self.check_reachable()?;
        tokio::task::yield_now().await;
        let k = key(&reference.namespace, &reference.name);
        let mut state = self.state();
        let object = state
            .sealed
            .get(&k)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "SealedSecret",
                namespace: reference.namespace.clone(),
                name: reference.name.clone(),
            })?;
        let count = {
            let fetches = state.fetches.entry(k.clone()).or_insert(0);
            *fetches += 1;
            *fetches
        };
        if state.modify_after_fetch.get(&k) == Some(&count) {
            state.modify_after_fetch.remove(&k);
            state.bump(&k);
        }
        Ok(object)
    }

    async fn fetch_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        self.check_reachable()?;
        if self.secrets_unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable("connection reset".to_string()));
        }
        tokio::task::yield_now().await;
        Ok(self.state().secrets.get(&key(namespace, name)).cloned())
    }
}

#[async_trait]
impl ClusterWriter for FakeCluster {
    async fn dry_run_update(&self, object: &SealedSecret) -> Result<(), ClusterError> {
        self.check_reachable()?;
        self.dry_runs.fetch_add(1, Ordering::SeqCst);
        let k = object_key(object);
        if self.state().reject_dry_run.contains(&k) {
            return Err(ClusterError::Rejected {
                code: 422,
                message: "admission webhook denied the request".to_string(),
            });
        }
        Ok(())
    }

    async fn update_sealed_secret(
        &self,
        object: &SealedSecret,
    ) -> Result<SealedSecret, ClusterError> {
        self.check_reachable()?;
        let k = object_key(object);
        let mut state = self.state();
        if let Some(code) = state.reject_update.get(&k) {
            return Err(ClusterError::Rejected {
                code: *code,
                message: "update refused".to_string(),
            });
        }
        let current = state.sealed.get(&k).ok_or_else(|| ClusterError::NotFound {
            kind: "SealedSecret",
            namespace: k.0.clone(),
            name: k.1.clone(),
        })?;
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(ClusterError::Conflict {
                resource: format!("{}/{}", k.0, k.1),
                message: "the object has been modified".to_string(),
            });
        }
        state.sealed.insert(k.clone(), object.clone());
        state.bump(&k);
        self.writes.fetch_add(1, Ordering::SeqCst);
        state
            .sealed
            .get(&k)
            .cloned()
            .ok_or_else(|| ClusterError::Unreachable("object vanished".to_string()))
    }
}

fn object_key(object: &SealedSecret) -> Key {
    key(
        object.metadata.namespace.as_deref().unwrap_or_default(),
        object.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// Deterministic resealer: ciphertext depends only on the key and the Secret identity
#[derive(Default)]
pub struct FakeResealer {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
    fail_for: BTreeSet<String>,
    invalid_for: BTreeSet<String>,
    panic_for: BTreeSet<String>,
    constant_output: Option<BTreeMap<String, String>>,
    cancel_on_call: Option<CancellationToken>,
    identities: Mutex<Vec<String>>,
}

impl FakeResealer {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail with a tool error for `namespace/name`
    #[must_use]
    pub fn failing_for(mut self, reference: &str) -> Self {
        self.fail_for.insert(reference.to_string());
        self
    }

    /// Return unparsable output for `namespace/name`
    #[must_use]
    pub fn invalid_for(mut self, reference: &str) -> Self {
        self.invalid_for.insert(reference.to_string());
        self
    }

    #[must_use]
    pub fn panicking_for(mut self, reference: &str) -> Self {
        self.panic_for.insert(reference.to_string());
        self
    }

    /// Always return `data`, whatever the input
    #[must_use]
    pub fn with_constant_output(mut self, data: BTreeMap<String, String>) -> Self {
        self.constant_output = Some(data);
        self
    }

    /// Cancel `token` from inside the first call
    #[must_use]
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// `namespace/name` of every Secret handed to the resealer, in call order
    pub fn identities(&self) -> Vec<String> {
        self.identities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Resealer for FakeResealer {
    async fn reseal(
        &self,
        request: ResealRequest<'_>,
    ) -> Result<BTreeMap<String, String>, ResealError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let reference = format!("{}/{}", request.secret.namespace, request.secret.name);
        self.identities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(reference.clone());

        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        let delay = self
            .delay
            .or_else(|| self.cancel_on_call.as_ref().map(|_| Duration::from_millis(50)));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.panic_for.contains(&reference) {
            panic!("resealer exploded on {reference}");
        }
        if self.fail_for.contains(&reference) {
            return Err(ResealError::Failed {
                exit_code: Some(1),
                stderr: "error: cannot fetch certificate".to_string(),
            });
        }
        if self.invalid_for.contains(&reference) {
            return Err(ResealError::Representation(
                "missing spec.encryptedData".to_string(),
            ));
        }
        if let Some(data) = &self.constant_output {
            return Ok(data.clone());
        }
        Ok(request
            .secret
            .keys()
            .into_iter()
            .map(|k| {
                let digest = sha256_hex(
                    format!("{}|{reference}|{k}", request.key.fingerprint).as_bytes(),
                );
                (k.to_string(), format!("AgNEW{}", &digest[..32]))
            })
            .collect())
    }
}

/// Serves a fixed PEM
#[derive(Debug)]
pub struct StaticKeySource {
    pem: Vec<u8>,
}

impl StaticKeySource {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            pem: pem_for(label),
        })
    }

    pub fn raw(pem: &[u8]) -> Arc<Self> {
        Arc::new(Self { pem: pem.to_vec() })
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch_pem(&self, _controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        Ok(self.pem.clone())
    }

    fn describe(&self, controller_namespace: &str) -> String {
        format!("static:{controller_namespace}")
    }
}

/// Controller Service that cannot be reached
#[derive(Debug)]
pub struct UnreachableKeySource;

#[async_trait]
impl KeySource for UnreachableKeySource {
    async fn fetch_pem(&self, controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        Err(KeyFetchError::Unreachable {
            source_desc: self.describe(controller_namespace),
            message: "503 Service Unavailable".to_string(),
        })
    }

    fn describe(&self, controller_namespace: &str) -> String {
        format!("service {controller_namespace}/sealed-secrets-controller")
    }
}

/// Controller Service that accepts the connection and never answers
#[derive(Debug)]
pub struct HangingKeySource;

#[async_trait]
impl KeySource for HangingKeySource {
    async fn fetch_pem(&self, _controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        std::future::pending().await
    }

    fn describe(&self, controller_namespace: &str) -> String {
        format!("service {controller_namespace}/sealed-secrets-controller")
    }
}

/// PEM whose DER body is the bytes of `label`; distinct labels give distinct fingerprints
pub fn pem_for(label: &str) -> Vec<u8> {
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        STANDARD.encode(label.as_bytes())
    )
    .into_bytes()
}

pub fn sealed_secret(namespace: &str, name: &str, ciphertext: &str) -> SealedSecret {
    let mut object = SealedSecret::new(
        name,
        SealedSecretSpec {
            encrypted_data: BTreeMap::from([
                ("password".to_string(), format!("{ciphertext}-password")),
                ("username".to_string(), format!("{ciphertext}-username")),
            ]),
            template: None,
        },
    );
    object.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    };
    object
}

pub fn decrypted_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            ("password".to_string(), ByteString(b"hunter2".to_vec())),
            ("username".to_string(), ByteString(b"app".to_vec())),
        ])),
        ..Secret::default()
    }
}

/// Configuration tuned for tests: no backoff waits, single read attempt
pub fn test_config() -> ReencryptConfig {
    ReencryptConfig {
        read_attempts: 1,
        backoff_start_ms: 1,
        backoff_max_ms: 1,
        call_timeout_secs: 5,
        ..ReencryptConfig::default()
    }
}

pub fn settings_all(config: ReencryptConfig) -> RunSettings {
    RunSettings {
        config,
        namespace: None,
        names: Vec::new(),
    }
}

pub fn collaborators(
    cluster: &Arc<FakeCluster>,
    resealer: &Arc<FakeResealer>,
    key_source: Arc<dyn KeySource>,
) -> Collaborators {
    Collaborators {
        cluster: Arc::<FakeCluster>::clone(cluster),
        resealer: Arc::<FakeResealer>::clone(resealer),
        key_source,
    }
}

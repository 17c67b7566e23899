use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use chrono::{DateTime, SecondsFormat, offset::Utc};
use config::SourceOptions;
use platform::{HostPlatform, Platform};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::{
    AddressError, AddressSpace, GLOBAL_DEFAULT_ADDRESS_SPACE_ID, IpamError, LOCAL_DEFAULT_ADDRESS_SPACE_ID, Options,
    PoolInfo,
    source::{AddressSink, Environment, Source},
    store::{STORE_KEY, Storage},
};

/// Every address space known to the manager, by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSpaces {
    spaces: BTreeMap<String, AddressSpace>,
    // set when a source changed the tree and it hasn't been saved yet
    changed: bool,
}

impl AddressSpaces {
    pub fn space(&self, id: &str) -> Result<&AddressSpace, AddressError> {
        self.spaces
            .get(id)
            .ok_or_else(|| AddressError::SpaceNotFound(id.to_owned()))
    }

    pub fn space_mut(&mut self, id: &str) -> Result<&mut AddressSpace, AddressError> {
        self.spaces
            .get_mut(id)
            .ok_or_else(|| AddressError::SpaceNotFound(id.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressSpace> {
        self.spaces.values()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    fn link(&mut self) {
        for space in self.spaces.values_mut() {
            space.link();
        }
    }

    fn clear_leases(&mut self) {
        for space in self.spaces.values_mut() {
            space.clear_leases();
        }
    }

    fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

impl AddressSink for AddressSpaces {
    fn set_address_space(&mut self, space: AddressSpace) {
        match self.spaces.get_mut(space.id()) {
            Some(existing) => {
                if existing.merge(space).changed() {
                    self.changed = true;
                }
            }
            None => {
                let mut space = space;
                space.reset();
                space.link();
                info!(space = space.id(), scope = ?space.scope(), pools = space.pools().count(), "address space added");
                self.spaces.insert(space.id().to_owned(), space);
                self.changed = true;
            }
        }
    }
}

// the persisted form is a plain tree, back-references are rebuilt by `link`
#[derive(Serialize)]
struct PersistedRef<'a> {
    version: &'a str,
    address_spaces: &'a BTreeMap<String, AddressSpace>,
}

#[derive(Deserialize)]
struct Persisted {
    #[serde(default)]
    version: String,
    #[serde(default)]
    address_spaces: BTreeMap<String, AddressSpace>,
}

#[derive(Debug)]
struct State {
    spaces: AddressSpaces,
    source: Option<Source>,
}

/// Owns the address tree and hands out pools and addresses from it.
///
/// All operations are serialized by one lock. Each takes the lock, gives the
/// topology source a chance to refresh, applies the operation to the tree and
/// writes the whole tree back to the store. A failed write is reported but the
/// in-memory change stays.
#[derive(Debug)]
pub struct AddressManager<T> {
    version: String,
    store: Option<T>,
    platform: Arc<dyn Platform>,
    state: Mutex<State>,
}

impl<T: Storage> AddressManager<T> {
    /// a manager querying the running host, persisting to `store` if given
    pub fn new<S: Into<String>>(version: S, store: Option<T>) -> Self {
        Self::with_platform(version, store, Arc::new(HostPlatform))
    }

    pub fn with_platform<S: Into<String>>(version: S, store: Option<T>, platform: Arc<dyn Platform>) -> Self {
        Self {
            version: version.into(),
            store,
            platform,
            state: Mutex::new(State {
                spaces: AddressSpaces::default(),
                source: None,
            }),
        }
    }

    /// Restores the persisted tree and starts the source named by
    /// `opts.environment`. A source left running from an earlier call is
    /// stopped first.
    #[instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, opts: &SourceOptions) -> Result<(), IpamError<T::Error>> {
        let mut state = self.state.lock().await;
        stop(&mut state).await;
        self.restore(&mut state).await?;
        self.start(&mut state, opts).await
    }

    /// Stops the source, if any. Calling this more than once is harmless.
    pub async fn uninitialize(&self) {
        stop(&mut *self.state.lock().await).await;
    }

    /// Replaces the running source with the one named by `opts.environment`
    #[instrument(level = "debug", skip(self))]
    pub async fn start_source(&self, opts: &SourceOptions) -> Result<(), IpamError<T::Error>> {
        let mut state = self.state.lock().await;
        stop(&mut state).await;
        self.start(&mut state, opts).await
    }

    /// Detaches the source, leaving the tree as it is
    pub async fn stop_source(&self) {
        self.uninitialize().await
    }

    /// Gives the source a chance to publish new topology. Failures are logged.
    pub async fn refresh(&self) {
        let mut state = self.state.lock().await;
        self.refresh_source(&mut state).await;
    }

    /// ids of the default local & global spaces, empty for a space that
    /// doesn't exist
    pub async fn get_default_address_spaces(&self) -> (String, String) {
        let state = self.lock().await;
        let id = |id: &str| {
            state
                .spaces
                .space(id)
                .map(|s| s.id().to_owned())
                .unwrap_or_default()
        };
        (id(LOCAL_DEFAULT_ADDRESS_SPACE_ID), id(GLOBAL_DEFAULT_ADDRESS_SPACE_ID))
    }

    /// Takes a hold on a pool, returning its id and subnet. See
    /// [`AddressSpace::request_pool`].
    #[instrument(level = "debug", skip(self, options))]
    pub async fn request_pool(
        &self,
        as_id: &str,
        pool_id: &str,
        sub_pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<(String, String), IpamError<T::Error>> {
        let mut state = self.lock().await;
        let pool = state
            .spaces
            .space_mut(as_id)?
            .request_pool(pool_id, options, v6)?;
        let held = (pool.id(), pool.subnet().to_string());
        info!(pool = %held.0, usage = pool.usage_count(), "pool requested");
        self.save(&state).await?;
        Ok(held)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn release_pool(&self, as_id: &str, pool_id: &str) -> Result<(), IpamError<T::Error>> {
        let mut state = self.lock().await;
        state.spaces.space_mut(as_id)?.release_pool(pool_id)?;
        info!(pool = %pool_id, "pool released");
        self.save(&state).await
    }

    /// Snapshot of a pool. Does not refresh the source.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_pool_info(&self, as_id: &str, pool_id: &str) -> Result<PoolInfo, IpamError<T::Error>> {
        let state = self.state.lock().await;
        Ok(state.spaces.space(as_id)?.get_address_pool(pool_id)?.info())
    }

    /// Leases an address from a pool, returned in CIDR notation. See
    /// [`AddressPool::request_address`](crate::AddressPool::request_address).
    #[instrument(level = "debug", skip(self, options))]
    pub async fn request_address(
        &self,
        as_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<String, IpamError<T::Error>> {
        let mut state = self.lock().await;
        let leased = state
            .spaces
            .space_mut(as_id)?
            .get_address_pool_mut(pool_id)?
            .request_address(address, options)?;
        info!(%leased, pool = %pool_id, "address requested");
        self.save(&state).await?;
        Ok(leased)
    }

    #[instrument(level = "debug", skip(self, options))]
    pub async fn release_address(
        &self,
        as_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<(), IpamError<T::Error>> {
        let mut state = self.lock().await;
        state
            .spaces
            .space_mut(as_id)?
            .get_address_pool_mut(pool_id)?
            .release_address(address, options)?;
        info!(%address, pool = %pool_id, "address released");
        self.save(&state).await
    }

    /// Reconciles `space` into the tree, or adds it, and persists the result.
    /// An empty space clears every pool from the space with the same id.
    #[instrument(level = "debug", skip(self, space), fields(space = space.id()))]
    pub async fn set_address_space(&self, space: AddressSpace) -> Result<(), IpamError<T::Error>> {
        let mut state = self.state.lock().await;
        state.spaces.set_address_space(space);
        state.spaces.take_changed();
        self.save(&state).await
    }

    /// copy of every address space as currently known
    pub async fn address_spaces(&self) -> Vec<AddressSpace> {
        self.state.lock().await.spaces.iter().cloned().collect()
    }

    async fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        self.refresh_source(&mut state).await;
        state
    }

    async fn refresh_source(&self, state: &mut State) {
        let State { spaces, source } = state;
        let Some(source) = source.as_mut() else {
            return;
        };
        if let Err(err) = source.refresh(spaces).await {
            warn!(?err, "topology refresh failed, using last known address spaces");
        }
        if state.spaces.take_changed()
            && let Err(err) = self.save(state).await
        {
            warn!(?err, "failed to persist refreshed address spaces");
        }
    }

    async fn start(&self, state: &mut State, opts: &SourceOptions) -> Result<(), IpamError<T::Error>> {
        let env = opts
            .environment
            .parse::<Environment>()
            .map_err(|err| IpamError::InvalidConfiguration(err.to_string()))?;
        match Source::new(env, opts, self.platform.clone())? {
            Some(mut source) => {
                source.start(&mut state.spaces).await?;
                info!(environment = %env, "topology source started");
                state.source = Some(source);
            }
            None => debug!("no topology source configured"),
        }
        Ok(())
    }

    async fn save(&self, state: &State) -> Result<(), IpamError<T::Error>> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(&PersistedRef {
            version: &self.version,
            address_spaces: &state.spaces.spaces,
        })?;
        store.write(STORE_KEY, &bytes).await.map_err(IpamError::Store)?;
        debug!(bytes = bytes.len(), "address spaces persisted");
        Ok(())
    }

    async fn restore(&self, state: &mut State) -> Result<(), IpamError<T::Error>> {
        let Some(store) = &self.store else {
            debug!("no store configured, starting empty");
            return Ok(());
        };
        let Some(bytes) = store.read(STORE_KEY).await.map_err(IpamError::Store)? else {
            info!("no persisted address spaces found, starting empty");
            return Ok(());
        };
        let persisted: Persisted = serde_json::from_slice(&bytes)?;
        if persisted.version != self.version {
            debug!(persisted = %persisted.version, current = %self.version, "restoring state written by another version");
        }
        state.spaces = AddressSpaces {
            spaces: persisted.address_spaces,
            changed: false,
        };
        state.spaces.link();

        // if either time is unknown, assume no reboot
        let modified = match store.modification_time().await {
            Ok(modified) => modified,
            Err(err) => {
                warn!(?err, "failed to get store modification time, keeping leases");
                return Ok(());
            }
        };
        let rebooted = match self.platform.last_reboot_time() {
            Ok(rebooted) => rebooted,
            Err(err) => {
                warn!(?err, "failed to get last reboot time, keeping leases");
                return Ok(());
            }
        };
        info!(
            store_modified = %fmt_time(modified),
            last_reboot = %fmt_time(rebooted),
            spaces = state.spaces.len(),
            "restored address spaces"
        );
        if rebooted > modified {
            info!("host rebooted since last save, clearing all leases");
            state.spaces.clear_leases();
        }
        Ok(())
    }
}

async fn stop(state: &mut State) {
    if let Some(mut source) = state.source.take() {
        source.stop().await;
        info!("topology source stopped");
    }
}

fn fmt_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

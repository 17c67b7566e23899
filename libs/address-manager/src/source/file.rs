use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use config::{SourceOptions, wire::NetworkInterfaces};
use platform::Platform;
use tracing::{debug, info};

use crate::{
    GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope,
    source::{AddressSink, AddressSource, DEFAULT_QUERY_INTERVAL, SourceError, Throttle, populate_address_space},
};

pub const DEFAULT_FILE_PATH: &str = "/etc/hostipam/interfaces.json";

/// Reads the interface topology from a JSON document on disk
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    throttle: Throttle,
    platform: Arc<dyn Platform>,
}

impl FileSource {
    pub fn new(opts: &SourceOptions, platform: Arc<dyn Platform>) -> Self {
        Self {
            path: opts
                .file_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_PATH)),
            throttle: Throttle::new(opts.query_interval().unwrap_or(DEFAULT_QUERY_INTERVAL)),
            platform,
        }
    }

    async fn load(&self) -> Result<NetworkInterfaces, SourceError> {
        let input = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(NetworkInterfaces::from_json(&input)?)
    }
}

#[async_trait]
impl AddressSource for FileSource {
    async fn start(&mut self, _sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        info!(path = %self.path.display(), "file topology source started");
        Ok(())
    }

    async fn stop(&mut self) {
        debug!("file topology source stopped");
    }

    async fn refresh(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        if !self.throttle.ready() {
            return Ok(());
        }
        let doc = self.load().await?;
        let local = populate_address_space(sink, &doc, &self.platform.interfaces());
        let global = sink.new_address_space(GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Global);
        sink.set_address_space(local);
        sink.set_address_space(global);
        Ok(())
    }
}

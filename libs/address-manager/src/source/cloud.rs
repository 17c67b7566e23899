use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::{SourceOptions, wire::NetworkInterfaces};
use platform::Platform;
use tracing::{debug, info, trace};

use crate::{
    GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope,
    source::{AddressSink, AddressSource, SourceError, Throttle, populate_address_space},
};

/// wireserver endpoint describing the NICs attached to this VM
pub const DEFAULT_QUERY_URL: &str = "http://168.63.129.16/machine/plugins?comp=nmagent&type=getinterfaceinfov1";
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(10);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls the cloud metadata endpoint for the host's interface topology
#[derive(Debug)]
pub struct CloudSource {
    client: reqwest::Client,
    url: String,
    throttle: Throttle,
    platform: Arc<dyn Platform>,
}

impl CloudSource {
    pub fn new(opts: &SourceOptions, platform: Arc<dyn Platform>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: opts.query_url.clone().unwrap_or_else(|| DEFAULT_QUERY_URL.to_owned()),
            throttle: Throttle::new(opts.query_interval().unwrap_or(DEFAULT_QUERY_INTERVAL)),
            platform,
        })
    }

    async fn query(&self) -> Result<NetworkInterfaces, SourceError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        trace!(%body, "topology response");
        Ok(NetworkInterfaces::from_xml(&body)?)
    }
}

#[async_trait]
impl AddressSource for CloudSource {
    async fn start(&mut self, _sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        info!(url = %self.url, "cloud topology source started");
        Ok(())
    }

    async fn stop(&mut self) {
        debug!("cloud topology source stopped");
    }

    async fn refresh(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        if !self.throttle.ready() {
            return Ok(());
        }
        let doc = self.query().await?;
        let local = populate_address_space(sink, &doc, &self.platform.interfaces());
        let global = sink.new_address_space(GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Global);
        sink.set_address_space(local);
        sink.set_address_space(global);
        Ok(())
    }
}

use async_trait::async_trait;
use tracing::debug;

use crate::{
    GLOBAL_DEFAULT_ADDRESS_SPACE_ID, LOCAL_DEFAULT_ADDRESS_SPACE_ID, Scope,
    source::{AddressSink, AddressSource, SourceError},
};

/// Publishes empty default spaces once, then never changes anything
#[derive(Debug, Default)]
pub struct NullSource {
    loaded: bool,
}

impl NullSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AddressSource for NullSource {
    async fn start(&mut self, _sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        debug!("null topology source started");
        Ok(())
    }

    async fn stop(&mut self) {}

    async fn refresh(&mut self, sink: &mut dyn AddressSink) -> Result<(), SourceError> {
        if self.loaded {
            return Ok(());
        }
        let local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Local);
        let global = sink.new_address_space(GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Global);
        sink.set_address_space(local);
        sink.set_address_space(global);
        self.loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressSpace;

    #[derive(Default)]
    struct Collect(Vec<AddressSpace>);

    impl AddressSink for Collect {
        fn set_address_space(&mut self, space: AddressSpace) {
            self.0.push(space);
        }
    }

    #[tokio::test]
    async fn test_publishes_once() {
        let mut source = NullSource::new();
        let mut sink = Collect::default();
        source.start(&mut sink).await.unwrap();
        source.refresh(&mut sink).await.unwrap();
        source.refresh(&mut sink).await.unwrap();
        let ids: Vec<_> = sink.0.iter().map(|s| (s.id(), s.scope())).collect();
        assert_eq!(
            ids,
            [
                (LOCAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Local),
                (GLOBAL_DEFAULT_ADDRESS_SPACE_ID, Scope::Global)
            ]
        );
    }
}

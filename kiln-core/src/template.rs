use anyhow::Result;

use crate::DataContainer;

/// A pipeline stage that reads and updates the shared container.
pub trait Template: Send {
    /// Instance name from the agent config, used as the source of emitted packets.
    fn name(&self) -> &str;

    fn execute(&mut self, container: DataContainer) -> Result<DataContainer>;
}

/// Entry point of an agent: passes the container through unchanged.
pub struct InputTemplate {
    name: String,
}

impl InputTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Template for InputTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, container: DataContainer) -> Result<DataContainer> {
        Ok(container)
    }
}

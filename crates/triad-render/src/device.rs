// SPDX-License-Identifier: CEPL-1.0
use crate::adapter::SelectedAdapter;
use crate::error::PipelineError;
use crate::hal::{AdapterInfo, Backend, FeatureLevel};
use tracing::info;

/// The logical device. Every other GPU object is created through it.
pub struct Device<B: Backend> {
    raw: B::Device,
    adapter: AdapterInfo,
    level: FeatureLevel,
}

impl<B: Backend> Device<B> {
    /// Consumes the adapter; it is not needed past this point.
    pub fn create(
        backend: &mut B,
        selected: SelectedAdapter<B>,
        level: FeatureLevel,
    ) -> Result<Self, PipelineError> {
        let raw = backend
            .create_device(&selected.adapter, level)
            .map_err(PipelineError::DeviceCreationFailed)?;
        info!("device created on {} at feature level {}", selected.info.name, level);
        Ok(Device {
            raw,
            adapter: selected.info,
            level,
        })
    }

    pub fn raw(&self) -> &B::Device {
        &self.raw
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn level(&self) -> FeatureLevel {
        self.level
    }
}
